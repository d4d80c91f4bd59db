//! Run inspection commands: `sdlc status` and `sdlc runs`.

use anyhow::Result;
use sdlc::config::Config;
use sdlc::engine::state::IssueStatus;

use super::{load_latest, open_store};

pub async fn cmd_status(config: &Config) -> Result<()> {
    let engine = load_latest(config).await?;
    println!();
    engine.print_status();

    let pending: Vec<String> = engine.with_state(|s| {
        s.issues
            .values()
            .filter(|i| i.status == IssueStatus::AwaitingHuman)
            .map(|i| format!("{} ({})", i.id, i.title))
            .collect()
    });
    if !pending.is_empty() {
        println!("\nNeeds human attention:");
        for issue in pending {
            println!("  {}", issue);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_runs(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let runs = store.call(|s| s.list_runs()).await?;
    if runs.is_empty() {
        println!("No runs found. Run 'sdlc init <manifest>' first.");
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:<10} {:<7} {:<20} PRD",
        "Run", "Phase", "Status", "Issues", "Updated"
    );
    println!(
        "{:<10} {:<10} {:<10} {:<7} {:<20} ---",
        "----------", "----------", "----------", "-------", "--------------------"
    );
    for run in runs {
        println!(
            "{:<10} {:<10} {:<10} {:<7} {:<20} {}",
            run.id,
            run.phase,
            run.phase_status,
            run.issue_count,
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
            run.prd_url
        );
    }
    Ok(())
}
