//! Prompt builders for each agent role.
//!
//! Every builder first looks for `prompts/<name>.md` in the working directory;
//! when present, its `{{var}}` placeholders are filled in and the result is
//! used verbatim. Otherwise the built-in template applies.

use std::path::{Path, PathBuf};

/// Directory searched for prompt overrides.
pub const PROMPTS_DIR: &str = "prompts";

/// Loads overrides from a directory and renders prompts.
#[derive(Debug, Clone)]
pub struct Prompts {
    dir: PathBuf,
}

impl Default for Prompts {
    fn default() -> Self {
        Self::new(PROMPTS_DIR)
    }
}

/// Replace each `{{key}}` with its value.
pub fn interpolate(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{{{}}}}}", k), v)
    })
}

impl Prompts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn render(&self, name: &str, vars: &[(&str, &str)], fallback: impl FnOnce() -> String) -> String {
        match load_template(&self.dir.join(format!("{}.md", name))) {
            Some(tmpl) => interpolate(&tmpl, vars),
            None => fallback(),
        }
    }

    pub fn doc_generator(&self, repo_name: &str, language: &str, target_file: &str) -> String {
        self.render(
            "doc-generator",
            &[
                ("repo_name", repo_name),
                ("language", language),
                ("target_file", target_file),
            ],
            || {
                format!(
                    "You are a documentation generator for the {repo_name} repository (language: {language}).

Your task is to explore this codebase and generate a comprehensive {target_file} file.

Instructions:
1. Read the project structure (use Glob to find key files)
2. Understand the architecture, key patterns, and conventions
3. Write a clear, concise {target_file} that helps developers understand and work with this codebase

For CLAUDE.md: Focus on conventions, coding patterns, important file paths, build/test commands, and anything an AI assistant needs to know to work effectively in this repo.

For ARCHITECTURE.md: Focus on system design, component relationships, data flow, key abstractions, and how the pieces fit together.

Write the file directly using the Write tool."
                )
            },
        )
    }

    pub fn solution_designer(&self, prd_content: &str, repo_summary: &str) -> String {
        self.render(
            "solution-designer",
            &[("prd_content", prd_content), ("repo_summary", repo_summary)],
            || {
                format!(
                    "You are a senior solution architect. Your task is to create a detailed scoping document from the following PRD.

## PRD Content
{prd_content}

## Available Repositories
{repo_summary}

## Instructions

Create a comprehensive scoping document that includes:
1. **Summary**: What we're building and why
2. **Technical Approach**: How each repo will be modified
3. **API Changes**: New or modified endpoints/interfaces
4. **Data Model Changes**: Schema modifications
5. **Integration Points**: How components interact
6. **Risk Assessment**: Technical risks and mitigations
7. **Out of Scope**: What this does NOT include

Output the scoping document in markdown format."
                )
            },
        )
    }

    /// Solution designer that must read the PRD through its Notion tools.
    pub fn solution_designer_from_notion(&self, notion_url: &str, repo_summary: &str) -> String {
        format!(
            "IMPORTANT: The PRD is stored in Notion. Before doing anything else, use your Notion MCP tools to read the full content of this page:

{notion_url}

Read the page and all its sub-pages/blocks to get the complete PRD content. Then proceed with the instructions below using that content as the PRD.

{}",
            self.solution_designer("[PRD content fetched from Notion, see instructions above]", repo_summary)
        )
    }

    pub fn task_decomposer_from_notion(&self, notion_url: &str, repo_summary: &str) -> String {
        format!(
            "IMPORTANT: The scoping document is stored in Notion. Before doing anything else, use your Notion MCP tools to read the full content of this page:

{notion_url}

Read the page and all its sub-pages/blocks to get the complete scoping document content. Then proceed with the instructions below using that content as the scoping document.

{}",
            self.task_decomposer(
                "[Scoping document content fetched from Notion, see instructions above]",
                repo_summary
            )
        )
    }

    pub fn task_decomposer(&self, scoping_content: &str, repo_summary: &str) -> String {
        self.render(
            "task-decomposer",
            &[
                ("scoping_content", scoping_content),
                ("repo_summary", repo_summary),
            ],
            || {
                format!(
                    "You are a technical project planner. Decompose the following scoping document into implementable tasks with dependencies.

## Scoping Document
{scoping_content}

## Repositories
{repo_summary}

## Instructions

Create a PERT (task dependency graph) as a JSON array with this structure:

```json
[
  {{
    \"id\": \"TASK-001\",
    \"title\": \"Short task title\",
    \"description\": \"Detailed description of what to implement\",
    \"repo\": \"repo-name\",
    \"depends_on\": [],
    \"estimate\": \"S/M/L\"
  }}
]
```

Rules:
- Each task should be implementable in a single PR
- Tasks should be small enough for one developer session
- Dependencies must form a DAG (no cycles)
- Include test tasks for each feature task
- Use \"S\" (< 1 hour), \"M\" (1-3 hours), \"L\" (3-8 hours) estimates"
                )
            },
        )
    }

    pub fn coder(&self, issue_title: &str, issue_id: &str, language: &str, description: &str) -> String {
        self.render(
            "coder",
            &[
                ("issue_title", issue_title),
                ("issue_id", issue_id),
                ("language", language),
                ("description", description),
            ],
            || {
                let desc_block = if description.is_empty() {
                    String::new()
                } else {
                    format!("\n## Description\n{}\n", description)
                };
                format!(
                    "You are an expert {language} developer. Implement the following task:

## Task: {issue_title} (ID: {issue_id})
{desc_block}
## Instructions

1. Read the existing CLAUDE.md and ARCHITECTURE.md to understand project conventions
2. Implement the required changes
3. Write tests for your changes
4. Run existing tests to ensure nothing breaks
5. Commit your changes with a clear message referencing {issue_id}

Follow existing code patterns and conventions. Write clean, well-tested code.
Do not modify files outside the scope of this task."
                )
            },
        )
    }

    /// Coder that must read the issue body through its Linear tools.
    pub fn coder_from_linear(&self, issue_title: &str, issue_id: &str, linear_id: &str, language: &str) -> String {
        format!(
            "IMPORTANT: The full issue details are stored in Linear. Before doing anything else, use your Linear MCP tools to fetch the complete description of issue {linear_id}.

Read the issue description and acceptance criteria, then proceed with the instructions below using that context.

{}",
            self.coder(
                issue_title,
                issue_id,
                language,
                "[Issue description fetched from Linear, see instructions above]"
            )
        )
    }

    pub fn quality_reviewer(&self, issue_title: &str, language: &str) -> String {
        self.render(
            "quality-reviewer",
            &[("issue_title", issue_title), ("language", language)],
            || {
                format!(
                    "You are a senior {language} code reviewer. Review the changes made for: {issue_title}

## Instructions

1. Run the test suite and verify all tests pass
2. Review code changes for:
   - Correctness: Does the implementation match the task requirements?
   - Tests: Are there adequate tests? Do they cover edge cases?
   - Style: Does the code follow project conventions?
   - Security: Any potential vulnerabilities?
   - Performance: Any obvious performance issues?
3. Check for common issues:
   - Unused imports or variables
   - Missing error handling
   - Hardcoded values that should be configurable

## Output Format

If the code looks good, output: \"APPROVED: [brief reason]\"
If changes are needed, output: \"CHANGES REQUESTED:\" followed by specific, actionable feedback."
                )
            },
        )
    }

    pub fn feedback_writer(&self, review_feedback: &str) -> String {
        self.render(
            "feedback-writer",
            &[("review_feedback", review_feedback)],
            || {
                format!(
                    "You are a developer applying code review feedback. The reviewer has requested the following changes:

## Review Feedback
{review_feedback}

## Instructions

Apply each piece of feedback. After making changes, run the tests to verify everything passes.
Commit the fixes with a message like \"address review feedback\"."
                )
            },
        )
    }

    pub fn linear_issue_creator(&self, tasks_json: &str, team: &str) -> String {
        self.render(
            "linear-issue-creator",
            &[("tasks_json", tasks_json), ("team", team)],
            || {
                format!(
                    "You are a project tracking assistant. Create Linear issues from the following task list.

## Team
{team}

## Tasks (JSON)
```json
{tasks_json}
```

## Instructions

1. For each task in the JSON array, create a Linear issue on the \"{team}\" team with:
   - Title: the task's \"title\"
   - Description: the task's \"description\"
   - Estimate (if available): map \"S\" to 1, \"M\" to 2, \"L\" to 5

2. For tasks that have \"depends_on\" entries, set the blocking relationships:
   - The depended-on issue should block the dependent issue

3. After creating all issues, output ONLY a JSON object mapping task IDs to Linear issue identifiers. Example:
```json
{{\"TASK-001\": \"TEAM-123\", \"TASK-002\": \"TEAM-124\"}}
```

Do not output anything else besides the JSON mapping."
                )
            },
        )
    }
}

fn load_template(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().filter(|s| !s.is_empty())
}
