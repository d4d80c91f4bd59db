use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::state::RepoConfig;
use crate::errors::ManifestError;

/// Default manifest location, relative to the working directory.
pub const MANIFEST_FILE: &str = "manifest.yaml";

/// `manifest.yaml`: the PRD and the repositories a run operates on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub prd: String,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

impl Manifest {
    pub fn new(prd: impl Into<String>, repos: Vec<RepoConfig>) -> Self {
        Self {
            prd: prd.into(),
            repos,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        serde_yaml::from_str(&data).with_context(|| format!("parse manifest {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize manifest")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write manifest {}", path.display()))
    }

    /// Full validation applied to manifests submitted over the API.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.prd.is_empty() {
            return Err(ManifestError::MissingPrd);
        }
        if self.repos.is_empty() {
            return Err(ManifestError::NoRepos);
        }
        for (i, repo) in self.repos.iter().enumerate() {
            if repo.name.is_empty() || repo.path.is_empty() || repo.team.is_empty() {
                return Err(ManifestError::IncompleteRepo(i));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(name: &str, path: &str, team: &str) -> RepoConfig {
        RepoConfig {
            name: name.into(),
            path: path.into(),
            team: team.into(),
            language: String::new(),
        }
    }

    #[test]
    fn test_load_yaml_with_optional_language() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(
            &path,
            "prd: https://www.notion.so/acme/PRD-0123456789abcdef0123456789abcdef\nrepos:\n  - name: api\n    path: ../api\n    team: Core\n    language: go\n  - name: web\n    path: ../web\n    team: Front\n",
        )
        .unwrap();

        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.repos.len(), 2);
        assert_eq!(m.repos[0].language, "go");
        assert_eq!(m.repos[1].language, "");
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let m = Manifest::new("docs/prd.md", vec![repo("api", "../api", "core")]);
        m.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), m);
    }

    #[test]
    fn test_validate() {
        assert_eq!(Manifest::default().validate(), Err(ManifestError::MissingPrd));
        assert_eq!(Manifest::new("p", vec![]).validate(), Err(ManifestError::NoRepos));
        let m = Manifest::new("p", vec![repo("api", "a", "t"), repo("web", "", "t")]);
        assert_eq!(m.validate(), Err(ManifestError::IncompleteRepo(1)));
        assert_eq!(
            ManifestError::IncompleteRepo(1).to_string(),
            "repo 1: name, path, and team are required"
        );
        assert!(Manifest::new("p", vec![repo("api", "a", "t")]).validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Manifest::load(Path::new("/nonexistent/manifest.yaml")).unwrap_err();
        assert!(err.to_string().contains("read manifest"));
    }
}
