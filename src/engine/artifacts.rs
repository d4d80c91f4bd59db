use serde::Serialize;

use super::state::Phase;

pub const SCOPING_DOC: &str = "scoping_doc";
pub const SCOPING_DOC_NOTION: &str = "scoping_doc_notion";
pub const PERT: &str = "pert";

/// Directory (relative to the working directory) holding phase outputs.
pub const ARTIFACTS_DIR: &str = ".sdlc/artifacts";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArtifactDef {
    pub key: &'static str,
    pub default_file: &'static str,
    pub notion_title: &'static str,
}

pub const ARTIFACT_DEFS: [ArtifactDef; 2] = [
    ArtifactDef {
        key: SCOPING_DOC,
        default_file: "scoping-doc.md",
        notion_title: "1. Scoping Document",
    },
    ArtifactDef {
        key: PERT,
        default_file: "pert.md",
        notion_title: "2. PERT",
    },
];

pub fn artifact_def(key: &str) -> Option<&'static ArtifactDef> {
    ARTIFACT_DEFS.iter().find(|d| d.key == key)
}

/// The artifact a phase produces, if any.
pub fn phase_artifact(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Design => Some(SCOPING_DOC),
        Phase::Planning => Some(PERT),
        _ => None,
    }
}

/// Default on-disk path for a run's artifact: `.sdlc/artifacts/<run>-<file>`.
pub fn default_artifact_path(run_id: &str, key: &str) -> Option<String> {
    artifact_def(key).map(|def| format!("{}/{}-{}", ARTIFACTS_DIR, run_id, def.default_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_artifact_map() {
        assert_eq!(phase_artifact(Phase::Design), Some(SCOPING_DOC));
        assert_eq!(phase_artifact(Phase::Planning), Some(PERT));
        assert_eq!(phase_artifact(Phase::Tracking), None);
    }

    #[test]
    fn test_default_artifact_path() {
        assert_eq!(
            default_artifact_path("ab12cd34", PERT).as_deref(),
            Some(".sdlc/artifacts/ab12cd34-pert.md")
        );
        assert_eq!(default_artifact_path("ab12cd34", SCOPING_DOC_NOTION), None);
    }
}
