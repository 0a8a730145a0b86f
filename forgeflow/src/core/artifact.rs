//! Persisted stage artifacts.

use super::{StageId, StageRole, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// The type of document an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Architecture design document.
    ArchitectureDoc,
    /// Generated source tree.
    SourceCode,
    /// Generated test suites.
    TestSuite,
    /// Vulnerability report.
    SecurityReport,
    /// Container and deployment manifests.
    Dockerfile,
    /// The signed-off decision of an approval gate.
    ApprovalRecord,
}

impl ArtifactKind {
    /// Returns the artifact kind a stage produces, if any.
    ///
    /// Execute stages produce their domain's work product, approve stages
    /// produce an approval record, review stages produce nothing.
    #[must_use]
    pub const fn for_stage(stage: StageId) -> Option<Self> {
        match stage {
            StageId::Architecture => Some(Self::ArchitectureDoc),
            StageId::Development => Some(Self::SourceCode),
            StageId::Testing => Some(Self::TestSuite),
            StageId::Security => Some(Self::SecurityReport),
            StageId::Devops => Some(Self::Dockerfile),
            _ => match stage.role() {
                StageRole::Approve => Some(Self::ApprovalRecord),
                _ => None,
            },
        }
    }

    /// Returns the snake_case name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ArchitectureDoc => "architecture_doc",
            Self::SourceCode => "source_code",
            Self::TestSuite => "test_suite",
            Self::SecurityReport => "security_report",
            Self::Dockerfile => "dockerfile",
            Self::ApprovalRecord => "approval_record",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An output of a stage persisted for later inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning pipeline.
    pub pipeline_id: Uuid,
    /// The stage run that produced it.
    pub stage_run_id: Uuid,
    /// The producing stage.
    pub stage_id: StageId,
    /// Document type.
    pub kind: ArtifactKind,
    /// Display name.
    pub name: String,
    /// Serialized stage output.
    pub content: String,
    /// Lowercase hex SHA-256 of `content`.
    pub checksum: String,
    /// Once set, neither content nor checksum may change and the artifact may not be deleted.
    pub is_immutable: bool,
    /// Pipeline version that produced it.
    pub version: u32,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Artifact {
    /// Builds an artifact for a stage output.
    ///
    /// The immutability flag is derived from the stage role: approval-stage
    /// artifacts are always immutable, everything else is not.
    #[must_use]
    pub fn for_stage_output(
        pipeline_id: Uuid,
        stage_run_id: Uuid,
        stage_id: StageId,
        kind: ArtifactKind,
        version: u32,
        content: String,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            stage_run_id,
            stage_id,
            kind,
            name: format!("{}_{}", stage_id, created_at.to_rfc3339()),
            checksum: checksum(&content),
            content,
            is_immutable: stage_id.role() == StageRole::Approve,
            version,
            created_at,
        }
    }

    /// Returns true if `checksum` matches `content`.
    #[must_use]
    pub fn verify(&self) -> bool {
        checksum(&self.content) == self.checksum
    }
}

/// Computes the lowercase hex SHA-256 digest of `content`.
#[must_use]
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_stage() {
        assert_eq!(
            ArtifactKind::for_stage(StageId::Architecture),
            Some(ArtifactKind::ArchitectureDoc)
        );
        assert_eq!(
            ArtifactKind::for_stage(StageId::Devops),
            Some(ArtifactKind::Dockerfile)
        );
        assert_eq!(ArtifactKind::for_stage(StageId::SecurityReview), None);
        assert_eq!(
            ArtifactKind::for_stage(StageId::TestingApproval),
            Some(ArtifactKind::ApprovalRecord)
        );
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_immutability_follows_role() {
        let pipeline = Uuid::new_v4();
        let run = Uuid::new_v4();
        let doc = Artifact::for_stage_output(
            pipeline,
            run,
            StageId::Architecture,
            ArtifactKind::ArchitectureDoc,
            1,
            "{}".to_string(),
        );
        assert!(!doc.is_immutable);
        assert!(doc.verify());
        assert!(doc.name.starts_with("architecture_"));

        let record = Artifact::for_stage_output(
            pipeline,
            run,
            StageId::ArchitectureApproval,
            ArtifactKind::ApprovalRecord,
            1,
            r#"{"approved":true}"#.to_string(),
        );
        assert!(record.is_immutable);
    }
}
