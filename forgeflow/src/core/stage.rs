//! Stage identity: domains, roles and the fifteen stage ids.

use crate::errors::UnknownStageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named engineering phase. Each domain owns exactly three stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// System design.
    Architecture,
    /// Code production.
    Development,
    /// Test suites and coverage.
    Testing,
    /// Vulnerability analysis.
    Security,
    /// Deployment infrastructure. Optional; only runs when deployment is enabled.
    Devops,
}

impl Domain {
    /// All domains in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Architecture,
        Self::Development,
        Self::Testing,
        Self::Security,
        Self::Devops,
    ];

    /// Returns the snake_case name of the domain.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Devops => "devops",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown domain '{s}'"))
    }
}

/// The role a stage plays inside its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Produces the domain's work product.
    Execute,
    /// Critiques the work product. Never gates the pipeline.
    Review,
    /// Decides whether the pipeline may continue.
    Approve,
}

impl StageRole {
    /// Returns the snake_case name of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Review => "review",
            Self::Approve => "approve",
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one of the fifteen pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Architecture design.
    Architecture,
    /// Architecture review.
    ArchitectureReview,
    /// Architecture sign-off.
    ArchitectureApproval,
    /// Code generation.
    Development,
    /// Code review.
    DevelopmentReview,
    /// Code sign-off.
    DevelopmentApproval,
    /// Test suite generation.
    Testing,
    /// Test review.
    TestingReview,
    /// QA sign-off.
    TestingApproval,
    /// Security scan.
    Security,
    /// Security review.
    SecurityReview,
    /// Security sign-off.
    SecurityApproval,
    /// Deployment infrastructure generation.
    Devops,
    /// Infrastructure review.
    DevopsReview,
    /// Deployment sign-off.
    DevopsApproval,
}

impl StageId {
    /// Number of stages in the catalog.
    pub const COUNT: usize = 15;

    /// Every stage id in ascending pipeline order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Architecture,
        Self::ArchitectureReview,
        Self::ArchitectureApproval,
        Self::Development,
        Self::DevelopmentReview,
        Self::DevelopmentApproval,
        Self::Testing,
        Self::TestingReview,
        Self::TestingApproval,
        Self::Security,
        Self::SecurityReview,
        Self::SecurityApproval,
        Self::Devops,
        Self::DevopsReview,
        Self::DevopsApproval,
    ];

    /// Zero-based position of the stage in [`StageId::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// The domain owning this stage.
    #[must_use]
    pub const fn domain(&self) -> Domain {
        match self {
            Self::Architecture | Self::ArchitectureReview | Self::ArchitectureApproval => {
                Domain::Architecture
            }
            Self::Development | Self::DevelopmentReview | Self::DevelopmentApproval => {
                Domain::Development
            }
            Self::Testing | Self::TestingReview | Self::TestingApproval => Domain::Testing,
            Self::Security | Self::SecurityReview | Self::SecurityApproval => Domain::Security,
            Self::Devops | Self::DevopsReview | Self::DevopsApproval => Domain::Devops,
        }
    }

    /// The role this stage plays inside its domain.
    #[must_use]
    pub const fn role(&self) -> StageRole {
        match self.index() % 3 {
            0 => StageRole::Execute,
            1 => StageRole::Review,
            _ => StageRole::Approve,
        }
    }

    /// Looks up the stage for a `(domain, role)` pair.
    #[must_use]
    pub const fn for_pair(domain: Domain, role: StageRole) -> Self {
        let base = domain as usize * 3;
        let offset = match role {
            StageRole::Execute => 0,
            StageRole::Review => 1,
            StageRole::Approve => 2,
        };
        Self::ALL[base + offset]
    }

    /// The execution context key this stage's output is stored under.
    #[must_use]
    pub const fn context_key(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture_output",
            Self::ArchitectureReview => "architecture_review",
            Self::ArchitectureApproval => "approved_blueprint",
            Self::Development => "development_output",
            Self::DevelopmentReview => "dev_review",
            Self::DevelopmentApproval => "approved_code",
            Self::Testing => "testing_output",
            Self::TestingReview => "testing_review",
            Self::TestingApproval => "qa_clearance",
            Self::Security => "security_output",
            Self::SecurityReview => "security_review",
            Self::SecurityApproval => "security_clearance",
            Self::Devops => "devops_output",
            Self::DevopsReview => "devops_review",
            Self::DevopsApproval => "deployment_approval",
        }
    }

    /// Returns the snake_case identifier of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::ArchitectureReview => "architecture_review",
            Self::ArchitectureApproval => "architecture_approval",
            Self::Development => "development",
            Self::DevelopmentReview => "development_review",
            Self::DevelopmentApproval => "development_approval",
            Self::Testing => "testing",
            Self::TestingReview => "testing_review",
            Self::TestingApproval => "testing_approval",
            Self::Security => "security",
            Self::SecurityReview => "security_review",
            Self::SecurityApproval => "security_approval",
            Self::Devops => "devops",
            Self::DevopsReview => "devops_review",
            Self::DevopsApproval => "devops_approval",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = UnknownStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownStageError::new(s))
    }
}
