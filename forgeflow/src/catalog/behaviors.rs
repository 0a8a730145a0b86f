//! Prompt behaviors for the fifteen stage workers.
//!
//! Each behavior names the worker, carries its system prompt, and lists
//! the context keys its user prompt is built from. Inputs only ever name
//! seed keys or keys written by earlier stages.

use crate::context::ExecutionContext;
use crate::core::StageId;
use std::fmt::Write as _;

/// The static description of one stage worker.
#[derive(Debug, Clone, Copy)]
pub struct StageBehavior {
    /// The stage this behavior runs.
    pub stage: StageId,
    /// Human-readable worker name.
    pub name: &'static str,
    /// System prompt sent with every call.
    pub system_prompt: &'static str,
    /// Opening line of the user prompt.
    pub instruction: &'static str,
    /// Context keys rendered into the user prompt, in order.
    pub inputs: &'static [&'static str],
}

impl StageBehavior {
    /// Builds the user prompt from the context.
    ///
    /// Missing keys render as `null` so a prompt can always be built.
    #[must_use]
    pub fn build_prompt(&self, ctx: &ExecutionContext) -> String {
        let mut prompt = String::from(self.instruction);
        prompt.push('\n');
        for key in self.inputs {
            let value = ctx.get(key).cloned().unwrap_or(serde_json::Value::Null);
            let rendered = match value {
                serde_json::Value::String(s) => s,
                other => serde_json::to_string_pretty(&other).unwrap_or_default(),
            };
            let _ = write!(prompt, "\n{}:\n{}\n", key.to_uppercase(), rendered);
        }
        prompt
    }
}

const APPROVAL_FORMAT: &str = "Respond with a JSON object containing a boolean \"approved\", \
\"decision\", \"conditions\" and \"approval_notes\".";

/// Behaviors for every stage, indexed by [`StageId::index`].
pub static BEHAVIORS: [StageBehavior; StageId::COUNT] = [
    StageBehavior {
        stage: StageId::Architecture,
        name: "Architect Agent",
        system_prompt: "You are a senior software architect. Convert business requirements \
into a technical design. Respond with a JSON object with keys architecture_pattern, tech_stack, \
database_schema, api_design, folder_structure, architecture_diagram, scalability_plan, \
security_considerations, performance_targets, integration_points and summary.",
        instruction: "Design a complete technical architecture for the following project.",
        inputs: &[
            "project_name",
            "requirements",
            "target_cloud",
            "scale_requirement",
            "enabled_domains",
        ],
    },
    StageBehavior {
        stage: StageId::ArchitectureReview,
        name: "Senior Architect Agent",
        system_prompt: "You are a principal architect reviewing designs for scalability, \
security, performance and maintainability. Respond with a JSON object with keys overall_score, \
anti_patterns_found, improvements_required, risks and review_summary.",
        instruction: "Review the following architecture design critically.",
        inputs: &["architecture_output", "requirements", "scale_requirement"],
    },
    StageBehavior {
        stage: StageId::ArchitectureApproval,
        name: "Architecture Approval Agent",
        system_prompt: "You are the engineering head making the final architectural call. \
Only approve when the design is solid and the review concerns are addressed.",
        instruction: "Make the final approval decision on this architecture.",
        inputs: &["architecture_output", "architecture_review", "requirements"],
    },
    StageBehavior {
        stage: StageId::Development,
        name: "Developer Agent",
        system_prompt: "You are a senior full-stack developer. Follow the approved blueprint \
exactly. Respond with a JSON object with keys files (path, content, language, description), \
dependencies, setup_instructions, environment_variables and summary.",
        instruction: "Implement the following approved architecture.",
        inputs: &["approved_blueprint", "architecture_output", "requirements"],
    },
    StageBehavior {
        stage: StageId::DevelopmentReview,
        name: "Senior Developer Agent",
        system_prompt: "You are a principal engineer reviewing code quality. Respond with a \
JSON object with keys overall_score, security_issues, performance_issues, anti_patterns, \
required_changes and review_summary.",
        instruction: "Review this code for production readiness.",
        inputs: &["development_output", "approved_blueprint"],
    },
    StageBehavior {
        stage: StageId::DevelopmentApproval,
        name: "Development Manager Agent",
        system_prompt: "You are the development manager approving code for the QA phase. \
Verify all review concerns are addressed before approving.",
        instruction: "Approve or reject this code for the QA phase.",
        inputs: &["development_output", "dev_review"],
    },
    StageBehavior {
        stage: StageId::Testing,
        name: "Tester Agent",
        system_prompt: "You are a QA engineer writing unit, integration and end-to-end tests. \
Respond with a JSON object with keys test_files, coverage_estimate, test_plan, \
edge_cases_covered and summary.",
        instruction: "Generate comprehensive tests for this codebase.",
        inputs: &["approved_code", "development_output", "architecture_output", "requirements"],
    },
    StageBehavior {
        stage: StageId::TestingReview,
        name: "Senior Tester Agent",
        system_prompt: "You are a QA lead validating test quality and coverage. Respond with \
a JSON object with keys coverage_adequate, estimated_coverage, missing_test_scenarios, \
weak_assertions and review_summary.",
        instruction: "Review these test suites for quality and completeness.",
        inputs: &["testing_output", "development_output"],
    },
    StageBehavior {
        stage: StageId::TestingApproval,
        name: "QA Manager Agent",
        system_prompt: "You are the QA manager approving builds for security validation.",
        instruction: "Approve or reject this build for the security phase.",
        inputs: &["testing_output", "testing_review"],
    },
    StageBehavior {
        stage: StageId::Security,
        name: "Security Engineer Agent",
        system_prompt: "You are a security engineer performing static analysis, dependency \
audit and threat modelling. Respond with a JSON object with keys vulnerabilities, \
risk_score, owasp_findings, remediations and summary.",
        instruction: "Perform a complete security analysis of this codebase.",
        inputs: &["development_output", "approved_code", "architecture_output"],
    },
    StageBehavior {
        stage: StageId::SecurityReview,
        name: "Senior Security Agent",
        system_prompt: "You are a principal security engineer validating security findings. \
Respond with a JSON object with keys confirmed_vulnerabilities, false_positives, \
missed_issues and review_summary.",
        instruction: "Validate these security findings.",
        inputs: &["security_output", "development_output"],
    },
    StageBehavior {
        stage: StageId::SecurityApproval,
        name: "Security Manager Agent",
        system_prompt: "You are the security manager giving final production security \
clearance. Never approve with open critical findings.",
        instruction: "Grant or deny production security clearance.",
        inputs: &["security_output", "security_review", "qa_clearance"],
    },
    StageBehavior {
        stage: StageId::Devops,
        name: "Cloud Engineer Agent",
        system_prompt: "You are a senior cloud engineer generating deployment \
infrastructure. Respond with a JSON object with keys dockerfile, docker_compose, kubernetes, \
terraform, ci_pipeline, monitoring and summary.",
        instruction: "Generate production deployment infrastructure for this project.",
        inputs: &[
            "project_name",
            "target_cloud",
            "architecture_output",
            "approved_code",
            "security_clearance",
        ],
    },
    StageBehavior {
        stage: StageId::DevopsReview,
        name: "Cloud Team Lead Agent",
        system_prompt: "You are a cloud architecture lead reviewing infrastructure configs. \
Respond with a JSON object with keys cost_estimate, reliability_issues, security_issues, \
required_changes and review_summary.",
        instruction: "Review this infrastructure configuration.",
        inputs: &["devops_output", "target_cloud"],
    },
    StageBehavior {
        stage: StageId::DevopsApproval,
        name: "Cloud Manager Agent",
        system_prompt: "You are the VP of engineering approving production deployments.",
        instruction: "Approve or reject this deployment for production.",
        inputs: &["devops_output", "devops_review", "security_clearance"],
    },
];

/// Returns the behavior for a stage.
#[must_use]
pub fn behavior(stage: StageId) -> &'static StageBehavior {
    &BEHAVIORS[stage.index()]
}

/// Returns the full system prompt, adding the approval format for approve-role stages.
#[must_use]
pub(crate) fn system_prompt_for(behavior: &StageBehavior) -> String {
    match behavior.stage.role() {
        crate::core::StageRole::Approve => {
            format!("{} {}", behavior.system_prompt, APPROVAL_FORMAT)
        }
        _ => behavior.system_prompt.to_string(),
    }
}
