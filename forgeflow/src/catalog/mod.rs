//! The stage catalog and the worker dispatcher.
//!
//! The catalog is a process-wide constant: fifteen stages in a fixed linear
//! order, three per domain, each domain running execute, review and approve.
//! The dispatcher maps every stage to the worker that produces its output.

mod behaviors;
mod dispatcher;
mod worker;

#[cfg(feature = "anthropic")]
mod anthropic;

pub use behaviors::{behavior, StageBehavior, BEHAVIORS};
pub use dispatcher::{WorkerDispatcher, WorkerDispatcherBuilder};
pub use worker::{parse_response, PromptWorker, Worker, WorkerClient, WorkerOutput, WorkerRequest};

#[cfg(test)]
pub use worker::MockWorkerClient;

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicClient, AnthropicConfig};

use crate::core::{Domain, StageId, StageRole};
use serde::Serialize;

/// A static entry of the stage catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDefinition {
    /// The stage.
    pub stage_id: StageId,
    /// Owning domain.
    pub domain: Domain,
    /// Role within the domain.
    pub role: StageRole,
    /// 1-based position, strictly increasing.
    pub order: u8,
    /// Optional stages only run when deployment is enabled.
    pub optional: bool,
}

impl StageDefinition {
    const fn of(stage_id: StageId) -> Self {
        Self {
            stage_id,
            domain: stage_id.domain(),
            role: stage_id.role(),
            order: stage_id.index() as u8 + 1,
            optional: matches!(stage_id.domain(), Domain::Devops),
        }
    }
}

/// Every stage definition in ascending order.
pub static STAGE_CATALOG: [StageDefinition; StageId::COUNT] = {
    let mut defs = [StageDefinition::of(StageId::Architecture); StageId::COUNT];
    let mut i = 0;
    while i < StageId::COUNT {
        defs[i] = StageDefinition::of(StageId::ALL[i]);
        i += 1;
    }
    defs
};

/// Returns the catalog entry for a stage.
#[must_use]
pub fn definition(stage: StageId) -> &'static StageDefinition {
    &STAGE_CATALOG[stage.index()]
}

/// Returns the stages a new pipeline gets runs for, in order.
///
/// Stages of disabled domains are left out, as are optional stages when
/// deployment is disabled.
pub fn stages_for(
    enabled_domains: &[Domain],
    deployment_enabled: bool,
) -> impl Iterator<Item = &'static StageDefinition> + '_ {
    STAGE_CATALOG
        .iter()
        .filter(move |def| enabled_domains.contains(&def.domain))
        .filter(move |def| deployment_enabled || !def.optional)
}
