//! The persistence collaborator.
//!
//! Row mutations go through closures applied atomically by the store: the
//! closure sees the current row, and its changes are committed only if it
//! returns `Ok`. A closure error aborts the mutation and is returned as is.

mod memory;

pub use memory::InMemoryStore;

use crate::core::{ApprovalRequest, Artifact, PipelineInstance, Project, StageRun};
use crate::errors::ForgeflowError;
use async_trait::async_trait;
use uuid::Uuid;

/// Mutation applied to a pipeline row.
pub type PipelineUpdate = Box<dyn FnOnce(&mut PipelineInstance) -> Result<(), ForgeflowError> + Send>;

/// Mutation applied to a stage-run row.
pub type StageRunUpdate = Box<dyn FnOnce(&mut StageRun) -> Result<(), ForgeflowError> + Send>;

/// Mutation applied to an approval row.
pub type ApprovalUpdate = Box<dyn FnOnce(&mut ApprovalRequest) -> Result<(), ForgeflowError> + Send>;

/// Storage for pipelines, stage runs, approvals and artifacts.
///
/// Store failures surface as `ForgeflowError::Persistence`; missing rows as
/// `ForgeflowError::NotFound`.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Loads a project.
    async fn get_project(&self, id: Uuid) -> Result<Project, ForgeflowError>;

    /// Inserts a new pipeline together with its stage runs.
    async fn insert_pipeline(
        &self,
        pipeline: PipelineInstance,
        stage_runs: Vec<StageRun>,
    ) -> Result<(), ForgeflowError>;

    /// Loads a pipeline.
    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineInstance, ForgeflowError>;

    /// Atomically mutates a pipeline and returns the committed row.
    async fn modify_pipeline(
        &self,
        id: Uuid,
        update: PipelineUpdate,
    ) -> Result<PipelineInstance, ForgeflowError>;

    /// Lists a pipeline's stage runs in ascending order.
    async fn list_stage_runs(&self, pipeline_id: Uuid) -> Result<Vec<StageRun>, ForgeflowError>;

    /// Atomically mutates a stage run and returns the committed row.
    async fn modify_stage_run(
        &self,
        id: Uuid,
        update: StageRunUpdate,
    ) -> Result<StageRun, ForgeflowError>;

    /// Inserts an approval request.
    async fn insert_approval(&self, approval: ApprovalRequest) -> Result<(), ForgeflowError>;

    /// Loads an approval request.
    async fn get_approval(&self, id: Uuid) -> Result<ApprovalRequest, ForgeflowError>;

    /// Atomically mutates an approval request and returns the committed row.
    async fn modify_approval(
        &self,
        id: Uuid,
        update: ApprovalUpdate,
    ) -> Result<ApprovalRequest, ForgeflowError>;

    /// Lists every pending approval request, oldest first.
    async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, ForgeflowError>;

    /// Inserts an artifact.
    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), ForgeflowError>;

    /// Lists a pipeline's artifacts, oldest first.
    async fn list_artifacts(&self, pipeline_id: Uuid) -> Result<Vec<Artifact>, ForgeflowError>;

    /// Replaces an artifact's content and checksum.
    ///
    /// Fails with `ForgeflowError::ArtifactImmutable` for immutable artifacts.
    async fn update_artifact_content(
        &self,
        id: Uuid,
        content: String,
    ) -> Result<Artifact, ForgeflowError>;

    /// Deletes an artifact.
    ///
    /// Fails with `ForgeflowError::ArtifactImmutable` for immutable artifacts.
    async fn delete_artifact(&self, id: Uuid) -> Result<(), ForgeflowError>;
}
