//! In-memory store backed by parking_lot locks.

use super::{ApprovalUpdate, PipelineStore, PipelineUpdate, StageRunUpdate};
use crate::core::{checksum, ApprovalRequest, ApprovalStatus, Artifact, PipelineInstance, Project, StageRun};
use crate::errors::ForgeflowError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// A [`PipelineStore`] that keeps every row in memory.
///
/// Each mutation runs on a clone of the row under the table's write lock
/// and is committed only if the closure succeeds.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: RwLock<HashMap<Uuid, Project>>,
    pipelines: RwLock<HashMap<Uuid, PipelineInstance>>,
    stage_runs: RwLock<HashMap<Uuid, StageRun>>,
    approvals: RwLock<HashMap<Uuid, ApprovalRequest>>,
    artifacts: RwLock<Vec<Artifact>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a project.
    pub fn insert_project(&self, project: Project) {
        self.projects.write().insert(project.id, project);
    }
}

fn apply<T: Clone, F>(row: &mut T, update: F) -> Result<T, ForgeflowError>
where
    F: FnOnce(&mut T) -> Result<(), ForgeflowError>,
{
    let mut draft = row.clone();
    update(&mut draft)?;
    *row = draft.clone();
    Ok(draft)
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn get_project(&self, id: Uuid) -> Result<Project, ForgeflowError> {
        self.projects
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForgeflowError::not_found("project", id))
    }

    async fn insert_pipeline(
        &self,
        pipeline: PipelineInstance,
        stage_runs: Vec<StageRun>,
    ) -> Result<(), ForgeflowError> {
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&pipeline.id) {
            return Err(ForgeflowError::InvalidState(format!(
                "pipeline {} already exists",
                pipeline.id
            )));
        }
        let mut runs = self.stage_runs.write();
        for run in stage_runs {
            runs.insert(run.id, run);
        }
        pipelines.insert(pipeline.id, pipeline);
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineInstance, ForgeflowError> {
        self.pipelines
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForgeflowError::not_found("pipeline", id))
    }

    async fn modify_pipeline(
        &self,
        id: Uuid,
        update: PipelineUpdate,
    ) -> Result<PipelineInstance, ForgeflowError> {
        let mut pipelines = self.pipelines.write();
        let row = pipelines
            .get_mut(&id)
            .ok_or_else(|| ForgeflowError::not_found("pipeline", id))?;
        apply(row, update)
    }

    async fn list_stage_runs(&self, pipeline_id: Uuid) -> Result<Vec<StageRun>, ForgeflowError> {
        let mut runs: Vec<StageRun> = self
            .stage_runs
            .read()
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.order);
        Ok(runs)
    }

    async fn modify_stage_run(
        &self,
        id: Uuid,
        update: StageRunUpdate,
    ) -> Result<StageRun, ForgeflowError> {
        let mut runs = self.stage_runs.write();
        let row = runs
            .get_mut(&id)
            .ok_or_else(|| ForgeflowError::not_found("stage run", id))?;
        apply(row, update)
    }

    async fn insert_approval(&self, approval: ApprovalRequest) -> Result<(), ForgeflowError> {
        self.approvals.write().insert(approval.id, approval);
        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> Result<ApprovalRequest, ForgeflowError> {
        self.approvals
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForgeflowError::not_found("approval", id))
    }

    async fn modify_approval(
        &self,
        id: Uuid,
        update: ApprovalUpdate,
    ) -> Result<ApprovalRequest, ForgeflowError> {
        let mut approvals = self.approvals.write();
        let row = approvals
            .get_mut(&id)
            .ok_or_else(|| ForgeflowError::not_found("approval", id))?;
        apply(row, update)
    }

    async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, ForgeflowError> {
        let mut pending: Vec<ApprovalRequest> = self
            .approvals
            .read()
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }

    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), ForgeflowError> {
        self.artifacts.write().push(artifact);
        Ok(())
    }

    async fn list_artifacts(&self, pipeline_id: Uuid) -> Result<Vec<Artifact>, ForgeflowError> {
        Ok(self
            .artifacts
            .read()
            .iter()
            .filter(|a| a.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn update_artifact_content(
        &self,
        id: Uuid,
        content: String,
    ) -> Result<Artifact, ForgeflowError> {
        let mut artifacts = self.artifacts.write();
        let artifact = artifacts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| ForgeflowError::not_found("artifact", id))?;
        if artifact.is_immutable {
            return Err(ForgeflowError::ArtifactImmutable(id));
        }
        artifact.checksum = checksum(&content);
        artifact.content = content;
        Ok(artifact.clone())
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<(), ForgeflowError> {
        let mut artifacts = self.artifacts.write();
        let index = artifacts
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| ForgeflowError::not_found("artifact", id))?;
        if artifacts[index].is_immutable {
            return Err(ForgeflowError::ArtifactImmutable(id));
        }
        artifacts.remove(index);
        Ok(())
    }
}
