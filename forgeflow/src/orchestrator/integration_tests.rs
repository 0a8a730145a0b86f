//! Orchestrator scenarios: concurrency, cancellation, approvals and retries.

#[cfg(test)]
mod tests {
    use crate::config::ForgeflowConfig;
    use crate::core::{
        ApprovalDecision, ApprovalStatus, ArtifactKind, Domain, PipelineEvent, PipelineStatus,
        Project, StageId, StageRunStatus,
    };
    use crate::errors::ForgeflowError;
    use crate::events::{CollectingSubscriber, EventForwarder};
    use crate::notifications::{CollectingNotifier, Notification};
    use crate::orchestrator::Orchestrator;
    use crate::storage::{InMemoryStore, PipelineStore};
    use crate::testing::{
        architecture_project, full_project, scripted_dispatcher, wait_until, CallLog,
        ScriptedWorker,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(600);

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<InMemoryStore>,
        calls: CallLog,
        events: Arc<CollectingSubscriber>,
        notifier: Arc<CollectingNotifier>,
    }

    impl Fixture {
        fn new(config: ForgeflowConfig, workers: Vec<ScriptedWorker>) -> Self {
            Self::with_forwarder(config, workers, None)
        }

        fn with_forwarder(
            config: ForgeflowConfig,
            workers: Vec<ScriptedWorker>,
            forwarder: Option<Arc<dyn EventForwarder>>,
        ) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let calls = CallLog::new();
            let notifier = Arc::new(CollectingNotifier::new());
            let mut builder = Orchestrator::builder()
                .config(config)
                .store(store.clone())
                .dispatcher(scripted_dispatcher(workers, &calls).unwrap())
                .notifier(notifier.clone());
            if let Some(forwarder) = forwarder {
                builder = builder.forwarder(forwarder);
            }
            let orchestrator = builder.build().unwrap();
            let events = Arc::new(CollectingSubscriber::new());
            orchestrator.subscribe(events.clone());
            Self {
                orchestrator,
                store,
                calls,
                events,
                notifier,
            }
        }

        fn project(&self, project: Project) -> Uuid {
            let id = project.id;
            self.store.insert_project(project);
            id
        }

        async fn start(&self, project: Project) -> Uuid {
            let project_id = self.project(project);
            self.orchestrator
                .start_pipeline(project_id, "alice")
                .await
                .unwrap()
        }

        async fn wait_idle(&self, pipeline_id: Uuid) {
            let orchestrator = &self.orchestrator;
            assert!(
                wait_until(WAIT, || async move {
                    !orchestrator.is_pipeline_running(pipeline_id)
                })
                .await
            );
        }

        async fn wait_for_status(&self, pipeline_id: Uuid, status: PipelineStatus) {
            let orchestrator = &self.orchestrator;
            assert!(
                wait_until(WAIT, || async move {
                    orchestrator
                        .pipeline(pipeline_id)
                        .await
                        .is_ok_and(|p| p.status == status)
                })
                .await,
                "pipeline never reached {status}"
            );
        }

        async fn status(&self, pipeline_id: Uuid) -> PipelineStatus {
            self.orchestrator.pipeline(pipeline_id).await.unwrap().status
        }
    }

    fn human_gate_config() -> ForgeflowConfig {
        ForgeflowConfig::default().with_human_approval([Domain::Architecture])
    }

    #[derive(Default)]
    struct RecordingForwarder {
        forwarded: Mutex<Vec<PipelineEvent>>,
    }

    #[async_trait]
    impl EventForwarder for RecordingForwarder {
        async fn forward(&self, event: &PipelineEvent) -> Result<(), String> {
            self.forwarded.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_pipeline_runs_to_completion() {
        let fx = Fixture::new(ForgeflowConfig::default(), Vec::new());
        let pipeline_id = fx.start(architecture_project()).await;

        fx.wait_idle(pipeline_id).await;

        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Completed);
        assert_eq!(fx.calls.stages().len(), 3);
        assert_eq!(fx.orchestrator.active_pipeline_count(), 0);
        let runs = fx.orchestrator.stage_runs(pipeline_id).await.unwrap();
        assert!(runs.iter().all(|r| r.status.is_success()));
        assert_eq!(
            fx.orchestrator.list_artifacts(pipeline_id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_deployment_creates_no_devops_runs() {
        let fx = Fixture::new(ForgeflowConfig::default(), Vec::new());
        let pipeline_id = fx.start(full_project(false)).await;

        fx.wait_idle(pipeline_id).await;

        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Completed);
        let runs = fx.orchestrator.stage_runs(pipeline_id).await.unwrap();
        assert_eq!(runs.len(), 12);
        assert!(runs.iter().all(|r| r.domain != Domain::Devops));
        assert!(runs.iter().all(|r| r.status.is_success()));
    }

    #[tokio::test]
    async fn test_start_unknown_project() {
        let fx = Fixture::new(ForgeflowConfig::default(), Vec::new());
        let err = fx
            .orchestrator
            .start_pipeline(Uuid::new_v4(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeflowError::NotFound { entity: "project", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_queues_pipelines() {
        let fx = Fixture::new(
            ForgeflowConfig::default().with_max_concurrent_pipelines(1),
            vec![ScriptedWorker::new(StageId::Architecture)
                .then_delay(Duration::from_secs(10), json!({"draft": 1}))
                .then_delay(Duration::from_secs(10), json!({"draft": 2}))],
        );
        let first = fx.start(architecture_project()).await;
        let second = fx.start(architecture_project()).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.orchestrator.active_pipeline_count(), 2);
        assert_eq!(fx.status(first).await, PipelineStatus::Running);
        assert_eq!(fx.status(second).await, PipelineStatus::Pending);

        fx.wait_idle(second).await;
        assert_eq!(fx.status(first).await, PipelineStatus::Completed);
        assert_eq!(fx.status(second).await, PipelineStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_pipeline() {
        let fx = Fixture::new(
            ForgeflowConfig::default(),
            vec![ScriptedWorker::new(StageId::Architecture)
                .then_delay(Duration::from_secs(60), json!({"draft": 1}))],
        );
        let pipeline_id = fx.start(architecture_project()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        fx.orchestrator.cancel_pipeline(pipeline_id).await.unwrap();

        let pipeline = fx.orchestrator.pipeline(pipeline_id).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Failed);
        assert_eq!(pipeline.status_reason.as_deref(), Some("cancelled"));
        assert!(pipeline.completed_at.is_some());

        fx.wait_idle(pipeline_id).await;
        let runs = fx.orchestrator.stage_runs(pipeline_id).await.unwrap();
        assert_eq!(runs[0].status, StageRunStatus::Failed);
        assert_eq!(runs[1].status, StageRunStatus::Pending);
        assert_eq!(fx.calls.count(StageId::ArchitectureReview), 0);
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Failed);
        assert!(fx.events.event_types().contains(&"pipeline_cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_pipeline() {
        let fx = Fixture::new(
            ForgeflowConfig::default().with_max_concurrent_pipelines(1),
            vec![ScriptedWorker::new(StageId::Architecture)
                .then_delay(Duration::from_secs(10), json!({"draft": 1}))],
        );
        let first = fx.start(architecture_project()).await;
        let queued = fx.start(architecture_project()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.orchestrator.cancel_pipeline(queued).await.unwrap();
        fx.wait_idle(queued).await;
        assert_eq!(fx.status(queued).await, PipelineStatus::Failed);

        fx.wait_idle(first).await;
        assert_eq!(fx.status(first).await, PipelineStatus::Completed);
        assert_eq!(fx.calls.count(StageId::Architecture), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finished_pipeline_is_rejected() {
        let fx = Fixture::new(ForgeflowConfig::default(), Vec::new());
        let pipeline_id = fx.start(architecture_project()).await;
        fx.wait_idle(pipeline_id).await;

        let err = fx.orchestrator.cancel_pipeline(pipeline_id).await.unwrap_err();
        assert!(matches!(err, ForgeflowError::InvalidState(_)));
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_approval_approve_continues() {
        let fx = Fixture::new(human_gate_config(), Vec::new());
        let project = architecture_project()
            .with_domains([Domain::Architecture, Domain::Development]);
        let pipeline_id = fx.start(project).await;

        fx.wait_for_status(pipeline_id, PipelineStatus::WaitingApproval).await;
        let pending = fx.orchestrator.list_pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stage_id, StageId::ArchitectureApproval);
        assert_eq!(fx.calls.count(StageId::Development), 0);

        let decided = fx
            .orchestrator
            .decide_approval(pending[0].id, ApprovalDecision::Approve, "bob", None)
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("bob"));

        fx.wait_idle(pipeline_id).await;
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Completed);
        assert_eq!(fx.calls.count(StageId::DevelopmentApproval), 1);
        assert!(fx.orchestrator.list_pending_approvals().await.unwrap().is_empty());

        let types = fx.events.event_types();
        let requested = types.iter().position(|t| *t == "approval_requested").unwrap();
        let decided = types.iter().position(|t| *t == "approval_decided").unwrap();
        assert!(requested < decided);
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_approval_reject_halts() {
        let fx = Fixture::new(human_gate_config(), Vec::new());
        let project = architecture_project()
            .with_domains([Domain::Architecture, Domain::Development]);
        let pipeline_id = fx.start(project).await;
        fx.wait_for_status(pipeline_id, PipelineStatus::WaitingApproval).await;
        let approval_id = fx.orchestrator.list_pending_approvals().await.unwrap()[0].id;

        fx.orchestrator
            .decide_approval(
                approval_id,
                ApprovalDecision::Reject,
                "carol",
                Some("needs a cache layer".to_string()),
            )
            .await
            .unwrap();
        fx.wait_idle(pipeline_id).await;

        let pipeline = fx.orchestrator.pipeline(pipeline_id).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Rejected);
        assert_eq!(pipeline.status_reason.as_deref(), Some("needs a cache layer"));
        assert_eq!(fx.calls.count(StageId::Development), 0);
        assert_eq!(fx.events.event_types().last(), Some(&"pipeline_rejected"));

        let again = fx
            .orchestrator
            .decide_approval(approval_id, ApprovalDecision::Approve, "bob", None)
            .await
            .unwrap_err();
        assert!(matches!(again, ForgeflowError::InvalidState(_)));

        fx.orchestrator.shutdown().await;
        let delivered = fx.notifier.delivered();
        assert!(delivered
            .iter()
            .any(|n| matches!(n, Notification::ApprovalRequired { .. })));
        assert!(delivered.iter().any(|n| matches!(
            n,
            Notification::Rejected { reason, .. } if reason == "needs a cache layer"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_approval() {
        let fx = Fixture::new(human_gate_config(), Vec::new());
        let pipeline_id = fx.start(architecture_project()).await;
        fx.wait_for_status(pipeline_id, PipelineStatus::WaitingApproval).await;
        let approval_id = fx.orchestrator.list_pending_approvals().await.unwrap()[0].id;

        fx.orchestrator.cancel_pipeline(pipeline_id).await.unwrap();
        fx.wait_idle(pipeline_id).await;

        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Failed);
        let approval = fx.store.get_approval(approval_id).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Expired);
        assert!(fx.orchestrator.list_pending_approvals().await.unwrap().is_empty());

        let err = fx
            .orchestrator
            .decide_approval(approval_id, ApprovalDecision::Approve, "bob", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeflowError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rejected_pipeline_keeps_history() {
        let fx = Fixture::new(
            ForgeflowConfig::default(),
            vec![ScriptedWorker::new(StageId::ArchitectureApproval)
                .then_succeed(json!({"approved": false, "approval_notes": "split the monolith"}))],
        );
        let pipeline_id = fx.start(architecture_project()).await;
        fx.wait_idle(pipeline_id).await;
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Rejected);
        let first_run = fx.orchestrator.list_artifacts(pipeline_id).await.unwrap();
        assert_eq!(first_run.len(), 1);

        fx.orchestrator.retry_pipeline(pipeline_id).await.unwrap();
        fx.wait_idle(pipeline_id).await;

        let pipeline = fx.orchestrator.pipeline(pipeline_id).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Completed);
        assert_eq!(pipeline.version, 2);
        assert_eq!(pipeline.status_reason, None);
        assert_eq!(fx.calls.count(StageId::Architecture), 2);

        let artifacts = fx.orchestrator.list_artifacts(pipeline_id).await.unwrap();
        assert_eq!(artifacts.len(), 3);
        assert_eq!(artifacts[0], first_run[0]);
        let versions: Vec<(ArtifactKind, u32)> =
            artifacts.iter().map(|a| (a.kind, a.version)).collect();
        assert_eq!(
            versions,
            vec![
                (ArtifactKind::ArchitectureDoc, 1),
                (ArtifactKind::ArchitectureDoc, 2),
                (ArtifactKind::ApprovalRecord, 2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_pipeline_keeps_retry_counts() {
        let fx = Fixture::new(
            ForgeflowConfig::default(),
            vec![ScriptedWorker::new(StageId::ArchitectureReview)
                .then_fail("timeout")
                .then_fail("timeout")
                .then_fail("timeout")],
        );
        let pipeline_id = fx.start(architecture_project()).await;
        fx.wait_idle(pipeline_id).await;
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Failed);

        fx.orchestrator.retry_pipeline(pipeline_id).await.unwrap();
        fx.wait_idle(pipeline_id).await;

        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Completed);
        let runs = fx.orchestrator.stage_runs(pipeline_id).await.unwrap();
        assert_eq!(runs[1].stage_id, StageId::ArchitectureReview);
        assert_eq!(runs[1].retry_count, 3);
        assert_eq!(runs[1].status, StageRunStatus::Completed);
        assert_eq!(runs[1].error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_preconditions() {
        let fx = Fixture::new(
            ForgeflowConfig::default(),
            vec![ScriptedWorker::new(StageId::Architecture)
                .then_delay(Duration::from_secs(30), json!({"draft": 1}))],
        );
        let pipeline_id = fx.start(architecture_project()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = fx.orchestrator.retry_pipeline(pipeline_id).await.unwrap_err();
        assert!(matches!(err, ForgeflowError::AlreadyRunning(id) if id == pipeline_id));

        fx.wait_idle(pipeline_id).await;
        let err = fx.orchestrator.retry_pipeline(pipeline_id).await.unwrap_err();
        assert!(matches!(err, ForgeflowError::InvalidState(_)));
        assert_eq!(fx.orchestrator.pipeline(pipeline_id).await.unwrap().version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let fx = Fixture::new(ForgeflowConfig::default(), Vec::new());
        let late = Arc::new(CollectingSubscriber::new());
        let id = fx.orchestrator.subscribe(late.clone());
        assert!(fx.orchestrator.unsubscribe(id));
        assert!(!fx.orchestrator.unsubscribe(id));

        let pipeline_id = fx.start(architecture_project()).await;
        fx.wait_idle(pipeline_id).await;

        assert!(late.is_empty());
        assert!(!fx.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_and_drains_forwarder() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let fx = Fixture::with_forwarder(
            ForgeflowConfig::default(),
            vec![ScriptedWorker::new(StageId::Architecture)
                .then_delay(Duration::from_secs(3600), json!({"draft": 1}))],
            Some(forwarder.clone()),
        );
        let pipeline_id = fx.start(architecture_project()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        fx.orchestrator.shutdown().await;

        assert_eq!(fx.orchestrator.active_pipeline_count(), 0);
        assert_eq!(fx.status(pipeline_id).await, PipelineStatus::Failed);
        let forwarded = forwarder.forwarded.lock().len();
        assert_eq!(forwarded, fx.events.len());
        assert!(forwarded > 0);
    }
}
