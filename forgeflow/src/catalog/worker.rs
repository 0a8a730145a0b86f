//! The worker seam and the stock prompt-driven worker.

use super::behaviors::{system_prompt_for, StageBehavior};
use crate::context::ExecutionContext;
use crate::core::StageId;
use crate::errors::WorkerCallError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Structured output of a worker call.
pub type WorkerOutput = Map<String, Value>;

/// Produces the output of one stage.
///
/// Implementations must be cheap to share; the dispatcher hands out the
/// same instance to every pipeline.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The stage this worker serves.
    fn stage(&self) -> StageId;

    /// Human-readable worker name, recorded as the approver on approve-role stages.
    fn name(&self) -> &str;

    /// Runs the worker against the current context.
    async fn run(&self, ctx: &ExecutionContext) -> Result<WorkerOutput, WorkerCallError>;
}

/// A request to the external model API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// The stage being run.
    pub stage: StageId,
    /// System prompt.
    pub system_prompt: String,
    /// User prompt.
    pub prompt: String,
}

/// Client for the external model API behind prompt workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Sends a request and returns the raw text response.
    async fn complete(&self, request: WorkerRequest) -> Result<String, WorkerCallError>;
}

/// A worker that renders a prompt from the context and parses the model's reply.
pub struct PromptWorker {
    behavior: &'static StageBehavior,
    client: Arc<dyn WorkerClient>,
}

impl PromptWorker {
    /// Creates a prompt worker for a behavior.
    #[must_use]
    pub fn new(behavior: &'static StageBehavior, client: Arc<dyn WorkerClient>) -> Self {
        Self { behavior, client }
    }
}

impl std::fmt::Debug for PromptWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptWorker")
            .field("stage", &self.behavior.stage)
            .field("name", &self.behavior.name)
            .finish()
    }
}

#[async_trait]
impl Worker for PromptWorker {
    fn stage(&self) -> StageId {
        self.behavior.stage
    }

    fn name(&self) -> &str {
        self.behavior.name
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<WorkerOutput, WorkerCallError> {
        let request = WorkerRequest {
            stage: self.behavior.stage,
            system_prompt: system_prompt_for(self.behavior),
            prompt: self.behavior.build_prompt(ctx),
        };
        debug!(
            stage = %self.behavior.stage,
            worker = self.behavior.name,
            prompt_len = request.prompt.len(),
            "Calling worker"
        );
        let raw = self.client.complete(request).await?;
        Ok(parse_response(&raw))
    }
}

fn fenced_json() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
        .as_ref()
}

/// Parses a raw model response into a structured output.
///
/// The first JSON object found, inside a fenced block or bare, becomes the
/// output. Anything else is wrapped as `{"content": raw, "raw": raw}`.
#[must_use]
pub fn parse_response(raw: &str) -> WorkerOutput {
    let trimmed = raw.trim();
    let candidates = fenced_json()
        .into_iter()
        .flat_map(|re| re.captures_iter(trimmed))
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .chain(bare_object(trimmed));

    for candidate in candidates {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            return map;
        }
    }

    let mut fallback = Map::new();
    fallback.insert("content".to_string(), Value::String(raw.to_string()));
    fallback.insert("raw".to_string(), Value::String(raw.to_string()));
    fallback
}

fn bare_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::behavior;
    use mockall::predicate::function;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_bare_json() {
        let out = parse_response(r#"{"approved": true, "approval_notes": "fine"}"#);
        assert_eq!(out.get("approved"), Some(&json!(true)));
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let raw = "Here is my decision:\n```json\n{\"approved\": false}\n```\nThanks.";
        let out = parse_response(raw);
        assert_eq!(out.get("approved"), Some(&json!(false)));
        assert!(out.get("raw").is_none());
    }

    #[test]
    fn test_parse_falls_back_to_content() {
        let out = parse_response("just some prose");
        assert_eq!(out.get("content"), Some(&json!("just some prose")));
        assert_eq!(out.get("raw"), Some(&json!("just some prose")));

        let out = parse_response("[1, 2, 3]");
        assert_eq!(out.get("content"), Some(&json!("[1, 2, 3]")));
    }

    #[tokio::test]
    async fn test_prompt_worker_sends_behavior_prompts() {
        let mut client = MockWorkerClient::new();
        client
            .expect_complete()
            .with(function(|req: &WorkerRequest| {
                req.stage == StageId::DevelopmentApproval
                    && req.system_prompt.contains("\"approved\"")
                    && req.prompt.contains("DEV_REVIEW:")
            }))
            .times(1)
            .returning(|_| Ok(r#"{"approved": true}"#.to_string()));

        let worker = PromptWorker::new(behavior(StageId::DevelopmentApproval), Arc::new(client));
        let out = worker.run(&ExecutionContext::new()).await.unwrap();

        assert_eq!(worker.name(), "Development Manager Agent");
        assert_eq!(out.get("approved"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_prompt_worker_propagates_client_errors() {
        let mut client = MockWorkerClient::new();
        client
            .expect_complete()
            .returning(|req| Err(WorkerCallError::failed(req.stage, "rate limited")));

        let worker = PromptWorker::new(behavior(StageId::Security), Arc::new(client));
        let err = worker.run(&ExecutionContext::new()).await.unwrap_err();

        assert_eq!(err.stage(), StageId::Security);
    }
}
