//! The per-run execution context passed from stage to stage.

use crate::core::{Project, StageId};
use crate::errors::ContextConflictError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Keys seeded from the project before the first stage runs.
pub const SEED_KEYS: [&str; 8] = [
    "pipeline_id",
    "project_id",
    "project_name",
    "requirements",
    "enabled_domains",
    "deployment_enabled",
    "target_cloud",
    "scale_requirement",
];

/// Mutable key/value accumulator for one pipeline run.
///
/// Seed keys are written once before the first stage. After that the only
/// writer is [`ExecutionContext::record`], which stores a stage's output
/// under that stage's own key. A retry overwrites the same key; no stage
/// can reach another stage's key or a seed key.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: Map<String, Value>,
    writes: HashMap<StageId, u32>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context seeded from project attributes.
    #[must_use]
    pub fn for_project(pipeline_id: Uuid, project: &Project, scale_requirement: &str) -> Self {
        let mut values = Map::new();
        values.insert("pipeline_id".into(), Value::String(pipeline_id.to_string()));
        values.insert("project_id".into(), Value::String(project.id.to_string()));
        values.insert("project_name".into(), Value::String(project.name.clone()));
        values.insert(
            "requirements".into(),
            Value::String(project.requirements.clone()),
        );
        values.insert(
            "enabled_domains".into(),
            Value::Array(
                project
                    .enabled_domains
                    .iter()
                    .map(|d| Value::String(d.to_string()))
                    .collect(),
            ),
        );
        values.insert(
            "deployment_enabled".into(),
            Value::Bool(project.deployment_enabled),
        );
        values.insert(
            "target_cloud".into(),
            Value::String(project.target_cloud.clone()),
        );
        values.insert(
            "scale_requirement".into(),
            Value::String(scale_requirement.to_string()),
        );
        Self {
            values,
            writes: HashMap::new(),
        }
    }

    /// Writes a seed value.
    ///
    /// # Errors
    ///
    /// Returns `ContextConflictError` if the key is already set or belongs to a stage.
    pub fn seed(&mut self, key: impl Into<String>, value: Value) -> Result<(), ContextConflictError> {
        let key = key.into();
        if let Some(stage) = StageId::ALL.into_iter().find(|s| s.context_key() == key) {
            return Err(ContextConflictError::new(key, format!("stage '{stage}'")));
        }
        if self.values.contains_key(&key) {
            return Err(ContextConflictError::new(key, "seed"));
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Stores a stage's output under the stage's key and returns how many
    /// times that key has been written in this run.
    pub fn record(&mut self, stage: StageId, output: Value) -> u32 {
        self.values.insert(stage.context_key().to_string(), output);
        let writes = self.writes.entry(stage).or_insert(0);
        *writes += 1;
        *writes
    }

    /// Gets a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Gets the recorded output of a stage.
    #[must_use]
    pub fn stage_output(&self, stage: StageId) -> Option<&Value> {
        self.values.get(stage.context_key())
    }

    /// Number of times a stage's key was written.
    #[must_use]
    pub fn write_count(&self, stage: StageId) -> u32 {
        self.writes.get(&stage).copied().unwrap_or(0)
    }

    /// Checks if a key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns all keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the context is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a copy of all entries as a JSON object.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Domain;
    use serde_json::json;

    fn project() -> Project {
        Project::new("shop", "sell hats")
            .with_domains([Domain::Architecture])
            .with_target_cloud("gcp")
    }

    #[test]
    fn test_seeded_from_project() {
        let ctx = ExecutionContext::for_project(Uuid::nil(), &project(), "1M+ requests/day");

        for key in SEED_KEYS {
            assert!(ctx.contains_key(key), "missing {key}");
        }
        assert_eq!(ctx.get("enabled_domains"), Some(&json!(["architecture"])));
        assert_eq!(ctx.get("target_cloud"), Some(&json!("gcp")));
        assert_eq!(ctx.len(), SEED_KEYS.len());
    }

    #[test]
    fn test_seed_rejects_existing_and_stage_keys() {
        let mut ctx = ExecutionContext::for_project(Uuid::nil(), &project(), "");

        let err = ctx.seed("requirements", json!("other")).unwrap_err();
        assert_eq!(err.key, "requirements");

        let err = ctx.seed("approved_code", json!({})).unwrap_err();
        assert_eq!(err.owner, "stage 'development_approval'");

        ctx.seed("team", json!("platform")).unwrap();
        assert_eq!(ctx.get("requirements"), Some(&json!("sell hats")));
    }

    #[test]
    fn test_record_overwrites_only_own_key() {
        let mut ctx = ExecutionContext::new();
        ctx.record(StageId::Architecture, json!({"v": 1}));
        ctx.record(StageId::ArchitectureReview, json!({"score": 80}));

        let before = ctx.snapshot();
        let writes = ctx.record(StageId::Architecture, json!({"v": 2}));
        let after = ctx.snapshot();

        assert_eq!(writes, 2);
        assert_eq!(after["architecture_output"], json!({"v": 2}));
        assert_eq!(after["architecture_review"], before["architecture_review"]);
        assert_eq!(ctx.write_count(StageId::ArchitectureReview), 1);
        assert_eq!(ctx.stage_output(StageId::Testing), None);
    }
}
