use crate::errors::FlowError;
use crate::types::{
    composite_self_reference_errors, CompositeDefinition, CompositeSummary, PipelineDefinition,
    PipelineSummary, StoredPipeline,
};
use async_trait::async_trait;

/// Pipeline persistence. Backends: in-memory for tests, JSON files for
/// deployments.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persist a definition, stamping timestamps. Returns the pipeline id.
    async fn save(&self, definition: &PipelineDefinition) -> Result<String, FlowError>;
    async fn get(&self, pipeline_id: &str) -> Result<Option<StoredPipeline>, FlowError>;
    async fn list(&self) -> Result<Vec<PipelineSummary>, FlowError>;
    /// Delete is idempotent at most once: a second call is NotFound.
    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError>;
}

/// Composite-definition persistence. `get` is the read side consumed by
/// the engine while executing composite nodes.
#[async_trait]
pub trait CompositeStore: Send + Sync {
    async fn save(&self, definition: &CompositeDefinition) -> Result<String, FlowError>;
    async fn get(&self, composite_id: &str) -> Result<Option<CompositeDefinition>, FlowError>;
    async fn list(&self) -> Result<Vec<CompositeSummary>, FlowError>;
    async fn delete(&self, composite_id: &str) -> Result<(), FlowError>;
}

/// Reduce an id to filesystem-safe characters (`[A-Za-z0-9_-]`).
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Save-time composite validation: structural checks plus the static
/// self-reference guard.
pub fn validate_composite(definition: &CompositeDefinition) -> Result<(), FlowError> {
    let mut errors = definition.validate();
    errors.extend(composite_self_reference_errors(
        &definition.composite_id,
        &definition.subgraph,
    ));
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowError::validation(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_tricks() {
        assert_eq!(sanitize_id("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_id("my-pipeline_01"), "my-pipeline_01");
        assert_eq!(sanitize_id("weird id!"), "weirdid");
    }

    #[test]
    fn self_including_composite_fails_validation() {
        let definition: CompositeDefinition = serde_json::from_value(serde_json::json!({
            "composite_id": "cx",
            "name": "CX",
            "subgraph": {
                "nodes": [{"id": "inner", "type": "composite", "composite_id": "cx"}],
                "edges": []
            }
        }))
        .unwrap();
        let err = validate_composite(&definition).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }
}
