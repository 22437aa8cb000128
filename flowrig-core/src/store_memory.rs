use crate::errors::{FlowError, Resource};
use crate::store::{validate_composite, CompositeStore, PipelineStore};
use crate::types::{
    CompositeDefinition, CompositeSummary, PipelineDefinition, PipelineSummary, StoredPipeline,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory `PipelineStore` for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryPipelineStore {
    pipelines: RwLock<HashMap<String, StoredPipeline>>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn save(&self, definition: &PipelineDefinition) -> Result<String, FlowError> {
        let mut pipelines = self.pipelines.write().await;
        let now = Utc::now();
        let created_at = pipelines
            .get(&definition.pipeline_id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        pipelines.insert(
            definition.pipeline_id.clone(),
            StoredPipeline {
                pipeline_id: definition.pipeline_id.clone(),
                name: definition.name.clone(),
                created_at,
                updated_at: now,
                data: definition.clone(),
            },
        );
        Ok(definition.pipeline_id.clone())
    }

    async fn get(&self, pipeline_id: &str) -> Result<Option<StoredPipeline>, FlowError> {
        Ok(self.pipelines.read().await.get(pipeline_id).cloned())
    }

    async fn list(&self) -> Result<Vec<PipelineSummary>, FlowError> {
        let pipelines = self.pipelines.read().await;
        let mut summaries: Vec<PipelineSummary> = pipelines
            .values()
            .map(|p| PipelineSummary {
                id: p.pipeline_id.clone(),
                name: p.name.clone(),
                created_at: p.created_at,
                updated_at: p.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError> {
        let removed = self.pipelines.write().await.remove(pipeline_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(FlowError::NotFound {
                resource: Resource::Pipeline,
                id: pipeline_id.to_string(),
            }),
        }
    }
}

/// In-memory `CompositeStore` with the same save-time validation as the
/// JSON backend.
#[derive(Default)]
pub struct MemoryCompositeStore {
    composites: RwLock<HashMap<String, CompositeDefinition>>,
}

impl MemoryCompositeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompositeStore for MemoryCompositeStore {
    async fn save(&self, definition: &CompositeDefinition) -> Result<String, FlowError> {
        validate_composite(definition)?;
        let mut composites = self.composites.write().await;
        let now = Utc::now();
        let mut stored = definition.clone();
        stored.created_at = composites
            .get(&definition.composite_id)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        composites.insert(definition.composite_id.clone(), stored);
        Ok(definition.composite_id.clone())
    }

    async fn get(&self, composite_id: &str) -> Result<Option<CompositeDefinition>, FlowError> {
        Ok(self.composites.read().await.get(composite_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CompositeSummary>, FlowError> {
        let composites = self.composites.read().await;
        let mut summaries: Vec<CompositeSummary> = composites
            .values()
            .map(|c| CompositeSummary {
                id: c.composite_id.clone(),
                name: c.name.clone(),
                category: c.category.clone(),
                created_at: c.created_at.unwrap_or_default(),
                updated_at: c.updated_at.unwrap_or_default(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete(&self, composite_id: &str) -> Result<(), FlowError> {
        let removed = self.composites.write().await.remove(composite_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(FlowError::NotFound {
                resource: Resource::Composite,
                id: composite_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pipeline_round_trip_and_idempotent_delete() {
        let store = MemoryPipelineStore::new();
        let def: PipelineDefinition = serde_json::from_value(json!({
            "pipeline_id": "p1",
            "name": "Test",
            "nodes": [{"id": "a", "type": "function", "config": {}}],
            "edges": [],
            "variables": {}
        }))
        .unwrap();

        store.save(&def).await.unwrap();
        let stored = store.get("p1").await.unwrap().unwrap();
        assert_eq!(stored.data.nodes.len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete("p1").await.unwrap();
        let err = store.delete("p1").await.unwrap_err();
        assert_eq!(err.error_type(), "PipelineNotFoundError");
    }

    #[tokio::test]
    async fn composite_save_rejects_self_reference() {
        let store = MemoryCompositeStore::new();
        let def: CompositeDefinition = serde_json::from_value(json!({
            "composite_id": "cx",
            "name": "CX",
            "subgraph": {
                "nodes": [{"id": "inner", "type": "composite", "composite_id": "cx"}],
                "edges": []
            }
        }))
        .unwrap();
        let err = store.save(&def).await.unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
    }
}
