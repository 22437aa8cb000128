//! JSON-file persistence: one file per object named by its sanitized id,
//! plus a `_metadata.json` sidecar indexing `id → summary` for list
//! operations. Saves and deletes update both the file and the index.

use crate::errors::{FlowError, Resource};
use crate::store::{sanitize_id, validate_composite, CompositeStore, PipelineStore};
use crate::types::{
    CompositeDefinition, CompositeSummary, PipelineDefinition, PipelineSummary, StoredPipeline,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const METADATA_FILE: &str = "_metadata.json";

async fn read_metadata<S: DeserializeOwned>(dir: &Path) -> HashMap<String, S> {
    let path = dir.join(METADATA_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::error!(path = %path.display(), %err, "malformed metadata index, resetting");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

async fn write_metadata<S: Serialize>(
    dir: &Path,
    metadata: &HashMap<String, S>,
) -> Result<(), std::io::Error> {
    let raw = serde_json::to_string_pretty(metadata)?;
    tokio::fs::write(dir.join(METADATA_FILE), raw).await
}

fn object_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", sanitize_id(id)))
}

// ─── Pipelines ────────────────────────────────────────────────

pub struct JsonPipelineStore {
    dir: PathBuf,
}

impl JsonPipelineStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FlowError::PipelineSave {
                id: String::new(),
                message: format!("cannot create storage directory: {e}"),
            })?;
        tracing::info!(dir = %dir.display(), "pipeline store ready");
        Ok(Self { dir })
    }
}

#[async_trait]
impl PipelineStore for JsonPipelineStore {
    async fn save(&self, definition: &PipelineDefinition) -> Result<String, FlowError> {
        let id = definition.pipeline_id.clone();
        let save_err = |message: String| FlowError::PipelineSave {
            id: id.clone(),
            message,
        };

        let mut metadata: HashMap<String, PipelineSummary> = read_metadata(&self.dir).await;
        let now = Utc::now();
        let created_at = metadata.get(&id).map(|m| m.created_at).unwrap_or(now);

        let stored = StoredPipeline {
            pipeline_id: id.clone(),
            name: definition.name.clone(),
            created_at,
            updated_at: now,
            data: definition.clone(),
        };
        let raw = serde_json::to_string_pretty(&stored).map_err(|e| save_err(e.to_string()))?;
        tokio::fs::write(object_path(&self.dir, &id), raw)
            .await
            .map_err(|e| save_err(e.to_string()))?;

        metadata.insert(
            id.clone(),
            PipelineSummary {
                id: id.clone(),
                name: stored.name.clone(),
                created_at,
                updated_at: now,
            },
        );
        write_metadata(&self.dir, &metadata)
            .await
            .map_err(|e| save_err(e.to_string()))?;

        tracing::info!(pipeline_id = %id, "saved pipeline");
        Ok(id)
    }

    async fn get(&self, pipeline_id: &str) -> Result<Option<StoredPipeline>, FlowError> {
        let path = object_path(&self.dir, pipeline_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let stored = serde_json::from_str(&raw).map_err(|e| {
            FlowError::validation(format!("malformed pipeline file '{pipeline_id}': {e}"))
        })?;
        Ok(Some(stored))
    }

    async fn list(&self) -> Result<Vec<PipelineSummary>, FlowError> {
        let metadata: HashMap<String, PipelineSummary> = read_metadata(&self.dir).await;
        let mut summaries: Vec<PipelineSummary> = metadata.into_values().collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError> {
        let path = object_path(&self.dir, pipeline_id);
        if !path.exists() {
            return Err(FlowError::NotFound {
                resource: Resource::Pipeline,
                id: pipeline_id.to_string(),
            });
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FlowError::PipelineDelete {
                id: pipeline_id.to_string(),
                message: e.to_string(),
            })?;

        let mut metadata: HashMap<String, PipelineSummary> = read_metadata(&self.dir).await;
        metadata.remove(pipeline_id);
        write_metadata(&self.dir, &metadata)
            .await
            .map_err(|e| FlowError::PipelineDelete {
                id: pipeline_id.to_string(),
                message: e.to_string(),
            })?;

        tracing::info!(pipeline_id, "deleted pipeline");
        Ok(())
    }
}

// ─── Composites ───────────────────────────────────────────────

pub struct JsonCompositeStore {
    dir: PathBuf,
}

impl JsonCompositeStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FlowError::CompositeSave {
                id: String::new(),
                message: format!("cannot create storage directory: {e}"),
            })?;
        tracing::info!(dir = %dir.display(), "composite store ready");
        Ok(Self { dir })
    }
}

#[async_trait]
impl CompositeStore for JsonCompositeStore {
    async fn save(&self, definition: &CompositeDefinition) -> Result<String, FlowError> {
        validate_composite(definition)?;

        let id = definition.composite_id.clone();
        let save_err = |message: String| FlowError::CompositeSave {
            id: id.clone(),
            message,
        };

        let mut metadata: HashMap<String, CompositeSummary> = read_metadata(&self.dir).await;
        let now = Utc::now();
        let created_at = metadata.get(&id).map(|m| m.created_at).unwrap_or(now);

        let mut stored = definition.clone();
        stored.created_at = Some(created_at);
        stored.updated_at = Some(now);

        let raw = serde_json::to_string_pretty(&stored).map_err(|e| save_err(e.to_string()))?;
        tokio::fs::write(object_path(&self.dir, &id), raw)
            .await
            .map_err(|e| save_err(e.to_string()))?;

        metadata.insert(
            id.clone(),
            CompositeSummary {
                id: id.clone(),
                name: stored.name.clone(),
                category: stored.category.clone(),
                created_at,
                updated_at: now,
            },
        );
        write_metadata(&self.dir, &metadata)
            .await
            .map_err(|e| save_err(e.to_string()))?;

        tracing::info!(composite_id = %id, "saved composite");
        Ok(id)
    }

    async fn get(&self, composite_id: &str) -> Result<Option<CompositeDefinition>, FlowError> {
        let path = object_path(&self.dir, composite_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let definition = serde_json::from_str(&raw).map_err(|e| {
            FlowError::validation(format!("malformed composite file '{composite_id}': {e}"))
        })?;
        Ok(Some(definition))
    }

    async fn list(&self) -> Result<Vec<CompositeSummary>, FlowError> {
        let metadata: HashMap<String, CompositeSummary> = read_metadata(&self.dir).await;
        let mut summaries: Vec<CompositeSummary> = metadata.into_values().collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete(&self, composite_id: &str) -> Result<(), FlowError> {
        let path = object_path(&self.dir, composite_id);
        if !path.exists() {
            return Err(FlowError::NotFound {
                resource: Resource::Composite,
                id: composite_id.to_string(),
            });
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FlowError::CompositeDelete {
                id: composite_id.to_string(),
                message: e.to_string(),
            })?;

        let mut metadata: HashMap<String, CompositeSummary> = read_metadata(&self.dir).await;
        metadata.remove(composite_id);
        write_metadata(&self.dir, &metadata)
            .await
            .map_err(|e| FlowError::CompositeDelete {
                id: composite_id.to_string(),
                message: e.to_string(),
            })?;

        tracing::info!(composite_id, "deleted composite");
        Ok(())
    }
}
