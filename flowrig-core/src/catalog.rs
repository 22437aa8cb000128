use crate::bus::EventBus;
use crate::device::{DeviceCtor, FunctionCtor};
use crate::errors::{FlowError, Resource};
use crate::events::PipelineEvent;
use crate::types::{FunctionDescriptor, JsonMap, PluginDescriptor};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Executable side of a plugin: the device constructor plus a symbol table
/// of function constructors keyed by type name (`MoveFunction`, ...).
/// Runtimes are registered in-process; the manifest on disk supplies the
/// metadata only.
#[derive(Clone)]
pub struct PluginRuntime {
    pub device_ctor: DeviceCtor,
    pub functions: HashMap<String, FunctionCtor>,
}

/// A plugin with constructors resolved, cached by the catalog.
#[derive(Debug)]
pub struct LoadedPlugin {
    pub descriptor: Arc<PluginDescriptor>,
    pub device_ctor: DeviceCtor,
    /// Function constructors keyed by function id.
    pub functions: HashMap<String, FunctionCtor>,
}

// ─── Manifest (config.yaml) ───────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct ManifestPlugin {
    name: Option<String>,
    version: Option<String>,
    author: Option<String>,
    description: Option<String>,
    category: Option<String>,
    color: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestDevice {
    class: Option<String>,
    #[serde(default)]
    connection_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PluginManifest {
    #[serde(default)]
    plugin: ManifestPlugin,
    #[serde(default)]
    device: ManifestDevice,
    #[serde(default)]
    functions: Vec<FunctionDescriptor>,
}

impl PluginManifest {
    fn into_descriptor(self, plugin_id: &str) -> PluginDescriptor {
        PluginDescriptor {
            id: plugin_id.to_string(),
            name: self.plugin.name.unwrap_or_else(|| plugin_id.to_string()),
            version: self.plugin.version.unwrap_or_else(|| "1.0.0".to_string()),
            author: self.plugin.author.unwrap_or_else(|| "Unknown".to_string()),
            description: self.plugin.description.unwrap_or_default(),
            category: self.plugin.category.unwrap_or_else(|| "General".to_string()),
            color: self.plugin.color.unwrap_or_else(|| "#888888".to_string()),
            device_class: self.device.class.unwrap_or_default(),
            connection_types: self.device.connection_types,
            functions: self.functions,
        }
    }
}

/// Convert a function id to its constructor's type name:
/// `move_absolute` → `MoveAbsoluteFunction`. The rule is part of the
/// plugin authoring contract.
pub fn function_type_name(function_id: &str) -> String {
    let pascal: String = function_id
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    format!("{pascal}Function")
}

#[derive(Default)]
struct CatalogState {
    descriptors: HashMap<String, Arc<PluginDescriptor>>,
    runtimes: HashMap<String, PluginRuntime>,
    loaded: HashMap<String, Arc<LoadedPlugin>>,
}

/// Plugin catalog: resolves a plugin id to its descriptor and constructor
/// tables. Descriptors come from builtin registration and from `config.yaml`
/// manifests under the plugin directory; loading is lazy and cached.
pub struct PluginCatalog {
    plugin_dir: Option<PathBuf>,
    bus: Arc<EventBus>,
    state: RwLock<CatalogState>,
}

impl PluginCatalog {
    pub fn new(plugin_dir: Option<PathBuf>, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_dir,
            bus,
            state: RwLock::new(CatalogState::default()),
        }
    }

    /// Register a compiled-in plugin: metadata plus runtime in one step.
    pub async fn register_builtin(&self, descriptor: PluginDescriptor, runtime: PluginRuntime) {
        let mut state = self.state.write().await;
        let id = descriptor.id.clone();
        state.descriptors.insert(id.clone(), Arc::new(descriptor));
        state.runtimes.insert(id.clone(), runtime);
        tracing::info!(plugin_id = %id, "registered builtin plugin");
    }

    /// Register the executable runtime for a plugin whose metadata lives in
    /// a manifest on disk.
    pub async fn register_runtime(&self, plugin_id: &str, runtime: PluginRuntime) {
        let mut state = self.state.write().await;
        state.runtimes.insert(plugin_id.to_string(), runtime);
    }

    /// Scan the plugin directory for manifests. Subdirectories starting
    /// with `_` are skipped; a directory without a readable manifest is
    /// logged and skipped. Returns all known descriptors afterwards.
    pub async fn discover(&self) -> Vec<Arc<PluginDescriptor>> {
        if let Some(dir) = self.plugin_dir.clone() {
            match tokio::fs::read_dir(&dir).await {
                Ok(mut entries) => {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let path = entry.path();
                        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        if !path.is_dir() || name.starts_with('_') {
                            continue;
                        }
                        match self.read_manifest(&path, name).await {
                            Ok(descriptor) => {
                                let mut state = self.state.write().await;
                                tracing::info!(plugin_id = %name, "discovered plugin");
                                state
                                    .descriptors
                                    .insert(name.to_string(), Arc::new(descriptor));
                            }
                            Err(err) => {
                                tracing::error!(plugin_id = %name, %err, "skipping plugin");
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), %err, "plugin directory not readable");
                }
            }
        }

        let state = self.state.read().await;
        let mut all: Vec<_> = state.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn read_manifest(
        &self,
        dir: &std::path::Path,
        plugin_id: &str,
    ) -> Result<PluginDescriptor, FlowError> {
        let manifest_path = dir.join("config.yaml");
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| FlowError::PluginConfig {
                plugin_id: plugin_id.to_string(),
                message: format!("missing config.yaml: {e}"),
            })?;
        let manifest: PluginManifest =
            serde_yaml::from_str(&raw).map_err(|e| FlowError::PluginConfig {
                plugin_id: plugin_id.to_string(),
                message: format!("malformed config.yaml: {e}"),
            })?;
        Ok(manifest.into_descriptor(plugin_id))
    }

    pub async fn descriptor(&self, plugin_id: &str) -> Option<Arc<PluginDescriptor>> {
        self.state.read().await.descriptors.get(plugin_id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<PluginDescriptor>> {
        let state = self.state.read().await;
        let mut all: Vec<_> = state.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Materialize constructors for a plugin, caching the result. Declared
    /// functions whose constructor is missing from the runtime symbol table
    /// are warned about but do not fail the load.
    pub async fn load(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>, FlowError> {
        {
            let state = self.state.read().await;
            if let Some(loaded) = state.loaded.get(plugin_id) {
                return Ok(loaded.clone());
            }
        }

        let mut state = self.state.write().await;
        // Another loader may have won the race.
        if let Some(loaded) = state.loaded.get(plugin_id) {
            return Ok(loaded.clone());
        }

        let descriptor = state
            .descriptors
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound {
                resource: Resource::Plugin,
                id: plugin_id.to_string(),
            })?;
        let runtime = state
            .runtimes
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| FlowError::PluginLoad {
                plugin_id: plugin_id.to_string(),
                message: "no runtime registered for plugin".to_string(),
            })?;

        let mut functions = HashMap::new();
        for func in &descriptor.functions {
            let type_name = function_type_name(&func.id);
            match runtime.functions.get(&type_name) {
                Some(&ctor) => {
                    functions.insert(func.id.clone(), ctor);
                }
                None => {
                    tracing::warn!(
                        plugin_id,
                        function_id = %func.id,
                        %type_name,
                        "function constructor not found"
                    );
                }
            }
        }

        let loaded = Arc::new(LoadedPlugin {
            descriptor,
            device_ctor: runtime.device_ctor,
            functions,
        });
        state.loaded.insert(plugin_id.to_string(), loaded.clone());
        tracing::info!(
            plugin_id,
            functions = loaded.functions.len(),
            "loaded plugin"
        );
        Ok(loaded)
    }

    /// Drop cached constructors and resolve again.
    pub async fn reload(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>, FlowError> {
        self.state.write().await.loaded.remove(plugin_id);
        self.load(plugin_id).await
    }

    /// Drop cached constructors; returns whether the plugin was loaded.
    pub async fn unload(&self, plugin_id: &str) -> bool {
        let removed = self.state.write().await.loaded.remove(plugin_id).is_some();
        if removed {
            tracing::info!(plugin_id, "unloaded plugin");
        }
        removed
    }

    /// Stateless execution path: run a function on an ephemeral device
    /// built from empty config, publish any logs it emitted, discard the
    /// device. Unknown functions and internal failures are recoverable and
    /// reported inside the output map.
    pub async fn execute_stateless(
        &self,
        plugin_id: &str,
        function_id: &str,
        mut inputs: JsonMap,
    ) -> Result<JsonMap, FlowError> {
        let loaded = self.load(plugin_id).await?;

        let Some(&ctor) = loaded.functions.get(function_id) else {
            tracing::warn!(plugin_id, function_id, "function not found in plugin");
            let mut outputs = JsonMap::new();
            outputs.insert("complete".into(), serde_json::Value::Bool(true));
            return Ok(outputs);
        };

        let device = (loaded.device_ctor)(&format!("__ephemeral__{plugin_id}"), &JsonMap::new());
        let mut function = ctor(device);
        let result = function.execute(&mut inputs).await;

        for log in function.take_logs() {
            self.bus
                .publish(PipelineEvent::NodeLog {
                    pipeline_id: "direct_execution".into(),
                    node_id: format!("{plugin_id}.{function_id}"),
                    label: format!("{plugin_id}.{function_id}"),
                    timestamp: Utc::now(),
                    message: log.message,
                    level: log.level,
                })
                .await;
        }

        match result {
            Ok(outputs) => Ok(outputs),
            Err(err) => {
                tracing::error!(plugin_id, function_id, %err, "stateless execution failed");
                let mut outputs = JsonMap::new();
                outputs.insert("complete".into(), serde_json::Value::Bool(true));
                outputs.insert("error".into(), serde_json::Value::String(err.to_string()));
                Ok(outputs)
            }
        }
    }
}
