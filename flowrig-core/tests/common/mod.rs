//! Shared harness for engine integration tests.

use flowrig_core::bus::EventBus;
use flowrig_core::catalog::PluginCatalog;
use flowrig_core::engine::PipelineEngine;
use flowrig_core::events::{EventKind, PipelineEvent};
use flowrig_core::plugins;
use flowrig_core::registry::DeviceRegistry;
use flowrig_core::store::CompositeStore;
use flowrig_core::types::{JsonMap, PipelineDefinition};
use serde_json::json;
use std::sync::{Arc, Mutex};

pub struct Harness {
    pub engine: PipelineEngine,
    pub registry: Arc<DeviceRegistry>,
    pub catalog: Arc<PluginCatalog>,
    pub bus: Arc<EventBus>,
    pub events: Arc<Mutex<Vec<PipelineEvent>>>,
}

/// Engine wired with builtin plugins and an event recorder.
pub async fn harness() -> Harness {
    harness_with_store(None).await
}

pub async fn harness_with_store(store: Option<Arc<dyn CompositeStore>>) -> Harness {
    let bus = Arc::new(EventBus::new());
    let catalog = Arc::new(PluginCatalog::new(None, bus.clone()));
    plugins::register_builtins(&catalog).await;
    let registry = Arc::new(DeviceRegistry::new(catalog.clone(), bus.clone()));

    let events: Arc<Mutex<Vec<PipelineEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe_all(EventBus::handler(move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
        }
    }));

    let mut engine = PipelineEngine::new(registry.clone(), catalog.clone(), bus.clone());
    if let Some(store) = store {
        engine = engine.with_composite_store(store);
    }
    Harness {
        engine,
        registry,
        catalog,
        bus,
        events,
    }
}

impl Harness {
    /// Create an auto-connected mock servo instance.
    pub async fn servo(&self, instance_id: &str) {
        let config: JsonMap = [("auto_connect".to_string(), json!(true))]
            .into_iter()
            .collect();
        self.registry
            .create("mock_servo", instance_id, config)
            .await
            .unwrap();
        // Drop the device lifecycle events so pipeline assertions start clean.
        self.events.lock().unwrap().clear();
    }

    /// Recorded events as (kind, node id) pairs for order assertions.
    pub fn event_trace(&self) -> Vec<(EventKind, Option<String>)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| {
                let node_id = match event {
                    PipelineEvent::NodeExecuting { node_id, .. }
                    | PipelineEvent::NodeCompleted { node_id, .. } => Some(node_id.clone()),
                    _ => None,
                };
                (event.kind(), node_id)
            })
            .collect()
    }

    /// Index of the first trace entry matching (kind, node).
    pub fn trace_index(&self, kind: EventKind, node_id: Option<&str>) -> Option<usize> {
        self.event_trace()
            .iter()
            .position(|(k, n)| *k == kind && n.as_deref() == node_id)
    }
}

pub fn pipeline(value: serde_json::Value) -> PipelineDefinition {
    serde_json::from_value(value).unwrap()
}
