//! flowrig-core: pipeline execution engine for node-based automation.
//!
//! Users compose pipelines (DAGs of nodes) in a visual editor; this crate
//! executes them against live or simulated devices while streaming execution
//! events to subscribers.
//!
//! Components:
//! - `types`: pipeline / node / edge / composite definitions and descriptors.
//! - `errors`: the `FlowError` taxonomy with wire-format serialization.
//! - `events`: the `PipelineEvent` telemetry records.
//! - `bus`: typed pub/sub event bus with isolated concurrent handlers.
//! - `graph`: DAG construction, cycle detection and level computation.
//! - `frame`: per-execution value store (one frame per pipeline invocation).
//! - `device`: `Device` / `DeviceFunction` capability traits.
//! - `catalog`: plugin discovery, lazy class loading, stateless execution.
//! - `registry`: device-instance lifecycle and function dispatch.
//! - `logic`: builtin control-flow functions (delay, branch, print, ...).
//! - `engine`: the level-parallel pipeline engine.
//! - `store` / `store_memory` / `store_json`: pipeline and composite
//!   persistence (trait, in-memory, JSON-file backends).
//! - `plugins`: builtin simulated device plugins (mock servo, power supply).

pub mod bus;
pub mod catalog;
pub mod device;
pub mod engine;
pub mod errors;
pub mod events;
pub mod frame;
pub mod graph;
pub mod logic;
pub mod plugins;
pub mod registry;
pub mod store;
pub mod store_json;
pub mod store_memory;
pub mod types;

pub use bus::{EventBus, SubscriptionId};
pub use catalog::{LoadedPlugin, PluginCatalog, PluginRuntime};
pub use device::{Device, DeviceFunction, FunctionLog};
pub use engine::PipelineEngine;
pub use errors::{FlowError, Resource};
pub use events::{EventKind, PipelineEvent};
pub use frame::Frame;
pub use graph::PipelineGraph;
pub use registry::DeviceRegistry;
pub use store::{CompositeStore, PipelineStore};
pub use store_json::{JsonCompositeStore, JsonPipelineStore};
pub use store_memory::{MemoryCompositeStore, MemoryPipelineStore};
pub use types::{
    CompositeDefinition, DeviceStatus, EdgeDefinition, ExecutionResult, NodeDefinition, NodeType,
    PipelineDefinition, PluginDescriptor, MAX_COMPOSITE_DEPTH, MAX_LOOP_ITERATIONS,
};
