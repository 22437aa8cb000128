use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases and constants ─────────────────────────────

/// Dynamic value map used for node configs, inputs and outputs.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Maximum nesting depth for composite nodes.
pub const MAX_COMPOSITE_DEPTH: usize = 5;

/// Per-loop iteration cap.
pub const MAX_LOOP_ITERATIONS: i64 = 1000;

// ─── Value typing ─────────────────────────────────────────────

/// Closed set of types declared on function pins and composite mappings.
/// Runtime values stay dynamic (`serde_json::Value`); these tags drive
/// input-schema validation only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    String,
    Boolean,
    Array,
    Object,
    Trigger,
    Any,
}

impl ValueType {
    /// Check a dynamic value against this declared type.
    pub fn matches(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            ValueType::Number => value.is_number(),
            ValueType::String => value.is_string(),
            // Triggers travel as booleans on the wire.
            ValueType::Boolean | ValueType::Trigger => matches!(value, Value::Bool(_)),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
            ValueType::Any => true,
        }
    }
}

/// Python-style truthiness for dynamic values: null and empty containers
/// are false, numbers are false only at zero.
pub fn truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// While-loop condition coercion: the strings "false", "0", "no" and ""
/// (case-insensitive) are false; anything else falls back to truthiness.
pub fn coerce_condition(value: &serde_json::Value) -> bool {
    if let serde_json::Value::String(s) = value {
        !matches!(s.to_lowercase().as_str(), "false" | "0" | "no" | "")
    } else {
        truthy(value)
    }
}

/// Coerce a dynamic value to an iteration count. Non-numeric values fall
/// back to the supplied default.
pub fn coerce_count(value: Option<&serde_json::Value>, default: i64) -> i64 {
    use serde_json::Value;
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::Bool(b)) => *b as i64,
        _ => default,
    }
}

// ─── Pipeline definition ──────────────────────────────────────

/// The four node classes the engine knows how to execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Function,
    Composite,
    ForLoop,
    WhileLoop,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Function => "function",
            NodeType::Composite => "composite",
            NodeType::ForLoop => "for_loop",
            NodeType::WhileLoop => "while_loop",
        }
    }

    pub fn is_loop(self) -> bool {
        matches!(self, NodeType::ForLoop | NodeType::WhileLoop)
    }
}

/// A nested `{nodes, edges}` graph carried by composites and embedded
/// composite nodes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Subgraph {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One unit of work on the canvas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    /// Bound device instance; absent means the stateless dispatch path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<String>,
    /// Inline composite body; takes precedence over `composite_id` lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<Subgraph>,
    /// Pin mappings for embedded composite nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<CompositeInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<CompositeOutput>,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<serde_json::Value>,
}

impl NodeDefinition {
    /// Display label for events and errors, falling back to the node id.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// A named value channel between two node pins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub id: String,
    pub source: String,
    pub source_handle: String,
    pub target: String,
    pub target_handle: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    #[serde(default)]
    pub variables: JsonMap,
}

impl PipelineDefinition {
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Edges feeding into `node_id`.
    pub fn edges_into<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeDefinition> {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Edges leaving `node_id`.
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeDefinition> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

// ─── Composite definition ─────────────────────────────────────

/// Input pin mapping: an external pin routed onto `<node>.<pin>` inside
/// the subgraph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeInput {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub maps_to: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

/// Output pin mapping, mirroring the input direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeOutput {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub maps_from: String,
    #[serde(default)]
    pub description: String,
}

fn default_composite_category() -> String {
    "Composite".to_string()
}

fn default_composite_color() -> String {
    "#9b59b6".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A reusable subgraph with declared input/output pin mappings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeDefinition {
    pub composite_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub subgraph: Subgraph,
    #[serde(default)]
    pub inputs: Vec<CompositeInput>,
    #[serde(default)]
    pub outputs: Vec<CompositeOutput>,
    #[serde(default = "default_composite_category")]
    pub category: String,
    #[serde(default = "default_composite_color")]
    pub color: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CompositeDefinition {
    /// Structural validation errors; empty means acceptable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.composite_id.is_empty() {
            errors.push("composite_id is required".to_string());
        }
        if self.name.is_empty() {
            errors.push("name is required".to_string());
        }
        for inp in &self.inputs {
            if !inp.maps_to.contains('.') {
                errors.push(format!(
                    "invalid input mapping for '{}': maps_to must be 'node_id.pin_name'",
                    inp.name
                ));
            }
        }
        for out in &self.outputs {
            if !out.maps_from.contains('.') {
                errors.push(format!(
                    "invalid output mapping for '{}': maps_from must be 'node_id.pin_name'",
                    out.name
                ));
            }
        }
        errors
    }
}

/// Save-time guard against a composite including itself. The execute-time
/// in-progress stack is the authoritative check for indirect cycles.
pub fn composite_self_reference_errors(composite_id: &str, subgraph: &Subgraph) -> Vec<String> {
    let mut errors = Vec::new();
    for node in &subgraph.nodes {
        if node.node_type == NodeType::Composite
            && node.composite_id.as_deref() == Some(composite_id)
        {
            errors.push(format!(
                "circular reference: composite '{composite_id}' cannot contain itself"
            ));
        }
    }
    errors
}

// ─── Plugin descriptors ───────────────────────────────────────

/// Declared input pin: type tag, required flag and optional default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Immutable plugin metadata produced by discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub color: String,
    pub device_class: String,
    #[serde(default)]
    pub connection_types: Vec<String>,
    #[serde(default)]
    pub functions: Vec<FunctionDescriptor>,
}

// ─── Device status ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Error => "error",
        }
    }

    /// Allowed lifecycle transitions. Any state may enter `Error`.
    pub fn can_transition(self, to: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnected)
                | (Error, Disconnected)
                | (_, Error)
        )
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry listing row for one live device instance.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub instance_id: String,
    pub plugin_id: String,
    pub status: DeviceStatus,
    pub config: JsonMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Execution result ─────────────────────────────────────────

/// Outcome of one engine invocation. `results` is the whole value store,
/// injected `__input__*` buckets included; callers may filter.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub pipeline_id: String,
    pub nodes_executed: usize,
    /// Wall time in seconds.
    pub execution_time: f64,
    pub results: std::collections::HashMap<String, JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Store summaries ──────────────────────────────────────────

/// Index row kept in the `_metadata.json` sidecar for list operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted pipeline: the definition wrapped with store timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredPipeline {
    pub pipeline_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: PipelineDefinition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_type_round_trips_snake_case() {
        let node: NodeDefinition = serde_json::from_value(json!({
            "id": "n1",
            "type": "for_loop",
            "config": {"count": 3}
        }))
        .unwrap();
        assert_eq!(node.node_type, NodeType::ForLoop);
        assert_eq!(node.display_label(), "n1");
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "for_loop");
    }

    #[test]
    fn truthiness_matches_dynamic_semantics() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("false"))); // plain truthiness: non-empty string
        assert!(truthy(&json!(0.5)));
    }

    #[test]
    fn condition_coercion_handles_string_forms() {
        assert!(!coerce_condition(&json!("false")));
        assert!(!coerce_condition(&json!("No")));
        assert!(!coerce_condition(&json!("0")));
        assert!(coerce_condition(&json!("yes")));
        assert!(!coerce_condition(&json!(false)));
    }

    #[test]
    fn count_coercion_falls_back_on_garbage() {
        assert_eq!(coerce_count(Some(&json!(7)), 1), 7);
        assert_eq!(coerce_count(Some(&json!(2.9)), 1), 2);
        assert_eq!(coerce_count(Some(&json!("12")), 1), 12);
        assert_eq!(coerce_count(Some(&json!("soon")), 1), 1);
        assert_eq!(coerce_count(None, 1), 1);
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use DeviceStatus::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Disconnected));
        assert!(Error.can_transition(Disconnected));
        assert!(Connected.can_transition(Error));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Error.can_transition(Connected));
    }

    #[test]
    fn self_reference_is_rejected() {
        let sub: Subgraph = serde_json::from_value(json!({
            "nodes": [{"id": "inner", "type": "composite", "composite_id": "cx"}],
            "edges": []
        }))
        .unwrap();
        assert_eq!(composite_self_reference_errors("cx", &sub).len(), 1);
        assert!(composite_self_reference_errors("other", &sub).is_empty());
    }
}
