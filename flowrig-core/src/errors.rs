use serde_json::{json, Value};
use thiserror::Error;

/// Resource classes used by not-found / already-exists errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Pipeline,
    Composite,
    Device,
    Plugin,
}

impl Resource {
    fn as_str(self) -> &'static str {
        match self {
            Resource::Pipeline => "pipeline",
            Resource::Composite => "composite",
            Resource::Device => "device",
            Resource::Plugin => "plugin",
        }
    }

    fn not_found_type(self) -> &'static str {
        match self {
            Resource::Pipeline => "PipelineNotFoundError",
            Resource::Composite => "CompositeNotFoundError",
            Resource::Device => "DeviceNotFoundError",
            Resource::Plugin => "PluginNotFoundError",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain error taxonomy. Every variant carries a human message; the wire
/// form is `{error: {type, message, details?}}`.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{resource} '{id}' not found")]
    NotFound { resource: Resource, id: String },

    #[error("{resource} '{id}' already exists")]
    AlreadyExists { resource: Resource, id: String },

    #[error("{message}")]
    InvalidState { message: String },

    #[error("pipeline '{pipeline_id}' execution failed: {message}")]
    PipelineExecution {
        pipeline_id: String,
        message: String,
    },

    #[error("node '{node_id}' ({label}) failed: {message}")]
    NodeExecution {
        node_id: String,
        label: String,
        message: String,
        #[source]
        source: Option<Box<FlowError>>,
    },

    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency {
        cycle: Vec<String>,
        all_cycles: Vec<Vec<String>>,
    },

    #[error("device '{device_id}' connection error: {message}")]
    DeviceConnection { device_id: String, message: String },

    #[error("function '{function_id}' on device '{instance_id}' failed: {message}")]
    DeviceFunction {
        instance_id: String,
        function_id: String,
        message: String,
    },

    #[error("failed to load plugin '{plugin_id}': {message}")]
    PluginLoad { plugin_id: String, message: String },

    #[error("invalid configuration for plugin '{plugin_id}': {message}")]
    PluginConfig { plugin_id: String, message: String },

    #[error("failed to save pipeline '{id}': {message}")]
    PipelineSave { id: String, message: String },

    #[error("failed to delete pipeline '{id}': {message}")]
    PipelineDelete { id: String, message: String },

    #[error("failed to save composite '{id}': {message}")]
    CompositeSave { id: String, message: String },

    #[error("failed to delete composite '{id}': {message}")]
    CompositeDelete { id: String, message: String },
}

impl FlowError {
    pub fn validation(message: impl Into<String>) -> Self {
        FlowError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        FlowError::InvalidState {
            message: message.into(),
        }
    }

    /// Wrap an arbitrary failure as a node-level error, unless it already
    /// is one (node errors keep their original attribution).
    pub fn node(node_id: &str, label: &str, err: FlowError) -> Self {
        if matches!(err, FlowError::NodeExecution { .. }) {
            return err;
        }
        FlowError::NodeExecution {
            node_id: node_id.to_string(),
            label: label.to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn node_message(node_id: &str, label: &str, message: impl Into<String>) -> Self {
        FlowError::NodeExecution {
            node_id: node_id.to_string(),
            label: label.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Wire-level error class name.
    pub fn error_type(&self) -> &'static str {
        match self {
            FlowError::Validation { .. } => "ValidationError",
            FlowError::NotFound { resource, .. } => resource.not_found_type(),
            FlowError::AlreadyExists { .. } => "AlreadyExistsError",
            FlowError::InvalidState { .. } => "InvalidStateError",
            FlowError::PipelineExecution { .. } => "PipelineExecutionError",
            FlowError::NodeExecution { .. } => "NodeExecutionError",
            FlowError::CircularDependency { .. } => "CircularDependencyError",
            FlowError::DeviceConnection { .. } => "DeviceConnectionError",
            FlowError::DeviceFunction { .. } => "DeviceFunctionError",
            FlowError::PluginLoad { .. } => "PluginLoadError",
            FlowError::PluginConfig { .. } => "PluginConfigError",
            FlowError::PipelineSave { .. } => "PipelineSaveError",
            FlowError::PipelineDelete { .. } => "PipelineDeleteError",
            FlowError::CompositeSave { .. } => "CompositeSaveError",
            FlowError::CompositeDelete { .. } => "CompositeDeleteError",
        }
    }

    /// Structured context for the wire form and logs.
    pub fn details(&self) -> Value {
        match self {
            FlowError::Validation { field, .. } => match field {
                Some(f) => json!({ "field": f }),
                None => json!({}),
            },
            FlowError::NotFound { resource, id } | FlowError::AlreadyExists { resource, id } => {
                json!({ "resource": resource.as_str(), "id": id })
            }
            FlowError::InvalidState { .. } => json!({}),
            FlowError::PipelineExecution { pipeline_id, .. } => {
                json!({ "pipeline_id": pipeline_id })
            }
            FlowError::NodeExecution { node_id, label, .. } => {
                json!({ "node_id": node_id, "node_label": label })
            }
            FlowError::CircularDependency { cycle, all_cycles } => {
                json!({ "cycle": cycle, "all_cycles": all_cycles })
            }
            FlowError::DeviceConnection { device_id, .. } => json!({ "device_id": device_id }),
            FlowError::DeviceFunction {
                instance_id,
                function_id,
                ..
            } => json!({ "instance_id": instance_id, "function_id": function_id }),
            FlowError::PluginLoad { plugin_id, .. }
            | FlowError::PluginConfig { plugin_id, .. } => json!({ "plugin_id": plugin_id }),
            FlowError::PipelineSave { id, .. }
            | FlowError::PipelineDelete { id, .. }
            | FlowError::CompositeSave { id, .. }
            | FlowError::CompositeDelete { id, .. } => json!({ "id": id }),
        }
    }

    /// `{error: {type, message, details}}` envelope for HTTP responses.
    pub fn to_wire(&self) -> Value {
        json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "details": self.details(),
            }
        })
    }

    /// Node id for `pipeline_error` events, when attributable.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::NodeExecution { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_wrap_preserves_existing_node_errors() {
        let inner = FlowError::node_message("a", "Node A", "boom");
        let wrapped = FlowError::node("b", "Node B", inner);
        match wrapped {
            FlowError::NodeExecution { node_id, .. } => assert_eq!(node_id, "a"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wire_form_carries_type_and_details() {
        let err = FlowError::CircularDependency {
            cycle: vec!["a".into(), "b".into()],
            all_cycles: vec![vec!["a".into(), "b".into()]],
        };
        assert_eq!(err.error_type(), "CircularDependencyError");
        let wire = err.to_wire();
        assert_eq!(wire["error"]["type"], "CircularDependencyError");
        assert_eq!(wire["error"]["details"]["cycle"][0], "a");
        assert!(err.to_string().to_lowercase().contains("circular"));
    }

    #[test]
    fn not_found_types_are_resource_specific() {
        let err = FlowError::NotFound {
            resource: Resource::Device,
            id: "servo_1".into(),
        };
        assert_eq!(err.error_type(), "DeviceNotFoundError");
    }
}
