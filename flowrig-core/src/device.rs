use crate::errors::FlowError;
use crate::types::{DeviceStatus, InputSpec, JsonMap};
use async_trait::async_trait;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One log line captured during a function run, surfaced as a `node_log`
/// event on the stateless execution path.
#[derive(Clone, Debug)]
pub struct FunctionLog {
    pub level: String,
    pub message: String,
}

impl FunctionLog {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: "info".into(),
            message: message.into(),
        }
    }
}

/// A live hardware (or simulated) device. Implementations use interior
/// mutability: the registry hands out `Arc<dyn Device>` and allows
/// concurrent function execution on one instance; serializing access to
/// the underlying hardware is the device's own responsibility.
#[async_trait]
pub trait Device: Send + Sync {
    fn instance_id(&self) -> &str;
    fn status(&self) -> DeviceStatus;
    fn last_error(&self) -> Option<String>;
    /// The user-supplied construction config.
    fn config(&self) -> JsonMap;
    /// Introspection payload for the device listing.
    fn info(&self) -> serde_json::Value;

    async fn connect(&self) -> Result<bool, FlowError>;
    async fn disconnect(&self) -> Result<bool, FlowError>;
    async fn health_check(&self) -> Result<bool, FlowError>;

    /// Downcast hook so concrete function types can reach their device.
    fn as_any(&self) -> &dyn Any;

    fn is_connected(&self) -> bool {
        self.status() == DeviceStatus::Connected
    }
}

/// One invocable operation on a device. A fresh instance is constructed
/// per call, bound to the device it operates on.
#[async_trait]
pub trait DeviceFunction: Send {
    async fn execute(&mut self, inputs: &mut JsonMap) -> Result<JsonMap, FlowError>;

    /// Drain log lines emitted during `execute`.
    fn take_logs(&mut self) -> Vec<FunctionLog> {
        Vec::new()
    }
}

/// Constructs a device from (instance id, config).
pub type DeviceCtor = fn(&str, &JsonMap) -> Arc<dyn Device>;

/// Constructs a function bound to a device.
pub type FunctionCtor = fn(Arc<dyn Device>) -> Box<dyn DeviceFunction>;

/// Validate `inputs` against a declared schema: required pins must be
/// present, defaults are filled in, present values must match their
/// declared type.
pub fn validate_inputs(
    inputs: &mut JsonMap,
    schema: &BTreeMap<String, InputSpec>,
) -> Result<(), FlowError> {
    for (name, spec) in schema {
        if spec.required && !inputs.contains_key(name) {
            return Err(FlowError::validation(format!(
                "required input '{name}' is missing"
            )));
        }
        if !inputs.contains_key(name) {
            if let Some(default) = &spec.default {
                inputs.insert(name.clone(), default.clone());
            }
        }
        if let Some(value) = inputs.get(name) {
            if !spec.value_type.matches(value) {
                return Err(FlowError::Validation {
                    message: format!(
                        "input '{name}' has invalid type, expected {:?}",
                        spec.value_type
                    ),
                    field: Some(name.clone()),
                });
            }
        }
    }
    Ok(())
}

/// Shorthand for building an input schema in plugin registration code.
pub fn input_spec(
    value_type: crate::types::ValueType,
    required: bool,
    default: Option<serde_json::Value>,
) -> InputSpec {
    InputSpec {
        value_type,
        required,
        default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use serde_json::json;

    fn schema() -> BTreeMap<String, InputSpec> {
        let mut schema = BTreeMap::new();
        schema.insert("position".into(), input_spec(ValueType::Number, true, None));
        schema.insert(
            "speed".into(),
            input_spec(ValueType::Number, false, Some(json!(100.0))),
        );
        schema
    }

    #[test]
    fn defaults_are_applied_and_required_enforced() {
        let mut inputs: JsonMap = [("position".to_string(), json!(500.0))].into_iter().collect();
        validate_inputs(&mut inputs, &schema()).unwrap();
        assert_eq!(inputs["speed"], json!(100.0));

        let mut empty = JsonMap::new();
        let err = validate_inputs(&mut empty, &schema()).unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut inputs: JsonMap = [("position".to_string(), json!("far away"))]
            .into_iter()
            .collect();
        let err = validate_inputs(&mut inputs, &schema()).unwrap_err();
        assert!(err.to_string().contains("invalid type"));
    }
}
