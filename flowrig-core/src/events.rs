use crate::types::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telemetry records published on the event bus during execution.
///
/// The serialized form is the external WebSocket contract: one JSON object
/// per event, tagged by `type`, timestamps in ISO-8601.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline_id: String,
        pipeline_name: String,
        timestamp: DateTime<Utc>,
        node_count: usize,
    },
    NodeExecuting {
        pipeline_id: String,
        node_id: String,
        label: String,
        node_type: String,
        function_id: Option<String>,
        timestamp: DateTime<Utc>,
        /// 1-based loop counter, present only for loop iterations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_iterations: Option<i64>,
    },
    NodeCompleted {
        pipeline_id: String,
        node_id: String,
        label: String,
        timestamp: DateTime<Utc>,
        outputs: JsonMap,
        execution_time: f64,
    },
    NodeLog {
        pipeline_id: String,
        node_id: String,
        label: String,
        timestamp: DateTime<Utc>,
        message: String,
        level: String,
    },
    PipelineCompleted {
        pipeline_id: String,
        timestamp: DateTime<Utc>,
        success: bool,
        execution_time: f64,
        nodes_executed: usize,
    },
    PipelineError {
        pipeline_id: String,
        timestamp: DateTime<Utc>,
        error_message: String,
        node_id: Option<String>,
        error_type: Option<String>,
    },
    DeviceConnected {
        device_id: String,
        plugin_id: String,
        timestamp: DateTime<Utc>,
        status: String,
    },
    DeviceDisconnected {
        device_id: String,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    },
    DeviceError {
        device_id: String,
        timestamp: DateTime<Utc>,
        error_message: String,
        error_type: Option<String>,
    },
}

/// Event class tag used as the subscription key on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PipelineStarted,
    NodeExecuting,
    NodeCompleted,
    NodeLog,
    PipelineCompleted,
    PipelineError,
    DeviceConnected,
    DeviceDisconnected,
    DeviceError,
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::PipelineStarted { .. } => EventKind::PipelineStarted,
            PipelineEvent::NodeExecuting { .. } => EventKind::NodeExecuting,
            PipelineEvent::NodeCompleted { .. } => EventKind::NodeCompleted,
            PipelineEvent::NodeLog { .. } => EventKind::NodeLog,
            PipelineEvent::PipelineCompleted { .. } => EventKind::PipelineCompleted,
            PipelineEvent::PipelineError { .. } => EventKind::PipelineError,
            PipelineEvent::DeviceConnected { .. } => EventKind::DeviceConnected,
            PipelineEvent::DeviceDisconnected { .. } => EventKind::DeviceDisconnected,
            PipelineEvent::DeviceError { .. } => EventKind::DeviceError,
        }
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::PipelineStarted { pipeline_id, .. }
            | PipelineEvent::NodeExecuting { pipeline_id, .. }
            | PipelineEvent::NodeCompleted { pipeline_id, .. }
            | PipelineEvent::NodeLog { pipeline_id, .. }
            | PipelineEvent::PipelineCompleted { pipeline_id, .. }
            | PipelineEvent::PipelineError { pipeline_id, .. } => Some(pipeline_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tag() {
        let ev = PipelineEvent::PipelineStarted {
            pipeline_id: "p1".into(),
            pipeline_name: "Test".into(),
            timestamp: Utc::now(),
            node_count: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "pipeline_started");
        assert_eq!(v["node_count"], 3);
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn iteration_fields_are_omitted_when_absent() {
        let ev = PipelineEvent::NodeExecuting {
            pipeline_id: "p1".into(),
            node_id: "n1".into(),
            label: "n1".into(),
            node_type: "function".into(),
            function_id: Some("home".into()),
            timestamp: Utc::now(),
            iteration: None,
            total_iterations: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v.get("iteration").is_none());
        assert_eq!(v["function_id"], "home");
    }
}
