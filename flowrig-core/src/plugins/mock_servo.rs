//! Simulated single-axis servo motor.

use crate::catalog::PluginRuntime;
use crate::device::{input_spec, validate_inputs, Device, DeviceFunction};
use crate::errors::FlowError;
use crate::types::{
    DeviceStatus, FunctionDescriptor, JsonMap, PluginDescriptor, ValueType,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct ServoState {
    status: DeviceStatus,
    error: Option<String>,
    position: f64,
    velocity: f64,
    homed: bool,
}

pub struct MockServoDevice {
    instance_id: String,
    axis: i64,
    max_position: f64,
    state: Mutex<ServoState>,
}

impl MockServoDevice {
    fn new(instance_id: &str, config: &JsonMap) -> Arc<dyn Device> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            axis: config.get("axis").and_then(|v| v.as_i64()).unwrap_or(0),
            max_position: config
                .get("max_position")
                .and_then(|v| v.as_f64())
                .unwrap_or(1000.0),
            state: Mutex::new(ServoState {
                status: DeviceStatus::Disconnected,
                error: None,
                position: 0.0,
                velocity: 0.0,
                homed: false,
            }),
        })
    }

    async fn home_axis(&self) -> f64 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut state = self.state.lock();
        state.position = 0.0;
        state.velocity = 0.0;
        state.homed = true;
        state.position
    }

    async fn move_to_position(&self, position: f64, speed: f64) -> Result<f64, FlowError> {
        if position < 0.0 || position > self.max_position {
            return Err(FlowError::validation(format!(
                "position {position} out of range [0, {}]",
                self.max_position
            )));
        }

        let distance = {
            let state = self.state.lock();
            (position - state.position).abs()
        };
        let move_time = if speed > 0.0 { distance / speed } else { 0.1 };
        // Cap the simulated travel time.
        tokio::time::sleep(Duration::from_secs_f64(move_time.min(0.2))).await;

        let mut state = self.state.lock();
        state.position = position;
        state.velocity = 0.0;
        Ok(state.position)
    }

    fn read_position(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.position, state.velocity)
    }
}

#[async_trait]
impl Device for MockServoDevice {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn status(&self) -> DeviceStatus {
        self.state.lock().status
    }

    fn last_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    fn config(&self) -> JsonMap {
        let mut config = JsonMap::new();
        config.insert("axis".into(), json!(self.axis));
        config.insert("max_position".into(), json!(self.max_position));
        config
    }

    fn info(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "id": self.instance_id,
            "type": "mock_servo",
            "status": state.status.as_str(),
            "config": { "axis": self.axis, "max_position": self.max_position },
            "state": {
                "position": state.position,
                "velocity": state.velocity,
                "homed": state.homed,
            },
        })
    }

    async fn connect(&self) -> Result<bool, FlowError> {
        self.state.lock().status = DeviceStatus::Connecting;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut state = self.state.lock();
        state.status = DeviceStatus::Connected;
        state.error = None;
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, FlowError> {
        self.state.lock().status = DeviceStatus::Disconnected;
        Ok(true)
    }

    async fn health_check(&self) -> Result<bool, FlowError> {
        Ok(self.status() == DeviceStatus::Connected)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn servo(device: &Arc<dyn Device>) -> Result<&MockServoDevice, FlowError> {
    device
        .as_any()
        .downcast_ref::<MockServoDevice>()
        .ok_or_else(|| {
            FlowError::invalid_state(format!(
                "device '{}' is not a mock servo",
                device.instance_id()
            ))
        })
}

fn require_connected(device: &Arc<dyn Device>) -> Result<(), FlowError> {
    if !device.is_connected() {
        return Err(FlowError::DeviceConnection {
            device_id: device.instance_id().to_string(),
            message: "device not connected".to_string(),
        });
    }
    Ok(())
}

// ─── Functions ────────────────────────────────────────────────

struct HomeFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for HomeFunction {
    async fn execute(&mut self, _inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        require_connected(&self.device)?;
        servo(&self.device)?.home_axis().await;
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        Ok(outputs)
    }
}

struct MoveFunction {
    device: Arc<dyn Device>,
}

impl MoveFunction {
    fn schema() -> BTreeMap<String, crate::types::InputSpec> {
        let mut schema = BTreeMap::new();
        schema.insert("position".into(), input_spec(ValueType::Number, true, None));
        schema.insert(
            "speed".into(),
            input_spec(ValueType::Number, false, Some(json!(100.0))),
        );
        schema
    }
}

#[async_trait]
impl DeviceFunction for MoveFunction {
    async fn execute(&mut self, inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        validate_inputs(inputs, &Self::schema())?;
        require_connected(&self.device)?;

        let position = inputs.get("position").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let speed = inputs.get("speed").and_then(|v| v.as_f64()).unwrap_or(100.0);
        let reached = servo(&self.device)?.move_to_position(position, speed).await?;

        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("position".into(), json!(reached));
        Ok(outputs)
    }
}

struct GetPositionFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for GetPositionFunction {
    async fn execute(&mut self, _inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        require_connected(&self.device)?;
        let (position, velocity) = servo(&self.device)?.read_position();
        let mut outputs = JsonMap::new();
        outputs.insert("position".into(), json!(position));
        outputs.insert("velocity".into(), json!(velocity));
        Ok(outputs)
    }
}

// ─── Registration ─────────────────────────────────────────────

fn function(
    id: &str,
    description: &str,
    inputs: Vec<(&str, crate::types::InputSpec)>,
    outputs: &[&str],
) -> FunctionDescriptor {
    FunctionDescriptor {
        id: id.into(),
        name: id.replace('_', " "),
        description: description.into(),
        inputs: inputs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        id: "mock_servo".into(),
        name: "Mock Servo".into(),
        version: "1.0.0".into(),
        author: "FlowRig".into(),
        description: "Simulated single-axis servo motor for testing".into(),
        category: "Motion".into(),
        color: "#3498db".into(),
        device_class: "MockServoDevice".into(),
        connection_types: vec!["simulated".into()],
        functions: vec![
            function(
                "home",
                "Home the servo axis",
                vec![("trigger", input_spec(ValueType::Trigger, false, None))],
                &["complete"],
            ),
            function(
                "move",
                "Move to an absolute position",
                vec![
                    ("trigger", input_spec(ValueType::Trigger, false, None)),
                    ("position", input_spec(ValueType::Number, true, None)),
                    ("speed", input_spec(ValueType::Number, false, Some(json!(100.0)))),
                ],
                &["complete", "position"],
            ),
            function(
                "get_position",
                "Read position and velocity",
                vec![("trigger", input_spec(ValueType::Trigger, false, None))],
                &["position", "velocity"],
            ),
        ],
    }
}

pub fn runtime() -> PluginRuntime {
    let mut functions: HashMap<String, crate::device::FunctionCtor> = HashMap::new();
    functions.insert("HomeFunction".into(), |device| Box::new(HomeFunction { device }));
    functions.insert("MoveFunction".into(), |device| Box::new(MoveFunction { device }));
    functions.insert("GetPositionFunction".into(), |device| {
        Box::new(GetPositionFunction { device })
    });
    PluginRuntime {
        device_ctor: MockServoDevice::new,
        functions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_is_range_checked() {
        let device = MockServoDevice::new("s1", &JsonMap::new());
        device.connect().await.unwrap();

        let mut function = MoveFunction {
            device: device.clone(),
        };
        let mut inputs: JsonMap = [("position".to_string(), json!(2000.0))]
            .into_iter()
            .collect();
        let err = function.execute(&mut inputs).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let mut inputs: JsonMap = [("position".to_string(), json!(500.0))]
            .into_iter()
            .collect();
        let outputs = function.execute(&mut inputs).await.unwrap();
        assert_eq!(outputs["position"], json!(500.0));
        // Speed default was filled in by the schema.
        assert_eq!(inputs["speed"], json!(100.0));
    }

    #[tokio::test]
    async fn functions_refuse_disconnected_devices() {
        let device = MockServoDevice::new("s1", &JsonMap::new());
        let mut function = HomeFunction {
            device: device.clone(),
        };
        let err = function.execute(&mut JsonMap::new()).await.unwrap_err();
        assert_eq!(err.error_type(), "DeviceConnectionError");
    }

    #[tokio::test]
    async fn home_then_read_reports_zero() {
        let device = MockServoDevice::new("s1", &JsonMap::new());
        device.connect().await.unwrap();

        let mut home = HomeFunction {
            device: device.clone(),
        };
        let outputs = home.execute(&mut JsonMap::new()).await.unwrap();
        assert_eq!(outputs["complete"], json!(true));

        let mut read = GetPositionFunction {
            device: device.clone(),
        };
        let outputs = read.execute(&mut JsonMap::new()).await.unwrap();
        assert_eq!(outputs["position"], json!(0.0));
        assert_eq!(outputs["velocity"], json!(0.0));
    }
}
