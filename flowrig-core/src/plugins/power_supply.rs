//! Simulated bench power supply.

use crate::catalog::PluginRuntime;
use crate::device::{input_spec, validate_inputs, Device, DeviceFunction};
use crate::errors::FlowError;
use crate::types::{
    DeviceStatus, FunctionDescriptor, InputSpec, JsonMap, PluginDescriptor, ValueType,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct SupplyState {
    status: DeviceStatus,
    error: Option<String>,
    output_on: bool,
    set_voltage: f64,
    set_current: f64,
    actual_voltage: f64,
    actual_current: f64,
}

pub struct PowerSupplyDevice {
    instance_id: String,
    port: String,
    baudrate: i64,
    max_voltage: f64,
    max_current: f64,
    state: Mutex<SupplyState>,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

impl PowerSupplyDevice {
    fn new(instance_id: &str, config: &JsonMap) -> Arc<dyn Device> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            port: config
                .get("port")
                .and_then(|v| v.as_str())
                .unwrap_or("COM1")
                .to_string(),
            baudrate: config.get("baudrate").and_then(|v| v.as_i64()).unwrap_or(9600),
            max_voltage: config
                .get("max_voltage")
                .and_then(|v| v.as_f64())
                .unwrap_or(30.0),
            max_current: config
                .get("max_current")
                .and_then(|v| v.as_f64())
                .unwrap_or(5.0),
            state: Mutex::new(SupplyState {
                status: DeviceStatus::Disconnected,
                error: None,
                output_on: false,
                set_voltage: 0.0,
                set_current: 0.0,
                actual_voltage: 0.0,
                actual_current: 0.0,
            }),
        })
    }

    async fn power_on(&self) -> bool {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();
        state.output_on = true;
        state.actual_voltage = state.set_voltage + rng.gen_range(-0.02..0.02);
        state.actual_current = rng.gen_range(0.01..0.1);
        state.output_on
    }

    async fn power_off(&self) -> bool {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut state = self.state.lock();
        state.output_on = false;
        state.actual_voltage = 0.0;
        state.actual_current = 0.0;
        state.output_on
    }

    async fn set_voltage(&self, voltage: f64) -> Result<f64, FlowError> {
        if voltage < 0.0 || voltage > self.max_voltage {
            return Err(FlowError::validation(format!(
                "voltage {voltage} out of range [0, {}]",
                self.max_voltage
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();
        state.set_voltage = voltage;
        if state.output_on {
            state.actual_voltage = voltage + rng.gen_range(-0.02..0.02);
        }
        Ok(round3(state.actual_voltage))
    }

    async fn set_current(&self, current: f64) -> Result<f64, FlowError> {
        if current < 0.0 || current > self.max_current {
            return Err(FlowError::validation(format!(
                "current {current} out of range [0, {}]",
                self.max_current
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut state = self.state.lock();
        state.set_current = current;
        Ok(round3(state.set_current))
    }

    fn read_output(&self) -> (f64, f64, bool) {
        let state = self.state.lock();
        (
            round3(state.actual_voltage),
            round3(state.actual_current),
            state.output_on,
        )
    }
}

#[async_trait]
impl Device for PowerSupplyDevice {
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
        config.insert("port".into(), json!(self.port));
        config.insert("baudrate".into(), json!(self.baudrate));
        config.insert("max_voltage".into(), json!(self.max_voltage));
        config.insert("max_current".into(), json!(self.max_current));
        config
    }

    fn info(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "id": self.instance_id,
            "type": "power_supply",
            "status": state.status.as_str(),
            "config": {
                "port": self.port,
                "baudrate": self.baudrate,
                "max_voltage": self.max_voltage,
                "max_current": self.max_current,
            },
            "state": {
                "output_on": state.output_on,
                "voltage": state.actual_voltage,
                "current": state.actual_current,
            },
        })
    }

    async fn connect(&self) -> Result<bool, FlowError> {
        self.state.lock().status = DeviceStatus::Connecting;
        tokio::time::sleep(Duration::from_millis(100)).await;
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

fn supply(device: &Arc<dyn Device>) -> Result<&PowerSupplyDevice, FlowError> {
    device
        .as_any()
        .downcast_ref::<PowerSupplyDevice>()
        .ok_or_else(|| {
            FlowError::invalid_state(format!(
                "device '{}' is not a power supply",
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

struct PowerOnFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for PowerOnFunction {
    async fn execute(&mut self, _inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        require_connected(&self.device)?;
        let output_on = supply(&self.device)?.power_on().await;
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("output_on".into(), json!(output_on));
        Ok(outputs)
    }
}

struct PowerOffFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for PowerOffFunction {
    async fn execute(&mut self, _inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        require_connected(&self.device)?;
        let output_on = supply(&self.device)?.power_off().await;
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("output_on".into(), json!(output_on));
        Ok(outputs)
    }
}

struct SetVoltageFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for SetVoltageFunction {
    async fn execute(&mut self, inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        let mut schema: BTreeMap<String, InputSpec> = BTreeMap::new();
        schema.insert("voltage".into(), input_spec(ValueType::Number, true, None));
        validate_inputs(inputs, &schema)?;
        require_connected(&self.device)?;

        let voltage = inputs.get("voltage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let actual = supply(&self.device)?.set_voltage(voltage).await?;
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("actual_voltage".into(), json!(actual));
        Ok(outputs)
    }
}

struct SetCurrentFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for SetCurrentFunction {
    async fn execute(&mut self, inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        let mut schema: BTreeMap<String, InputSpec> = BTreeMap::new();
        schema.insert("current".into(), input_spec(ValueType::Number, true, None));
        validate_inputs(inputs, &schema)?;
        require_connected(&self.device)?;

        let current = inputs.get("current").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let actual = supply(&self.device)?.set_current(current).await?;
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("actual_current".into(), json!(actual));
        Ok(outputs)
    }
}

struct GetOutputFunction {
    device: Arc<dyn Device>,
}

#[async_trait]
impl DeviceFunction for GetOutputFunction {
    async fn execute(&mut self, _inputs: &mut JsonMap) -> Result<JsonMap, FlowError> {
        require_connected(&self.device)?;
        let (voltage, current, output_on) = supply(&self.device)?.read_output();
        let mut outputs = JsonMap::new();
        outputs.insert("complete".into(), json!(true));
        outputs.insert("voltage".into(), json!(voltage));
        outputs.insert("current".into(), json!(current));
        outputs.insert("output_on".into(), json!(output_on));
        Ok(outputs)
    }
}

// ─── Registration ─────────────────────────────────────────────

fn function(
    id: &str,
    description: &str,
    inputs: Vec<(&str, InputSpec)>,
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
        id: "power_supply".into(),
        name: "Power Supply".into(),
        version: "1.0.0".into(),
        author: "FlowRig".into(),
        description: "Simulated bench power supply".into(),
        category: "Power".into(),
        color: "#e67e22".into(),
        device_class: "PowerSupplyDevice".into(),
        connection_types: vec!["serial".into(), "simulated".into()],
        functions: vec![
            function(
                "power_on",
                "Enable the output",
                vec![("trigger", input_spec(ValueType::Trigger, false, None))],
                &["complete", "output_on"],
            ),
            function(
                "power_off",
                "Disable the output",
                vec![("trigger", input_spec(ValueType::Trigger, false, None))],
                &["complete", "output_on"],
            ),
            function(
                "set_voltage",
                "Set the output voltage",
                vec![
                    ("trigger", input_spec(ValueType::Trigger, false, None)),
                    ("voltage", input_spec(ValueType::Number, true, None)),
                ],
                &["complete", "actual_voltage"],
            ),
            function(
                "set_current",
                "Set the current limit",
                vec![
                    ("trigger", input_spec(ValueType::Trigger, false, None)),
                    ("current", input_spec(ValueType::Number, true, None)),
                ],
                &["complete", "actual_current"],
            ),
            function(
                "get_output",
                "Read voltage, current and output state",
                vec![("trigger", input_spec(ValueType::Trigger, false, None))],
                &["complete", "voltage", "current", "output_on"],
            ),
        ],
    }
}

pub fn runtime() -> PluginRuntime {
    let mut functions: HashMap<String, crate::device::FunctionCtor> = HashMap::new();
    functions.insert("PowerOnFunction".into(), |device| {
        Box::new(PowerOnFunction { device })
    });
    functions.insert("PowerOffFunction".into(), |device| {
        Box::new(PowerOffFunction { device })
    });
    functions.insert("SetVoltageFunction".into(), |device| {
        Box::new(SetVoltageFunction { device })
    });
    functions.insert("SetCurrentFunction".into(), |device| {
        Box::new(SetCurrentFunction { device })
    });
    functions.insert("GetOutputFunction".into(), |device| {
        Box::new(GetOutputFunction { device })
    });
    PluginRuntime {
        device_ctor: PowerSupplyDevice::new,
        functions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn voltage_is_range_checked() {
        let device = PowerSupplyDevice::new("psu_1", &JsonMap::new());
        device.connect().await.unwrap();

        let mut function = SetVoltageFunction {
            device: device.clone(),
        };
        let mut inputs: JsonMap = [("voltage".to_string(), json!(99.0))].into_iter().collect();
        let err = function.execute(&mut inputs).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn power_cycle_updates_output_state() {
        let device = PowerSupplyDevice::new("psu_1", &JsonMap::new());
        device.connect().await.unwrap();

        let mut set = SetVoltageFunction {
            device: device.clone(),
        };
        let mut inputs: JsonMap = [("voltage".to_string(), json!(12.0))].into_iter().collect();
        set.execute(&mut inputs).await.unwrap();

        let mut on = PowerOnFunction {
            device: device.clone(),
        };
        let outputs = on.execute(&mut JsonMap::new()).await.unwrap();
        assert_eq!(outputs["output_on"], json!(true));

        let mut read = GetOutputFunction {
            device: device.clone(),
        };
        let outputs = read.execute(&mut JsonMap::new()).await.unwrap();
        let voltage = outputs["voltage"].as_f64().unwrap();
        assert!((voltage - 12.0).abs() < 0.1);

        let mut off = PowerOffFunction {
            device: device.clone(),
        };
        let outputs = off.execute(&mut JsonMap::new()).await.unwrap();
        assert_eq!(outputs["output_on"], json!(false));
    }
}
