use crate::bus::EventBus;
use crate::catalog::PluginCatalog;
use crate::device::{Device, FunctionCtor};
use crate::errors::{FlowError, Resource};
use crate::events::PipelineEvent;
use crate::types::{truthy, DeviceInfo, JsonMap};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct RegisteredDevice {
    device: Arc<dyn Device>,
    plugin_id: String,
    /// Function constructors snapshotted at creation, keyed by function id.
    functions: Arc<HashMap<String, FunctionCtor>>,
}

/// Owns live device instances keyed by instance id and mediates function
/// invocation. Creation/removal mutate the table under one write lock;
/// `execute` takes a read snapshot and runs without holding it, so
/// concurrent executes on one instance are allowed.
pub struct DeviceRegistry {
    catalog: Arc<PluginCatalog>,
    bus: Arc<EventBus>,
    devices: RwLock<HashMap<String, RegisteredDevice>>,
}

impl DeviceRegistry {
    pub fn new(catalog: Arc<PluginCatalog>, bus: Arc<EventBus>) -> Self {
        Self {
            catalog,
            bus,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Create a device instance from a plugin. Fails with AlreadyExists if
    /// the id is taken. With `config.auto_connect` truthy the instance is
    /// connected immediately; a connect failure leaves the instance
    /// registered in `error` status.
    pub async fn create(
        &self,
        plugin_id: &str,
        instance_id: &str,
        config: JsonMap,
    ) -> Result<(), FlowError> {
        let loaded = self.catalog.load(plugin_id).await?;
        let auto_connect = config.get("auto_connect").map(truthy).unwrap_or(false);

        let device = {
            let mut devices = self.devices.write().await;
            if devices.contains_key(instance_id) {
                return Err(FlowError::AlreadyExists {
                    resource: Resource::Device,
                    id: instance_id.to_string(),
                });
            }
            let device = (loaded.device_ctor)(instance_id, &config);
            devices.insert(
                instance_id.to_string(),
                RegisteredDevice {
                    device: device.clone(),
                    plugin_id: plugin_id.to_string(),
                    functions: Arc::new(loaded.functions.clone()),
                },
            );
            device
        };
        tracing::info!(instance_id, plugin_id, "created device instance");

        if auto_connect {
            self.connect_device(instance_id, plugin_id, &device).await;
        }
        Ok(())
    }

    /// Remove an instance, disconnecting it first when connected.
    pub async fn remove(&self, instance_id: &str) -> Result<(), FlowError> {
        let device = {
            let devices = self.devices.read().await;
            devices
                .get(instance_id)
                .map(|d| d.device.clone())
                .ok_or_else(|| FlowError::NotFound {
                    resource: Resource::Device,
                    id: instance_id.to_string(),
                })?
        };

        if device.is_connected() {
            if let Err(err) = device.disconnect().await {
                tracing::warn!(instance_id, %err, "disconnect during removal failed");
            }
            self.bus
                .publish(PipelineEvent::DeviceDisconnected {
                    device_id: instance_id.to_string(),
                    timestamp: Utc::now(),
                    reason: Some("instance removed".to_string()),
                })
                .await;
        }

        self.devices.write().await.remove(instance_id);
        tracing::info!(instance_id, "removed device instance");
        Ok(())
    }

    pub async fn get(&self, instance_id: &str) -> Result<Arc<dyn Device>, FlowError> {
        let devices = self.devices.read().await;
        devices
            .get(instance_id)
            .map(|d| d.device.clone())
            .ok_or_else(|| FlowError::NotFound {
                resource: Resource::Device,
                id: instance_id.to_string(),
            })
    }

    pub async fn list(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.read().await;
        let mut infos: Vec<DeviceInfo> = devices
            .iter()
            .map(|(id, entry)| DeviceInfo {
                instance_id: id.clone(),
                plugin_id: entry.plugin_id.clone(),
                status: entry.device.status(),
                config: entry.device.config(),
                error: entry.device.last_error(),
            })
            .collect();
        infos.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        infos
    }

    pub async fn plugin_id(&self, instance_id: &str) -> Option<String> {
        let devices = self.devices.read().await;
        devices.get(instance_id).map(|d| d.plugin_id.clone())
    }

    /// Function ids available on an instance.
    pub async fn instance_functions(&self, instance_id: &str) -> Result<Vec<String>, FlowError> {
        let devices = self.devices.read().await;
        let entry = devices
            .get(instance_id)
            .ok_or_else(|| FlowError::NotFound {
                resource: Resource::Device,
                id: instance_id.to_string(),
            })?;
        let mut ids: Vec<String> = entry.functions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Run a function on a connected instance. A fresh function object is
    /// constructed per call.
    pub async fn execute(
        &self,
        instance_id: &str,
        function_id: &str,
        mut inputs: JsonMap,
    ) -> Result<JsonMap, FlowError> {
        let (device, functions) = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(instance_id)
                .ok_or_else(|| FlowError::NotFound {
                    resource: Resource::Device,
                    id: instance_id.to_string(),
                })?;
            (entry.device.clone(), entry.functions.clone())
        };

        if !device.is_connected() {
            return Err(FlowError::invalid_state(format!(
                "device '{instance_id}' is {} and cannot execute functions",
                device.status()
            )));
        }

        let Some(&ctor) = functions.get(function_id) else {
            let mut available: Vec<&str> = functions.keys().map(String::as_str).collect();
            available.sort();
            return Err(FlowError::DeviceFunction {
                instance_id: instance_id.to_string(),
                function_id: function_id.to_string(),
                message: format!("function not found, available: [{}]", available.join(", ")),
            });
        };

        tracing::debug!(instance_id, function_id, "executing device function");
        let mut function = ctor(device);
        function
            .execute(&mut inputs)
            .await
            .map_err(|err| match err {
                already @ FlowError::DeviceFunction { .. } => already,
                other => FlowError::DeviceFunction {
                    instance_id: instance_id.to_string(),
                    function_id: function_id.to_string(),
                    message: other.to_string(),
                },
            })
    }

    /// Connect one instance, publishing the device event. Connecting an
    /// already connected device is a no-op success.
    pub async fn connect(&self, instance_id: &str) -> Result<bool, FlowError> {
        let (device, plugin_id) = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(instance_id)
                .ok_or_else(|| FlowError::NotFound {
                    resource: Resource::Device,
                    id: instance_id.to_string(),
                })?;
            (entry.device.clone(), entry.plugin_id.clone())
        };
        if device.is_connected() {
            return Ok(true);
        }
        Ok(self.connect_device(instance_id, &plugin_id, &device).await)
    }

    /// Disconnect one instance, publishing the device event.
    pub async fn disconnect(&self, instance_id: &str) -> Result<bool, FlowError> {
        let device = self.get(instance_id).await?;
        let ok = device.disconnect().await.unwrap_or_else(|err| {
            tracing::warn!(instance_id, %err, "disconnect failed");
            false
        });
        self.bus
            .publish(PipelineEvent::DeviceDisconnected {
                device_id: instance_id.to_string(),
                timestamp: Utc::now(),
                reason: None,
            })
            .await;
        Ok(ok)
    }

    /// Best-effort connect of every instance, in parallel. Never raises.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        self.fan_out(|device| async move { device.connect().await })
            .await
    }

    /// Best-effort disconnect of every instance, in parallel.
    pub async fn disconnect_all(&self) -> HashMap<String, bool> {
        self.fan_out(|device| async move { device.disconnect().await })
            .await
    }

    /// Parallel health probe across all instances.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        self.fan_out(|device| async move { device.health_check().await })
            .await
    }

    async fn fan_out<F, Fut>(&self, op: F) -> HashMap<String, bool>
    where
        F: Fn(Arc<dyn Device>) -> Fut,
        Fut: std::future::Future<Output = Result<bool, FlowError>>,
    {
        let snapshot: Vec<(String, Arc<dyn Device>)> = {
            let devices = self.devices.read().await;
            devices
                .iter()
                .map(|(id, entry)| (id.clone(), entry.device.clone()))
                .collect()
        };

        let tasks = snapshot.into_iter().map(|(id, device)| {
            let fut = op(device);
            async move {
                let ok = match fut.await {
                    Ok(ok) => ok,
                    Err(err) => {
                        tracing::error!(instance_id = %id, %err, "device operation failed");
                        false
                    }
                };
                (id, ok)
            }
        });
        join_all(tasks).await.into_iter().collect()
    }

    /// Connect a device and publish the outcome event. Returns success.
    async fn connect_device(
        &self,
        instance_id: &str,
        plugin_id: &str,
        device: &Arc<dyn Device>,
    ) -> bool {
        match device.connect().await {
            Ok(true) => {
                self.bus
                    .publish(PipelineEvent::DeviceConnected {
                        device_id: instance_id.to_string(),
                        plugin_id: plugin_id.to_string(),
                        timestamp: Utc::now(),
                        status: device.status().to_string(),
                    })
                    .await;
                true
            }
            Ok(false) => {
                let message = device
                    .last_error()
                    .unwrap_or_else(|| "connect refused".to_string());
                tracing::warn!(instance_id, %message, "device connect failed");
                self.publish_device_error(instance_id, message).await;
                false
            }
            Err(err) => {
                tracing::warn!(instance_id, %err, "device connect failed");
                self.publish_device_error(instance_id, err.to_string()).await;
                false
            }
        }
    }

    async fn publish_device_error(&self, instance_id: &str, message: String) {
        self.bus
            .publish(PipelineEvent::DeviceError {
                device_id: instance_id.to_string(),
                timestamp: Utc::now(),
                error_message: message,
                error_type: Some("DeviceConnectionError".to_string()),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins;
    use crate::types::DeviceStatus;
    use serde_json::json;

    async fn registry() -> DeviceRegistry {
        let bus = Arc::new(EventBus::new());
        let catalog = Arc::new(PluginCatalog::new(None, bus.clone()));
        plugins::register_builtins(&catalog).await;
        DeviceRegistry::new(catalog, bus)
    }

    fn config(auto_connect: bool) -> JsonMap {
        [("auto_connect".to_string(), json!(auto_connect))]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn duplicate_instance_ids_are_rejected() {
        let registry = registry().await;
        registry
            .create("mock_servo", "servo_1", JsonMap::new())
            .await
            .unwrap();
        let err = registry
            .create("mock_servo", "servo_1", JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "AlreadyExistsError");
    }

    #[tokio::test]
    async fn auto_connect_brings_instance_up() {
        let registry = registry().await;
        registry
            .create("mock_servo", "servo_1", config(true))
            .await
            .unwrap();
        let device = registry.get("servo_1").await.unwrap();
        assert_eq!(device.status(), DeviceStatus::Connected);

        let infos = registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].plugin_id, "mock_servo");
        assert_eq!(infos[0].status, DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn execute_requires_connection() {
        let registry = registry().await;
        registry
            .create("mock_servo", "servo_1", JsonMap::new())
            .await
            .unwrap();
        let err = registry
            .execute("servo_1", "home", JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "InvalidStateError");

        registry.connect("servo_1").await.unwrap();
        let outputs = registry
            .execute("servo_1", "home", JsonMap::new())
            .await
            .unwrap();
        assert_eq!(outputs["complete"], json!(true));
    }

    #[tokio::test]
    async fn unknown_function_reports_available_ones() {
        let registry = registry().await;
        registry
            .create("mock_servo", "servo_1", config(true))
            .await
            .unwrap();
        let err = registry
            .execute("servo_1", "warp", JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "DeviceFunctionError");
        assert!(err.to_string().contains("home"));
    }

    #[tokio::test]
    async fn remove_disconnects_and_forgets() {
        let registry = registry().await;
        registry
            .create("mock_servo", "servo_1", config(true))
            .await
            .unwrap();
        registry.remove("servo_1").await.unwrap();
        let err = registry.remove("servo_1").await.unwrap_err();
        assert_eq!(err.error_type(), "DeviceNotFoundError");
    }

    #[tokio::test]
    async fn fan_outs_cover_every_instance() {
        let registry = registry().await;
        registry
            .create("mock_servo", "a", JsonMap::new())
            .await
            .unwrap();
        registry
            .create("power_supply", "b", JsonMap::new())
            .await
            .unwrap();

        let connected = registry.connect_all().await;
        assert_eq!(connected.len(), 2);
        assert!(connected.values().all(|&ok| ok));

        let health = registry.health_check_all().await;
        assert!(health["a"] && health["b"]);

        let disconnected = registry.disconnect_all().await;
        assert!(disconnected.values().all(|&ok| ok));
        let health = registry.health_check_all().await;
        assert!(!health["a"] && !health["b"]);
    }
}
