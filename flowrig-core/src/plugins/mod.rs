//! Builtin simulated device plugins.
//!
//! Each plugin contributes a descriptor (the metadata a manifest would
//! declare) and a runtime (device constructor plus function constructor
//! symbol table). External plugins follow the same shape, registering
//! their runtime against a `config.yaml` manifest in the plugin directory.

pub mod mock_servo;
pub mod power_supply;

use crate::catalog::PluginCatalog;

/// Register every builtin plugin with the catalog. Called once at startup.
pub async fn register_builtins(catalog: &PluginCatalog) {
    catalog
        .register_builtin(mock_servo::descriptor(), mock_servo::runtime())
        .await;
    catalog
        .register_builtin(power_supply::descriptor(), power_supply::runtime())
        .await;
}
