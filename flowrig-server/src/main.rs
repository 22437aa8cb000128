use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use flowrig_core::bus::EventBus;
use flowrig_core::catalog::PluginCatalog;
use flowrig_core::engine::PipelineEngine;
use flowrig_core::plugins;
use flowrig_core::registry::DeviceRegistry;
use flowrig_core::store::{CompositeStore, PipelineStore};
use flowrig_core::store_json::{JsonCompositeStore, JsonPipelineStore};
use flowrig_server::{router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let plugin_dir = parse_arg("--plugin-dir")
        .or_else(|| std::env::var("FLOWRIG_PLUGIN_DIR").ok())
        .unwrap_or_else(|| "plugins".to_string());
    let data_dir = parse_arg("--data-dir")
        .or_else(|| std::env::var("FLOWRIG_DATA_DIR").ok())
        .unwrap_or_else(|| "data".to_string());
    let addr = parse_arg("--listen")
        .or_else(|| std::env::var("FLOWRIG_LISTEN").ok())
        .unwrap_or_else(|| "0.0.0.0:8000".to_string());

    let bus = Arc::new(EventBus::new());

    let catalog = Arc::new(PluginCatalog::new(
        Some(PathBuf::from(&plugin_dir)),
        bus.clone(),
    ));
    plugins::register_builtins(&catalog).await;
    let discovered = catalog.discover().await;
    tracing::info!(count = discovered.len(), %plugin_dir, "plugins available");

    let registry = Arc::new(DeviceRegistry::new(catalog.clone(), bus.clone()));

    let data_root = PathBuf::from(&data_dir);
    let pipelines: Arc<dyn PipelineStore> =
        Arc::new(JsonPipelineStore::new(data_root.join("pipelines")).await?);
    let composites: Arc<dyn CompositeStore> =
        Arc::new(JsonCompositeStore::new(data_root.join("composites")).await?);

    let engine = Arc::new(
        PipelineEngine::new(registry.clone(), catalog.clone(), bus.clone())
            .with_composite_store(composites.clone()),
    );

    let state = AppState {
        engine,
        registry,
        catalog,
        pipelines,
        composites,
        bus,
        ws_connections: Arc::new(AtomicUsize::new(0)),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "flowrig server listening");
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Read `--flag <value>` from the command line.
fn parse_arg(flag: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}
