use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use flowrig_core::bus::EventBus;
use flowrig_core::catalog::PluginCatalog;
use flowrig_core::engine::PipelineEngine;
use flowrig_core::errors::FlowError;
use flowrig_core::registry::DeviceRegistry;
use flowrig_core::store::{CompositeStore, PipelineStore};
use flowrig_core::types::{CompositeDefinition, JsonMap, PipelineDefinition};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared handles threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PipelineEngine>,
    pub registry: Arc<DeviceRegistry>,
    pub catalog: Arc<PluginCatalog>,
    pub pipelines: Arc<dyn PipelineStore>,
    pub composites: Arc<dyn CompositeStore>,
    pub bus: Arc<EventBus>,
    pub ws_connections: Arc<AtomicUsize>,
}

/// Response wrapper mapping the core error taxonomy onto HTTP statuses.
pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        ApiError(err)
    }
}

/// Status mapping: 400 validation-class, 404 not-found, 409 conflicts,
/// 503 device connectivity, 500 otherwise.
pub fn status_for(err: &FlowError) -> StatusCode {
    match err {
        FlowError::Validation { .. }
        | FlowError::InvalidState { .. }
        | FlowError::CircularDependency { .. }
        | FlowError::PluginConfig { .. } => StatusCode::BAD_REQUEST,
        FlowError::NotFound { .. } => StatusCode::NOT_FOUND,
        FlowError::AlreadyExists { .. } => StatusCode::CONFLICT,
        FlowError::DeviceConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(self.0.to_wire())).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/pipelines/execute", post(execute_pipeline))
        .route("/api/v1/pipelines/save", post(save_pipeline))
        .route("/api/v1/pipelines", get(list_pipelines))
        .route(
            "/api/v1/pipelines/:pipeline_id",
            get(get_pipeline).delete(delete_pipeline),
        )
        .route("/api/v1/composites", get(list_composites).post(create_composite))
        .route(
            "/api/v1/composites/:composite_id",
            get(get_composite).put(update_composite).delete(delete_composite),
        )
        .route("/api/v1/devices", get(list_devices).post(create_device))
        .route("/api/v1/devices/function", post(execute_function))
        .route("/api/v1/devices/:instance_id", delete(remove_device))
        .route("/api/v1/devices/:instance_id/connect", post(connect_device))
        .route(
            "/api/v1/devices/:instance_id/disconnect",
            post(disconnect_device),
        )
        .route("/api/v1/plugins", get(list_plugins))
        .route("/api/v1/plugins/:plugin_id/reload", post(reload_plugin))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Pipelines ────────────────────────────────────────────────

async fn execute_pipeline(
    State(state): State<AppState>,
    Json(definition): Json<PipelineDefinition>,
) -> ApiResult {
    let result = state.engine.execute(&definition).await;
    Ok(Json(serde_json::to_value(result).map_err(|e| {
        FlowError::validation(format!("unserializable result: {e}"))
    })?))
}

async fn save_pipeline(
    State(state): State<AppState>,
    Json(definition): Json<PipelineDefinition>,
) -> ApiResult {
    let pipeline_id = state.pipelines.save(&definition).await?;
    Ok(Json(json!({ "pipeline_id": pipeline_id })))
}

async fn list_pipelines(State(state): State<AppState>) -> ApiResult {
    let pipelines = state.pipelines.list().await?;
    Ok(Json(json!({ "pipelines": pipelines })))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
) -> ApiResult {
    let stored = state.pipelines.get(&pipeline_id).await?.ok_or_else(|| {
        FlowError::NotFound {
            resource: flowrig_core::errors::Resource::Pipeline,
            id: pipeline_id.clone(),
        }
    })?;
    Ok(Json(json!(stored)))
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
) -> ApiResult {
    state.pipelines.delete(&pipeline_id).await?;
    Ok(Json(json!({ "deleted": pipeline_id })))
}

// ─── Composites ───────────────────────────────────────────────

async fn list_composites(State(state): State<AppState>) -> ApiResult {
    let composites = state.composites.list().await?;
    Ok(Json(json!({ "composites": composites })))
}

async fn create_composite(
    State(state): State<AppState>,
    Json(mut definition): Json<CompositeDefinition>,
) -> ApiResult {
    if definition.composite_id.is_empty() {
        definition.composite_id = format!("composite_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    }
    let composite_id = state.composites.save(&definition).await?;
    Ok(Json(json!({ "composite_id": composite_id })))
}

async fn get_composite(
    State(state): State<AppState>,
    Path(composite_id): Path<String>,
) -> ApiResult {
    let definition = state.composites.get(&composite_id).await?.ok_or_else(|| {
        FlowError::NotFound {
            resource: flowrig_core::errors::Resource::Composite,
            id: composite_id.clone(),
        }
    })?;
    Ok(Json(json!(definition)))
}

async fn update_composite(
    State(state): State<AppState>,
    Path(composite_id): Path<String>,
    Json(mut definition): Json<CompositeDefinition>,
) -> ApiResult {
    definition.composite_id = composite_id;
    let composite_id = state.composites.save(&definition).await?;
    Ok(Json(json!({ "composite_id": composite_id })))
}

async fn delete_composite(
    State(state): State<AppState>,
    Path(composite_id): Path<String>,
) -> ApiResult {
    state.composites.delete(&composite_id).await?;
    Ok(Json(json!({ "deleted": composite_id })))
}

// ─── Devices ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateDeviceRequest {
    plugin_id: String,
    instance_id: String,
    #[serde(default)]
    config: JsonMap,
}

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "devices": state.registry.list().await })))
}

async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<CreateDeviceRequest>,
) -> ApiResult {
    state
        .registry
        .create(&request.plugin_id, &request.instance_id, request.config)
        .await?;
    let device = state.registry.get(&request.instance_id).await?;
    Ok(Json(json!({
        "instance_id": request.instance_id,
        "status": device.status().as_str(),
    })))
}

async fn remove_device(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult {
    state.registry.remove(&instance_id).await?;
    Ok(Json(json!({ "deleted": instance_id })))
}

async fn connect_device(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult {
    let connected = state.registry.connect(&instance_id).await?;
    Ok(Json(json!({ "instance_id": instance_id, "connected": connected })))
}

async fn disconnect_device(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult {
    let disconnected = state.registry.disconnect(&instance_id).await?;
    Ok(Json(json!({ "instance_id": instance_id, "disconnected": disconnected })))
}

#[derive(Deserialize)]
struct ExecuteFunctionRequest {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    plugin_id: Option<String>,
    function_id: String,
    #[serde(default)]
    inputs: JsonMap,
}

/// Direct function execution: on a live instance when `instance_id` is
/// given, stateless through the catalog otherwise.
async fn execute_function(
    State(state): State<AppState>,
    Json(request): Json<ExecuteFunctionRequest>,
) -> ApiResult {
    let outputs = match (&request.instance_id, &request.plugin_id) {
        (Some(instance_id), _) if !instance_id.is_empty() => {
            state
                .registry
                .execute(instance_id, &request.function_id, request.inputs)
                .await?
        }
        (_, Some(plugin_id)) => {
            state
                .catalog
                .execute_stateless(plugin_id, &request.function_id, request.inputs)
                .await?
        }
        _ => {
            return Err(FlowError::validation(
                "either instance_id or plugin_id is required",
            )
            .into())
        }
    };
    Ok(Json(json!({ "outputs": outputs })))
}

// ─── Plugins ──────────────────────────────────────────────────

async fn list_plugins(State(state): State<AppState>) -> ApiResult {
    let plugins: Vec<_> = state
        .catalog
        .list()
        .await
        .iter()
        .map(|d| serde_json::to_value(d.as_ref()).unwrap_or(Value::Null))
        .collect();
    Ok(Json(json!({ "plugins": plugins })))
}

async fn reload_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> ApiResult {
    let loaded = state.catalog.reload(&plugin_id).await?;
    Ok(Json(json!({
        "plugin_id": plugin_id,
        "functions": loaded.functions.keys().collect::<Vec<_>>(),
    })))
}
