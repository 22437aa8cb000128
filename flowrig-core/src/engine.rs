use crate::bus::EventBus;
use crate::catalog::PluginCatalog;
use crate::errors::FlowError;
use crate::events::PipelineEvent;
use crate::frame::Frame;
use crate::graph::PipelineGraph;
use crate::logic;
use crate::registry::DeviceRegistry;
use crate::store::CompositeStore;
use crate::types::{
    coerce_condition, coerce_count, CompositeInput, CompositeOutput, ExecutionResult, JsonMap,
    NodeDefinition, NodeType, PipelineDefinition, MAX_COMPOSITE_DEPTH, MAX_LOOP_ITERATIONS,
};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-invocation execution context, cloned down the node recursion.
/// Composite nodes descend with a fresh frame, incremented depth and their
/// id pushed onto the in-progress stack.
#[derive(Clone)]
struct ExecCtx {
    pipeline: Arc<PipelineDefinition>,
    frame: Arc<Frame>,
    depth: usize,
    composite_stack: Arc<Vec<String>>,
    cancel: CancellationToken,
}

impl ExecCtx {
    fn descend(&self, pipeline: PipelineDefinition, composite_id: Option<&str>) -> Self {
        let mut stack = (*self.composite_stack).clone();
        if let Some(id) = composite_id {
            stack.push(id.to_string());
        }
        Self {
            pipeline: Arc::new(pipeline),
            frame: Arc::new(Frame::new()),
            depth: self.depth + 1,
            composite_stack: Arc::new(stack),
            cancel: self.cancel.clone(),
        }
    }
}

/// Pipeline execution engine.
///
/// Builds the dependency DAG for a definition, then walks its levels:
/// nodes within a level run concurrently, levels run in order. Composite
/// nodes recurse with an isolated frame; loop nodes drive the subregion
/// reachable from their `loop_body` handle. Every lifecycle transition is
/// published on the event bus.
pub struct PipelineEngine {
    registry: Arc<DeviceRegistry>,
    catalog: Arc<PluginCatalog>,
    bus: Arc<EventBus>,
    composites: Option<Arc<dyn CompositeStore>>,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        catalog: Arc<PluginCatalog>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            catalog,
            bus,
            composites: None,
        }
    }

    /// Attach the composite store consulted by composite nodes.
    pub fn with_composite_store(mut self, store: Arc<dyn CompositeStore>) -> Self {
        self.composites = Some(store);
        self
    }

    /// Execute a pipeline to completion.
    pub async fn execute(&self, definition: &PipelineDefinition) -> ExecutionResult {
        self.execute_with_cancel(definition, CancellationToken::new())
            .await
    }

    /// Execute a pipeline under a caller-held cancellation token.
    /// Cancellation is observed at level boundaries and between loop
    /// iterations; running device functions are not preempted.
    pub async fn execute_with_cancel(
        &self,
        definition: &PipelineDefinition,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let pipeline_id = definition.pipeline_id.clone();
        tracing::info!(%pipeline_id, "executing pipeline");
        let started = Instant::now();

        let ctx = ExecCtx {
            pipeline: Arc::new(definition.clone()),
            frame: Arc::new(Frame::new()),
            depth: 0,
            composite_stack: Arc::new(Vec::new()),
            cancel,
        };

        match self.run_top_level(&ctx).await {
            Ok(nodes_executed) => {
                let execution_time = started.elapsed().as_secs_f64();
                tracing::info!(
                    %pipeline_id,
                    nodes_executed,
                    execution_time,
                    "pipeline completed"
                );
                self.bus
                    .publish(PipelineEvent::PipelineCompleted {
                        pipeline_id: pipeline_id.clone(),
                        timestamp: Utc::now(),
                        success: true,
                        execution_time,
                        nodes_executed,
                    })
                    .await;
                ExecutionResult {
                    success: true,
                    pipeline_id,
                    nodes_executed,
                    execution_time,
                    results: ctx.frame.snapshot(),
                    error: None,
                }
            }
            Err(err) => {
                let execution_time = started.elapsed().as_secs_f64();
                tracing::error!(%pipeline_id, %err, "pipeline execution failed");
                self.bus
                    .publish(PipelineEvent::PipelineError {
                        pipeline_id: pipeline_id.clone(),
                        timestamp: Utc::now(),
                        error_message: err.to_string(),
                        node_id: err.node_id().map(String::from),
                        error_type: Some(err.error_type().to_string()),
                    })
                    .await;
                ExecutionResult {
                    success: false,
                    pipeline_id,
                    nodes_executed: 0,
                    execution_time,
                    results: ctx.frame.snapshot(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Analyze the graph and run all levels. Returns the executed count.
    async fn run_top_level(&self, ctx: &ExecCtx) -> Result<usize, FlowError> {
        let graph = PipelineGraph::build(&ctx.pipeline.nodes, &ctx.pipeline.edges);
        let order = graph.topological_order()?;
        let levels = graph.levels(&order);

        self.bus
            .publish(PipelineEvent::PipelineStarted {
                pipeline_id: ctx.pipeline.pipeline_id.clone(),
                pipeline_name: ctx.pipeline.name.clone(),
                timestamp: Utc::now(),
                node_count: order.len(),
            })
            .await;

        let mut nodes_executed = 0;
        for (level_index, level) in levels.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(FlowError::PipelineExecution {
                    pipeline_id: ctx.pipeline.pipeline_id.clone(),
                    message: "execution cancelled".to_string(),
                });
            }
            tracing::info!(
                level = level_index + 1,
                total = levels.len(),
                nodes = level.len(),
                "executing level"
            );

            for node_id in level {
                self.publish_node_executing(ctx, node_id, None, None).await;
            }

            let level_started = Instant::now();
            let results = join_all(
                level
                    .iter()
                    .map(|node_id| self.execute_node(node_id.clone(), ctx.clone())),
            )
            .await;
            let level_time = level_started.elapsed().as_secs_f64();

            if let Some(err) = results.into_iter().find_map(Result::err) {
                return Err(err);
            }

            for node_id in level {
                let node = ctx.pipeline.node(node_id);
                self.bus
                    .publish(PipelineEvent::NodeCompleted {
                        pipeline_id: ctx.pipeline.pipeline_id.clone(),
                        node_id: node_id.clone(),
                        label: node
                            .map(|n| n.display_label().to_string())
                            .unwrap_or_else(|| node_id.clone()),
                        timestamp: Utc::now(),
                        outputs: ctx.frame.outputs(node_id).unwrap_or_default(),
                        execution_time: level_time,
                    })
                    .await;
            }

            nodes_executed += level.len();
        }
        Ok(nodes_executed)
    }

    /// Execute one node and store its outputs in the current frame. Any
    /// failure is wrapped as a node-level error carrying id and label.
    fn execute_node(&self, node_id: String, ctx: ExecCtx) -> BoxFuture<'_, Result<(), FlowError>> {
        async move {
            let Some(node) = ctx.pipeline.node(&node_id).cloned() else {
                return Err(FlowError::node_message(
                    &node_id,
                    "Unknown",
                    format!("node '{node_id}' not found in pipeline definition"),
                ));
            };
            tracing::debug!(%node_id, node_type = node.node_type.as_str(), "executing node");

            let outputs = match node.node_type {
                NodeType::Function => self.run_function_node(&node, &ctx).await,
                NodeType::Composite => self.run_composite_node(&node, &ctx).await,
                NodeType::ForLoop => self.run_for_loop(&node, &ctx).await,
                NodeType::WhileLoop => self.run_while_loop(&node, &ctx).await,
            }
            .map_err(|e| FlowError::node(&node.id, node.display_label(), e))?;

            tracing::debug!(
                %node_id,
                outputs = ?outputs.keys().collect::<Vec<_>>(),
                "node completed"
            );
            ctx.frame.insert(&node.id, outputs);
            Ok(())
        }
        .boxed()
    }

    // ── Function nodes ──

    async fn run_function_node(
        &self,
        node: &NodeDefinition,
        ctx: &ExecCtx,
    ) -> Result<JsonMap, FlowError> {
        let function_id = node.function_id.clone().unwrap_or_default();
        let plugin_id = node.plugin_id.clone().unwrap_or_default();
        let inputs = self.collect_inputs(node, ctx);

        if plugin_id == logic::LOGIC_PLUGIN_ID {
            return Ok(logic::execute(&function_id, &inputs).await);
        }

        match node.device_instance.as_deref() {
            None | Some("") => {
                self.catalog
                    .execute_stateless(&plugin_id, &function_id, inputs)
                    .await
            }
            Some(instance_id) => self.registry.execute(instance_id, &function_id, inputs).await,
        }
    }

    // ── Composite nodes ──

    async fn run_composite_node(
        &self,
        node: &NodeDefinition,
        ctx: &ExecCtx,
    ) -> Result<JsonMap, FlowError> {
        if ctx.depth >= MAX_COMPOSITE_DEPTH {
            return Err(FlowError::node_message(
                &node.id,
                node.display_label(),
                format!("maximum composite nesting depth ({MAX_COMPOSITE_DEPTH}) exceeded"),
            ));
        }

        let composite_id = node.composite_id.clone();
        if let Some(id) = &composite_id {
            if ctx.composite_stack.contains(id) {
                return Err(FlowError::node_message(
                    &node.id,
                    node.display_label(),
                    format!("circular composite reference: '{id}' is already executing"),
                ));
            }
        }

        // Embedded subgraph wins over the store lookup.
        let (subgraph, input_mappings, output_mappings) = match &node.subgraph {
            Some(subgraph) => (subgraph.clone(), node.inputs.clone(), node.outputs.clone()),
            None => {
                let definition = match (&self.composites, &composite_id) {
                    (Some(store), Some(id)) => store.get(id).await?,
                    _ => None,
                };
                let Some(definition) = definition else {
                    return Err(FlowError::node_message(
                        &node.id,
                        node.display_label(),
                        format!(
                            "composite definition not found for '{}'",
                            composite_id.as_deref().unwrap_or("<unset>")
                        ),
                    ));
                };
                (definition.subgraph, definition.inputs, definition.outputs)
            }
        };

        if subgraph.is_empty() {
            tracing::warn!(node_id = %node.id, "composite has an empty subgraph");
            return Ok(JsonMap::new());
        }

        let external_inputs = self.collect_inputs(node, ctx);
        let sub_pipeline = PipelineDefinition {
            pipeline_id: format!("{}.{}", ctx.pipeline.pipeline_id, node.id),
            name: format!("Subgraph: {}", node.display_label()),
            nodes: subgraph.nodes,
            edges: subgraph.edges,
            variables: JsonMap::new(),
        };
        let sub_ctx = ctx.descend(sub_pipeline, composite_id.as_deref());

        self.inject_external_inputs(&sub_ctx, &input_mappings, &external_inputs);
        self.run_subgraph(&sub_ctx).await?;
        Ok(Self::project_outputs(&sub_ctx, &output_mappings))
    }

    /// Route mapped external inputs into `__input__` buckets of the child
    /// frame. Unmapped or absent inputs are simply not injected.
    fn inject_external_inputs(
        &self,
        sub_ctx: &ExecCtx,
        mappings: &[CompositeInput],
        external_inputs: &JsonMap,
    ) {
        for mapping in mappings {
            let Some((target_node, target_pin)) = mapping.maps_to.split_once('.') else {
                continue;
            };
            if let Some(value) = external_inputs.get(&mapping.name) {
                sub_ctx
                    .frame
                    .inject_input(target_node, target_pin, value.clone());
            }
        }
    }

    /// Run a composite subgraph sequentially along topological order.
    /// Level parallelism stays at the top level only.
    async fn run_subgraph(&self, sub_ctx: &ExecCtx) -> Result<(), FlowError> {
        let graph = PipelineGraph::build(&sub_ctx.pipeline.nodes, &sub_ctx.pipeline.edges);
        let order = graph.topological_order()?;
        tracing::debug!(
            pipeline_id = %sub_ctx.pipeline.pipeline_id,
            ?order,
            "composite execution order"
        );
        for sub_node_id in order {
            self.execute_node(sub_node_id, sub_ctx.clone()).await?;
        }
        Ok(())
    }

    /// Read declared outputs from the child frame. Declared mappings whose
    /// internal pin never produced a value are omitted.
    fn project_outputs(sub_ctx: &ExecCtx, mappings: &[CompositeOutput]) -> JsonMap {
        let mut outputs = JsonMap::new();
        for mapping in mappings {
            let Some((source_node, source_pin)) = mapping.maps_from.split_once('.') else {
                continue;
            };
            if let Some(value) = sub_ctx.frame.output_value(source_node, source_pin) {
                outputs.insert(mapping.name.clone(), value);
            }
        }
        outputs
    }

    // ── Loop nodes ──

    /// Nodes wired to this loop's `loop_body` output handle.
    fn loop_body_targets(node_id: &str, pipeline: &PipelineDefinition) -> Vec<String> {
        pipeline
            .edges_from(node_id)
            .filter(|e| e.source_handle == "loop_body")
            .map(|e| e.target.clone())
            .collect()
    }

    async fn run_for_loop(
        &self,
        node: &NodeDefinition,
        ctx: &ExecCtx,
    ) -> Result<JsonMap, FlowError> {
        let inputs = self.collect_inputs(node, ctx);
        let mut count = coerce_count(inputs.get("count"), 1).max(0);
        if count > MAX_LOOP_ITERATIONS {
            tracing::warn!(
                count,
                max = MAX_LOOP_ITERATIONS,
                "for loop count exceeds maximum, limiting"
            );
            count = MAX_LOOP_ITERATIONS;
        }
        tracing::info!(node_id = %node.id, count, "executing for loop");

        let body_targets = Self::loop_body_targets(&node.id, &ctx.pipeline);

        for i in 0..count {
            if ctx.cancel.is_cancelled() {
                return Err(FlowError::invalid_state("execution cancelled"));
            }

            ctx.frame.insert(
                &node.id,
                [
                    ("loop_body".to_string(), serde_json::json!(true)),
                    ("index".to_string(), serde_json::json!(i)),
                    ("iteration".to_string(), serde_json::json!(i + 1)),
                    ("total".to_string(), serde_json::json!(count)),
                ]
                .into_iter()
                .collect(),
            );

            self.publish_node_executing(ctx, &node.id, Some(i + 1), Some(count))
                .await;

            for target in &body_targets {
                self.execute_loop_body(target, ctx).await?;
            }
        }

        Ok([
            ("loop_body".to_string(), serde_json::json!(false)),
            (
                "index".to_string(),
                serde_json::json!(if count > 0 { count - 1 } else { 0 }),
            ),
            ("complete".to_string(), serde_json::json!(true)),
            ("iterations_completed".to_string(), serde_json::json!(count)),
        ]
        .into_iter()
        .collect())
    }

    async fn run_while_loop(
        &self,
        node: &NodeDefinition,
        ctx: &ExecCtx,
    ) -> Result<JsonMap, FlowError> {
        let max_iterations =
            coerce_count(node.config.get("max_iterations"), MAX_LOOP_ITERATIONS)
                .clamp(0, MAX_LOOP_ITERATIONS);
        tracing::info!(node_id = %node.id, max_iterations, "executing while loop");

        let body_targets = Self::loop_body_targets(&node.id, &ctx.pipeline);
        let mut iteration: i64 = 0;

        while iteration < max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(FlowError::invalid_state("execution cancelled"));
            }

            // Re-collect inputs so the condition sees values written by the
            // previous iteration's body.
            let inputs = self.collect_inputs(node, ctx);
            let condition = inputs
                .get("condition")
                .map(coerce_condition)
                .unwrap_or(true);
            if !condition {
                tracing::debug!(node_id = %node.id, iteration, "while condition false, exiting");
                break;
            }

            ctx.frame.insert(
                &node.id,
                [
                    ("loop_body".to_string(), serde_json::json!(true)),
                    ("index".to_string(), serde_json::json!(iteration)),
                    ("iteration".to_string(), serde_json::json!(iteration + 1)),
                ]
                .into_iter()
                .collect(),
            );

            self.publish_node_executing(ctx, &node.id, Some(iteration + 1), None)
                .await;

            for target in &body_targets {
                self.execute_loop_body(target, ctx).await?;
            }
            iteration += 1;
        }

        if iteration >= max_iterations {
            tracing::warn!(node_id = %node.id, max_iterations, "while loop reached max iterations");
        }

        Ok([
            ("loop_body".to_string(), serde_json::json!(false)),
            ("index".to_string(), serde_json::json!(iteration.max(1) - 1)),
            ("complete".to_string(), serde_json::json!(true)),
            (
                "iterations_completed".to_string(),
                serde_json::json!(iteration),
            ),
        ]
        .into_iter()
        .collect())
    }

    /// Breadth-first execution of one loop-body chain: run the start node,
    /// then every downstream node reachable through out-edges, stopping at
    /// other loop nodes (control-flow boundaries). Each node runs at most
    /// once per iteration.
    async fn execute_loop_body(&self, start_node_id: &str, ctx: &ExecCtx) -> Result<(), FlowError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([start_node_id.to_string()]);
        let body_ctx = ExecCtx {
            depth: ctx.depth + 1,
            ..ctx.clone()
        };

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            self.execute_node(current.clone(), body_ctx.clone()).await?;

            for edge in ctx.pipeline.edges_from(&current) {
                let target_is_loop = ctx
                    .pipeline
                    .node(&edge.target)
                    .map(|n| n.node_type.is_loop())
                    .unwrap_or(false);
                if !target_is_loop && !visited.contains(&edge.target) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        Ok(())
    }

    // ── Input collection ──

    /// Build a node's inputs by overlaying, in order: static config,
    /// composite-injected inputs, then incoming edge values. Later writes
    /// win, so dataflow edges override everything.
    fn collect_inputs(&self, node: &NodeDefinition, ctx: &ExecCtx) -> JsonMap {
        let mut inputs = node.config.clone();

        if let Some(injected) = ctx.frame.injected(&node.id) {
            tracing::debug!(
                node_id = %node.id,
                pins = ?injected.keys().collect::<Vec<_>>(),
                "applying injected inputs"
            );
            inputs.extend(injected);
        }

        for edge in ctx.pipeline.edges_into(&node.id) {
            match ctx.frame.outputs(&edge.source) {
                Some(source_outputs) => match source_outputs.get(&edge.source_handle) {
                    Some(value) => {
                        inputs.insert(edge.target_handle.clone(), value.clone());
                    }
                    None => {
                        tracing::warn!(
                            source = %edge.source,
                            handle = %edge.source_handle,
                            "source output not found, skipping edge"
                        );
                    }
                },
                None => {
                    tracing::warn!(source = %edge.source, "source node has no output data");
                }
            }
        }

        inputs
    }

    // ── Events ──

    async fn publish_node_executing(
        &self,
        ctx: &ExecCtx,
        node_id: &str,
        iteration: Option<i64>,
        total_iterations: Option<i64>,
    ) {
        let node = ctx.pipeline.node(node_id);
        self.bus
            .publish(PipelineEvent::NodeExecuting {
                pipeline_id: ctx.pipeline.pipeline_id.clone(),
                node_id: node_id.to_string(),
                label: node
                    .map(|n| n.display_label().to_string())
                    .unwrap_or_else(|| node_id.to_string()),
                node_type: node
                    .map(|n| n.node_type.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                function_id: node.and_then(|n| n.function_id.clone()),
                timestamp: Utc::now(),
                iteration,
                total_iterations,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins;
    use serde_json::json;

    async fn engine() -> (PipelineEngine, Arc<DeviceRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let catalog = Arc::new(PluginCatalog::new(None, bus.clone()));
        plugins::register_builtins(&catalog).await;
        let registry = Arc::new(DeviceRegistry::new(catalog.clone(), bus.clone()));
        (
            PipelineEngine::new(registry.clone(), catalog, bus.clone()),
            registry,
            bus,
        )
    }

    fn pipeline(value: serde_json::Value) -> PipelineDefinition {
        serde_json::from_value(value).unwrap()
    }

    /// Full lifecycle: create device, run a linear pipeline, verify
    /// dataflow from config through the servo and back out.
    #[tokio::test]
    async fn test_engine_linear_pipeline() {
        let (engine, registry, _bus) = engine().await;
        registry
            .create(
                "mock_servo",
                "servo_1",
                [("auto_connect".to_string(), json!(true))]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let def = pipeline(json!({
            "pipeline_id": "p_linear",
            "name": "Linear",
            "nodes": [
                {"id": "a", "type": "function", "plugin_id": "mock_servo",
                 "device_instance": "servo_1", "function_id": "home", "config": {}},
                {"id": "b", "type": "function", "plugin_id": "mock_servo",
                 "device_instance": "servo_1", "function_id": "move",
                 "config": {"position": 250.0, "speed": 500.0}},
                {"id": "c", "type": "function", "plugin_id": "mock_servo",
                 "device_instance": "servo_1", "function_id": "get_position", "config": {}}
            ],
            "edges": [
                {"id": "e1", "source": "a", "source_handle": "complete",
                 "target": "b", "target_handle": "trigger"},
                {"id": "e2", "source": "b", "source_handle": "complete",
                 "target": "c", "target_handle": "trigger"}
            ],
            "variables": {}
        }));

        let result = engine.execute(&def).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.nodes_executed, 3);
        assert_eq!(result.results["c"]["position"], json!(250.0));
    }

    #[tokio::test]
    async fn test_dataflow_edge_overrides_config() {
        let (engine, _registry, _bus) = engine().await;

        let def = pipeline(json!({
            "pipeline_id": "p_precedence",
            "name": "Precedence",
            "nodes": [
                {"id": "src", "type": "function", "plugin_id": "logic",
                 "function_id": "set_variable", "config": {"value": 42}},
                {"id": "dst", "type": "function", "plugin_id": "logic",
                 "function_id": "set_variable", "config": {"value": 7}}
            ],
            "edges": [
                {"id": "e1", "source": "src", "source_handle": "value",
                 "target": "dst", "target_handle": "value"}
            ],
            "variables": {}
        }));

        let result = engine.execute(&def).await;
        assert!(result.success);
        // The edge value (42) wins over dst's static config (7).
        assert_eq!(result.results["dst"]["value"], json!(42));
    }

    #[tokio::test]
    async fn test_unknown_device_fails_the_pipeline() {
        let (engine, _registry, _bus) = engine().await;
        let def = pipeline(json!({
            "pipeline_id": "p_missing",
            "name": "Missing device",
            "nodes": [
                {"id": "a", "type": "function", "plugin_id": "mock_servo",
                 "device_instance": "ghost", "function_id": "home", "config": {}}
            ],
            "edges": [],
            "variables": {}
        }));

        let result = engine.execute(&def).await;
        assert!(!result.success);
        assert_eq!(result.nodes_executed, 0);
        assert!(result.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_cancellation_between_levels() {
        let (engine, _registry, _bus) = engine().await;
        let def = pipeline(json!({
            "pipeline_id": "p_cancel",
            "name": "Cancelled",
            "nodes": [
                {"id": "a", "type": "function", "plugin_id": "logic",
                 "function_id": "delay", "config": {"duration_ms": 10}}
            ],
            "edges": [],
            "variables": {}
        }));

        let token = CancellationToken::new();
        token.cancel();
        let result = engine.execute_with_cancel(&def, token).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cancelled"));
    }
}
