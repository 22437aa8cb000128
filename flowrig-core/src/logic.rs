//! Builtin control-flow functions, dispatched when a node's plugin id is
//! the reserved value `"logic"`. These run inside the engine with no
//! device instance and never fail.

use crate::types::{truthy, JsonMap};
use serde_json::json;
use std::time::Duration;

/// The reserved plugin id routed to this table.
pub const LOGIC_PLUGIN_ID: &str = "logic";

pub async fn execute(function_id: &str, inputs: &JsonMap) -> JsonMap {
    match function_id {
        "delay" => {
            let duration_ms = inputs
                .get("duration_ms")
                .and_then(|v| v.as_f64())
                .unwrap_or(1000.0);
            tracing::info!(duration_ms, "delay: waiting");
            tokio::time::sleep(Duration::from_secs_f64(duration_ms / 1000.0)).await;
            outputs(&[("complete", json!(true))])
        }
        "branch" => {
            let condition = inputs.get("condition").map(truthy).unwrap_or(false);
            tracing::info!(condition, "branch");
            outputs(&[("true", json!(condition)), ("false", json!(!condition))])
        }
        "print" => {
            let message = match inputs.get("message") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            println!("[Pipeline Print] {message}");
            tracing::info!(%message, "print");
            outputs(&[("complete", json!(true))])
        }
        "set_variable" => {
            let value = inputs.get("value").cloned().unwrap_or(serde_json::Value::Null);
            tracing::info!(?value, "set_variable");
            outputs(&[("complete", json!(true)), ("value", value)])
        }
        other => {
            tracing::warn!(function_id = other, "unknown logic function");
            outputs(&[("complete", json!(true))])
        }
    }
}

fn outputs(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn branch_sets_exactly_one_side() {
        let inputs: JsonMap = [("condition".to_string(), json!(true))].into_iter().collect();
        let out = execute("branch", &inputs).await;
        assert_eq!(out["true"], json!(true));
        assert_eq!(out["false"], json!(false));

        let out = execute("branch", &JsonMap::new()).await;
        assert_eq!(out["true"], json!(false));
        assert_eq!(out["false"], json!(true));
    }

    #[tokio::test]
    async fn set_variable_passes_value_through() {
        let inputs: JsonMap = [("value".to_string(), json!([1, 2, 3]))].into_iter().collect();
        let out = execute("set_variable", &inputs).await;
        assert_eq!(out["complete"], json!(true));
        assert_eq!(out["value"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn delay_suspends_for_the_requested_time() {
        let inputs: JsonMap = [("duration_ms".to_string(), json!(30))].into_iter().collect();
        let started = std::time::Instant::now();
        let out = execute("delay", &inputs).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(out["complete"], json!(true));
    }

    #[tokio::test]
    async fn unknown_functions_complete_with_a_warning() {
        let out = execute("quantum_flux", &JsonMap::new()).await;
        assert_eq!(out, outputs(&[("complete", json!(true))]));
    }
}
