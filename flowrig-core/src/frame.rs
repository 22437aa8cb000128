use crate::types::JsonMap;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Key prefix for composite-injected inputs destined for an internal node.
pub const INJECTED_PREFIX: &str = "__input__";

/// Per-execution value store: `node_id → {output_name → value}`.
///
/// One frame lives for one pipeline invocation. A composite node gets its
/// own child frame; only its declared output mappings cross back to the
/// parent, so internal node outputs stay invisible outside the composite.
#[derive(Default)]
pub struct Frame {
    slots: RwLock<HashMap<String, JsonMap>>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (replace) a node's output bucket.
    pub fn insert(&self, node_id: &str, outputs: JsonMap) {
        self.slots.write().insert(node_id.to_string(), outputs);
    }

    /// Clone of a node's output bucket, if it has produced one.
    pub fn outputs(&self, node_id: &str) -> Option<JsonMap> {
        self.slots.read().get(node_id).cloned()
    }

    /// One named output of a node.
    pub fn output_value(&self, node_id: &str, pin: &str) -> Option<serde_json::Value> {
        self.slots.read().get(node_id).and_then(|o| o.get(pin)).cloned()
    }

    /// Record a composite-injected input for an internal node.
    pub fn inject_input(&self, node_id: &str, pin: &str, value: serde_json::Value) {
        let mut slots = self.slots.write();
        slots
            .entry(format!("{INJECTED_PREFIX}{node_id}"))
            .or_default()
            .insert(pin.to_string(), value);
    }

    /// Injected-input bucket for a node, if any mapping targeted it.
    pub fn injected(&self, node_id: &str) -> Option<JsonMap> {
        self.slots
            .read()
            .get(&format!("{INJECTED_PREFIX}{node_id}"))
            .cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.slots.read().contains_key(node_id)
    }

    /// Full copy of the store, injected buckets included.
    pub fn snapshot(&self) -> HashMap<String, JsonMap> {
        self.slots.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_replaces_the_whole_bucket() {
        let frame = Frame::new();
        frame.insert("a", outputs(&[("complete", json!(true))]));
        frame.insert("a", outputs(&[("index", json!(2))]));
        let bucket = frame.outputs("a").unwrap();
        assert!(bucket.get("complete").is_none());
        assert_eq!(bucket["index"], json!(2));
    }

    #[test]
    fn injected_inputs_live_in_their_own_namespace() {
        let frame = Frame::new();
        frame.inject_input("x", "trigger", json!(true));
        frame.inject_input("x", "count", json!(3));

        assert!(frame.outputs("x").is_none());
        let injected = frame.injected("x").unwrap();
        assert_eq!(injected["trigger"], json!(true));
        assert_eq!(injected["count"], json!(3));
        assert!(frame.snapshot().contains_key("__input__x"));
    }

    #[test]
    fn output_value_reads_one_pin() {
        let frame = Frame::new();
        frame.insert("servo", outputs(&[("position", json!(500.0))]));
        assert_eq!(frame.output_value("servo", "position"), Some(json!(500.0)));
        assert_eq!(frame.output_value("servo", "velocity"), None);
        assert_eq!(frame.output_value("ghost", "position"), None);
    }
}
