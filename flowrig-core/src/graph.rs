use crate::errors::FlowError;
use crate::types::{EdgeDefinition, NodeDefinition};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Execution-dependency graph for one pipeline: vertices are node ids,
/// edges run source → target.
pub struct PipelineGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl PipelineGraph {
    /// Build the graph from a definition. Edge endpoints missing from the
    /// node list are added as vertices, matching the editor's permissive
    /// wire format.
    pub fn build(nodes: &[NodeDefinition], edges: &[EdgeDefinition]) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in nodes {
            indices
                .entry(node.id.clone())
                .or_insert_with(|| graph.add_node(node.id.clone()));
        }
        for edge in edges {
            let source = *indices
                .entry(edge.source.clone())
                .or_insert_with(|| graph.add_node(edge.source.clone()));
            let target = *indices
                .entry(edge.target.clone())
                .or_insert_with(|| graph.add_node(edge.target.clone()));
            graph.add_edge(source, target, ());
        }

        tracing::debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "built execution graph"
        );
        Self { graph, indices }
    }

    pub fn is_dag(&self) -> bool {
        toposort(&self.graph, None).is_ok()
    }

    /// Cycles as node-id lists: every strongly connected component with
    /// more than one node, plus self-loops. Nonempty iff the graph is not
    /// a DAG.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                cycles.push(component.iter().map(|&ix| self.graph[ix].clone()).collect());
            } else if let Some(&ix) = component.first() {
                if self.graph.find_edge(ix, ix).is_some() {
                    cycles.push(vec![self.graph[ix].clone()]);
                }
            }
        }
        cycles
    }

    /// Topological order, or a CircularDependency error carrying one sample
    /// cycle plus all detected cycles.
    pub fn topological_order(&self) -> Result<Vec<String>, FlowError> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order.iter().map(|&ix| self.graph[ix].clone()).collect()),
            Err(_) => {
                let all_cycles = self.cycles();
                let cycle = all_cycles.first().cloned().unwrap_or_default();
                Err(FlowError::CircularDependency { cycle, all_cycles })
            }
        }
    }

    /// Group a topological order into execution levels. Nodes in one level
    /// have no dependencies among each other and may run in parallel; level
    /// order preserves topological order.
    pub fn levels(&self, order: &[String]) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut remaining: HashSet<usize> = (0..order.len()).collect();
        let mut executed: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            let mut ready: Vec<usize> = (0..order.len())
                .filter(|i| remaining.contains(i))
                .filter(|&i| {
                    self.predecessors(&order[i])
                        .all(|pred| executed.contains(pred.as_str()))
                })
                .collect();

            if ready.is_empty() {
                // Cannot happen on a valid DAG; emit one node to avoid a hang.
                if let Some(&stuck) = remaining.iter().min() {
                    tracing::warn!(node = %order[stuck], "no ready nodes, forcing singleton level");
                    ready.push(stuck);
                }
            }

            for &i in &ready {
                remaining.remove(&i);
                executed.insert(order[i].as_str());
            }
            levels.push(ready.into_iter().map(|i| order[i].clone()).collect());
        }

        tracing::debug!(
            level_count = levels.len(),
            sizes = ?levels.iter().map(Vec::len).collect::<Vec<_>>(),
            "grouped execution levels"
        );
        levels
    }

    fn predecessors<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a String> {
        self.indices
            .get(node_id)
            .into_iter()
            .flat_map(move |&ix| {
                self.graph
                    .neighbors_directed(ix, Direction::Incoming)
                    .map(move |p| &self.graph[p])
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeDefinition {
        serde_json::from_value(serde_json::json!({"id": id, "type": "function"})).unwrap()
    }

    fn edge(id: &str, source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            id: id.into(),
            source: source.into(),
            source_handle: "complete".into(),
            target: target.into(),
            target_handle: "trigger".into(),
        }
    }

    #[test]
    fn linear_chain_is_a_dag_with_singleton_levels() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("e1", "a", "b"), edge("e2", "b", "c")];
        let graph = PipelineGraph::build(&nodes, &edges);

        assert!(graph.is_dag());
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(graph.levels(&order), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn fanout_shares_a_level() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("e1", "a", "b"), edge("e2", "a", "c")];
        let graph = PipelineGraph::build(&nodes, &edges);

        let order = graph.topological_order().unwrap();
        let levels = graph.levels(&order);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["a"]);
        let mut second = levels[1].clone();
        second.sort();
        assert_eq!(second, vec!["b", "c"]);
    }

    #[test]
    fn every_edge_crosses_levels_forward() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let edges = vec![
            edge("e1", "a", "b"),
            edge("e2", "a", "c"),
            edge("e3", "b", "d"),
            edge("e4", "c", "d"),
        ];
        let graph = PipelineGraph::build(&nodes, &edges);
        let order = graph.topological_order().unwrap();
        let levels = graph.levels(&order);

        let level_of = |id: &str| levels.iter().position(|l| l.iter().any(|n| n == id));
        for (u, v) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
            assert!(level_of(u).unwrap() < level_of(v).unwrap());
        }
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let nodes = vec![node("a"), node("b")];
        let edges = vec![edge("e1", "a", "b"), edge("e2", "b", "a")];
        let graph = PipelineGraph::build(&nodes, &edges);

        assert!(!graph.is_dag());
        let cycles = graph.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().to_lowercase().contains("circular"));
    }

    #[test]
    fn self_loop_counts_as_cycle() {
        let nodes = vec![node("a")];
        let edges = vec![edge("e1", "a", "a")];
        let graph = PipelineGraph::build(&nodes, &edges);
        assert!(!graph.is_dag());
        assert_eq!(graph.cycles(), vec![vec!["a".to_string()]]);
    }

    #[test]
    fn edges_to_unknown_nodes_create_vertices() {
        // The editor can reference nodes that were deleted from the list.
        let nodes = vec![node("a")];
        let edges = vec![edge("e1", "a", "ghost")];
        let graph = PipelineGraph::build(&nodes, &edges);
        let order = graph.topological_order().unwrap();
        assert_eq!(order.len(), 2);
    }
}
