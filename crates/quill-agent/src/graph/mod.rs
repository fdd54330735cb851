//! Workflow graph: named steps joined by static and conditional edges.
//!
//! A [`Graph`] is only obtainable through [`GraphBuilder::build`], which
//! rejects malformed topologies up front so no run ever starts on one.
//! The [`GraphExecutor`] walks a built graph from its entry node, one step at
//! a time, checkpointing after every step and bounding the number of times
//! a conditional edge may send the run back into the graph.

pub mod edge;
pub mod executor;
pub mod node;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use quill_core::error::{QuillError, Result};

use crate::state::RunState;

pub use edge::{review_router, ConditionalEdge, Edge, RouteFn, END, REVIEW_LABELS};
pub use executor::{ExecutorLimits, GraphExecutor, Run, RunStatus};
pub use node::{step_fn, FnStep, GraphNode, Step};

/// Where a run goes after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Continue at `node`. `conditional` is set when a router chose it.
    Next { node: String, conditional: bool },
    /// The run is over.
    End,
}

/// A validated workflow graph.
pub struct Graph {
    nodes: HashMap<String, GraphNode>,
    order: Vec<String>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Node names in registration order.
    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    /// Decide the transition out of `from` for the given state.
    pub fn next(&self, from: &str, state: &RunState) -> Result<Transition> {
        let transition = match self.edges.get(from) {
            None => Transition::End,
            Some(Edge::Static { to, .. }) if to == END => Transition::End,
            Some(Edge::Static { to, .. }) => Transition::Next {
                node: to.clone(),
                conditional: false,
            },
            Some(Edge::Conditional(edge)) => {
                let (_, target) = edge.route(state)?;
                if target == END {
                    Transition::End
                } else {
                    Transition::Next {
                        node: target.to_string(),
                        conditional: true,
                    }
                }
            }
        };
        Ok(transition)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .finish()
    }
}

/// Collects nodes and edges, then validates them into a [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    entries: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.nodes.push(GraphNode::new(name, step));
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::Static {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Add a conditional fan-out from `from`.
    ///
    /// `labels` are the values `predicate` may return; they must equal the
    /// keys of `routes`.
    pub fn add_conditional_edges<F, L>(
        mut self,
        from: impl Into<String>,
        labels: &[&str],
        predicate: F,
        routes: &[(&str, &str)],
    ) -> Self
    where
        F: Fn(&RunState) -> L + Send + Sync + 'static,
        L: Into<String>,
    {
        let predicate: RouteFn =
            Arc::new(move |state: &RunState| -> String { predicate(state).into() });
        self.edges.push(Edge::Conditional(ConditionalEdge::new(
            from,
            labels.iter().map(|l| l.to_string()).collect(),
            predicate,
            routes
                .iter()
                .map(|(label, to)| (label.to_string(), to.to_string()))
                .collect(),
        )));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entries.push(name.into());
        self
    }

    pub fn build(self) -> Result<Graph> {
        let entry = match self.entries.as_slice() {
            [] => return Err(definition("no entry node set")),
            [entry] => entry.clone(),
            many => {
                return Err(definition(format!(
                    "entry node set {} times ({})",
                    many.len(),
                    many.join(", ")
                )))
            }
        };

        let mut nodes = HashMap::new();
        let mut order = Vec::new();
        for node in self.nodes {
            if node.name == END {
                return Err(definition(format!("'{}' is reserved", END)));
            }
            if nodes.contains_key(&node.name) {
                return Err(definition(format!("duplicate node '{}'", node.name)));
            }
            order.push(node.name.clone());
            nodes.insert(node.name.clone(), node);
        }

        if !nodes.contains_key(&entry) {
            return Err(definition(format!("entry node '{}' does not exist", entry)));
        }

        let mut edges: HashMap<String, Edge> = HashMap::new();
        for edge in self.edges {
            let from = edge.from().to_string();
            if !nodes.contains_key(&from) {
                return Err(definition(format!("edge from unknown node '{}'", from)));
            }
            for target in edge.targets() {
                if target != END && !nodes.contains_key(target) {
                    return Err(definition(format!(
                        "edge from '{}' to unknown node '{}'",
                        from, target
                    )));
                }
            }
            if let Edge::Conditional(cond) = &edge {
                let declared: HashSet<&str> = cond.labels.iter().map(String::as_str).collect();
                let routed: HashSet<&str> = cond.routes.keys().map(String::as_str).collect();
                if declared.len() != cond.labels.len() || declared != routed {
                    return Err(definition(format!(
                        "router labels on '{}' do not match its routing table",
                        from
                    )));
                }
            }
            if edges.contains_key(&from) {
                return Err(definition(format!("node '{}' has more than one outgoing edge", from)));
            }
            edges.insert(from, edge);
        }

        if !terminal_reachable(&entry, &edges) {
            return Err(definition(format!(
                "no terminal is reachable from entry '{}'",
                entry
            )));
        }

        Ok(Graph {
            nodes,
            order,
            edges,
            entry,
        })
    }
}

fn definition(message: impl Into<String>) -> QuillError {
    QuillError::GraphDefinition(message.into())
}

/// Breadth-first walk from the entry looking for `END` or a node with no
/// outgoing edge.
fn terminal_reachable(entry: &str, edges: &HashMap<String, Edge>) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);

    while let Some(name) = queue.pop_front() {
        if name == END {
            return true;
        }
        if !seen.insert(name) {
            continue;
        }
        match edges.get(name) {
            None => return true,
            Some(edge) => queue.extend(edge.targets()),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Critique, StatePatch};

    fn noop() -> Arc<dyn Step> {
        step_fn(|s: &RunState| Ok(s.clone()))
    }

    fn research_shape() -> GraphBuilder {
        GraphBuilder::new()
            .add_node("search", noop())
            .add_node("curate", noop())
            .add_node("write", noop())
            .add_node("critique", noop())
            .add_node("revise", noop())
            .add_edge("search", "curate")
            .add_edge("curate", "write")
            .add_edge("write", "critique")
            .add_conditional_edges(
                "critique",
                &REVIEW_LABELS,
                review_router,
                &[("continue", "revise"), ("end", END)],
            )
            .add_edge("revise", "critique")
    }

    fn err_of(builder: GraphBuilder) -> String {
        match builder.build() {
            Err(QuillError::GraphDefinition(msg)) => msg,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("graph should have been rejected"),
        }
    }

    #[test]
    fn test_research_graph_builds() {
        let graph = research_shape().set_entry("search").build().unwrap();
        assert_eq!(graph.entry(), "search");
        assert_eq!(graph.node_names().len(), 5);
        assert!(graph.node("revise").is_some());
    }

    #[test]
    fn test_transitions() {
        let graph = research_shape().set_entry("search").build().unwrap();
        let state = RunState::new("t");

        assert_eq!(
            graph.next("search", &state).unwrap(),
            Transition::Next { node: "curate".into(), conditional: false }
        );
        assert_eq!(
            graph.next("critique", &state).unwrap(),
            Transition::Next { node: "revise".into(), conditional: true }
        );
        let approved = state.replace(StatePatch::new().critique(Critique::Approved));
        assert_eq!(graph.next("critique", &approved).unwrap(), Transition::End);
    }

    #[test]
    fn test_missing_entry() {
        assert!(err_of(research_shape()).contains("no entry"));
    }

    #[test]
    fn test_entry_set_twice() {
        let msg = err_of(research_shape().set_entry("search").set_entry("curate"));
        assert!(msg.contains("2 times"));
    }

    #[test]
    fn test_unknown_entry() {
        assert!(err_of(research_shape().set_entry("publish")).contains("does not exist"));
    }

    #[test]
    fn test_duplicate_node() {
        let msg = err_of(research_shape().add_node("search", noop()).set_entry("search"));
        assert!(msg.contains("duplicate node 'search'"));
    }

    #[test]
    fn test_edge_to_unknown_node() {
        let msg = err_of(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_edge("a", "ghost")
                .set_entry("a"),
        );
        assert!(msg.contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_edge_from_unknown_node() {
        let msg = err_of(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_edge("ghost", "a")
                .set_entry("a"),
        );
        assert!(msg.contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_label_mismatch() {
        let msg = err_of(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_node("b", noop())
                .add_conditional_edges("a", &["continue", "end"], |_: &RunState| "end", &[("end", END)])
                .add_edge("b", END)
                .set_entry("a"),
        );
        assert!(msg.contains("do not match"));
    }

    #[test]
    fn test_two_outgoing_edges() {
        let msg = err_of(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_node("b", noop())
                .add_edge("a", "b")
                .add_edge("a", END)
                .set_entry("a"),
        );
        assert!(msg.contains("more than one outgoing edge"));
    }

    #[test]
    fn test_cycle_without_exit() {
        let msg = err_of(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_node("b", noop())
                .add_edge("a", "b")
                .add_edge("b", "a")
                .set_entry("a"),
        );
        assert!(msg.contains("no terminal"));
    }

    #[test]
    fn test_dead_end_node_counts_as_terminal() {
        let graph = GraphBuilder::new()
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge("a", "b")
            .set_entry("a")
            .build()
            .unwrap();
        assert_eq!(graph.next("b", &RunState::new("t")).unwrap(), Transition::End);
    }
}
