use std::collections::HashMap;
use std::sync::Arc;

use quill_core::error::{QuillError, Result};

use crate::state::{Critique, RunState};

/// Terminal pseudo-node. Routing here ends the run.
pub const END: &str = "__end__";

/// Labels produced by [`review_router`].
pub const REVIEW_LABELS: [&str; 2] = ["continue", "end"];

/// Predicate choosing a route label from the current state.
pub type RouteFn = Arc<dyn Fn(&RunState) -> String + Send + Sync>;

/// A transition between nodes.
#[derive(Clone, Debug)]
pub enum Edge {
    /// Always taken.
    Static { from: String, to: String },
    /// Chosen at runtime by a predicate over the state.
    Conditional(ConditionalEdge),
}

impl Edge {
    pub fn from(&self) -> &str {
        match self {
            Self::Static { from, .. } => from,
            Self::Conditional(edge) => &edge.from,
        }
    }

    /// Every node this edge can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Static { to, .. } => vec![to.as_str()],
            Self::Conditional(edge) => edge.routes.values().map(String::as_str).collect(),
        }
    }
}

/// A predicate plus its label → target routing table.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub from: String,
    /// Labels the predicate may return.
    pub labels: Vec<String>,
    pub routes: HashMap<String, String>,
    predicate: RouteFn,
}

impl ConditionalEdge {
    pub fn new(
        from: impl Into<String>,
        labels: Vec<String>,
        predicate: RouteFn,
        routes: HashMap<String, String>,
    ) -> Self {
        Self {
            from: from.into(),
            labels,
            routes,
            predicate,
        }
    }

    /// Evaluate the predicate and resolve its label to a target.
    pub fn route(&self, state: &RunState) -> Result<(String, &str)> {
        let label = (self.predicate)(state);
        match self.routes.get(&label) {
            Some(target) => Ok((label, target.as_str())),
            None => Err(QuillError::GraphDefinition(format!(
                "router on '{}' returned unknown label '{}'",
                self.from, label
            ))),
        }
    }
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("labels", &self.labels)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Route after a review: `"end"` once approved, `"continue"` otherwise.
///
/// A state that has not been reviewed yet routes to `"continue"`.
pub fn review_router(state: &RunState) -> &'static str {
    match state.critique() {
        Some(Critique::Approved) => "end",
        _ => "continue",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePatch;

    fn review_edge() -> ConditionalEdge {
        ConditionalEdge::new(
            "critique",
            REVIEW_LABELS.iter().map(|l| l.to_string()).collect(),
            Arc::new(|s: &RunState| review_router(s).to_string()),
            HashMap::from([
                ("continue".to_string(), "revise".to_string()),
                ("end".to_string(), END.to_string()),
            ]),
        )
    }

    #[test]
    fn test_review_router() {
        let state = RunState::new("t");
        assert_eq!(review_router(&state), "continue");

        let rejected = state.replace(StatePatch::new().critique(Critique::NeedsRevision("x".into())));
        assert_eq!(review_router(&rejected), "continue");

        let approved = rejected.replace(StatePatch::new().critique(Critique::Approved));
        assert_eq!(review_router(&approved), "end");
        // The router only reads.
        assert_eq!(approved.critique(), Some(&Critique::Approved));
    }

    #[test]
    fn test_conditional_route_resolves_target() {
        let edge = review_edge();
        let approved = RunState::new("t").replace(StatePatch::new().critique(Critique::Approved));
        let (label, target) = edge.route(&approved).unwrap();
        assert_eq!(label, "end");
        assert_eq!(target, END);
    }

    #[test]
    fn test_unknown_label_is_definition_error() {
        let edge = ConditionalEdge::new(
            "critique",
            vec!["end".into()],
            Arc::new(|_: &RunState| "sideways".to_string()),
            HashMap::from([("end".to_string(), END.to_string())]),
        );
        let err = edge.route(&RunState::new("t")).unwrap_err();
        assert!(matches!(err, QuillError::GraphDefinition(_)));
    }

    #[test]
    fn test_edge_targets() {
        let edge = Edge::Conditional(review_edge());
        let mut targets = edge.targets();
        targets.sort();
        assert_eq!(targets, vec![END, "revise"]);
        assert_eq!(edge.from(), "critique");
    }
}
