use std::sync::Arc;

use futures::future::BoxFuture;

use quill_core::error::Result;

use crate::state::RunState;

/// A unit of work in the graph.
///
/// A step reads the current state and returns its successor. On failure it
/// returns an error and the caller's state is left as it was.
pub trait Step: Send + Sync + 'static {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>>;
}

/// A named step registered in a graph.
#[derive(Clone)]
pub struct GraphNode {
    pub name: String,
    pub step: Arc<dyn Step>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            step,
        }
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode").field("name", &self.name).finish()
    }
}

/// Adapts a synchronous state transition into a [`Step`].
pub struct FnStep<F>(pub F);

impl<F> Step for FnStep<F>
where
    F: Fn(&RunState) -> Result<RunState> + Send + Sync + 'static,
{
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move { (self.0)(state) })
    }
}

/// Wrap a closure as a shareable step.
pub fn step_fn<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(&RunState) -> Result<RunState> + Send + Sync + 'static,
{
    Arc::new(FnStep(f))
}
