pub mod checkpoint;
pub mod graph;
pub mod registry;
pub mod research;
pub mod run_log;
pub mod state;
pub mod steps;

pub use checkpoint::{open_store, Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use graph::{
    review_router, Edge, ExecutorLimits, Graph, GraphBuilder, GraphExecutor, GraphNode, Run,
    RunStatus, Step, Transition, END,
};
pub use registry::RunRegistry;
pub use research::{build_graph, strip_feedback, ResearchWorkflow};
pub use run_log::RunLogger;
pub use state::{Critique, RunState, StatePatch};
