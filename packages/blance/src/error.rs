//! Error types for orchestration.
//!
//! Planner warnings are not errors -- see `planner::PlannerWarning` --
//! they are data returned alongside a successful plan. These types cover
//! the two places the spec calls for real `Result::Err` propagation:
//! synchronous input validation, and caller callback failures.

use crate::types::Op;

/// Fatal validation failures raised synchronously by `OrchestrateMoves`,
/// before any worker task is spawned.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    #[error("begin map and end map reference different partition sets")]
    MismatchedPartitionSets,

    #[error("partition {partition:?} references node {node:?}, which is not in nodes_all")]
    UnknownNode { partition: String, node: String },

    #[error("invalid orchestrator options: {reason}")]
    InvalidOptions { reason: String },
}

/// A single callback failure, recorded in `OrchestratorProgress::errors`.
///
/// Callback errors are data, not control: the orchestrator keeps dispatching
/// other moves after recording one of these. Only `Stop` halts it.
#[derive(Debug, thiserror::Error)]
#[error("assign_partition_fn failed for partition {partition:?} node {node:?} state {state:?} op {op}: {source}")]
pub struct MoveError {
    pub partition: String,
    pub node: String,
    pub state: Option<String>,
    pub op: Op,
    #[source]
    pub source: anyhow::Error,
}
