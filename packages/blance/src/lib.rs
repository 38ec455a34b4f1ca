//! Partition rebalancing: given a cluster topology change, computes a
//! target assignment of partitions to nodes and drives the cluster to it.
//!
//! Three pieces compose to do that:
//!
//! - [`moves`]: decomposes a (begin, end) pair of per-partition node-state
//!   maps into an ordered sequence of node-level transitions.
//! - [`planner`]: computes the end map itself, from a previous map and a
//!   topology delta (nodes added/removed), honoring per-state replica
//!   constraints while minimizing churn.
//! - [`orchestrator`]: executes the moves concurrently across the
//!   cluster, with per-node and cluster-wide concurrency caps, pause and
//!   stop controls, and a progress stream.
//!
//! None of this crate's types are a wire format; `serde` derives on the
//! domain types are for embedding applications that persist or transmit
//! assignments, not for any protocol defined here.

pub mod error;
pub mod moves;
pub mod orchestrator;
pub mod planner;
pub mod types;

// ---------------------------------------------------------------------------
// types
// ---------------------------------------------------------------------------
pub use types::{NodeStateOp, Op, Partition, PartitionMap, PartitionModel, PartitionModelState};

// ---------------------------------------------------------------------------
// moves
// ---------------------------------------------------------------------------
pub use moves::calc_partition_moves;

// ---------------------------------------------------------------------------
// planner
// ---------------------------------------------------------------------------
pub use planner::{plan_partitions, rebalance_partitions, PlanOptions, PlannerWarning};

// ---------------------------------------------------------------------------
// orchestrator
// ---------------------------------------------------------------------------
pub use orchestrator::{
    orchestrate_moves, AssignPartitionFn, AssignPartitionFuture, LowestWeightPartitionMoveForNode,
    NextMovesPicker, OrchestratorHandle, OrchestratorOptions, OrchestratorProgress,
};

// ---------------------------------------------------------------------------
// error
// ---------------------------------------------------------------------------
pub use error::{MoveError, OrchestrateError};
