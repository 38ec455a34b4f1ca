//! The moves supplier: a single task that owns every partition's move
//! queue exclusively, answering "what's next for node N" requests over a
//! channel rather than sharing the queues behind a lock.
//!
//! Grounded on the teacher's actor-task idiom (a dedicated task owning
//! mutable state, addressed via `mpsc` + `oneshot`) -- there is no
//! one-to-one counterpart in `examples/original_source/orchestrate.go`,
//! whose `calcNextPartitionToAssignToNode` stub is unimplemented there;
//! this module is the idiomatic Rust rendition of that missing piece,
//! built around the picker contract spec.md §4.3 describes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};

use super::state::{NextMoves, PendingMove};
use crate::types::{NodeStateOp, Op};

/// Chooses which of several ready moves to hand to a node next, when more
/// than one partition has a move currently queued for it.
pub trait NextMovesPicker: Send + Sync {
    fn pick(&self, node: &str, candidates: &[PendingMove]) -> usize;
}

/// Default picker: favors the lowest-weight partition, then the
/// least-disruptive operation (add, then promote, then demote, then del),
/// then partition name for determinism.
#[derive(Debug, Clone, Default)]
pub struct LowestWeightPartitionMoveForNode {
    pub partition_weights: BTreeMap<String, u32>,
}

impl NextMovesPicker for LowestWeightPartitionMoveForNode {
    fn pick(&self, _node: &str, candidates: &[PendingMove]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| {
                let weight = self.partition_weights.get(&c.partition).copied().unwrap_or(1);
                (weight, op_rank(c.node_state_op.op), c.partition.clone())
            })
            .map_or(0, |(i, _)| i)
    }
}

fn op_rank(op: Op) -> u8 {
    match op {
        Op::Add => 0,
        Op::Promote => 1,
        Op::Demote => 2,
        Op::Del => 3,
    }
}

pub(crate) enum SupplierRequest {
    NextForNode {
        node: String,
        reply: oneshot::Sender<NextMoveResult>,
    },
    Complete {
        partition: String,
        reply: oneshot::Sender<()>,
    },
    /// Exclusive inspection of every partition's remaining move queue.
    Visit {
        reply: oneshot::Sender<BTreeMap<String, Vec<NodeStateOp>>>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum NextMoveResult {
    /// A move is ready for this node right now.
    Move(PendingMove),
    /// Nothing for this node right now, but other partitions still have
    /// moves outstanding -- one may target this node later. Wait for a
    /// completion notification and ask again.
    Pending,
    /// Every partition's queue is exhausted. Safe to stop asking.
    Drained,
}

/// Runs the supplier loop until `req_rx` closes (every worker and the
/// handle have dropped their sender). `done` is notified after every
/// `Complete`, waking workers parked on `NextMoveResult::Pending`.
pub(crate) async fn run(
    mut queues: HashMap<String, NextMoves>,
    picker: Arc<dyn NextMovesPicker>,
    mut req_rx: mpsc::UnboundedReceiver<SupplierRequest>,
    done: Arc<Notify>,
) {
    while let Some(req) = req_rx.recv().await {
        match req {
            SupplierRequest::NextForNode { node, reply } => {
                let result = next_for_node(&queues, &node, picker.as_ref());
                let _ = reply.send(result);
            }
            SupplierRequest::Complete { partition, reply } => {
                if let Some(nm) = queues.get_mut(&partition) {
                    nm.advance();
                }
                done.notify_waiters();
                let _ = reply.send(());
            }
            SupplierRequest::Visit { reply } => {
                let snapshot: BTreeMap<String, Vec<NodeStateOp>> =
                    queues.iter().map(|(partition, nm)| (partition.clone(), nm.remaining_moves())).collect();
                let _ = reply.send(snapshot);
            }
        }
    }
}

fn next_for_node(
    queues: &HashMap<String, NextMoves>,
    node: &str,
    picker: &dyn NextMovesPicker,
) -> NextMoveResult {
    let mut candidates = Vec::new();
    let mut any_pending = false;

    for (partition, nm) in queues {
        if let Some(mv) = nm.current() {
            any_pending = true;
            if mv.node == node {
                candidates.push(PendingMove {
                    partition: partition.clone(),
                    node_state_op: mv.clone(),
                });
            }
        }
    }

    if candidates.is_empty() {
        return if any_pending { NextMoveResult::Pending } else { NextMoveResult::Drained };
    }

    let idx = picker.pick(node, &candidates);
    NextMoveResult::Move(candidates.into_iter().nth(idx).unwrap_or_else(|| unreachable!()))
}
