//! Per-node worker task: repeatedly asks the supplier for the next move
//! targeting its node, dispatches up to `max_concurrent_per_node` calls
//! to the caller's callback concurrently, and reports progress --
//! grounded on `runNode` in `examples/original_source/orchestrate.go`,
//! generalized from that function's single-token gate to a
//! `tokio::task::JoinSet` so the per-node concurrency cap does something
//! real instead of serializing every call.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::state::{OrchestratorProgress, PendingMove};
use super::supplier::{NextMoveResult, SupplierRequest};
use super::AssignPartitionFn;
use crate::error::MoveError;

pub(crate) struct WorkerContext {
    pub node: String,
    pub assign_partition_fn: AssignPartitionFn,
    pub req_tx: mpsc::UnboundedSender<SupplierRequest>,
    pub done: Arc<Notify>,
    pub node_semaphore: Arc<Semaphore>,
    pub cluster_semaphore: Option<Arc<Semaphore>>,
    pub stop_rx: watch::Receiver<bool>,
    pub pause_rx: watch::Receiver<bool>,
    pub progress_tx: watch::Sender<OrchestratorProgress>,
    pub errors: Arc<parking_lot::Mutex<Vec<MoveError>>>,
}

pub(crate) async fn run(mut ctx: WorkerContext) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        while let Some(res) = in_flight.try_join_next() {
            warn_on_panic(&ctx.node, res);
        }

        if *ctx.stop_rx.borrow() {
            break;
        }

        if *ctx.pause_rx.borrow() {
            tokio::select! {
                _ = ctx.pause_rx.changed() => continue,
                _ = ctx.stop_rx.changed() => continue,
                Some(res) = in_flight.join_next(), if !in_flight.is_empty() => { warn_on_panic(&ctx.node, res); continue; }
            }
        }

        let permit = match ctx.node_semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tokio::select! {
                    Some(res) = in_flight.join_next(), if !in_flight.is_empty() => warn_on_panic(&ctx.node, res),
                    _ = ctx.stop_rx.changed() => {}
                }
                continue;
            }
        };

        debug!(in_flight = in_flight.len(), "requesting next move");
        let (reply_tx, reply_rx) = oneshot::channel();
        if ctx
            .req_tx
            .send(SupplierRequest::NextForNode { node: ctx.node.clone(), reply: reply_tx })
            .is_err()
        {
            drop(permit);
            break; // supplier gone; orchestration winding down.
        }
        let Ok(result) = reply_rx.await else {
            drop(permit);
            break;
        };

        match result {
            NextMoveResult::Drained => {
                drop(permit);
                debug!("no more moves queued for this node");
                if in_flight.is_empty() {
                    break;
                }
                if let Some(res) = in_flight.join_next().await {
                    warn_on_panic(&ctx.node, res);
                }
            }
            NextMoveResult::Pending => {
                drop(permit);
                tokio::select! {
                    () = ctx.done.notified() => {}
                    _ = ctx.stop_rx.changed() => {}
                    Some(res) = in_flight.join_next(), if !in_flight.is_empty() => warn_on_panic(&ctx.node, res),
                }
            }
            NextMoveResult::Move(pending) => {
                let cluster_permit = match &ctx.cluster_semaphore {
                    Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore never closed")),
                    None => None,
                };
                let assign_fn = ctx.assign_partition_fn.clone();
                let req_tx = ctx.req_tx.clone();
                let progress_tx = ctx.progress_tx.clone();
                let errors = ctx.errors.clone();
                let node = ctx.node.clone();
                let stop_rx = ctx.stop_rx.clone();
                in_flight.spawn(async move {
                    let _node_permit = permit;
                    let _cluster_permit = cluster_permit;
                    dispatch_one(node, assign_fn, req_tx, progress_tx, errors, stop_rx, pending).await;
                });
            }
        }
    }

    // Stop observed (or supplier gone): let in-flight dispatches finish,
    // don't start any new ones.
    while let Some(res) = in_flight.join_next().await {
        warn_on_panic(&ctx.node, res);
    }
}

fn warn_on_panic(node: &str, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        warn!(node = %node, error = %e, "dispatch task panicked");
    }
}

async fn dispatch_one(
    node: String,
    assign_fn: AssignPartitionFn,
    req_tx: mpsc::UnboundedSender<SupplierRequest>,
    progress_tx: watch::Sender<OrchestratorProgress>,
    errors: Arc<parking_lot::Mutex<Vec<MoveError>>>,
    stop_rx: watch::Receiver<bool>,
    pending: PendingMove,
) {
    let partition = pending.partition;
    let op = pending.node_state_op;

    let outcome = (assign_fn)(partition.clone(), op.clone(), stop_rx).await;

    match outcome {
        Ok(()) => {
            complete(&req_tx, partition).await;
            progress_tx.send_modify(|p| p.completed_moves += 1);
        }
        Err(source) => {
            warn!(node = %node, partition = %partition, op = %op.op, error = %source, "assign_partition_fn failed");
            errors.lock().push(MoveError {
                partition: partition.clone(),
                node: op.node,
                state: op.state,
                op: op.op,
                source,
            });
            // Orchestration keeps moving other partitions forward rather
            // than retrying; the failure is recorded, not fatal.
            complete(&req_tx, partition).await;
            progress_tx.send_modify(|p| p.error_count += 1);
        }
    }
}

async fn complete(req_tx: &mpsc::UnboundedSender<SupplierRequest>, partition: String) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if req_tx.send(SupplierRequest::Complete { partition, reply: reply_tx }).is_ok() {
        let _ = reply_rx.await;
    }
}
