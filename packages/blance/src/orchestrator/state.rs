//! Shared state types for the orchestrator: per-partition move queues and
//! the progress snapshot broadcast to callers.
//!
//! Grounded on the paired-struct channel idiom in the teacher's
//! `cluster/state.rs` and `network/shutdown.rs` -- a plain data type here,
//! mutated only by the supplier task (see `super::supplier`), with a
//! read-only snapshot published over a `tokio::sync::watch` channel.

use crate::types::NodeStateOp;

/// One partition's remaining move list plus a cursor into it. Moves for a
/// single partition must apply in order -- a later move may depend on an
/// earlier one having already landed (e.g. promoting a node that the
/// previous move just added).
#[derive(Debug, Clone)]
pub(crate) struct NextMoves {
    pub moves: Vec<NodeStateOp>,
    pub cursor: usize,
}

impl NextMoves {
    pub(crate) fn new(moves: Vec<NodeStateOp>) -> Self {
        Self { moves, cursor: 0 }
    }

    pub(crate) fn current(&self) -> Option<&NodeStateOp> {
        self.moves.get(self.cursor)
    }

    pub(crate) fn advance(&mut self) {
        self.cursor += 1;
    }

    pub(crate) fn remaining(&self) -> usize {
        self.moves.len() - self.cursor
    }

    /// The moves not yet completed, in application order.
    pub(crate) fn remaining_moves(&self) -> Vec<NodeStateOp> {
        self.moves[self.cursor..].to_vec()
    }
}

/// A move ready to be dispatched to a particular node, along with the
/// partition it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct PendingMove {
    pub partition: String,
    pub node_state_op: NodeStateOp,
}

/// A point-in-time view of an orchestration run, published over a `watch`
/// channel. Readers that fall behind simply observe the latest snapshot;
/// nothing blocks on a slow reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorProgress {
    pub total_moves: u64,
    pub completed_moves: u64,
    pub error_count: u64,
    pub paused: bool,
    pub stopped: bool,
}

impl OrchestratorProgress {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completed_moves + self.error_count >= self.total_moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Op;

    #[test]
    fn next_moves_cursor_advances() {
        let mut nm = NextMoves::new(vec![
            NodeStateOp::new("a", Some("master".to_string()), Op::Add),
            NodeStateOp::new("b", Some("replica".to_string()), Op::Add),
        ]);
        assert_eq!(nm.remaining(), 2);
        assert_eq!(nm.current().unwrap().node, "a");
        nm.advance();
        assert_eq!(nm.remaining(), 1);
        assert_eq!(nm.current().unwrap().node, "b");
        nm.advance();
        assert!(nm.current().is_none());
        assert_eq!(nm.remaining(), 0);
    }

    #[test]
    fn progress_is_done_when_counts_match() {
        let mut p = OrchestratorProgress {
            total_moves: 3,
            completed_moves: 2,
            error_count: 0,
            ..Default::default()
        };
        assert!(!p.is_done());
        p.completed_moves = 2;
        p.error_count = 1;
        assert!(p.is_done());
    }
}
