//! Move calculator: decomposes a (begin, end) pair of per-partition
//! node-state maps into an ordered sequence of node-level transitions.
//!
//! Single free function, no shared state -- grounded on
//! `examples/original_source/moves.go`.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{NodeStateOp, Op};

/// Computes the step-by-step moves to transition a partition from
/// `beg_nodes_by_state` to `end_nodes_by_state`.
///
/// `states` is an ordered slice of state names, most important first
/// (e.g. `["master", "replica"]`). Applying the returned ops, in order,
/// to `beg_nodes_by_state` yields `end_nodes_by_state`.
///
/// For each state, in priority order:
/// 1. demotions into the state (nodes that held a higher-priority state
///    in `beg` and hold this state in `end`),
/// 2. promotions into the state (nodes that held a lower-priority state
///    in `beg` and hold this state in `end`),
/// 3. clean adds (nodes new to the partition entirely),
/// 4. clean deletes (nodes leaving the partition entirely).
///
/// Each node appears at most once in the output -- the first
/// classification that matches wins, so a node that is both "promoted"
/// and "cleanly added" (impossible under a consistent beg/end pair, but
/// the seen-set guards it regardless) is recorded once, as a promotion.
#[must_use]
pub fn calc_partition_moves(
    states: &[String],
    beg_nodes_by_state: &BTreeMap<String, Vec<String>>,
    end_nodes_by_state: &BTreeMap<String, Vec<String>>,
) -> Vec<NodeStateOp> {
    let mut moves = Vec::new();
    let mut seen = BTreeSet::new();

    let beg_nodes = flatten(beg_nodes_by_state);
    let end_nodes = flatten(end_nodes_by_state);

    let adds: BTreeSet<&String> = end_nodes.difference(&beg_nodes).collect();
    let dels: BTreeSet<&String> = beg_nodes.difference(&end_nodes).collect();

    for (state_idx, state) in states.iter().enumerate() {
        let end_in_state = end_nodes_by_state.get(state).map_or(&[][..], Vec::as_slice);

        // 1. Demotions: currently in a higher-priority state (index < state_idx).
        for node in find_state_changes(0, state_idx, end_in_state, states, beg_nodes_by_state) {
            push_once(&mut moves, &mut seen, &node, Some(state.clone()), Op::Demote);
        }

        // 2. Promotions: currently in a lower-priority state (index > state_idx).
        for node in find_state_changes(
            state_idx + 1,
            states.len(),
            end_in_state,
            states,
            beg_nodes_by_state,
        ) {
            push_once(&mut moves, &mut seen, &node, Some(state.clone()), Op::Promote);
        }

        // 3. Clean adds: new to `end[state]`, absent from `beg` entirely.
        let beg_in_state: BTreeSet<&String> = beg_nodes_by_state
            .get(state)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        for node in end_in_state {
            if !beg_in_state.contains(node) && adds.contains(node) {
                push_once(&mut moves, &mut seen, node, Some(state.clone()), Op::Add);
            }
        }

        // 4. Clean deletes: leaving `beg[state]`, absent from `end` entirely.
        let end_in_state_set: BTreeSet<&String> = end_in_state.iter().collect();
        if let Some(beg_nodes_for_state) = beg_nodes_by_state.get(state) {
            for node in beg_nodes_for_state {
                if !end_in_state_set.contains(node) && dels.contains(node) {
                    push_once(&mut moves, &mut seen, node, None, Op::Del);
                }
            }
        }
    }

    moves
}

fn push_once(
    moves: &mut Vec<NodeStateOp>,
    seen: &mut BTreeSet<String>,
    node: &str,
    state: Option<String>,
    op: Op,
) {
    if seen.insert(node.to_string()) {
        moves.push(NodeStateOp::new(node.to_string(), state, op));
    }
}

/// Returns, in `end_in_state` order, every node that appears in
/// `beg_nodes_by_state[states[begStateIdx..endStateIdx]]`.
fn find_state_changes(
    beg_state_idx: usize,
    end_state_idx: usize,
    end_in_state: &[String],
    states: &[String],
    beg_nodes_by_state: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut rv = Vec::new();
    for node in end_in_state {
        for state in &states[beg_state_idx..end_state_idx] {
            if beg_nodes_by_state
                .get(state)
                .is_some_and(|nodes| nodes.contains(node))
            {
                rv.push(node.clone());
            }
        }
    }
    rv
}

fn flatten(nodes_by_state: &BTreeMap<String, Vec<String>>) -> BTreeSet<String> {
    nodes_by_state.values().flatten().cloned().collect()
}
