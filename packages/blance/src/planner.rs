//! Planner: given a previous assignment and a topology delta, produces a
//! target `PartitionMap` that respects per-state replica-count
//! constraints while minimizing reassignment churn and balancing load.
//!
//! Grounded on `examples/original_source/plan.go`. The node-scoring
//! formula, cohort-based partition ordering, and stickiness rules are
//! carried over verbatim in meaning; see spec.md §4.2 and `DESIGN.md`'s
//! Open Question notes for the two places this implementation resolves
//! ambiguity in the original source rather than guessing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::{Partition, PartitionMap, PartitionModel};

// ---------------------------------------------------------------------------
// PlannerWarning
// ---------------------------------------------------------------------------

/// A non-fatal note that a partition could not meet its replica-count
/// constraint for some state, because too few candidate nodes remained.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerWarning {
    pub partition: String,
    pub state: String,
    pub wanted: u32,
    pub got: u32,
}

impl fmt::Display for PlannerWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not meet constraints: wanted {} node(s) in state {:?} for partition {:?}, got {}",
            self.wanted, self.state, self.partition, self.got
        )
    }
}

// ---------------------------------------------------------------------------
// PlanOptions
// ---------------------------------------------------------------------------

/// Extra knobs beyond `rebalance_partitions`'s simplified surface:
/// per-state stickiness overrides and per-node weights. Embedders who
/// don't need these should use `rebalance_partitions` instead.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Affinity bonus per state, keyed by state name. Defaults to 1.5
    /// when absent for a state (see `stickiness_for`).
    pub state_stickiness: BTreeMap<String, f64>,
    /// Divides a candidate's score (lower score wins); absent or zero
    /// means unweighted.
    pub node_weights: BTreeMap<String, u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Computes the next target assignment given a previous map and a
/// topology delta, using default stickiness (1.5 everywhere) and no node
/// weighting. This is the entry point described in spec.md §6.
///
/// The eligible node set is derived from `prev`'s current nodes plus
/// `nodes_to_add`, minus `nodes_to_remove`.
#[must_use]
pub fn rebalance_partitions(
    prev: &PartitionMap,
    nodes_to_remove: &[String],
    nodes_to_add: &[String],
    model: &PartitionModel,
    state_constraints: &BTreeMap<String, u32>,
    partition_weights: &BTreeMap<String, u32>,
) -> (PartitionMap, Vec<PlannerWarning>) {
    let nodes = compute_target_nodes(prev, nodes_to_add, nodes_to_remove);
    plan_partitions(
        prev,
        &nodes,
        nodes_to_remove,
        nodes_to_add,
        model,
        state_constraints,
        partition_weights,
        &PlanOptions::default(),
    )
}

/// Full-control variant of `rebalance_partitions`, exposing per-state
/// stickiness overrides and per-node weights (spec.md §4.2's complete
/// `planNextMap` contract). `nodes` is the caller-supplied eligible
/// target node set.
#[must_use]
pub fn plan_partitions(
    prev: &PartitionMap,
    nodes: &[String],
    nodes_to_remove: &[String],
    nodes_to_add: &[String],
    model: &PartitionModel,
    state_constraints: &BTreeMap<String, u32>,
    partition_weights: &BTreeMap<String, u32>,
    options: &PlanOptions,
) -> (PartitionMap, Vec<PlannerWarning>) {
    let mut warnings = Vec::new();

    // Step 1: deep copy prev, stripping nodes_to_remove from every state.
    let mut next_partitions: Vec<Partition> = prev
        .iter()
        .map(|(_, p)| {
            let mut np = p.clone();
            strip_nodes(&mut np, nodes_to_remove, None);
            np
        })
        .collect();
    next_partitions.sort_by(|a, b| a.name.cmp(&b.name));

    // Step 2: seed state/node counters from the (unstripped) previous map.
    let mut state_node_counts = count_state_nodes(prev, partition_weights);

    // Step 3: fill states in priority order.
    let num_partitions = prev.len();
    for state_name in model.states_by_priority() {
        let constraints = state_constraints
            .get(state_name)
            .copied()
            .unwrap_or_else(|| model.0.get(state_name).map_or(0, |m| m.constraints));

        if constraints > 0 {
            assign_state_to_partitions(
                &mut next_partitions,
                prev,
                nodes_to_remove,
                nodes_to_add,
                partition_weights,
                state_name,
                constraints,
                nodes,
                model,
                &mut state_node_counts,
                &options.state_stickiness,
                &options.node_weights,
                num_partitions,
                &mut warnings,
            );
        }
    }

    (next_partitions.into_iter().collect(), warnings)
}

// ---------------------------------------------------------------------------
// Node-set derivation
// ---------------------------------------------------------------------------

fn compute_target_nodes(
    prev: &PartitionMap,
    nodes_to_add: &[String],
    nodes_to_remove: &[String],
) -> Vec<String> {
    let mut set: BTreeSet<String> = BTreeSet::new();
    for (_, partition) in prev.iter() {
        set.extend(partition.all_nodes());
    }
    set.extend(nodes_to_add.iter().cloned());
    for n in nodes_to_remove {
        set.remove(n);
    }
    set.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Per-state assignment pass
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn assign_state_to_partitions(
    next_partitions: &mut [Partition],
    prev: &PartitionMap,
    nodes_to_remove: &[String],
    nodes_to_add: &[String],
    partition_weights: &BTreeMap<String, u32>,
    state_name: &str,
    constraints: u32,
    nodes: &[String],
    model: &PartitionModel,
    state_node_counts: &mut BTreeMap<String, BTreeMap<String, f64>>,
    state_stickiness: &BTreeMap<String, f64>,
    node_weights: &BTreeMap<String, u32>,
    num_partitions: usize,
    warnings: &mut Vec<PlannerWarning>,
) {
    let mut order: Vec<usize> = (0..next_partitions.len()).collect();
    order.sort_by(|&i, &j| {
        partition_sort_key(&next_partitions[i], prev, nodes_to_remove, nodes_to_add, partition_weights, state_name)
            .cmp(&partition_sort_key(&next_partitions[j], prev, nodes_to_remove, nodes_to_add, partition_weights, state_name))
    });

    // Keyed by highest-priority-node, value is {candidate: count}. Reset
    // per state, matching the original's per-call `nodeToNodeCounts`.
    let mut node_to_node_counts: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

    for idx in order {
        let partition_weight =
            f64::from(partition_weights.get(&next_partitions[idx].name).copied().unwrap_or(1));
        let stickiness = stickiness_for(&next_partitions[idx].name, state_name, partition_weights, state_stickiness);

        let nodes_to_assign = find_best_nodes(
            &next_partitions[idx],
            state_name,
            constraints,
            nodes,
            model,
            state_node_counts,
            &mut node_to_node_counts,
            stickiness,
            node_weights,
            num_partitions,
            warnings,
        );

        // Free up the state's old occupants and the new occupants'
        // previous slots before placing them, so a node never appears
        // in two states of the same partition at once.
        let old_occupants = next_partitions[idx].nodes_in_state(state_name).to_vec();
        remove_nodes_from_partition(&mut next_partitions[idx], &old_occupants, partition_weight, state_node_counts);
        remove_nodes_from_partition(&mut next_partitions[idx], &nodes_to_assign, partition_weight, state_node_counts);

        if nodes_to_assign.is_empty() {
            next_partitions[idx].nodes_by_state.remove(state_name);
        } else {
            next_partitions[idx]
                .nodes_by_state
                .insert(state_name.to_string(), nodes_to_assign.clone());
        }

        let counts = state_node_counts.entry(state_name.to_string()).or_default();
        for n in &nodes_to_assign {
            *counts.entry(n.clone()).or_insert(0.0) += partition_weight;
        }
    }
}

/// Stickiness for a (partition, state) pair: the partition's own weight
/// overrides everything if present, else the state's configured
/// stickiness, else the 1.5 default. This mirrors the original's
/// (slightly surprising) reuse of `partitionWeights` as a stickiness
/// override -- see spec.md §4.2.
fn stickiness_for(
    partition_name: &str,
    state_name: &str,
    partition_weights: &BTreeMap<String, u32>,
    state_stickiness: &BTreeMap<String, f64>,
) -> f64 {
    if let Some(w) = partition_weights.get(partition_name) {
        return f64::from(*w);
    }
    if let Some(s) = state_stickiness.get(state_name) {
        return *s;
    }
    1.5
}

/// Removes `remove_nodes` from every state of `partition`, decrementing
/// `state_node_counts` for each removal.
fn remove_nodes_from_partition(
    partition: &mut Partition,
    remove_nodes: &[String],
    weight: f64,
    state_node_counts: &mut BTreeMap<String, BTreeMap<String, f64>>,
) {
    if remove_nodes.is_empty() {
        return;
    }
    let remove_set: BTreeSet<&String> = remove_nodes.iter().collect();
    for (state_name, nodes) in partition.nodes_by_state.iter_mut() {
        let removed: Vec<String> = nodes.iter().filter(|n| remove_set.contains(n)).cloned().collect();
        if removed.is_empty() {
            continue;
        }
        nodes.retain(|n| !remove_set.contains(n));
        let counts = state_node_counts.entry(state_name.clone()).or_default();
        for n in &removed {
            let entry = counts.entry(n.clone()).or_insert(0.0);
            *entry -= weight;
        }
    }
}

fn strip_nodes(
    partition: &mut Partition,
    remove_nodes: &[String],
    mut on_remove: Option<&mut dyn FnMut(&str, &[String])>,
) {
    if remove_nodes.is_empty() {
        return;
    }
    let remove_set: BTreeSet<&String> = remove_nodes.iter().collect();
    for (state_name, nodes) in partition.nodes_by_state.iter_mut() {
        let removed: Vec<String> = nodes.iter().filter(|n| remove_set.contains(n)).cloned().collect();
        if !removed.is_empty() {
            if let Some(cb) = on_remove.as_deref_mut() {
                cb(state_name, &removed);
            }
        }
        nodes.retain(|n| !remove_set.contains(n));
    }
}

// ---------------------------------------------------------------------------
// Partition sort key (cohort, weight, name)
// ---------------------------------------------------------------------------

fn partition_sort_key(
    partition: &Partition,
    prev: &PartitionMap,
    nodes_to_remove: &[String],
    nodes_to_add: &[String],
    partition_weights: &BTreeMap<String, u32>,
    state_name: &str,
) -> (u8, String, String) {
    let weight = partition_weights.get(&partition.name).copied().unwrap_or(1);
    let weight_key = format!("{weight:010}");
    let name_key = partition_name_key(&partition.name);

    // Cohort 0: prev's assignment for this state touches a to-be-removed node.
    if let Some(prev_partition) = prev.get(&partition.name) {
        let prev_nodes = prev_partition.nodes_in_state(state_name);
        if prev_nodes.iter().any(|n| nodes_to_remove.contains(n)) {
            return (0, weight_key, name_key);
        }
    }

    // Cohort 1: current total node set hasn't touched any newly added node.
    if !nodes_to_add.is_empty() {
        let touches_added = partition.all_nodes().iter().any(|n| nodes_to_add.contains(n));
        if !touches_added {
            return (1, weight_key, name_key);
        }
    }

    (2, weight_key, name_key)
}

fn partition_name_key(name: &str) -> String {
    if let Ok(n) = name.parse::<u64>() {
        format!("{n:010}")
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// `{state: {node: weighted count}}` derived from every (partition,
/// state, node) triple in `map`, where each partition contributes its
/// weight from `partition_weights` (default 1).
fn count_state_nodes(
    map: &PartitionMap,
    partition_weights: &BTreeMap<String, u32>,
) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut rv: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for (name, partition) in map.iter() {
        let weight = f64::from(partition_weights.get(name).copied().unwrap_or(1));
        for (state_name, nodes) in &partition.nodes_by_state {
            let counts = rv.entry(state_name.clone()).or_default();
            for node in nodes {
                *counts.entry(node.clone()).or_insert(0.0) += weight;
            }
        }
    }
    rv
}

// ---------------------------------------------------------------------------
// Candidate ranking
// ---------------------------------------------------------------------------

/// Ranks candidate nodes for (partition, state) ascending by score (lower
/// is better) and returns the top `constraints` of them. Emits a
/// `PlannerWarning` if fewer than `constraints` candidates remain.
///
/// Candidates start from `nodes`, minus any node in `partition` already
/// holding a state with *lower* priority value (i.e. more important) than
/// `state_name` -- spec.md §4.2's explicit resolution of the ambiguous Go
/// stub. The co-location key used inside the score, by contrast,
/// preserves the original's asymmetric "max priority value" convention;
/// see `PartitionModel::least_important_state`.
#[allow(clippy::too_many_arguments)]
fn find_best_nodes(
    partition: &Partition,
    state_name: &str,
    constraints: u32,
    nodes: &[String],
    model: &PartitionModel,
    state_node_counts: &BTreeMap<String, BTreeMap<String, f64>>,
    node_to_node_counts: &mut BTreeMap<String, BTreeMap<String, f64>>,
    stickiness: f64,
    node_weights: &BTreeMap<String, u32>,
    num_partitions: usize,
    warnings: &mut Vec<PlannerWarning>,
) -> Vec<String> {
    let mut node_partition_counts: BTreeMap<String, f64> = BTreeMap::new();
    for counts in state_node_counts.values() {
        for (node, c) in counts {
            *node_partition_counts.entry(node.clone()).or_insert(0.0) += c;
        }
    }

    let highest_priority_state_name = model.least_important_state();
    let highest_priority_node: String = highest_priority_state_name
        .and_then(|s| partition.nodes_in_state(s).first())
        .cloned()
        .unwrap_or_default();

    let Some(&state_priority) = model.0.get(state_name).map(|s| &s.priority) else {
        return Vec::new();
    };

    let mut candidates: Vec<String> = nodes
        .iter()
        .filter(|n| {
            !partition.nodes_by_state.iter().any(|(s, ns)| {
                model.0.get(s).is_some_and(|m| m.priority < state_priority) && ns.iter().any(|x| *x == **n)
            })
        })
        .cloned()
        .collect();

    candidates.sort_by(|a, b| {
        let sa = score_node(
            a, partition, state_name, num_partitions, &highest_priority_node,
            state_node_counts, node_to_node_counts, &node_partition_counts, node_weights, stickiness,
        );
        let sb = score_node(
            b, partition, state_name, num_partitions, &highest_priority_node,
            state_node_counts, node_to_node_counts, &node_partition_counts, node_weights, stickiness,
        );
        sa.partial_cmp(&sb).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
    });

    if candidates.len() > constraints as usize {
        candidates.truncate(constraints as usize);
    } else if candidates.len() < constraints as usize {
        warnings.push(PlannerWarning {
            partition: partition.name.clone(),
            state: state_name.to_string(),
            wanted: constraints,
            got: candidates.len() as u32,
        });
    }

    let bucket = node_to_node_counts.entry(highest_priority_node).or_default();
    for c in &candidates {
        *bucket.entry(c.clone()).or_insert(0.0) += 1.0;
    }

    candidates
}

#[allow(clippy::too_many_arguments)]
fn score_node(
    node: &str,
    partition: &Partition,
    state_name: &str,
    num_partitions: usize,
    highest_priority_node: &str,
    state_node_counts: &BTreeMap<String, BTreeMap<String, f64>>,
    node_to_node_counts: &BTreeMap<String, BTreeMap<String, f64>>,
    node_partition_counts: &BTreeMap<String, f64>,
    node_weights: &BTreeMap<String, u32>,
    stickiness: f64,
) -> f64 {
    let lower_priority_balance_factor = if num_partitions > 0 {
        node_to_node_counts
            .get(highest_priority_node)
            .and_then(|m| m.get(node))
            .copied()
            .unwrap_or(0.0)
            / num_partitions as f64
    } else {
        0.0
    };

    let filled_factor = if num_partitions > 0 {
        let c = node_partition_counts.get(node).copied().unwrap_or(0.0);
        (0.001 * c) / num_partitions as f64
    } else {
        0.0
    };

    let current_factor = if partition.nodes_in_state(state_name).iter().any(|n| n == node) {
        stickiness
    } else {
        0.0
    };

    let mut r = state_node_counts
        .get(state_name)
        .and_then(|m| m.get(node))
        .copied()
        .unwrap_or(0.0);
    r += lower_priority_balance_factor;
    r += filled_factor;

    if let Some(w) = node_weights.get(node) {
        if *w > 0 {
            r /= f64::from(*w);
        }
    }

    r - current_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionModelState;

    fn model(entries: &[(&str, u32, u32)]) -> PartitionModel {
        entries
            .iter()
            .map(|(name, prio, cons)| ((*name).to_string(), PartitionModelState::new(*prio, *cons)))
            .collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn partition_with(name: &str, states: &[(&str, &[&str])]) -> Partition {
        let mut p = Partition::new(name);
        for (state, nodes) in states {
            p.nodes_by_state
                .insert((*state).to_string(), nodes.iter().map(|n| (*n).to_string()).collect());
        }
        p
    }

    #[test]
    fn remove_node_from_single_partition_yields_warning() {
        // Scenario 3 from spec §8.
        let prev: PartitionMap = vec![partition_with("00", &[("master", &["a"])])]
            .into_iter()
            .collect();
        let model = model(&[("master", 0, 1)]);

        let (out, warnings) = rebalance_partitions(&prev, &strings(&["a"]), &[], &model, &BTreeMap::new(), &BTreeMap::new());

        assert!(out.get("00").unwrap().nodes_in_state("master").is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].wanted, 1);
        assert_eq!(warnings[0].got, 0);
    }

    #[test]
    fn add_two_nodes_fills_master_and_replica() {
        // Scenario 2 from spec §8.
        let prev: PartitionMap = vec![Partition::new("00")].into_iter().collect();
        let model = model(&[("master", 0, 1), ("replica", 1, 1)]);

        let (out, warnings) = rebalance_partitions(
            &prev,
            &[],
            &strings(&["a", "b"]),
            &model,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );

        assert!(warnings.is_empty());
        let p = out.get("00").unwrap();
        assert_eq!(p.nodes_in_state("master").len(), 1);
        assert_eq!(p.nodes_in_state("replica").len(), 1);
        assert_ne!(p.nodes_in_state("master")[0], p.nodes_in_state("replica")[0]);
    }

    #[test]
    fn removed_node_never_appears_in_output() {
        let prev: PartitionMap = vec![
            partition_with("00", &[("master", &["a"]), ("replica", &["b"])]),
            partition_with("01", &[("master", &["b"]), ("replica", &["a"])]),
        ]
        .into_iter()
        .collect();
        let model = model(&[("master", 0, 1), ("replica", 1, 1)]);

        let (out, _warnings) = rebalance_partitions(&prev, &strings(&["a"]), &[], &model, &BTreeMap::new(), &BTreeMap::new());

        for (_, partition) in out.iter() {
            for nodes in partition.nodes_by_state.values() {
                assert!(!nodes.contains(&"a".to_string()));
            }
        }
    }

    #[test]
    fn constraint_never_exceeded() {
        let prev: PartitionMap = vec![Partition::new("00"), Partition::new("01"), Partition::new("02")]
            .into_iter()
            .collect();
        let model = model(&[("master", 0, 1), ("replica", 1, 2)]);

        let (out, _warnings) = rebalance_partitions(
            &prev,
            &[],
            &strings(&["a", "b", "c", "d"]),
            &model,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );

        for (_, partition) in out.iter() {
            assert!(partition.nodes_in_state("master").len() <= 1);
            assert!(partition.nodes_in_state("replica").len() <= 2);
        }
    }

    #[test]
    fn output_partition_set_matches_input() {
        let prev: PartitionMap = vec![Partition::new("00"), Partition::new("01")].into_iter().collect();
        let model = model(&[("master", 0, 1)]);

        let (out, _warnings) = rebalance_partitions(&prev, &[], &strings(&["a"]), &model, &BTreeMap::new(), &BTreeMap::new());

        assert_eq!(out.name_set(), prev.name_set());
    }

    #[test]
    fn fully_satisfied_prev_is_stable_modulo_ordering() {
        let prev: PartitionMap = vec![
            partition_with("00", &[("master", &["a"]), ("replica", &["b"])]),
            partition_with("01", &[("master", &["b"]), ("replica", &["a"])]),
        ]
        .into_iter()
        .collect();
        let model = model(&[("master", 0, 1), ("replica", 1, 1)]);

        let (out, warnings) = rebalance_partitions(&prev, &[], &[], &model, &BTreeMap::new(), &BTreeMap::new());

        assert!(warnings.is_empty());
        for (name, partition) in prev.iter() {
            let next = out.get(name).unwrap();
            assert_eq!(next.nodes_in_state("master").len(), partition.nodes_in_state("master").len());
            assert_eq!(next.nodes_in_state("replica").len(), partition.nodes_in_state("replica").len());
        }
    }

    #[test]
    fn colocation_key_uses_max_priority_state() {
        // Preserves the original's asymmetric "max Priority value" convention
        // for the co-location key: the *least* important state's current
        // holder is what the nodeToNodeCounts bookkeeping keys off.
        let model = model(&[("master", 0, 1), ("replica", 1, 1), ("dead", 9, 1)]);
        assert_eq!(model.least_important_state(), Some("dead"));
    }

    #[test]
    fn higher_priority_state_never_displaced_by_lower() {
        // Assigning replica must not steal a node already holding master.
        let prev: PartitionMap = vec![partition_with("00", &[("master", &["a"])])].into_iter().collect();
        let model = model(&[("master", 0, 1), ("replica", 1, 1)]);

        let (out, _warnings) = rebalance_partitions(
            &prev,
            &[],
            &strings(&["b"]),
            &model,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );

        let p = out.get("00").unwrap();
        assert_eq!(p.nodes_in_state("master"), &["a".to_string()]);
    }

    #[test]
    fn warning_display_is_human_readable() {
        let w = PlannerWarning {
            partition: "00".to_string(),
            state: "master".to_string(),
            wanted: 1,
            got: 0,
        };
        assert_eq!(
            w.to_string(),
            "could not meet constraints: wanted 1 node(s) in state \"master\" for partition \"00\", got 0"
        );
    }
}
