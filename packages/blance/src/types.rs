//! Core data model: partitions, partition maps, and the per-state model.
//!
//! These types are the shared vocabulary between the move calculator, the
//! planner, and the orchestrator. They carry no behavior beyond small
//! query helpers -- the algorithms that act on them live in their own
//! modules.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Op
// ---------------------------------------------------------------------------

/// A single node-state transition kind.
///
/// An empty state paired with `Op::Del` means the node relinquishes the
/// partition entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
    Del,
    Promote,
    Demote,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Add => "add",
            Op::Del => "del",
            Op::Promote => "promote",
            Op::Demote => "demote",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// NodeStateOp
// ---------------------------------------------------------------------------

/// Associates a node with a state and an operation.
///
/// A sequence of `NodeStateOp`s is a step-by-step transition plan for a
/// single partition: first add node A to "master", then demote node B to
/// "replica", then remove the partition from node C (its state becomes
/// `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateOp {
    pub node: String,
    /// `None` when `op` is `Op::Del` -- the node is leaving the partition.
    pub state: Option<String>,
    pub op: Op,
}

impl NodeStateOp {
    #[must_use]
    pub fn new(node: impl Into<String>, state: Option<String>, op: Op) -> Self {
        Self {
            node: node.into(),
            state,
            op,
        }
    }
}

// ---------------------------------------------------------------------------
// Partition / PartitionMap
// ---------------------------------------------------------------------------

/// A named, non-overlapping shard of some logical resource.
///
/// `nodes_by_state` is keyed by state name, e.g. `{"master": ["a"],
/// "replica": ["b", "c"]}`. Order within a state's node list matters only
/// for states whose model priority treats the first element as the
/// "primary" slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub name: String,
    #[serde(default)]
    pub nodes_by_state: BTreeMap<String, Vec<String>>,
}

impl Partition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes_by_state: BTreeMap::new(),
        }
    }

    /// Returns the node list for `state`, or an empty slice if the state
    /// has no entry yet.
    #[must_use]
    pub fn nodes_in_state(&self, state: &str) -> &[String] {
        self.nodes_by_state
            .get(state)
            .map_or(&[][..], Vec::as_slice)
    }

    /// Returns every node assigned to this partition in any state,
    /// deduplicated. Order is unspecified.
    #[must_use]
    pub fn all_nodes(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        for nodes in self.nodes_by_state.values() {
            seen.extend(nodes.iter().cloned());
        }
        seen.into_iter().collect()
    }
}

/// All partitions for some logical resource, keyed by partition name.
///
/// Iteration order does not affect correctness; it is a `BTreeMap` purely
/// so that diagnostics, logs, and tests that iterate the map get
/// deterministic output without an extra sort step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap(pub BTreeMap<String, Partition>);

impl PartitionMap {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.0.get(name)
    }

    pub fn insert(&mut self, partition: Partition) {
        self.0.insert(partition.name.clone(), partition);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Partition)> {
        self.0.iter()
    }

    /// Returns the set of partition names, used to validate that a begin
    /// map and an end map agree on which partitions exist.
    #[must_use]
    pub fn name_set(&self) -> std::collections::BTreeSet<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl FromIterator<Partition> for PartitionMap {
    fn from_iter<I: IntoIterator<Item = Partition>>(iter: I) -> Self {
        let mut map = Self::new();
        for p in iter {
            map.insert(p);
        }
        map
    }
}

// ---------------------------------------------------------------------------
// PartitionModel
// ---------------------------------------------------------------------------

/// Per-state metadata: how important a state is, and how many replicas of
/// it each partition should have.
///
/// `Priority` of zero is the highest -- e.g. "master" should carry a lower
/// `priority` than "replica", so "master" is filled first and never
/// displaced by a later, lower-priority state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionModelState {
    pub priority: u32,
    pub constraints: u32,
}

impl PartitionModelState {
    #[must_use]
    pub fn new(priority: u32, constraints: u32) -> Self {
        Self {
            priority,
            constraints,
        }
    }
}

/// Defines the set of states a partition can be assigned to a node under,
/// keyed by state name (e.g. "master", "replica", "dead").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionModel(pub BTreeMap<String, PartitionModelState>);

impl PartitionModel {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns state names ordered by ascending priority (most important
    /// first), ties broken lexicographically by name.
    #[must_use]
    pub fn states_by_priority(&self) -> Vec<&str> {
        let mut states: Vec<&str> = self.0.keys().map(String::as_str).collect();
        states.sort_by(|a, b| {
            self.0[*a]
                .priority
                .cmp(&self.0[*b].priority)
                .then_with(|| a.cmp(b))
        });
        states
    }

    /// Returns the name of the state with the *maximum* priority value --
    /// i.e. the *least* important state in the model. This asymmetric
    /// convention is intentional: see `planner`'s co-location scoring,
    /// which keys on this value.
    #[must_use]
    pub fn least_important_state(&self) -> Option<&str> {
        self.0
            .iter()
            .max_by(|(an, a), (bn, b)| a.priority.cmp(&b.priority).then_with(|| an.cmp(bn)))
            .map(|(name, _)| name.as_str())
    }
}

impl FromIterator<(String, PartitionModelState)> for PartitionModel {
    fn from_iter<I: IntoIterator<Item = (String, PartitionModelState)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
