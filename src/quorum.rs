//! Quorum sets and the trust predicates evaluated over them.
//!
//! A [`QuorumSet`] is an immutable tree: `threshold` out of the direct
//! `validators` plus the nested `inner_sets` must be satisfied. Built once,
//! validated once, then only read.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use core::fmt::{self, Debug};
use serde::de::{self, DeserializeSeed, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, NodeId, Result};

/// Inner sets may be nested at most this deep below the root.
pub const MAX_NESTING_DEPTH: usize = 4;
pub const MAX_NODES: usize = 1000;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QuorumSet {
    threshold: u32,
    validators: BTreeSet<NodeId>,
    inner_sets: Vec<QuorumSet>,
}

impl Debug for QuorumSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}{:?}", self.threshold, self.validators)?;
        if !self.inner_sets.is_empty() {
            write!(f, "{:?}", self.inner_sets)?;
        }
        Ok(())
    }
}

// Decoding stops at MAX_NESTING_DEPTH, before recursing any further.
// Everything else is left to `validate`.
impl<'de> Deserialize<'de> for QuorumSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        NestedSet { depth: 0 }.deserialize(deserializer)
    }
}

const FIELDS: &[&str] = &["threshold", "validators", "inner_sets"];

#[derive(Clone, Copy)]
struct NestedSet {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for NestedSet {
    type Value = QuorumSet;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<QuorumSet, D::Error>
    where
        D: Deserializer<'de>,
    {
        if self.depth > MAX_NESTING_DEPTH {
            return Err(de::Error::custom(format!(
                "quorum set nested deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        deserializer.deserialize_struct("QuorumSet", FIELDS, self)
    }
}

impl<'de> Visitor<'de> for NestedSet {
    type Value = QuorumSet;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a quorum set")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<QuorumSet, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let threshold = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let validators = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let inner_sets = seq
            .next_element_seed(InnerSets {
                depth: self.depth + 1,
            })?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
        Ok(QuorumSet {
            threshold,
            validators,
            inner_sets,
        })
    }
}

struct InnerSets {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for InnerSets {
    type Value = Vec<QuorumSet>;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for InnerSets {
    type Value = Vec<QuorumSet>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a sequence of inner quorum sets")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        // the length prefix is untrusted
        let mut inner_sets = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(MAX_NODES));
        let nested = NestedSet { depth: self.depth };
        while let Some(inner) = seq.next_element_seed(nested)? {
            inner_sets.push(inner);
        }
        Ok(inner_sets)
    }
}

impl QuorumSet {
    pub fn new(
        threshold: u32,
        validators: impl IntoIterator<Item = NodeId>,
        inner_sets: Vec<QuorumSet>,
    ) -> Result<Self> {
        let qset = Self {
            threshold,
            validators: validators.into_iter().collect(),
            inner_sets,
        };
        qset.validate()?;
        Ok(qset)
    }

    /// The quorum set of a node that only trusts itself.
    pub fn singleton(node: NodeId) -> Self {
        Self {
            threshold: 1,
            validators: BTreeSet::from_iter([node]),
            inner_sets: Vec::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn validators(&self) -> &BTreeSet<NodeId> {
        &self.validators
    }

    pub fn inner_sets(&self) -> &[QuorumSet] {
        &self.inner_sets
    }

    fn entries(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        self.check(0, &mut seen)?;
        if seen.len() > MAX_NODES {
            return Err(Error::MalformedQuorumSet {
                reason: format!("{} nodes exceed the limit of {}", seen.len(), MAX_NODES),
            });
        }
        Ok(())
    }

    fn check(&self, depth: usize, seen: &mut BTreeSet<NodeId>) -> Result<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::MalformedQuorumSet {
                reason: format!("nested deeper than {} levels", MAX_NESTING_DEPTH),
            });
        }
        if self.threshold == 0 || self.threshold as usize > self.entries() {
            return Err(Error::MalformedQuorumSet {
                reason: format!(
                    "threshold {} out of range 1..={}",
                    self.threshold,
                    self.entries()
                ),
            });
        }
        for node in self.validators.iter() {
            if !seen.insert(*node) {
                return Err(Error::MalformedQuorumSet {
                    reason: format!("{:?} appears more than once", node),
                });
            }
        }
        for inner in self.inner_sets.iter() {
            inner.check(depth + 1, seen)?;
        }
        Ok(())
    }

    /// Every node mentioned anywhere in the tree.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = self.validators.clone();
        for inner in self.inner_sets.iter() {
            nodes.extend(inner.nodes());
        }
        nodes
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.validators.contains(node) || self.inner_sets.iter().any(|q| q.contains(node))
    }

    /// At least `threshold` of (validators in `nodes`, satisfied inner sets).
    pub fn is_quorum_slice(&self, nodes: &BTreeSet<NodeId>) -> bool {
        let satisfied = self
            .validators
            .iter()
            .filter(|v| nodes.contains(v))
            .count()
            + self
                .inner_sets
                .iter()
                .filter(|inner| inner.is_quorum_slice(nodes))
                .count();
        satisfied >= self.threshold as usize
    }

    /// True when `nodes` intersects every slice of this set, i.e. removing
    /// them leaves the set unsatisfiable.
    pub fn is_v_blocking(&self, nodes: &BTreeSet<NodeId>) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let blocked = self
            .validators
            .iter()
            .filter(|v| nodes.contains(v))
            .count()
            + self
                .inner_sets
                .iter()
                .filter(|inner| inner.is_v_blocking(nodes))
                .count();
        blocked > self.entries().saturating_sub(self.threshold as usize)
    }

    /// The share of `u64::MAX` that `node` carries in this tree. Each level
    /// scales its child's weight by `threshold / entries`, rounding up.
    pub fn node_weight(&self, node: &NodeId) -> u64 {
        let total = self.entries() as u128;
        let threshold = self.threshold as u128;
        if total == 0 || threshold == 0 {
            return 0;
        }
        let scale = |weight: u64| {
            let numerator = weight as u128 * threshold;
            let res = (numerator + total - 1) / total;
            res.min(u64::MAX as u128) as u64
        };
        if self.validators.contains(node) {
            return scale(u64::MAX);
        }
        self.inner_sets
            .iter()
            .map(|inner| inner.node_weight(node))
            .find(|w| *w > 0)
            .map(scale)
            .unwrap_or(0)
    }
}

pub fn is_quorum_slice(quorum_set: &QuorumSet, senders: &BTreeSet<NodeId>) -> bool {
    quorum_set.is_quorum_slice(senders)
}

pub fn is_v_blocking(quorum_set: &QuorumSet, senders: &BTreeSet<NodeId>) -> bool {
    quorum_set.is_v_blocking(senders)
}

/// Transitive quorum check.
///
/// `members` are the senders whose statements support the assertion, each with
/// the quorum set it declared. Senders whose own slice is not satisfied by the
/// remaining senders are dropped until nothing changes; what is left is a
/// quorum for us if it satisfies `local`.
pub fn is_quorum<'a>(
    local: &QuorumSet,
    members: impl IntoIterator<Item = (NodeId, Cow<'a, QuorumSet>)>,
) -> bool {
    let members: BTreeMap<NodeId, Cow<'a, QuorumSet>> = members.into_iter().collect();
    let mut nodes: BTreeSet<NodeId> = members.keys().copied().collect();
    loop {
        let kept: BTreeSet<NodeId> = nodes
            .iter()
            .filter(|n| members.get(n).map_or(false, |q| q.is_quorum_slice(&nodes)))
            .copied()
            .collect();
        if kept.len() == nodes.len() {
            break;
        }
        nodes = kept;
    }
    local.is_quorum_slice(&nodes)
}
