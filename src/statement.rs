use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use core::fmt::Debug;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::quorum::QuorumSet;
use crate::{NodeId, Result, SlotIndex, Value};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot<V> {
    // field order matters: ballots compare by counter first, then by value
    pub counter: u32,
    pub value: V,
}

impl<V: Debug> Debug for Ballot<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{:?})", self.counter, self.value)
    }
}

impl<V: Value> Ballot<V> {
    pub fn new(counter: u32, value: V) -> Self {
        Self { counter, value }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.value == other.value
    }

    /// `self ≤ other` and both carry the same value.
    pub fn is_less_and_compatible(&self, other: &Self) -> bool {
        self <= other && self.is_compatible(other)
    }

    /// `self ≤ other` with different values.
    pub fn is_less_and_incompatible(&self, other: &Self) -> bool {
        self <= other && !self.is_compatible(other)
    }

    pub fn with_counter(&self, counter: u32) -> Self {
        Self {
            counter,
            value: self.value.clone(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Value")]
pub enum Pledge<V: Value> {
    Nominate {
        quorum_set: QuorumSet,
        votes: BTreeSet<V>,
        accepted: BTreeSet<V>,
    },
    Prepare {
        quorum_set: QuorumSet,
        ballot: Ballot<V>,
        prepared: Option<Ballot<V>>,
        prepared_prime: Option<Ballot<V>>,
        n_c: u32,
        n_h: u32,
    },
    Confirm {
        quorum_set: QuorumSet,
        ballot: Ballot<V>,
        n_prepared: u32,
        n_commit: u32,
        n_h: u32,
    },
    Externalize {
        commit: Ballot<V>,
        n_h: u32,
    },
}

impl<V: Value> Debug for Pledge<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pledge::Nominate {
                votes, accepted, ..
            } => write!(f, "NOM(v{:?} a{:?})", votes, accepted),
            Pledge::Prepare {
                ballot,
                prepared,
                prepared_prime,
                n_c,
                n_h,
                ..
            } => write!(
                f,
                "PREP(b{:?} p{:?} p'{:?} c{} h{})",
                ballot, prepared, prepared_prime, n_c, n_h
            ),
            Pledge::Confirm {
                ballot,
                n_prepared,
                n_commit,
                n_h,
                ..
            } => write!(
                f,
                "CONF(b{:?} p{} c{} h{})",
                ballot, n_prepared, n_commit, n_h
            ),
            Pledge::Externalize { commit, n_h } => write!(f, "EXT(c{:?} h{})", commit, n_h),
        }
    }
}

impl<V: Value> Pledge<V> {
    /// Position in the statement lifecycle; a sender can only move forward.
    pub fn rank(&self) -> u8 {
        match self {
            Pledge::Nominate { .. } => 0,
            Pledge::Prepare { .. } => 1,
            Pledge::Confirm { .. } => 2,
            Pledge::Externalize { .. } => 3,
        }
    }

    pub fn is_ballot_pledge(&self) -> bool {
        !matches!(self, Pledge::Nominate { .. })
    }

    /// Every value referenced by this pledge.
    pub fn values(&self) -> BTreeSet<&V> {
        match self {
            Pledge::Nominate {
                votes, accepted, ..
            } => votes.iter().chain(accepted.iter()).collect(),
            Pledge::Prepare {
                ballot,
                prepared,
                prepared_prime,
                ..
            } => std::iter::once(ballot)
                .chain(prepared.iter())
                .chain(prepared_prime.iter())
                .map(|b| &b.value)
                .collect(),
            Pledge::Confirm { ballot, .. } => BTreeSet::from_iter([&ballot.value]),
            Pledge::Externalize { commit, .. } => BTreeSet::from_iter([&commit.value]),
        }
    }

    /// The ballot this pledge works on: `b` while preparing, the commit
    /// ballot once confirming or externalizing.
    pub fn working_ballot(&self) -> Option<Ballot<V>> {
        match self {
            Pledge::Nominate { .. } => None,
            Pledge::Prepare { ballot, .. } => Some(ballot.clone()),
            Pledge::Confirm {
                ballot, n_commit, ..
            } => Some(ballot.with_counter(*n_commit)),
            Pledge::Externalize { commit, .. } => Some(commit.clone()),
        }
    }

    /// Counter used when deciding whether peers are ahead of us.
    pub fn ballot_counter(&self) -> u32 {
        match self {
            Pledge::Nominate { .. } => 0,
            Pledge::Prepare { ballot, .. } | Pledge::Confirm { ballot, .. } => ballot.counter,
            Pledge::Externalize { .. } => u32::MAX,
        }
    }

    /// Whether a ballot pledge supersedes `older` from the same sender.
    pub fn supersedes(&self, older: &Self) -> bool {
        if self.rank() != older.rank() {
            return self.rank() > older.rank();
        }
        match (older, self) {
            (
                Pledge::Prepare {
                    ballot: old_b,
                    prepared: old_p,
                    prepared_prime: old_pp,
                    n_h: old_h,
                    ..
                },
                Pledge::Prepare {
                    ballot,
                    prepared,
                    prepared_prime,
                    n_h,
                    ..
                },
            ) => (old_b, old_p, old_pp, old_h) < (ballot, prepared, prepared_prime, n_h),
            (
                Pledge::Confirm {
                    ballot: old_b,
                    n_prepared: old_p,
                    n_h: old_h,
                    ..
                },
                Pledge::Confirm {
                    ballot,
                    n_prepared,
                    n_h,
                    ..
                },
            ) => match old_b.cmp(ballot) {
                Ordering::Less => true,
                Ordering::Equal => (old_p, old_h) < (n_prepared, n_h),
                Ordering::Greater => false,
            },
            // an externalize never changes and nominations have their own rule
            _ => false,
        }
    }

    /// Structural checks a well behaved sender never violates.
    pub fn is_sane(&self, from_self: bool) -> bool {
        match self {
            Pledge::Nominate {
                quorum_set,
                votes,
                accepted,
            } => quorum_set.validate().is_ok() && !(votes.is_empty() && accepted.is_empty()),
            Pledge::Prepare {
                quorum_set,
                ballot,
                prepared,
                prepared_prime,
                n_c,
                n_h,
            } => {
                let counter_ok = from_self || ballot.counter > 0;
                let prime_ok = match (prepared_prime, prepared) {
                    (Some(pp), Some(p)) => pp.is_less_and_incompatible(p),
                    (Some(_), None) => false,
                    _ => true,
                };
                let h_ok = *n_h == 0 || prepared.as_ref().map_or(false, |p| *n_h <= p.counter);
                let c_ok = *n_c == 0 || (*n_h != 0 && ballot.counter >= *n_h && *n_h >= *n_c);
                quorum_set.validate().is_ok() && counter_ok && prime_ok && h_ok && c_ok
            }
            Pledge::Confirm {
                quorum_set,
                ballot,
                n_commit,
                n_h,
                ..
            } => {
                quorum_set.validate().is_ok()
                    && ballot.counter > 0
                    && *n_h <= ballot.counter
                    && *n_commit <= *n_h
            }
            Pledge::Externalize { commit, n_h } => commit.counter > 0 && *n_h >= commit.counter,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Value")]
pub struct Statement<V: Value> {
    pub slot_index: SlotIndex,
    pub node_id: NodeId,
    pub pledge: Pledge<V>,
}

impl<V: Value> Debug for Statement<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}-{:?}@{:?}", self.slot_index, self.pledge, self.node_id)
    }
}

impl<V: Value> Statement<V> {
    /// The canonical encoding that signatures are computed over.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crypto::encode(self)
    }

    /// The quorum set the sender declared with this statement. A node that
    /// externalized is satisfied by itself alone.
    pub fn companion_quorum_set(&self) -> Cow<'_, QuorumSet> {
        match &self.pledge {
            Pledge::Nominate { quorum_set, .. }
            | Pledge::Prepare { quorum_set, .. }
            | Pledge::Confirm { quorum_set, .. } => Cow::Borrowed(quorum_set),
            Pledge::Externalize { .. } => Cow::Owned(QuorumSet::singleton(self.node_id)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Value")]
pub struct Envelope<V: Value> {
    pub statement: Statement<V>,
    pub signature: Vec<u8>,
}

impl<V: Value> Debug for Envelope<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.statement)
    }
}

impl<V: Value> Envelope<V> {
    /// An envelope waiting for [`crate::Engine::sign_envelope`].
    pub fn unsigned(statement: Statement<V>) -> Self {
        Self {
            statement,
            signature: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crypto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        crypto::decode(bytes)
    }
}
