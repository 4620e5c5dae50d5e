//! Federated Byzantine agreement.
//!
//! Every node trusts its own [`QuorumSet`] instead of a global majority. For
//! each [`SlotIndex`] the nodes first nominate candidate values, then run a
//! ballot protocol that commits and externalizes exactly one value.
//!
//! The [`Engine`] is the entry point: feed it envelopes from the network with
//! [`Engine::receive_envelope`], start nomination with [`Engine::nominate`] and
//! drive timeouts through the [`Driver`] hooks.

pub mod ballot;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod engine;
pub mod error;
pub mod nomination;
pub mod node;
pub mod quorum;
pub mod slot;
pub mod statement;

use core::fmt::{self, Debug, Display};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use crate::ballot::{BallotProtocol, Phase};
pub use crate::config::EngineConfig;
pub use crate::crypto::{election_hash, value_hash, ElectionPurpose};
pub use crate::driver::{Driver, EnvelopeState, Timer};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::node::{LocalNode, Role, Validator, Watcher};
pub use crate::nomination::Nomination;
pub use crate::quorum::{is_quorum, is_quorum_slice, is_v_blocking, QuorumSet};
pub use crate::slot::{Slot, SlotContext};
pub use crate::statement::{Ballot, Envelope, Pledge, Statement};

pub type SlotIndex = u64;

/// Anything the application wants to agree on.
///
/// Values must be totally ordered and have a deterministic encoding since they
/// end up inside signed statements.
pub trait Value: Ord + Clone + Debug + Serialize + DeserializeOwned {}
impl<T: Ord + Clone + Debug + Serialize + DeserializeOwned> Value for T {}

/// A node identity: the bytes of its ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<ed25519::PublicKey> for NodeId {
    fn from(public: ed25519::PublicKey) -> Self {
        NodeId(public.to_bytes())
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i:{}", hex::encode(&self.0[..3]))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
