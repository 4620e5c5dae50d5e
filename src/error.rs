use thiserror::Error;

use crate::{NodeId, SlotIndex};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to encode with bincode")]
    Encoding(#[from] bincode::Error),
    #[error("Ed25519 Error {0}")]
    Ed25519(#[from] ed25519::SignatureError),
    #[error("Malformed quorum set: {reason}")]
    MalformedQuorumSet { reason: String },
    #[error("Refusing to sign a statement from {statement_node:?} with the key of {local_node:?}")]
    ForeignStatement {
        statement_node: NodeId,
        local_node: NodeId,
    },
    #[error("Slot {slot_index} exceeded the ballot advance depth of {depth}")]
    AdvanceRecursion { slot_index: SlotIndex, depth: u32 },
    #[error("Slot {slot_index} rejected a statement it produced itself")]
    SelfStatementRejected { slot_index: SlotIndex },
}

pub type Result<T> = std::result::Result<T, Error>;
