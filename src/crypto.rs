//! The cryptographic gate: canonical encoding, envelope signatures and the
//! deterministic hashes used for leader and neighborhood election.
//!
//! Everything in here is consensus critical. Two nodes that disagree on a
//! single byte of an encoding or an election hash will disagree on who leads a
//! nomination round, or reject each other's signatures.

use core::convert::TryFrom;

use bincode::Options;
use ed25519::{Keypair, PublicKey, Signature, Signer, Verifier};
use log::trace;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::statement::{Envelope, Statement};
use crate::{Error, NodeId, Result, SlotIndex, Value};

/// Domain separation for [`election_hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPurpose {
    Neighborhood,
    Priority,
}

impl ElectionPurpose {
    pub fn tag(self) -> u32 {
        match self {
            ElectionPurpose::Neighborhood => 1,
            ElectionPurpose::Priority => 2,
        }
    }
}

// tag for ranking the values proposed by a round leader
const VALUE_TAG: u32 = 3;

/// Upper bound on any encoding, in either direction.
pub const MAX_ENCODED_LEN: u64 = 1 << 20;

// fixed width, big endian, no trailing bytes
fn canonical_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_ENCODED_LEN)
}

pub fn encode<T: Serialize>(item: &T) -> Result<Vec<u8>> {
    Ok(canonical_options().serialize(item)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(canonical_options().deserialize(bytes)?)
}

fn fold_digest(digest: &[u8]) -> u64 {
    digest
        .iter()
        .take(8)
        .fold(0u64, |acc, byte| acc << 8 | u64::from(*byte))
}

/// SHA-256 over `slot_index ‖ tag ‖ round ‖ node_id`, folded into the first
/// eight digest bytes read big endian.
pub fn election_hash(
    slot_index: SlotIndex,
    purpose: ElectionPurpose,
    round: u32,
    node_id: &NodeId,
) -> u64 {
    let mut sha = Sha256::new();
    sha.update(slot_index.to_be_bytes());
    sha.update(purpose.tag().to_be_bytes());
    sha.update(round.to_be_bytes());
    sha.update(node_id.as_bytes());
    fold_digest(&sha.finalize())
}

/// Rank of a value offered by a round leader, same construction as
/// [`election_hash`] with its own tag and the value's canonical encoding.
pub fn value_hash<V: Value>(slot_index: SlotIndex, round: u32, value: &V) -> Result<u64> {
    let mut sha = Sha256::new();
    sha.update(slot_index.to_be_bytes());
    sha.update(VALUE_TAG.to_be_bytes());
    sha.update(round.to_be_bytes());
    sha.update(encode(value)?);
    Ok(fold_digest(&sha.finalize()))
}

/// Short hex digest of a value, for logs.
pub fn value_string<V: Value>(value: &V) -> Result<String> {
    let digest = Sha256::digest(encode(value)?);
    Ok(hex::encode(&digest[..3]))
}

/// Signs the canonical encoding of `statement`.
///
/// The statement must be issued by the owner of `keypair`.
pub fn sign<V: Value>(statement: &Statement<V>, keypair: &Keypair) -> Result<Vec<u8>> {
    let local_node = NodeId::from(keypair.public);
    if statement.node_id != local_node {
        return Err(Error::ForeignStatement {
            statement_node: statement.node_id,
            local_node,
        });
    }
    let sig = keypair.sign(&statement.to_bytes()?);
    Ok(sig.to_bytes().to_vec())
}

/// Decodes a node id back into the ed25519 key it was derived from.
pub fn public_key(node_id: &NodeId) -> Result<PublicKey> {
    Ok(PublicKey::from_bytes(node_id.as_bytes())?)
}

/// Checks the envelope signature against the key named in its statement.
pub fn verify<V: Value>(envelope: &Envelope<V>) -> bool {
    let public = match public_key(&envelope.statement.node_id) {
        Ok(public) => public,
        Err(err) => {
            trace!("undecodable node id {:?}: {}", envelope.statement.node_id, err);
            return false;
        }
    };
    let sig = match Signature::try_from(envelope.signature.as_slice()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    match envelope.statement.to_bytes() {
        Ok(bytes) => public.verify(&bytes, &sig).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_election_hash_known_vectors() {
        let node = NodeId([7u8; 32]);
        assert_eq!(
            election_hash(5, ElectionPurpose::Neighborhood, 0, &node),
            13887125771230910139
        );
        assert_eq!(
            election_hash(5, ElectionPurpose::Neighborhood, 1, &node),
            6386641781755140375
        );
        assert_eq!(
            election_hash(5, ElectionPurpose::Priority, 0, &node),
            8887256327188792783
        );
        assert_eq!(
            election_hash(5, ElectionPurpose::Priority, 1, &node),
            12951805845232105791
        );
        assert_eq!(
            election_hash(0, ElectionPurpose::Priority, 0, &NodeId([0u8; 32])),
            3383747442819503709
        );
    }

    #[quickcheck]
    fn prop_election_purposes_are_separated(slot: u64, round: u32, id: Vec<u8>) -> bool {
        let mut bytes = [0u8; 32];
        bytes
            .iter_mut()
            .zip(id.into_iter())
            .for_each(|(b, i)| *b = i);
        let node = NodeId(bytes);

        election_hash(slot, ElectionPurpose::Priority, round, &node)
            != election_hash(slot, ElectionPurpose::Neighborhood, round, &node)
    }

    #[test]
    fn test_encoding_is_big_endian_fixed_width() {
        assert_eq!(encode(&1u64).unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(encode(&(2u32, 3u8)).unwrap(), vec![0, 0, 0, 2, 3]);
        assert_eq!(decode::<u32>(&[0, 0, 1, 0]).unwrap(), 256);
        assert!(decode::<u32>(&[0, 0, 1, 0, 9]).is_err());
    }

    #[test]
    fn test_node_ids_off_the_curve_are_not_keys() {
        // y = 2 has no x on edwards25519
        let mut bytes = [0u8; 32];
        bytes[0] = 2;
        assert!(matches!(
            public_key(&NodeId(bytes)),
            Err(Error::Ed25519(_))
        ));

        let keypair = Keypair::generate(&mut rand::thread_rng());
        let node_id = NodeId::from(keypair.public);
        assert_eq!(public_key(&node_id).unwrap(), keypair.public);
    }

    #[test]
    fn test_encodings_are_size_limited() {
        let too_big = vec![0u8; MAX_ENCODED_LEN as usize];
        match encode(&too_big) {
            Err(Error::Encoding(err)) => assert!(matches!(*err, bincode::ErrorKind::SizeLimit)),
            other => panic!("expected a size limit error, got {:?}", other),
        }

        // a well formed length prefix followed by that many bytes
        let mut bytes = MAX_ENCODED_LEN.to_be_bytes().to_vec();
        bytes.resize(bytes.len() + MAX_ENCODED_LEN as usize, 0);
        match decode::<Vec<u8>>(&bytes) {
            Err(Error::Encoding(err)) => assert!(matches!(*err, bincode::ErrorKind::SizeLimit)),
            other => panic!("expected a size limit error, got {:?}", other.map(|v| v.len())),
        }

        let fits = vec![7u8; 1024];
        assert_eq!(decode::<Vec<u8>>(&encode(&fits).unwrap()).unwrap(), fits);
    }

    #[test]
    fn test_value_hash_depends_on_round() {
        let a = value_hash(1, 0, &42u64).unwrap();
        let b = value_hash(1, 1, &42u64).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, value_hash(1, 0, &42u64).unwrap());
    }
}
