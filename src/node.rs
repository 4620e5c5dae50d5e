use core::fmt::{self, Debug};

use ed25519::Keypair;
use rand::{CryptoRng, Rng};

use crate::{NodeId, QuorumSet, Result};

/// What the local node may do in consensus.
///
/// A [`Validator`] holds a signing key and takes part in voting. A
/// [`Watcher`] only follows the slots it hears about and learns the
/// externalized values.
pub trait Role {
    fn node_id(&self) -> NodeId;

    fn keypair(&self) -> Option<&Keypair>;
}

pub struct Validator {
    keypair: Keypair,
}

impl Validator {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn random(mut rng: impl Rng + CryptoRng) -> Self {
        Self::new(Keypair::generate(&mut rng))
    }

    pub fn signing_key(&self) -> &Keypair {
        &self.keypair
    }
}

impl Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validator({:?})", NodeId::from(self.keypair.public))
    }
}

impl Role for Validator {
    fn node_id(&self) -> NodeId {
        NodeId::from(self.keypair.public)
    }

    fn keypair(&self) -> Option<&Keypair> {
        Some(&self.keypair)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watcher {
    id: NodeId,
}

impl Watcher {
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }
}

impl Role for Watcher {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn keypair(&self) -> Option<&Keypair> {
        None
    }
}

/// The local node: its role and the quorum set it currently trusts.
#[derive(Debug)]
pub struct LocalNode<R: Role> {
    pub role: R,
    quorum_set: QuorumSet,
}

impl<R: Role> LocalNode<R> {
    pub fn new(role: R, quorum_set: QuorumSet) -> Result<Self> {
        quorum_set.validate()?;
        Ok(Self { role, quorum_set })
    }

    pub fn id(&self) -> NodeId {
        self.role.node_id()
    }

    pub fn quorum_set(&self) -> &QuorumSet {
        &self.quorum_set
    }

    pub fn update_quorum_set(&mut self, quorum_set: QuorumSet) -> Result<()> {
        quorum_set.validate()?;
        self.quorum_set = quorum_set;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_validator_ids_follow_the_key() {
        let rng = StdRng::from_seed([0u8; 32]);
        let validator = Validator::random(rng);
        assert_eq!(
            validator.node_id().as_bytes(),
            validator.keypair.public.as_bytes()
        );
        assert!(validator.keypair().is_some());
    }

    #[test]
    fn test_watcher_has_no_key() {
        let watcher = Watcher::new(NodeId([4; 32]));
        assert_eq!(watcher.node_id(), NodeId([4; 32]));
        assert!(watcher.keypair().is_none());
    }

    #[test]
    fn test_local_node_rejects_malformed_quorum_set() -> eyre::Result<()> {
        let id = NodeId([1; 32]);
        let mut node = LocalNode::new(Watcher::new(id), QuorumSet::singleton(id))?;

        let pair = QuorumSet::new(1, [id, NodeId([2; 32])], vec![])?;
        node.update_quorum_set(pair.clone())?;
        assert_eq!(node.quorum_set(), &pair);

        // a zero threshold only gets past the constructor over the wire
        let raw = crate::crypto::encode(&(0u32, vec![id], Vec::<QuorumSet>::new()))?;
        let zero: QuorumSet = crate::crypto::decode(&raw)?;
        assert!(node.update_quorum_set(zero).is_err());
        assert_eq!(node.quorum_set(), &pair);
        Ok(())
    }
}
