use std::collections::{BTreeMap, BTreeSet};

use ed25519::Keypair;
use log::{debug, info};

use crate::ballot::{BallotProtocol, Phase};
use crate::crypto;
use crate::driver::Driver;
use crate::nomination::Nomination;
use crate::quorum::{is_quorum, is_v_blocking};
use crate::statement::{Envelope, Pledge, Statement};
use crate::{EngineConfig, NodeId, QuorumSet, Result, SlotIndex, Value};

/// Everything a slot borrows from its engine while handling one call.
pub struct SlotContext<'a, D> {
    pub slot_index: SlotIndex,
    pub node_id: NodeId,
    pub quorum_set: &'a QuorumSet,
    pub keypair: Option<&'a Keypair>,
    pub driver: &'a mut D,
    pub config: &'a EngineConfig,
}

impl<'a, D> SlotContext<'a, D> {
    /// Wraps `pledge` into a signed envelope from the local node, or `None`
    /// when the local node has no key to sign with.
    pub fn sign<V: Value>(&mut self, pledge: Pledge<V>) -> Result<Option<Envelope<V>>>
    where
        D: Driver<V>,
    {
        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None => return Ok(None),
        };
        let statement = Statement {
            slot_index: self.slot_index,
            node_id: self.node_id,
            pledge,
        };
        let signature = crypto::sign(&statement, keypair)?;
        self.driver.envelope_signed();
        Ok(Some(Envelope {
            statement,
            signature,
        }))
    }
}

/// Federated accept: a v-blocking set accepted, or a quorum voted or
/// accepted.
pub(crate) fn federated_accept<V: Value>(
    quorum_set: &QuorumSet,
    latest: &BTreeMap<NodeId, Envelope<V>>,
    voted: impl Fn(&Statement<V>) -> bool,
    accepted: impl Fn(&Statement<V>) -> bool,
) -> bool {
    let acceptors: BTreeSet<NodeId> = latest
        .iter()
        .filter(|(_, env)| accepted(&env.statement))
        .map(|(node, _)| *node)
        .collect();
    if is_v_blocking(quorum_set, &acceptors) {
        return true;
    }
    federated_ratify(quorum_set, latest, |st| accepted(st) || voted(st))
}

/// Federated ratify: a quorum, transitively closed over the quorum sets the
/// senders declared, agrees with `voted`.
pub(crate) fn federated_ratify<V: Value>(
    quorum_set: &QuorumSet,
    latest: &BTreeMap<NodeId, Envelope<V>>,
    voted: impl Fn(&Statement<V>) -> bool,
) -> bool {
    is_quorum(
        quorum_set,
        latest
            .values()
            .filter(|env| voted(&env.statement))
            .map(|env| (env.statement.node_id, env.statement.companion_quorum_set())),
    )
}

/// One consensus instance: nomination and ballot state for a single index.
#[derive(Debug)]
pub struct Slot<V: Value> {
    index: SlotIndex,
    nomination: Nomination<V>,
    ballot: BallotProtocol<V>,
}

impl<V: Value> Slot<V> {
    pub fn new(index: SlotIndex) -> Self {
        Self {
            index,
            nomination: Nomination::default(),
            ballot: BallotProtocol::default(),
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn nomination(&self) -> &Nomination<V> {
        &self.nomination
    }

    pub fn ballot(&self) -> &BallotProtocol<V> {
        &self.ballot
    }

    pub fn phase(&self) -> Phase {
        self.ballot.phase()
    }

    pub fn candidates(&self) -> &BTreeSet<V> {
        self.nomination.candidates()
    }

    pub fn externalized_value(&self) -> Option<&V> {
        self.ballot.externalized_value()
    }

    /// Number of senders we hold a statement from, per sub-protocol.
    pub fn statement_count(&self) -> usize {
        self.nomination.statement_count() + self.ballot.statement_count()
    }

    /// Our own latest statements, for peers catching up. Once externalized
    /// only the externalize statement is relevant.
    pub fn current_state(&self) -> Vec<Envelope<V>> {
        if self.phase() == Phase::Externalize {
            return self.ballot.last_envelope().cloned().into_iter().collect();
        }
        self.nomination
            .last_envelope()
            .into_iter()
            .chain(self.ballot.last_envelope())
            .cloned()
            .collect()
    }

    pub fn process_envelope<D: Driver<V>>(
        &mut self,
        envelope: &Envelope<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<()> {
        match envelope.statement.pledge {
            Pledge::Nominate { .. } => self.nomination.process_envelope(envelope, ctx)?,
            _ => {
                self.ballot.process_envelope(envelope, ctx)?;
            }
        }
        self.settle(ctx)
    }

    pub fn nominate<D: Driver<V>>(
        &mut self,
        value: V,
        timed_out: bool,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let updated = self.nomination.nominate(ctx, value, timed_out)?;
        self.settle(ctx)?;
        Ok(updated)
    }

    pub fn abandon_ballot<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) -> Result<bool> {
        let abandoned = self.ballot.abandon_ballot(0, ctx)?;
        self.settle(ctx)?;
        Ok(abandoned)
    }

    /// Hands fresh composites to the ballot protocol and ends nomination once
    /// the slot externalized.
    fn settle<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) -> Result<()> {
        if let Some(composite) = self.nomination.take_pending_composite() {
            debug!(
                "[FBA-{:?}] slot {} composite {:?}",
                ctx.node_id, self.index, composite
            );
            self.ballot.update_composite(composite, ctx)?;
        }
        if self.phase() == Phase::Externalize && !self.nomination.is_stopped() {
            info!(
                "[FBA-{:?}] slot {} externalized {:?}",
                ctx.node_id,
                self.index,
                self.externalized_value()
            );
            self.nomination.stop();
        }
        Ok(())
    }
}
