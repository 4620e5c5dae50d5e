use std::collections::BTreeMap;

use log::{debug, info, trace};

use crate::crypto;
use crate::driver::{Driver, EnvelopeState};
use crate::node::{LocalNode, Role, Validator, Watcher};
use crate::slot::{Slot, SlotContext};
use crate::statement::Envelope;
use crate::{EngineConfig, NodeId, QuorumSet, Result, SlotIndex, Value};

/// A node's view of every slot it knows about.
///
/// The engine owns the slots outright; a slot only ever sees the local node,
/// the driver and the config through a [`SlotContext`] that lives for the
/// duration of one call.
#[derive(Debug)]
pub struct Engine<V: Value, D: Driver<V>, R: Role> {
    local: LocalNode<R>,
    driver: D,
    config: EngineConfig,
    slots: BTreeMap<SlotIndex, Slot<V>>,
}

impl<V: Value, D: Driver<V>> Engine<V, D, Validator> {
    pub fn validator(
        validator: Validator,
        quorum_set: QuorumSet,
        driver: D,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::new(validator, quorum_set, driver, config)
    }

    /// Proposes `value` for `slot_index`, or moves nomination to its next
    /// round when `timed_out`.
    pub fn nominate(&mut self, slot_index: SlotIndex, value: V, timed_out: bool) -> Result<bool> {
        info!(
            "[FBA-{:?}] nominate slot {} with {:?} (timed out: {})",
            self.local_node_id(),
            slot_index,
            value,
            timed_out
        );
        // a timer firing for a slot we no longer hold must not resurrect it
        let nominated = self.with_slot(slot_index, !timed_out, |slot, ctx| {
            slot.nominate(value, timed_out, ctx)
        })?;
        Ok(nominated.unwrap_or(false))
    }

    /// Ballot timer expiry: give up on the current ballot and move on to the
    /// next counter.
    pub fn abandon_ballot(&mut self, slot_index: SlotIndex) -> Result<bool> {
        let abandoned = self.with_slot(slot_index, false, |slot, ctx| slot.abandon_ballot(ctx))?;
        Ok(abandoned.unwrap_or(false))
    }

    pub fn sign_envelope(&mut self, envelope: &mut Envelope<V>) -> Result<()> {
        envelope.signature = crypto::sign(&envelope.statement, self.local.role.signing_key())?;
        self.driver.envelope_signed();
        Ok(())
    }
}

impl<V: Value, D: Driver<V>> Engine<V, D, Watcher> {
    pub fn watcher(
        id: NodeId,
        quorum_set: QuorumSet,
        driver: D,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::new(Watcher::new(id), quorum_set, driver, config)
    }
}

impl<V: Value, D: Driver<V>, R: Role> Engine<V, D, R> {
    pub fn new(role: R, quorum_set: QuorumSet, driver: D, config: EngineConfig) -> Result<Self> {
        Ok(Self {
            local: LocalNode::new(role, quorum_set)?,
            driver,
            config,
            slots: BTreeMap::new(),
        })
    }

    /// Runs `f` on the slot with a context borrowed from the engine. Missing
    /// slots are created when `create` is set, otherwise `f` is skipped.
    fn with_slot<T>(
        &mut self,
        slot_index: SlotIndex,
        create: bool,
        f: impl FnOnce(&mut Slot<V>, &mut SlotContext<'_, D>) -> Result<T>,
    ) -> Result<Option<T>> {
        let Engine {
            local,
            driver,
            config,
            slots,
        } = self;
        let slot = if create {
            slots
                .entry(slot_index)
                .or_insert_with(|| Slot::new(slot_index))
        } else {
            match slots.get_mut(&slot_index) {
                Some(slot) => slot,
                None => return Ok(None),
            }
        };
        let mut ctx = SlotContext {
            slot_index,
            node_id: local.id(),
            quorum_set: local.quorum_set(),
            keypair: local.role.keypair(),
            driver,
            config,
        };
        f(slot, &mut ctx).map(Some)
    }

    /// Authenticates `envelope` and folds it into its slot.
    ///
    /// `Invalid` means the signature did not check out and nothing was
    /// touched. `Valid` says nothing about whether the statement was new.
    pub fn receive_envelope(&mut self, envelope: Envelope<V>) -> Result<EnvelopeState> {
        if !self.verify_envelope(&envelope) {
            debug!(
                "[FBA-{:?}] dropping badly signed {:?}",
                self.local_node_id(),
                envelope
            );
            return Ok(EnvelopeState::Invalid);
        }

        trace!("[FBA-{:?}] received {:?}", self.local_node_id(), envelope);
        let slot_index = envelope.statement.slot_index;
        self.with_slot(slot_index, true, |slot, ctx| {
            slot.process_envelope(&envelope, ctx)
        })?;
        Ok(EnvelopeState::Valid)
    }

    /// Checks the signature and reports the outcome to the driver.
    pub fn verify_envelope(&mut self, envelope: &Envelope<V>) -> bool {
        let valid = crypto::verify(envelope);
        self.driver.envelope_verified(valid);
        valid
    }

    /// Replaces the local quorum set. Statements processed from now on use
    /// the new one; what was already decided stays.
    pub fn update_local_quorum_set(&mut self, quorum_set: QuorumSet) -> Result<()> {
        self.local.update_quorum_set(quorum_set)?;
        info!(
            "[FBA-{:?}] quorum set is now {:?}",
            self.local_node_id(),
            self.local.quorum_set()
        );
        Ok(())
    }

    pub fn local_quorum_set(&self) -> &QuorumSet {
        self.local.quorum_set()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local.id()
    }

    /// Forgets every slot below `max_slot_index`.
    pub fn purge_slots(&mut self, max_slot_index: SlotIndex) {
        let kept = self.slots.split_off(&max_slot_index);
        let purged = std::mem::replace(&mut self.slots, kept);
        if !purged.is_empty() {
            debug!(
                "[FBA-{:?}] purged {} slots below {}",
                self.local_node_id(),
                purged.len(),
                max_slot_index
            );
        }
    }

    pub fn known_slots_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cumulative_statement_count(&self) -> usize {
        self.slots.values().map(Slot::statement_count).sum()
    }

    pub fn value_string(&self, value: &V) -> Result<String> {
        crypto::value_string(value)
    }

    pub fn slot(&self, slot_index: SlotIndex) -> Option<&Slot<V>> {
        self.slots.get(&slot_index)
    }

    pub fn externalized_value(&self, slot_index: SlotIndex) -> Option<&V> {
        self.slot(slot_index).and_then(Slot::externalized_value)
    }

    /// The statements we would send a peer that asks where we are on
    /// `slot_index`.
    pub fn current_state(&self, slot_index: SlotIndex) -> Vec<Envelope<V>> {
        self.slot(slot_index)
            .map(Slot::current_state)
            .unwrap_or_default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use rand::{rngs::StdRng, SeedableRng};

    use crate::driver::Timer;
    use crate::statement::{Ballot, Pledge, Statement};
    use crate::{Error, Phase};

    #[derive(Debug, Default)]
    struct Recorder {
        outbox: Vec<Envelope<u64>>,
        externalized: BTreeMap<SlotIndex, u64>,
        timers: BTreeMap<(SlotIndex, Timer), Duration>,
        signed: usize,
        verified: Vec<bool>,
    }

    impl Driver<u64> for Recorder {
        fn validate_value(&self, _slot_index: SlotIndex, value: &u64) -> bool {
            *value != 0
        }

        fn combine_candidates(&self, _slot_index: SlotIndex, candidates: &BTreeSet<u64>) -> Option<u64> {
            candidates.iter().max().copied()
        }

        fn emit_envelope(&mut self, envelope: &Envelope<u64>) {
            self.outbox.push(envelope.clone());
        }

        fn setup_timer(&mut self, slot_index: SlotIndex, timer: Timer, timeout: Duration) {
            self.timers.insert((slot_index, timer), timeout);
        }

        fn stop_timer(&mut self, slot_index: SlotIndex, timer: Timer) {
            self.timers.remove(&(slot_index, timer));
        }

        fn value_externalized(&mut self, slot_index: SlotIndex, value: &u64) {
            assert!(self.externalized.insert(slot_index, *value).is_none());
        }

        fn envelope_signed(&mut self) {
            self.signed += 1;
        }

        fn envelope_verified(&mut self, valid: bool) {
            self.verified.push(valid);
        }
    }

    fn solo(seed: u8) -> Result<Engine<u64, Recorder, Validator>> {
        let validator = Validator::random(StdRng::from_seed([seed; 32]));
        let qset = QuorumSet::singleton(validator.node_id());
        Engine::validator(validator, qset, Recorder::default(), EngineConfig::default())
    }

    #[test]
    fn test_lone_validator_externalizes_its_own_value() -> Result<()> {
        let mut engine = solo(1)?;
        assert!(engine.nominate(9, 42, false)?);

        assert_eq!(engine.externalized_value(9), Some(&42));
        assert_eq!(engine.driver().externalized.get(&9), Some(&42));
        assert_eq!(engine.slot(9).map(Slot::phase), Some(Phase::Externalize));
        assert!(engine.slot(9).map_or(false, |s| s.nomination().is_stopped()));

        // once terminal, the catch-up state is the externalize statement
        let state = engine.current_state(9);
        assert_eq!(state.len(), 1);
        assert!(matches!(
            state[0].statement.pledge,
            Pledge::Externalize { commit: Ballot { value: 42, .. }, .. }
        ));
        let outbox = engine.driver().outbox.clone();
        assert!(outbox.iter().all(|env| engine.verify_envelope(env)));
        assert!(!engine.driver().timers.contains_key(&(9, Timer::Ballot)));

        // nothing left to nominate
        assert!(!engine.nominate(9, 43, false)?);
        Ok(())
    }

    #[test]
    fn test_timed_out_calls_never_create_slots() -> Result<()> {
        let mut engine = solo(2)?;
        assert!(!engine.nominate(3, 7, true)?);
        assert!(!engine.abandon_ballot(3)?);
        assert_eq!(engine.known_slots_count(), 0);
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_not_nominated() -> Result<()> {
        let mut engine = solo(3)?;
        assert!(!engine.nominate(1, 0, false)?);
        assert_eq!(engine.externalized_value(1), None);
        assert!(engine.driver().outbox.is_empty());
        Ok(())
    }

    #[test]
    fn test_sign_envelope_refuses_foreign_statements() -> Result<()> {
        let mut engine = solo(4)?;
        let mut envelope = Envelope::unsigned(Statement {
            slot_index: 1,
            node_id: NodeId([8; 32]),
            pledge: Pledge::Externalize {
                commit: Ballot::new(1, 5u64),
                n_h: 1,
            },
        });
        assert!(matches!(
            engine.sign_envelope(&mut envelope),
            Err(Error::ForeignStatement { .. })
        ));
        assert_eq!(engine.driver().signed, 0);

        envelope.statement.node_id = engine.local_node_id();
        engine.sign_envelope(&mut envelope)?;
        assert!(engine.verify_envelope(&envelope));
        assert_eq!(engine.driver().signed, 1);
        Ok(())
    }

    #[test]
    fn test_verify_envelope_reports_every_outcome() -> Result<()> {
        let mut engine = solo(10)?;
        let mut peer = solo(11)?;
        peer.nominate(4, 12, false)?;
        let envelope = peer.driver().outbox[0].clone();
        let mut tampered = envelope.clone();
        tampered.signature[0] ^= 1;

        assert!(engine.verify_envelope(&envelope));
        assert!(!engine.verify_envelope(&tampered));
        assert_eq!(engine.driver().verified, vec![true, false]);
        // checking alone never creates slot state
        assert_eq!(engine.known_slots_count(), 0);

        // receiving verifies once more, and reports it once
        assert_eq!(engine.receive_envelope(envelope)?, EnvelopeState::Valid);
        assert_eq!(engine.driver().verified, vec![true, false, true]);
        assert_eq!(engine.known_slots_count(), 1);
        Ok(())
    }

    #[test]
    fn test_tampered_envelope_is_invalid_and_ignored() -> Result<()> {
        let mut engine = solo(5)?;
        let mut peer = solo(6)?;
        peer.nominate(2, 11, false)?;
        let mut envelope = peer.driver().outbox[0].clone();
        envelope.statement.slot_index = 3;

        assert_eq!(
            engine.receive_envelope(envelope)?,
            EnvelopeState::Invalid
        );
        assert_eq!(engine.known_slots_count(), 0);
        assert_eq!(engine.driver().verified, vec![false]);
        Ok(())
    }

    #[test]
    fn test_purge_drops_only_lower_slots() -> Result<()> {
        let mut engine = solo(7)?;
        for slot in 1..=5 {
            engine.nominate(slot, 100 + slot, false)?;
        }
        assert_eq!(engine.known_slots_count(), 5);
        let statements = engine.cumulative_statement_count();

        engine.purge_slots(3);
        assert_eq!(engine.known_slots_count(), 3);
        assert!(engine.slot(2).is_none());
        assert_eq!(engine.externalized_value(3), Some(&103));
        assert!(engine.cumulative_statement_count() < statements);
        Ok(())
    }

    #[test]
    fn test_malformed_quorum_set_update_is_rejected() -> eyre::Result<()> {
        let mut engine = solo(8)?;
        let before = engine.local_quorum_set().clone();
        let raw = crypto::encode(&(2u32, vec![engine.local_node_id()], Vec::<QuorumSet>::new()))?;
        let malformed: QuorumSet = crypto::decode(&raw)?;
        assert!(engine.update_local_quorum_set(malformed).is_err());
        assert_eq!(engine.local_quorum_set(), &before);
        Ok(())
    }

    #[test]
    fn test_value_string_is_short_hex() -> Result<()> {
        let engine = solo(9)?;
        let s = engine.value_string(&42)?;
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        Ok(())
    }
}
