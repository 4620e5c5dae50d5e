//! Hooks into the embedding application.
//!
//! The engine never talks to a network, a clock or a ledger directly. It asks
//! its [`Driver`] to judge values, to ship envelopes and to arm timers, and it
//! reports protocol milestones through the notification methods, which all
//! default to no-ops.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::statement::{Ballot, Envelope};
use crate::{EngineConfig, SlotIndex, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timer {
    Nomination,
    Ballot,
}

/// Outcome of [`crate::Engine::receive_envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Valid,
    Invalid,
}

pub trait Driver<V: Value> {
    fn validate_value(&self, slot_index: SlotIndex, value: &V) -> bool;

    /// Folds the confirmed nomination candidates into one composite value.
    fn combine_candidates(&self, slot_index: SlotIndex, candidates: &BTreeSet<V>) -> Option<V>;

    /// Sends a signed envelope to the peers.
    fn emit_envelope(&mut self, envelope: &Envelope<V>);

    /// Arms `timer` for `slot_index`. When it fires the application calls
    /// `nominate(slot, value, true)` or `abandon_ballot(slot)`.
    fn setup_timer(&mut self, _slot_index: SlotIndex, _timer: Timer, _timeout: Duration) {}

    fn stop_timer(&mut self, _slot_index: SlotIndex, _timer: Timer) {}

    fn compute_timeout(&self, timer: Timer, round: u32, config: &EngineConfig) -> Duration {
        let base = match timer {
            Timer::Nomination => config.nomination_timeout,
            Timer::Ballot => config.ballot_timeout,
        };
        config.timeout(base, round)
    }

    fn value_externalized(&mut self, _slot_index: SlotIndex, _value: &V) {}

    fn nominating_value(&mut self, _slot_index: SlotIndex, _value: &V) {}

    fn updated_candidate_value(&mut self, _slot_index: SlotIndex, _value: &V) {}

    fn started_ballot_protocol(&mut self, _slot_index: SlotIndex, _ballot: &Ballot<V>) {}

    fn accepted_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &Ballot<V>) {}

    fn confirmed_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &Ballot<V>) {}

    fn accepted_commit(&mut self, _slot_index: SlotIndex, _ballot: &Ballot<V>) {}

    fn ballot_did_hear_from_quorum(&mut self, _slot_index: SlotIndex, _ballot: &Ballot<V>) {}

    fn envelope_signed(&mut self) {}

    fn envelope_verified(&mut self, _valid: bool) {}
}
