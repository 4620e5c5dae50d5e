//! The ballot protocol: PREPARE → CONFIRM → EXTERNALIZE.
//!
//! Local state follows the usual naming:
//!
//! * `b` the ballot we are working on ([`BallotProtocol::current_ballot`])
//! * `p`, `p'` the two highest incompatible ballots we accepted as prepared
//! * `h` the highest ballot we confirmed as prepared
//! * `c` the lowest ballot we are committing to (or accepted / confirmed the
//!   commit of, depending on the phase)
//! * `z` the value we are locked on once something was confirmed prepared
//!
//! Every statement we fold in, our own included, runs the attempt steps in a
//! fixed order until nothing changes.

use std::collections::{BTreeMap, BTreeSet};

use core::cmp::Ordering;
use log::{debug, info, trace, warn};

use crate::driver::{Driver, Timer};
use crate::quorum::{is_quorum, is_v_blocking};
use crate::slot::{federated_accept, federated_ratify, SlotContext};
use crate::statement::{Ballot, Envelope, Pledge, Statement};
use crate::{Error, NodeId, QuorumSet, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Prepare,
    Confirm,
    Externalize,
}

#[derive(Debug)]
pub struct BallotProtocol<V: Value> {
    phase: Phase,
    current: Option<Ballot<V>>,
    prepared: Option<Ballot<V>>,
    prepared_prime: Option<Ballot<V>>,
    high: Option<Ballot<V>>,
    commit: Option<Ballot<V>>,
    value_override: Option<V>,
    latest_composite: Option<V>,
    heard_from_quorum: bool,
    message_level: u32,
    latest: BTreeMap<NodeId, Envelope<V>>,
    last_envelope: Option<Envelope<V>>,
    last_envelope_emit: Option<Envelope<V>>,
}

impl<V: Value> Default for BallotProtocol<V> {
    fn default() -> Self {
        Self {
            phase: Phase::Prepare,
            current: None,
            prepared: None,
            prepared_prime: None,
            high: None,
            commit: None,
            value_override: None,
            latest_composite: None,
            heard_from_quorum: false,
            message_level: 0,
            latest: BTreeMap::new(),
            last_envelope: None,
            last_envelope_emit: None,
        }
    }
}

/// Does `st` claim that `ballot` is prepared?
fn has_prepared_ballot<V: Value>(ballot: &Ballot<V>, st: &Statement<V>) -> bool {
    match &st.pledge {
        Pledge::Prepare {
            prepared,
            prepared_prime,
            ..
        } => prepared
            .iter()
            .chain(prepared_prime.iter())
            .any(|p| ballot.is_less_and_compatible(p)),
        Pledge::Confirm {
            ballot: b,
            n_prepared,
            ..
        } => ballot.is_less_and_compatible(&b.with_counter(*n_prepared)),
        Pledge::Externalize { commit, .. } => ballot.is_compatible(commit),
        Pledge::Nominate { .. } => false,
    }
}

/// Does `st` accept the commit of `ballot.value` over the whole `interval`?
fn commit_predicate<V: Value>(ballot: &Ballot<V>, interval: (u32, u32), st: &Statement<V>) -> bool {
    match &st.pledge {
        Pledge::Confirm {
            ballot: b,
            n_commit,
            n_h,
            ..
        } => ballot.is_compatible(b) && *n_commit <= interval.0 && interval.1 <= *n_h,
        Pledge::Externalize { commit, .. } => {
            ballot.is_compatible(commit) && commit.counter <= interval.0
        }
        _ => false,
    }
}

/// Widens `[low, high]` downwards over `boundaries`, starting from the
/// highest boundary, for as long as `pred` holds. `(0, 0)` when no interval
/// satisfies `pred`.
fn find_extended_interval(
    boundaries: &BTreeSet<u32>,
    pred: impl Fn((u32, u32)) -> bool,
) -> (u32, u32) {
    let mut candidate = (0, 0);
    for b in boundaries.iter().rev().copied() {
        let cur = if candidate.0 == 0 {
            (b, b)
        } else if b > candidate.1 {
            continue;
        } else {
            (b, candidate.1)
        };
        if pred(cur) {
            candidate = cur;
        } else if candidate.0 != 0 {
            break;
        }
    }
    candidate
}

impl<V: Value> BallotProtocol<V> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_ballot(&self) -> Option<&Ballot<V>> {
        self.current.as_ref()
    }

    pub fn prepared(&self) -> Option<&Ballot<V>> {
        self.prepared.as_ref()
    }

    pub fn prepared_prime(&self) -> Option<&Ballot<V>> {
        self.prepared_prime.as_ref()
    }

    pub fn high_ballot(&self) -> Option<&Ballot<V>> {
        self.high.as_ref()
    }

    pub fn commit(&self) -> Option<&Ballot<V>> {
        self.commit.as_ref()
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    pub fn statement_count(&self) -> usize {
        self.latest.len()
    }

    pub fn latest_envelope(&self, node: &NodeId) -> Option<&Envelope<V>> {
        self.latest.get(node)
    }

    pub fn last_envelope(&self) -> Option<&Envelope<V>> {
        self.last_envelope.as_ref()
    }

    pub fn externalized_value(&self) -> Option<&V> {
        match self.phase {
            Phase::Externalize => self.commit.as_ref().map(|c| &c.value),
            _ => None,
        }
    }

    /// Folds a ballot statement into the slot. Returns whether it was kept.
    pub fn process_envelope<D: Driver<V>>(
        &mut self,
        envelope: &Envelope<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let statement = &envelope.statement;
        let sender = statement.node_id;

        if !statement.pledge.is_ballot_pledge() {
            return Ok(false);
        }
        if !statement.pledge.is_sane(sender == ctx.node_id) {
            debug!(
                "[BAL-{}] insane statement from {:?}: {:?}",
                ctx.slot_index, sender, statement.pledge
            );
            return Ok(false);
        }
        if let Some(old) = self.latest.get(&sender) {
            if !statement.pledge.supersedes(&old.statement.pledge) {
                trace!("[BAL-{}] stale statement from {:?}", ctx.slot_index, sender);
                return Ok(false);
            }
        }
        let invalid = statement
            .pledge
            .values()
            .into_iter()
            .any(|value| !ctx.driver.validate_value(ctx.slot_index, value));
        if invalid {
            debug!(
                "[BAL-{}] statement from {:?} carries an invalid value",
                ctx.slot_index, sender
            );
            return Ok(false);
        }

        if self.phase != Phase::Externalize {
            self.latest.insert(sender, envelope.clone());
            self.advance_slot(statement, ctx)?;
            return Ok(true);
        }

        // once externalized only statements that agree with us are kept
        let agrees = match (statement.pledge.working_ballot(), &self.commit) {
            (Some(working), Some(commit)) => working.is_compatible(commit),
            _ => false,
        };
        if agrees {
            self.latest.insert(sender, envelope.clone());
        }
        Ok(agrees)
    }

    fn advance_slot<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<()> {
        self.message_level += 1;
        if self.message_level >= ctx.config.max_advance_depth {
            self.message_level -= 1;
            return Err(Error::AdvanceRecursion {
                slot_index: ctx.slot_index,
                depth: ctx.config.max_advance_depth,
            });
        }

        let did_work = self.attempt_advance(hint, ctx);
        self.message_level -= 1;

        if did_work? {
            self.send_latest_envelope(ctx);
        }
        Ok(())
    }

    fn attempt_advance<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let mut did_work = self.attempt_prepared_accept(hint, ctx)?;
        did_work = self.attempt_prepared_confirmed(hint, ctx)? || did_work;
        did_work = self.attempt_accept_commit(hint, ctx)? || did_work;
        did_work = self.attempt_confirm_commit(hint, ctx)? || did_work;

        // only the outermost call bumps, so the counter moves once per
        // incoming statement
        if self.message_level == 1 {
            loop {
                let bumped = self.attempt_bump(ctx)?;
                did_work = bumped || did_work;
                if !bumped {
                    break;
                }
            }
            self.check_heard_from_quorum(ctx);
        }
        Ok(did_work)
    }

    /// Ballots worth testing for "prepared", given what `hint` talks about.
    fn prepare_candidates(&self, hint: &Statement<V>) -> BTreeSet<Ballot<V>> {
        let mut hints = BTreeSet::new();
        match &hint.pledge {
            Pledge::Prepare {
                ballot,
                prepared,
                prepared_prime,
                ..
            } => {
                hints.insert(ballot.clone());
                hints.extend(prepared.iter().cloned());
                hints.extend(prepared_prime.iter().cloned());
            }
            Pledge::Confirm {
                ballot, n_prepared, ..
            } => {
                hints.insert(ballot.with_counter(*n_prepared));
                hints.insert(ballot.with_counter(u32::MAX));
            }
            Pledge::Externalize { commit, .. } => {
                hints.insert(commit.with_counter(u32::MAX));
            }
            Pledge::Nominate { .. } => (),
        }

        let mut candidates = BTreeSet::new();
        for top in hints.iter().rev() {
            for env in self.latest.values() {
                match &env.statement.pledge {
                    Pledge::Prepare {
                        ballot,
                        prepared,
                        prepared_prime,
                        ..
                    } => {
                        let below_top = std::iter::once(ballot)
                            .chain(prepared.iter())
                            .chain(prepared_prime.iter())
                            .filter(|b| b.is_less_and_compatible(top));
                        candidates.extend(below_top.cloned());
                    }
                    Pledge::Confirm {
                        ballot, n_prepared, ..
                    } => {
                        if top.is_compatible(ballot) {
                            candidates.insert(top.clone());
                            if *n_prepared < top.counter {
                                candidates.insert(top.with_counter(*n_prepared));
                            }
                        }
                    }
                    Pledge::Externalize { commit, .. } => {
                        if top.is_compatible(commit) {
                            candidates.insert(top.clone());
                        }
                    }
                    Pledge::Nominate { .. } => (),
                }
            }
        }
        candidates
    }

    fn attempt_prepared_accept<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if self.phase == Phase::Externalize {
            return Ok(false);
        }
        let quorum_set = ctx.quorum_set;
        let candidates = self.prepare_candidates(hint);

        for ballot in candidates.iter().rev() {
            if self.phase == Phase::Confirm {
                // in CONFIRM only a higher compatible p is of interest
                let raises_p = self
                    .prepared
                    .as_ref()
                    .map_or(false, |p| p.is_less_and_compatible(ballot));
                if !raises_p {
                    continue;
                }
            }
            // at or below p' this can neither become p nor p'
            if self.prepared_prime.as_ref().map_or(false, |pp| ballot <= pp) {
                continue;
            }
            if self
                .prepared
                .as_ref()
                .map_or(false, |p| ballot.is_less_and_compatible(p))
            {
                continue;
            }

            let accepted = federated_accept(
                quorum_set,
                &self.latest,
                |st| match &st.pledge {
                    Pledge::Prepare { ballot: b, .. } => ballot.is_less_and_compatible(b),
                    Pledge::Confirm { ballot: b, .. } => ballot.is_compatible(b),
                    Pledge::Externalize { commit, .. } => ballot.is_compatible(commit),
                    Pledge::Nominate { .. } => false,
                },
                |st| has_prepared_ballot(ballot, st),
            );
            if accepted {
                return self.set_prepared_accept(ballot.clone(), ctx);
            }
        }
        Ok(false)
    }

    fn set_prepared_accept<D: Driver<V>>(
        &mut self,
        ballot: Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let mut did_work = self.set_prepared(&ballot);

        // a commit that got overtaken by an incompatible prepared ballot is void
        if self.commit.is_some() {
            if let Some(high) = &self.high {
                let aborted = self
                    .prepared
                    .iter()
                    .chain(self.prepared_prime.iter())
                    .any(|p| high.is_less_and_incompatible(p));
                if aborted {
                    debug_assert_eq!(self.phase, Phase::Prepare);
                    self.commit = None;
                    did_work = true;
                }
            }
        }

        if did_work {
            trace!("[BAL-{}] accepted prepared {:?}", ctx.slot_index, ballot);
            ctx.driver.accepted_ballot_prepared(ctx.slot_index, &ballot);
            self.emit_current_state(ctx)?;
        }
        Ok(did_work)
    }

    /// Raises `p` (pushing the old one into `p'` when incompatible) or `p'`.
    fn set_prepared(&mut self, ballot: &Ballot<V>) -> bool {
        if self.prepared.is_none() {
            self.prepared = Some(ballot.clone());
            return true;
        }
        let prepared = match &self.prepared {
            Some(prepared) => prepared,
            None => return false,
        };
        match prepared.cmp(ballot) {
            Ordering::Less => {
                if !prepared.is_compatible(ballot) {
                    self.prepared_prime = self.prepared.take();
                }
                self.prepared = Some(ballot.clone());
                true
            }
            Ordering::Greater => {
                let raises_prime = match &self.prepared_prime {
                    None => true,
                    Some(pp) => pp < ballot && !prepared.is_compatible(ballot),
                };
                if raises_prime {
                    self.prepared_prime = Some(ballot.clone());
                }
                raises_prime
            }
            Ordering::Equal => false,
        }
    }

    fn ratified_prepared(&self, ballot: &Ballot<V>, quorum_set: &QuorumSet) -> bool {
        federated_ratify(quorum_set, &self.latest, |st| has_prepared_ballot(ballot, st))
    }

    fn attempt_prepared_confirmed<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if self.phase != Phase::Prepare || self.prepared.is_none() {
            return Ok(false);
        }
        let quorum_set = ctx.quorum_set;
        let candidates: Vec<Ballot<V>> = self.prepare_candidates(hint).into_iter().rev().collect();

        // highest ballot confirmed prepared that would raise h
        let mut found = None;
        for (i, ballot) in candidates.iter().enumerate() {
            if self.high.as_ref().map_or(false, |h| h >= ballot) {
                break;
            }
            if self.ratified_prepared(ballot, quorum_set) {
                found = Some(i);
                break;
            }
        }
        let h_index = match found {
            Some(i) => i,
            None => return Ok(false),
        };
        let new_h = candidates[h_index].clone();

        // lowest ballot at or above b, compatible with h and confirmed
        // prepared all the way up, becomes c
        let mut new_c = None;
        let blocked_by = |b: &Option<Ballot<V>>| {
            b.as_ref()
                .map_or(false, |b| new_h.is_less_and_incompatible(b))
        };
        if self.commit.is_none() && !blocked_by(&self.prepared) && !blocked_by(&self.prepared_prime) {
            for ballot in candidates[h_index..].iter() {
                if self.current.as_ref().map_or(false, |b| ballot < b) {
                    break;
                }
                if !ballot.is_less_and_compatible(&new_h) {
                    continue;
                }
                if self.ratified_prepared(ballot, quorum_set) {
                    new_c = Some(ballot.clone());
                } else {
                    break;
                }
            }
        }
        self.set_prepared_confirmed(new_c, new_h, ctx)
    }

    fn set_prepared_confirmed<D: Driver<V>>(
        &mut self,
        new_c: Option<Ballot<V>>,
        new_h: Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        self.value_override = Some(new_h.value.clone());

        let mut did_work = false;
        let on_h = self
            .current
            .as_ref()
            .map_or(true, |b| b.is_compatible(&new_h));
        if on_h {
            if self.high.as_ref().map_or(true, |h| new_h > *h) {
                self.high = Some(new_h.clone());
                did_work = true;
            }
            if let Some(c) = new_c {
                debug_assert!(self.commit.is_none());
                self.commit = Some(c);
                did_work = true;
            }
            // only reported once h or c actually moved
            if did_work {
                ctx.driver.confirmed_ballot_prepared(ctx.slot_index, &new_h);
            }
        }

        did_work = self.update_current_if_needed(&new_h, ctx) || did_work;
        if did_work {
            trace!(
                "[BAL-{}] confirmed prepared, h={:?} c={:?}",
                ctx.slot_index,
                self.high,
                self.commit
            );
            self.emit_current_state(ctx)?;
        }
        Ok(did_work)
    }

    /// Counters at which some peer bounds a commit of `ballot.value`.
    fn commit_boundaries(&self, ballot: &Ballot<V>) -> BTreeSet<u32> {
        let mut boundaries = BTreeSet::new();
        for env in self.latest.values() {
            match &env.statement.pledge {
                Pledge::Prepare {
                    ballot: b,
                    n_c,
                    n_h,
                    ..
                } => {
                    if ballot.is_compatible(b) && *n_c != 0 {
                        boundaries.insert(*n_c);
                        boundaries.insert(*n_h);
                    }
                }
                Pledge::Confirm {
                    ballot: b,
                    n_commit,
                    n_h,
                    ..
                } => {
                    if ballot.is_compatible(b) {
                        boundaries.insert(*n_commit);
                        boundaries.insert(*n_h);
                    }
                }
                Pledge::Externalize { commit, n_h } => {
                    if ballot.is_compatible(commit) {
                        boundaries.insert(commit.counter);
                        boundaries.insert(*n_h);
                        boundaries.insert(u32::MAX);
                    }
                }
                Pledge::Nominate { .. } => (),
            }
        }
        boundaries
    }

    fn attempt_accept_commit<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if self.phase == Phase::Externalize {
            return Ok(false);
        }
        let ballot = match &hint.pledge {
            Pledge::Prepare {
                ballot, n_c, n_h, ..
            } if *n_c != 0 => ballot.with_counter(*n_h),
            Pledge::Confirm { ballot, n_h, .. } => ballot.with_counter(*n_h),
            Pledge::Externalize { commit, n_h } => commit.with_counter(*n_h),
            _ => return Ok(false),
        };
        if self.phase == Phase::Confirm
            && !self.high.as_ref().map_or(false, |h| ballot.is_compatible(h))
        {
            return Ok(false);
        }

        let boundaries = self.commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return Ok(false);
        }

        let quorum_set = ctx.quorum_set;
        let (low, high) = find_extended_interval(&boundaries, |interval| {
            federated_accept(
                quorum_set,
                &self.latest,
                |st| match &st.pledge {
                    Pledge::Prepare {
                        ballot: b, n_c, n_h, ..
                    } => {
                        ballot.is_compatible(b)
                            && *n_c != 0
                            && *n_c <= interval.0
                            && interval.1 <= *n_h
                    }
                    Pledge::Confirm {
                        ballot: b,
                        n_commit,
                        ..
                    } => ballot.is_compatible(b) && *n_commit <= interval.0,
                    Pledge::Externalize { commit, .. } => {
                        ballot.is_compatible(commit) && commit.counter <= interval.0
                    }
                    Pledge::Nominate { .. } => false,
                },
                |st| commit_predicate(&ballot, interval, st),
            )
        });
        if low == 0 {
            return Ok(false);
        }

        let raises_h = self.phase != Phase::Confirm
            || self.high.as_ref().map_or(true, |h| high > h.counter);
        if !raises_h {
            return Ok(false);
        }
        self.set_accept_commit(ballot.with_counter(low), ballot.with_counter(high), ctx)
    }

    fn set_accept_commit<D: Driver<V>>(
        &mut self,
        c: Ballot<V>,
        h: Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let mut did_work = false;
        self.value_override = Some(h.value.clone());

        if self.high.as_ref() != Some(&h) || self.commit.as_ref() != Some(&c) {
            self.commit = Some(c);
            self.high = Some(h.clone());
            did_work = true;
        }

        if self.phase == Phase::Prepare {
            info!(
                "[BAL-{}] accepted commit {:?}, moving to CONFIRM",
                ctx.slot_index, h
            );
            self.phase = Phase::Confirm;
            let off_h = self
                .current
                .as_ref()
                .map_or(false, |b| !h.is_less_and_compatible(b));
            if off_h {
                self.bump_to_ballot(h.clone(), ctx);
            }
            self.prepared_prime = None;
            did_work = true;
        }

        if did_work {
            self.update_current_if_needed(&h, ctx);
            ctx.driver.accepted_commit(ctx.slot_index, &h);
            self.emit_current_state(ctx)?;
        }
        Ok(did_work)
    }

    fn attempt_confirm_commit<D: Driver<V>>(
        &mut self,
        hint: &Statement<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if self.phase != Phase::Confirm || self.high.is_none() {
            return Ok(false);
        }
        let ballot = match &hint.pledge {
            Pledge::Confirm { ballot, n_h, .. } => ballot.with_counter(*n_h),
            Pledge::Externalize { commit, n_h } => commit.with_counter(*n_h),
            _ => return Ok(false),
        };
        if !self.commit.as_ref().map_or(false, |c| c.is_compatible(&ballot)) {
            return Ok(false);
        }

        let quorum_set = ctx.quorum_set;
        let boundaries = self.commit_boundaries(&ballot);
        let (low, high) = find_extended_interval(&boundaries, |interval| {
            federated_ratify(quorum_set, &self.latest, |st| {
                commit_predicate(&ballot, interval, st)
            })
        });
        if low == 0 {
            return Ok(false);
        }
        self.set_confirm_commit(ballot.with_counter(low), ballot.with_counter(high), ctx)
    }

    fn set_confirm_commit<D: Driver<V>>(
        &mut self,
        c: Ballot<V>,
        h: Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        info!("[BAL-{}] externalizing {:?}", ctx.slot_index, c);
        let value = c.value.clone();
        self.commit = Some(c);
        self.high = Some(h.clone());
        self.update_current_if_needed(&h, ctx);
        self.phase = Phase::Externalize;

        self.emit_current_state(ctx)?;
        ctx.driver.stop_timer(ctx.slot_index, Timer::Ballot);
        ctx.driver.value_externalized(ctx.slot_index, &value);
        Ok(true)
    }

    fn v_blocking_ahead_of(&self, counter: u32, quorum_set: &QuorumSet) -> bool {
        let ahead: BTreeSet<NodeId> = self
            .latest
            .iter()
            .filter(|(_, env)| env.statement.pledge.ballot_counter() > counter)
            .map(|(node, _)| *node)
            .collect();
        is_v_blocking(quorum_set, &ahead)
    }

    /// Catches up with a v-blocking set that moved to higher counters: jump to
    /// the lowest counter that is no longer v-blocking-ahead of us.
    fn attempt_bump<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) -> Result<bool> {
        if self.phase == Phase::Externalize {
            return Ok(false);
        }
        let quorum_set = ctx.quorum_set;
        let local_counter = self.current.as_ref().map_or(0, |b| b.counter);
        if !self.v_blocking_ahead_of(local_counter, quorum_set) {
            return Ok(false);
        }

        let counters: BTreeSet<u32> = self
            .latest
            .values()
            .map(|env| env.statement.pledge.ballot_counter())
            .filter(|counter| *counter > local_counter)
            .collect();
        for counter in counters {
            if !self.v_blocking_ahead_of(counter, quorum_set) {
                debug!(
                    "[BAL-{}] v-blocking set ahead of {}, bumping to {}",
                    ctx.slot_index, local_counter, counter
                );
                return self.abandon_ballot(counter, ctx);
            }
        }
        Ok(false)
    }

    /// Moves to counter `n` (or the next counter when `n` is 0), keeping the
    /// locked value, else the latest composite, else the current value.
    pub fn abandon_ballot<D: Driver<V>>(
        &mut self,
        n: u32,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        let value = self
            .latest_composite
            .clone()
            .or_else(|| self.current.as_ref().map(|b| b.value.clone()));
        match value {
            Some(value) if n == 0 => self.bump_state(value, true, ctx),
            Some(value) => self.bump_state_to(value, n, ctx),
            None => Ok(false),
        }
    }

    /// Feeds a new nomination composite in. Starts the protocol with ballot
    /// `(1, composite)` unless a ballot is already running.
    pub fn update_composite<D: Driver<V>>(
        &mut self,
        composite: V,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        self.latest_composite = Some(composite.clone());
        self.bump_state(composite, false, ctx)
    }

    pub fn bump_state<D: Driver<V>>(
        &mut self,
        value: V,
        force: bool,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if !force && self.current.is_some() {
            return Ok(false);
        }
        let n = self
            .current
            .as_ref()
            .map_or(1, |b| b.counter.saturating_add(1));
        self.bump_state_to(value, n, ctx)
    }

    pub fn bump_state_to<D: Driver<V>>(
        &mut self,
        value: V,
        n: u32,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<bool> {
        if self.phase == Phase::Externalize {
            return Ok(false);
        }
        let value = self.value_override.clone().unwrap_or(value);
        let updated = self.update_current_value(Ballot::new(n, value), ctx);
        if updated {
            self.emit_current_state(ctx)?;
            self.check_heard_from_quorum(ctx);
        }
        Ok(updated)
    }

    fn update_current_value<D: Driver<V>>(
        &mut self,
        ballot: Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if self.phase == Phase::Externalize {
            return false;
        }
        if self
            .commit
            .as_ref()
            .map_or(false, |c| !c.is_compatible(&ballot))
        {
            return false;
        }
        match self.current.as_ref().map(|current| current.cmp(&ballot)) {
            None | Some(Ordering::Less) => {
                self.bump_to_ballot(ballot, ctx);
                true
            }
            Some(Ordering::Equal) => false,
            Some(Ordering::Greater) => {
                warn!(
                    "[BAL-{}] refusing to move back from {:?} to {:?}",
                    ctx.slot_index, self.current, ballot
                );
                false
            }
        }
    }

    fn update_current_if_needed<D: Driver<V>>(
        &mut self,
        h: &Ballot<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if self.current.as_ref().map_or(true, |b| b < h) {
            self.bump_to_ballot(h.clone(), ctx);
            true
        } else {
            false
        }
    }

    fn bump_to_ballot<D: Driver<V>>(&mut self, ballot: Ballot<V>, ctx: &mut SlotContext<'_, D>) {
        debug_assert_ne!(self.phase, Phase::Externalize);
        let got_bumped = self
            .current
            .as_ref()
            .map_or(true, |b| b.counter != ballot.counter);
        if self.current.is_none() {
            info!("[BAL-{}] starting ballot {:?}", ctx.slot_index, ballot);
            ctx.driver.started_ballot_protocol(ctx.slot_index, &ballot);
        }

        // h and c always carry the value of b
        if self.high.as_ref().map_or(false, |h| !h.is_compatible(&ballot)) {
            self.high = None;
            self.commit = None;
        }
        self.current = Some(ballot);
        if got_bumped {
            self.heard_from_quorum = false;
        }
    }

    /// Arms the ballot timer the first time a quorum is on our counter or
    /// beyond, stops it when that quorum is lost or we externalized.
    fn check_heard_from_quorum<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) {
        let current = match &self.current {
            Some(current) => current.clone(),
            None => return,
        };
        let heard = is_quorum(
            ctx.quorum_set,
            self.latest
                .values()
                .filter(|env| match &env.statement.pledge {
                    Pledge::Prepare { ballot, .. } => current.counter <= ballot.counter,
                    _ => true,
                })
                .map(|env| (env.statement.node_id, env.statement.companion_quorum_set())),
        );

        if !heard {
            self.heard_from_quorum = false;
            ctx.driver.stop_timer(ctx.slot_index, Timer::Ballot);
            return;
        }

        let newly_heard = !self.heard_from_quorum;
        self.heard_from_quorum = true;
        if newly_heard {
            ctx.driver
                .ballot_did_hear_from_quorum(ctx.slot_index, &current);
            if self.phase != Phase::Externalize {
                let timeout = ctx
                    .driver
                    .compute_timeout(Timer::Ballot, current.counter, ctx.config);
                ctx.driver.setup_timer(ctx.slot_index, Timer::Ballot, timeout);
            }
        }
        if self.phase == Phase::Externalize {
            ctx.driver.stop_timer(ctx.slot_index, Timer::Ballot);
        }
    }

    fn current_pledge(&self, quorum_set: &QuorumSet) -> Option<Pledge<V>> {
        let ballot = self.current.clone()?;
        let counter = |b: &Option<Ballot<V>>| b.as_ref().map_or(0, |b| b.counter);
        let pledge = match self.phase {
            Phase::Prepare => Pledge::Prepare {
                quorum_set: quorum_set.clone(),
                ballot,
                prepared: self.prepared.clone(),
                prepared_prime: self.prepared_prime.clone(),
                n_c: counter(&self.commit),
                n_h: counter(&self.high),
            },
            Phase::Confirm => Pledge::Confirm {
                quorum_set: quorum_set.clone(),
                ballot,
                n_prepared: counter(&self.prepared),
                n_commit: counter(&self.commit),
                n_h: counter(&self.high),
            },
            Phase::Externalize => Pledge::Externalize {
                commit: self.commit.clone()?,
                n_h: counter(&self.high),
            },
        };
        Some(pledge)
    }

    /// Signs our current state, folds it into our own view and queues it for
    /// sending if it is newer than what we sent last.
    fn emit_current_state<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) -> Result<()> {
        let pledge = match self.current_pledge(ctx.quorum_set) {
            Some(pledge) => pledge,
            None => return Ok(()),
        };
        let unchanged = self
            .latest
            .get(&ctx.node_id)
            .map_or(false, |env| env.statement.pledge == pledge);
        if unchanged {
            return Ok(());
        }
        let envelope = match ctx.sign(pledge)? {
            Some(envelope) => envelope,
            None => return Ok(()),
        };

        if !self.process_envelope(&envelope, ctx)? {
            return Err(Error::SelfStatementRejected {
                slot_index: ctx.slot_index,
            });
        }

        let newer = self.last_envelope.as_ref().map_or(true, |last| {
            envelope.statement.pledge.supersedes(&last.statement.pledge)
        });
        if newer {
            self.last_envelope = Some(envelope);
            self.send_latest_envelope(ctx);
        }
        Ok(())
    }

    /// Sends the last envelope once the outermost advance has finished, so
    /// a cascade of state changes goes out as a single statement.
    fn send_latest_envelope<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) {
        if self.message_level != 0 {
            return;
        }
        if let Some(last) = &self.last_envelope {
            if self.last_envelope_emit.as_ref() != Some(last) {
                trace!("[BAL-{}] emitting {:?}", ctx.slot_index, last);
                ctx.driver.emit_envelope(last);
                self.last_envelope_emit = Some(last.clone());
            }
        }
    }
}
