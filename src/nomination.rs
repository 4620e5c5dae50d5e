//! Nomination: agreeing on the set of candidate values a slot may ballot on.
//!
//! Every round a node picks its leaders, votes for what they propose and runs
//! federated voting on each value. A value accepted by a quorum becomes a
//! candidate; the driver folds the candidates into one composite which then
//! seeds the ballot protocol.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace};

use crate::crypto::{election_hash, value_hash, ElectionPurpose};
use crate::driver::{Driver, Timer};
use crate::slot::{federated_accept, federated_ratify, SlotContext};
use crate::statement::{Envelope, Pledge};
use crate::{NodeId, Result, Value};

#[derive(Debug)]
pub struct Nomination<V: Value> {
    round: u32,
    votes: BTreeSet<V>,
    accepted: BTreeSet<V>,
    candidates: BTreeSet<V>,
    round_leaders: BTreeSet<NodeId>,
    latest: BTreeMap<NodeId, Envelope<V>>,
    latest_composite: Option<V>,
    pending_composite: Option<V>,
    started: bool,
    stopped: bool,
    last_envelope: Option<Envelope<V>>,
}

impl<V: Value> Default for Nomination<V> {
    fn default() -> Self {
        Self {
            round: 0,
            votes: BTreeSet::new(),
            accepted: BTreeSet::new(),
            candidates: BTreeSet::new(),
            round_leaders: BTreeSet::new(),
            latest: BTreeMap::new(),
            latest_composite: None,
            pending_composite: None,
            started: false,
            stopped: false,
            last_envelope: None,
        }
    }
}

fn nomination_sets<V: Value>(pledge: &Pledge<V>) -> Option<(&BTreeSet<V>, &BTreeSet<V>)> {
    match pledge {
        Pledge::Nominate {
            votes, accepted, ..
        } => Some((votes, accepted)),
        _ => None,
    }
}

/// A nomination replaces an older one from the same sender only by growing:
/// both sets must be supersets and at least one must be strictly larger.
fn is_newer_nomination<V: Value>(
    old: (&BTreeSet<V>, &BTreeSet<V>),
    new: (&BTreeSet<V>, &BTreeSet<V>),
) -> bool {
    let (old_votes, old_accepted) = old;
    let (votes, accepted) = new;
    old_votes.is_subset(votes)
        && old_accepted.is_subset(accepted)
        && (old_votes.len() < votes.len() || old_accepted.len() < accepted.len())
}

impl<V: Value> Nomination<V> {
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn votes(&self) -> &BTreeSet<V> {
        &self.votes
    }

    pub fn accepted(&self) -> &BTreeSet<V> {
        &self.accepted
    }

    pub fn candidates(&self) -> &BTreeSet<V> {
        &self.candidates
    }

    pub fn round_leaders(&self) -> &BTreeSet<NodeId> {
        &self.round_leaders
    }

    pub fn latest_composite(&self) -> Option<&V> {
        self.latest_composite.as_ref()
    }

    /// The composite produced since the last call, if any.
    pub(crate) fn take_pending_composite(&mut self) -> Option<V> {
        self.pending_composite.take()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.started = false;
    }

    pub fn statement_count(&self) -> usize {
        self.latest.len()
    }

    pub fn latest_envelope(&self, node: &NodeId) -> Option<&Envelope<V>> {
        self.latest.get(node)
    }

    /// Our own last emitted nomination.
    pub fn last_envelope(&self) -> Option<&Envelope<V>> {
        self.last_envelope.as_ref()
    }

    fn is_newer(&self, node: &NodeId, pledge: &Pledge<V>) -> bool {
        let new = match nomination_sets(pledge) {
            Some(sets) => sets,
            None => return false,
        };
        match self
            .latest
            .get(node)
            .and_then(|env| nomination_sets(&env.statement.pledge))
        {
            Some(old) => is_newer_nomination(old, new),
            None => true,
        }
    }

    /// Starts or continues nomination of `value`.
    ///
    /// A timed out call moves to the next round; it is ignored before the
    /// first regular call. Returns whether our nomination changed.
    pub fn nominate<D: Driver<V>>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        value: V,
        timed_out: bool,
    ) -> Result<bool> {
        if self.stopped || !self.candidates.is_empty() {
            trace!(
                "[NOM-{}] nomination is over, ignoring {:?}",
                ctx.slot_index,
                value
            );
            return Ok(false);
        }
        if timed_out {
            if !self.started {
                return Ok(false);
            }
            self.round = self.round.saturating_add(1);
        }
        self.started = true;

        self.update_round_leaders(ctx);

        let mut updated = false;
        let local = ctx.node_id;
        if self.round_leaders.contains(&local)
            && self.votes.is_empty()
            && ctx.driver.validate_value(ctx.slot_index, &value)
        {
            ctx.driver.nominating_value(ctx.slot_index, &value);
            self.votes.insert(value);
            updated = true;
        }

        let leaders: Vec<NodeId> = self
            .round_leaders
            .iter()
            .filter(|leader| **leader != local)
            .copied()
            .collect();
        for leader in leaders {
            let adopted = match self.latest.get(&leader) {
                Some(env) => self.new_value_from_nomination(ctx, &env.statement.pledge)?,
                None => None,
            };
            if let Some(adopted) = adopted {
                ctx.driver.nominating_value(ctx.slot_index, &adopted);
                self.votes.insert(adopted);
                updated = true;
            }
        }

        let timeout = ctx
            .driver
            .compute_timeout(Timer::Nomination, self.round, ctx.config);
        ctx.driver
            .setup_timer(ctx.slot_index, Timer::Nomination, timeout);

        if updated {
            self.emit_nomination(ctx)?;
        } else {
            debug!(
                "[NOM-{}] round {} left our nomination unchanged",
                ctx.slot_index, self.round
            );
        }
        Ok(updated)
    }

    /// Neighborhood membership for the current round. The local node is
    /// always a neighbor of itself.
    fn in_neighborhood<D>(&self, ctx: &SlotContext<'_, D>, node: &NodeId) -> bool {
        if *node == ctx.node_id {
            return true;
        }
        let weight = ctx.quorum_set.node_weight(node);
        if weight == 0 {
            return false;
        }
        (0..=self.round).any(|k| {
            let growth = ctx.config.neighborhood_growth.saturating_mul(k as u64);
            let threshold = weight.saturating_mul(growth.saturating_add(1));
            election_hash(ctx.slot_index, ElectionPurpose::Neighborhood, k, node) <= threshold
        })
    }

    fn update_round_leaders<D>(&mut self, ctx: &SlotContext<'_, D>) {
        let mut members = ctx.quorum_set.nodes();
        members.insert(ctx.node_id);

        let leader = members
            .into_iter()
            .filter(|node| self.in_neighborhood(ctx, node))
            .max_by_key(|node| {
                (
                    election_hash(ctx.slot_index, ElectionPurpose::Priority, self.round, node),
                    *node,
                )
            });

        if let Some(leader) = leader {
            if self.round_leaders.insert(leader) {
                debug!(
                    "[NOM-{}] round {} leader {:?}",
                    ctx.slot_index, self.round, leader
                );
            }
        }
    }

    /// The best valid value a leader offers that we have not voted for yet.
    /// Accepted values are preferred; votes are only looked at when none of
    /// the accepted values is valid.
    fn new_value_from_nomination<D: Driver<V>>(
        &self,
        ctx: &SlotContext<'_, D>,
        pledge: &Pledge<V>,
    ) -> Result<Option<V>> {
        let (votes, accepted) = match nomination_sets(pledge) {
            Some(sets) => sets,
            None => return Ok(None),
        };

        let mut best: Option<(u64, &V)> = None;
        let mut found_valid = false;
        for group in [accepted, votes] {
            if found_valid {
                break;
            }
            for value in group.iter() {
                if !ctx.driver.validate_value(ctx.slot_index, value) {
                    continue;
                }
                found_valid = true;
                if self.votes.contains(value) {
                    continue;
                }
                let rank = value_hash(ctx.slot_index, self.round, value)?;
                if best.map_or(true, |(best_rank, _)| rank >= best_rank) {
                    best = Some((rank, value));
                }
            }
        }
        Ok(best.map(|(_, value)| value.clone()))
    }

    pub fn process_envelope<D: Driver<V>>(
        &mut self,
        envelope: &Envelope<V>,
        ctx: &mut SlotContext<'_, D>,
    ) -> Result<()> {
        let statement = &envelope.statement;
        let sender = statement.node_id;

        if !self.is_newer(&sender, &statement.pledge) {
            trace!(
                "[NOM-{}] stale nomination from {:?}",
                ctx.slot_index,
                sender
            );
            return Ok(());
        }
        if !statement.pledge.is_sane(sender == ctx.node_id) {
            debug!(
                "[NOM-{}] insane nomination from {:?}: {:?}",
                ctx.slot_index, sender, statement.pledge
            );
            return Ok(());
        }

        self.latest.insert(sender, envelope.clone());

        if !self.started || self.stopped {
            return Ok(());
        }

        let to_check: BTreeSet<V> = match nomination_sets(&statement.pledge) {
            Some((votes, accepted)) => votes.union(accepted).cloned().collect(),
            None => BTreeSet::new(),
        };
        let (mut modified, new_candidates) = self.attempt_promote(ctx, &to_check);

        if self.candidates.is_empty() && self.round_leaders.contains(&sender) {
            if let Some(adopted) = self.new_value_from_nomination(ctx, &statement.pledge)? {
                ctx.driver.nominating_value(ctx.slot_index, &adopted);
                self.votes.insert(adopted);
                modified = true;
            }
        }

        if modified {
            self.emit_nomination(ctx)?;
        }
        if new_candidates {
            self.update_composite(ctx);
        }
        Ok(())
    }

    /// Runs federated voting on `values` and on everything already accepted.
    /// Returns `(modified, new_candidates)`.
    fn attempt_promote<D: Driver<V>>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        values: &BTreeSet<V>,
    ) -> (bool, bool) {
        let mut modified = false;
        for value in values.iter() {
            if self.accepted.contains(value) {
                continue;
            }
            let accept = federated_accept(
                ctx.quorum_set,
                &self.latest,
                |st| nomination_sets(&st.pledge).map_or(false, |(v, _)| v.contains(value)),
                |st| nomination_sets(&st.pledge).map_or(false, |(_, a)| a.contains(value)),
            );
            if accept && ctx.driver.validate_value(ctx.slot_index, value) {
                trace!("[NOM-{}] accepted {:?}", ctx.slot_index, value);
                self.votes.insert(value.clone());
                self.accepted.insert(value.clone());
                modified = true;
            }
        }

        let mut new_candidates = false;
        let pending: Vec<V> = self
            .accepted
            .difference(&self.candidates)
            .cloned()
            .collect();
        for value in pending {
            let ratified = federated_ratify(ctx.quorum_set, &self.latest, |st| {
                nomination_sets(&st.pledge).map_or(false, |(_, a)| a.contains(&value))
            });
            if ratified {
                info!("[NOM-{}] new candidate {:?}", ctx.slot_index, value);
                self.candidates.insert(value);
                new_candidates = true;
                ctx.driver.stop_timer(ctx.slot_index, Timer::Nomination);
            }
        }
        (modified, new_candidates)
    }

    fn update_composite<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) {
        let composite = match ctx
            .driver
            .combine_candidates(ctx.slot_index, &self.candidates)
        {
            Some(composite) => composite,
            None => return,
        };
        if self.latest_composite.as_ref() != Some(&composite) {
            ctx.driver.updated_candidate_value(ctx.slot_index, &composite);
            self.latest_composite = Some(composite.clone());
            self.pending_composite = Some(composite);
        }
    }

    /// Signs our current nomination, folds it into our own state and sends
    /// it if it is still the newest one we produced.
    fn emit_nomination<D: Driver<V>>(&mut self, ctx: &mut SlotContext<'_, D>) -> Result<()> {
        let pledge = Pledge::Nominate {
            quorum_set: ctx.quorum_set.clone(),
            votes: self.votes.clone(),
            accepted: self.accepted.clone(),
        };
        let envelope = match ctx.sign(pledge)? {
            Some(envelope) => envelope,
            None => return Ok(()),
        };

        self.process_envelope(&envelope, ctx)?;

        let newer = match self
            .last_envelope
            .as_ref()
            .and_then(|last| nomination_sets(&last.statement.pledge))
        {
            Some(old) => nomination_sets(&envelope.statement.pledge)
                .map_or(false, |new| is_newer_nomination(old, new)),
            None => true,
        };
        if newer {
            trace!("[NOM-{}] emitting {:?}", ctx.slot_index, envelope);
            ctx.driver.emit_envelope(&envelope);
            self.last_envelope = Some(envelope);
        }
        Ok(())
    }
}
