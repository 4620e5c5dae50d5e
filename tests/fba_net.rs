use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, VecDeque};
use std::fs::File;
use std::io::Write;
use std::time::Duration;

use log::info;
use rand::prelude::{IteratorRandom, StdRng};
use sn_fba::{
    Driver, Engine, EngineConfig, Envelope, EnvelopeState, NodeId, QuorumSet, Result, Role,
    SlotIndex, Timer, Validator,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: NodeId,
    pub dest: NodeId,
    pub envelope: Envelope<u64>,
}

/// Records everything the engine asks of its environment.
#[derive(Debug, Default)]
pub struct TestDriver {
    pub outbox: Vec<Envelope<u64>>,
    pub emitted: Vec<Envelope<u64>>,
    pub externalized: BTreeMap<SlotIndex, u64>,
    pub timers: BTreeMap<(SlotIndex, Timer), Duration>,
    pub invalid_values: BTreeSet<u64>,
}

impl Driver<u64> for TestDriver {
    fn validate_value(&self, _slot_index: SlotIndex, value: &u64) -> bool {
        !self.invalid_values.contains(value)
    }

    fn combine_candidates(&self, _slot_index: SlotIndex, candidates: &BTreeSet<u64>) -> Option<u64> {
        candidates.iter().max().copied()
    }

    fn emit_envelope(&mut self, envelope: &Envelope<u64>) {
        self.outbox.push(envelope.clone());
        self.emitted.push(envelope.clone());
    }

    fn setup_timer(&mut self, slot_index: SlotIndex, timer: Timer, timeout: Duration) {
        self.timers.insert((slot_index, timer), timeout);
    }

    fn stop_timer(&mut self, slot_index: SlotIndex, timer: Timer) {
        self.timers.remove(&(slot_index, timer));
    }

    fn value_externalized(&mut self, slot_index: SlotIndex, value: &u64) {
        // a slot externalizes at most once
        assert!(self.externalized.insert(slot_index, *value).is_none());
    }
}

pub type Proc = Engine<u64, TestDriver, Validator>;

#[derive(Default, Debug)]
pub struct Net {
    pub procs: Vec<Proc>,
    pub packets: BTreeMap<NodeId, VecDeque<Packet>>,
    pub delivered_packets: Vec<Packet>,
    pub decisions: BTreeMap<SlotIndex, u64>,
    pub nominations: BTreeMap<(NodeId, SlotIndex), u64>,
}

impl Net {
    /// `n` validators sharing one flat quorum set of the given threshold.
    pub fn with_procs(threshold: u32, n: u8, rng: &mut StdRng) -> Self {
        let validators: Vec<Validator> = (0..n).map(|_| Validator::random(&mut *rng)).collect();
        let ids = validators.iter().map(Validator::node_id);
        let quorum_set = QuorumSet::new(threshold, ids, vec![]).unwrap();

        let procs = validators
            .into_iter()
            .map(|v| {
                Engine::validator(
                    v,
                    quorum_set.clone(),
                    TestDriver::default(),
                    EngineConfig::default(),
                )
                .unwrap()
            })
            .collect();
        Self {
            procs,
            ..Default::default()
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.procs.iter().map(Proc::local_node_id).collect()
    }

    pub fn proc(&self, id: NodeId) -> Option<&Proc> {
        self.procs.iter().find(|p| p.local_node_id() == id)
    }

    pub fn proc_mut(&mut self, id: NodeId) -> Option<&mut Proc> {
        self.procs.iter_mut().find(|p| p.local_node_id() == id)
    }

    /// Pick a random node id from the set of procs
    pub fn pick_id(&self, rng: &mut StdRng) -> NodeId {
        self.ids().into_iter().choose(rng).unwrap()
    }

    pub fn nominate(&mut self, id: NodeId, slot_index: SlotIndex, value: u64) -> Result<bool> {
        self.nominations.insert((id, slot_index), value);
        let nominated = self
            .proc_mut(id)
            .unwrap()
            .nominate(slot_index, value, false)?;
        self.flush_outbox(id);
        self.record_decisions(id);
        Ok(nominated)
    }

    pub fn nominate_all(&mut self, slot_index: SlotIndex, value: u64) -> Result<()> {
        for id in self.ids() {
            self.nominate(id, slot_index, value)?;
        }
        Ok(())
    }

    /// Moves whatever `id` emitted since the last flush onto the wire.
    pub fn flush_outbox(&mut self, id: NodeId) {
        let outbox = match self.proc_mut(id) {
            Some(proc) => std::mem::take(&mut proc.driver_mut().outbox),
            None => return,
        };
        for envelope in outbox {
            self.broadcast(id, envelope);
        }
    }

    pub fn broadcast_packets(&self, source: NodeId, envelope: &Envelope<u64>) -> Vec<Packet> {
        self.ids()
            .into_iter()
            .filter(|dest| *dest != source)
            .map(|dest| Packet {
                source,
                dest,
                envelope: envelope.clone(),
            })
            .collect()
    }

    pub fn broadcast(&mut self, source: NodeId, envelope: Envelope<u64>) {
        let packets = self.broadcast_packets(source, &envelope);
        self.enqueue_packets(packets);
    }

    pub fn enqueue_packets(&mut self, packets: impl IntoIterator<Item = Packet>) {
        for packet in packets {
            self.packets
                .entry(packet.source)
                .or_default()
                .push_back(packet);
        }
    }

    pub fn deliver_packet_from_source(&mut self, source: NodeId) -> Result<()> {
        let packet = match self.packets.get_mut(&source).map(|ps| ps.pop_front()) {
            Some(Some(p)) => p,
            _ => return Ok(()), // nothing to do
        };
        self.purge_empty_queues();
        self.deliver(packet)
    }

    /// Delivers queued packets matching `pred`, in queue order, until none
    /// is left. Everything else stays queued.
    pub fn deliver_where(&mut self, pred: impl Fn(&Packet) -> bool) -> Result<()> {
        loop {
            let position = self.packets.iter().find_map(|(source, queue)| {
                queue.iter().position(|p| pred(p)).map(|i| (*source, i))
            });
            let packet = match position {
                Some((source, i)) => self.packets.get_mut(&source).and_then(|q| q.remove(i)),
                None => break,
            };
            self.purge_empty_queues();
            if let Some(packet) = packet {
                self.deliver(packet)?;
            }
        }
        Ok(())
    }

    fn deliver(&mut self, packet: Packet) -> Result<()> {
        self.delivered_packets.push(packet.clone());
        let dest = packet.dest;
        let dest_proc = match self.proc_mut(dest) {
            Some(proc) => proc,
            None => return Ok(()),
        };

        info!("{:?} handling: {:?}", dest, packet.envelope);
        let state = dest_proc.receive_envelope(packet.envelope)?;
        assert_eq!(state, EnvelopeState::Valid);

        self.flush_outbox(dest);
        self.record_decisions(dest);
        Ok(())
    }

    /// Cross-checks what `id` externalized against every other node.
    fn record_decisions(&mut self, id: NodeId) {
        let externalized = match self.proc(id) {
            Some(proc) => proc.driver().externalized.clone(),
            None => return,
        };
        for (slot_index, value) in externalized {
            match self.decisions.entry(slot_index) {
                Entry::Occupied(decided) => assert_eq!(
                    *decided.get(),
                    value,
                    "{:?} disagrees on slot {}",
                    id,
                    slot_index
                ),
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
    }

    pub fn drain_queued_packets(&mut self) -> Result<()> {
        while let Some(source) = self.packets.keys().next().cloned() {
            self.deliver_packet_from_source(source)?;
            self.purge_empty_queues();
        }
        Ok(())
    }

    /// Like [`Net::drain_queued_packets`] but picks the next source at random.
    pub fn drain_shuffled(&mut self, rng: &mut StdRng) -> Result<()> {
        while let Some(source) = self.packets.keys().choose(rng).cloned() {
            self.deliver_packet_from_source(source)?;
        }
        Ok(())
    }

    pub fn purge_empty_queues(&mut self) {
        self.packets = core::mem::take(&mut self.packets)
            .into_iter()
            .filter(|(_, queue)| !queue.is_empty())
            .collect();
    }

    /// Fires every armed timer once. Returns whether any was armed.
    pub fn fire_timers(&mut self) -> Result<bool> {
        let mut fired = false;
        for id in self.ids() {
            let timers = match self.proc_mut(id) {
                Some(proc) => std::mem::take(&mut proc.driver_mut().timers),
                None => continue,
            };
            for (slot_index, timer) in timers.into_keys() {
                fired = true;
                let proc = self.procs.iter_mut().find(|p| p.local_node_id() == id);
                let proc = match proc {
                    Some(proc) => proc,
                    None => continue,
                };
                match timer {
                    Timer::Nomination => {
                        if let Some(value) = self.nominations.get(&(id, slot_index)) {
                            proc.nominate(slot_index, *value, true)?;
                        }
                    }
                    Timer::Ballot => {
                        proc.abandon_ballot(slot_index)?;
                    }
                }
            }
            self.flush_outbox(id);
            self.record_decisions(id);
        }
        Ok(fired)
    }

    /// Alternates draining the network and firing timers until every node
    /// externalized `slot_index` or `max_rounds` timer rounds went by.
    pub fn run_slot(&mut self, slot_index: SlotIndex, max_rounds: usize) -> Result<()> {
        for _ in 0..max_rounds {
            self.drain_queued_packets()?;
            if self.all_externalized(slot_index) || !self.fire_timers()? {
                break;
            }
        }
        Ok(())
    }

    /// [`Net::run_slot`] with packets delivered in a random source order.
    pub fn run_slot_shuffled(
        &mut self,
        slot_index: SlotIndex,
        max_rounds: usize,
        rng: &mut StdRng,
    ) -> Result<()> {
        for _ in 0..max_rounds {
            self.drain_shuffled(rng)?;
            if self.all_externalized(slot_index) || !self.fire_timers()? {
                break;
            }
        }
        Ok(())
    }

    pub fn all_externalized(&self, slot_index: SlotIndex) -> bool {
        self.procs
            .iter()
            .all(|p| p.externalized_value(slot_index).is_some())
    }

    pub fn externalized(&self, slot_index: SlotIndex) -> Vec<Option<u64>> {
        self.procs
            .iter()
            .map(|p| p.externalized_value(slot_index).copied())
            .collect()
    }

    pub fn generate_msc(&self, name: &str) -> eyre::Result<()> {
        // See: http://www.mcternan.me.uk/mscgen/
        let mut msc = String::from(
            "
msc {\n
  hscale = \"2\";\n
",
        );
        let procs = self
            .ids()
            .into_iter()
            .collect::<BTreeSet<_>>() // sort by node id
            .into_iter()
            .map(|id| format!("{:?}", id))
            .collect::<Vec<_>>()
            .join(",");
        msc.push_str(&procs);
        msc.push_str(";\n");
        for packet in self.delivered_packets.iter() {
            msc.push_str(&format!(
                "{:?} -> {:?} [ label=\"{:?}\"];\n",
                packet.source, packet.dest, packet.envelope
            ));
        }
        msc.push_str("}\n");

        let mut msc_file = File::create(name)?;
        msc_file.write_all(msc.as_bytes())?;
        Ok(())
    }
}
