use crate::link::SimPort;
use crate::trace::SimulationReport;
use bytes::Bytes;
use gbn_abstract::{EngineConfig, Packet, PacketKind, SeqNum, SimConfig};
use gbn_engine::{Engine, QueueRx, QueueTx, RdtError, SeqSpace, Step, app_queue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on engine actions per node per millisecond, so a tick always ends.
const MAX_STEPS_PER_TICK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeId {
    Sender,
    Receiver,
}

impl NodeId {
    pub fn peer(&self) -> Self {
        match self {
            NodeId::Sender => NodeId::Receiver,
            NodeId::Receiver => NodeId::Sender,
        }
    }
}

#[derive(Debug)]
pub enum EventType {
    PacketArrival {
        to: NodeId,
        packet: Packet,
        /// Absolute index in the stream the packet belongs to: the DATA
        /// sequence of its sender, or the accepted sequence an ACK confirms.
        stream_pos: u64,
    },
    AppSend { node: NodeId, data: Bytes },
}

#[derive(Debug)]
struct Event {
    time: u64,
    event_type: EventType,
    id: u64, // Unique ID to differentiate events at same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for time: smallest time is Greater in BinaryHeap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A compact textual summary of important link-layer events.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

/// One endpoint: an engine plus the application side of its queues.
struct Node {
    engine: Engine<SimPort>,
    app_tx: QueueTx<Bytes>,
    app_rx: QueueRx<Bytes>,
    // Scheduled payloads that did not fit in the application queue yet
    backlog: VecDeque<Bytes>,
    sent: Vec<Bytes>,
    delivered: Vec<Bytes>,

    // Sequence numbers unwrapped off the 2W ring
    space: SeqSpace,
    last_base: SeqNum,
    abs_base: u64,
    last_expected: SeqNum,
    abs_expected: u64,
}

impl Node {
    fn new(engine_config: &EngineConfig, link_capacity: usize) -> Result<Self, RdtError> {
        let (app_tx, inbound) = app_queue("inbound", engine_config.queue_capacity);
        let (outbound, app_rx) = app_queue("outbound", engine_config.queue_capacity);
        let engine = Engine::new(engine_config, SimPort::new(link_capacity), inbound, outbound)?;
        Ok(Self {
            engine,
            app_tx,
            app_rx,
            backlog: VecDeque::new(),
            sent: Vec::new(),
            delivered: Vec::new(),
            space: SeqSpace::for_window(engine_config.window()),
            last_base: 0,
            abs_base: 0,
            last_expected: 0,
            abs_expected: 0,
        })
    }

    /// Follow `send_base` and `expected` around the ring. Neither moves a full
    /// lap within one poll.
    fn sync_positions(&mut self) {
        let base = self.engine.send_state().base();
        self.abs_base += u64::from(self.space.distance(base, self.last_base));
        self.last_base = base;

        let expected = self.engine.recv_state().expected();
        self.abs_expected += u64::from(self.space.distance(expected, self.last_expected));
        self.last_expected = expected;
    }

    /// Stream position of a packet leaving this node.
    fn stream_position(&self, packet: &Packet) -> u64 {
        let (last_seq, last_pos) = match packet.kind() {
            PacketKind::Data => {
                let send = self.engine.send_state();
                let next = self.abs_base + u64::from(send.in_flight());
                (self.space.decrement(send.next()), next.saturating_sub(1))
            }
            PacketKind::Ack => (
                self.space.decrement(self.engine.recv_state().expected()),
                self.abs_expected.saturating_sub(1),
            ),
        };
        last_pos.saturating_sub(u64::from(self.space.distance(last_seq, packet.seq())))
    }

    /// The engine would take this packet for a different one sharing its
    /// sequence number, i.e. it outlived a full lap of the ring.
    fn is_misread(&self, packet: &Packet, stream_pos: u64) -> bool {
        let seq = packet.seq();
        match packet.kind() {
            PacketKind::Data => {
                seq == self.engine.recv_state().expected() && stream_pos != self.abs_expected
            }
            PacketKind::Ack => {
                let send = self.engine.send_state();
                let in_flight = send.in_flight();
                if in_flight > 0 && seq == self.space.decrement(send.base()) {
                    stream_pos + 1 != self.abs_base
                } else if self.space.contains(seq, send.base(), in_flight) {
                    stream_pos != self.abs_base + u64::from(self.space.distance(seq, send.base()))
                } else {
                    false
                }
            }
        }
    }

    /// Drop the next inbound packet if it has outlived its sequence number.
    fn expire_front(&mut self) -> Option<Packet> {
        let expired = self
            .engine
            .substrate()
            .front_arrival()
            .is_some_and(|(packet, pos)| self.is_misread(packet, pos));
        if expired {
            self.engine.substrate_mut().pop_arrival()
        } else {
            None
        }
    }

    fn feed_backlog(&mut self) -> Result<(), RdtError> {
        while self.app_tx.has_capacity() {
            let Some(data) = self.backlog.pop_front() else {
                break;
            };
            self.sent.push(data.clone());
            self.app_tx.put(data)?;
        }
        Ok(())
    }

    fn collect_delivered(&mut self) -> Result<(), RdtError> {
        while let Some(data) = self.app_rx.try_take()? {
            self.delivered.push(data);
        }
        Ok(())
    }

    fn is_quiescent(&self) -> bool {
        self.backlog.is_empty() && self.engine.is_drained() && self.engine.substrate().is_idle()
    }
}

/// Deterministic, virtual-time harness for two engines.
///
/// Time advances in 1 ms ticks. Within a tick each engine is polled until it
/// idles, then each port's outbound buffer is drained onto its link, where
/// loss, duplication and latency are applied. Runs are reproducible for a
/// given `SimConfig::seed`.
pub struct Simulator {
    time: u64,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    config: SimConfig,
    engine_config: EngineConfig,
    rng: StdRng,

    sender: Node,
    receiver: Node,

    /// DATA packets the Sender put on the wire, retransmissions included.
    pub sender_packet_count: u32,

    // Deterministic fault injection: drop first DATA from Sender with given seq numbers
    drop_data_once: Vec<u16>,
    // Deterministic fault injection: drop first ACK from Receiver with given seq numbers
    drop_ack_once: Vec<u16>,

    /// Packets discarded because they arrived after their sequence number
    /// had been reused.
    pub expired_count: u32,

    /// Timeline of link events (drops, duplicates, sends, deliveries).
    pub link_events: Vec<LinkEventSummary>,
}

impl Simulator {
    pub fn new(config: SimConfig, engine_config: EngineConfig) -> Result<Self, RdtError> {
        engine_config.validate()?;
        config
            .validate(engine_config.window())
            .map_err(RdtError::Config)?;
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            sender: Node::new(&engine_config, config.link_capacity)?,
            receiver: Node::new(&engine_config, config.link_capacity)?,
            config,
            engine_config,
            rng,
            sender_packet_count: 0,
            drop_data_once: Vec::new(),
            drop_ack_once: Vec::new(),
            expired_count: 0,
            link_events: Vec::new(),
        })
    }

    /// Register a deterministic fault: drop the first DATA packet sent by Sender whose seq equals `seq`.
    pub fn add_drop_data_once(&mut self, seq: u16) {
        self.drop_data_once.push(seq);
    }

    /// Register a deterministic fault: drop the first ACK sent by Receiver whose seq equals `seq`.
    pub fn add_drop_ack_once(&mut self, seq: u16) {
        self.drop_ack_once.push(seq);
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    pub fn engine(&self, node: NodeId) -> &Engine<SimPort> {
        &self.node(node).engine
    }

    /// Payloads handed to `node`'s engine so far, in order.
    pub fn sent(&self, node: NodeId) -> &[Bytes] {
        &self.node(node).sent
    }

    /// Payloads `node`'s engine delivered to its application, in order.
    pub fn delivered(&self, node: NodeId) -> &[Bytes] {
        &self.node(node).delivered
    }

    fn node(&self, node: NodeId) -> &Node {
        match node {
            NodeId::Sender => &self.sender,
            NodeId::Receiver => &self.receiver,
        }
    }

    fn node_mut(&mut self, node: NodeId) -> &mut Node {
        match node {
            NodeId::Sender => &mut self.sender,
            NodeId::Receiver => &mut self.receiver,
        }
    }

    fn push_event(&mut self, time: u64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    /// Schedule the Sender's application to hand `data` to its engine at `time` ms.
    pub fn schedule_app_send(&mut self, time: u64, data: impl Into<Bytes>) {
        self.schedule_app_send_from(NodeId::Sender, time, data);
    }

    pub fn schedule_app_send_from(&mut self, node: NodeId, time: u64, data: impl Into<Bytes>) {
        self.push_event(
            time,
            EventType::AppSend {
                node,
                data: data.into(),
            },
        );
    }

    pub fn peek_next_event_time(&self) -> Option<u64> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn current_time(&self) -> u64 {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Nothing scheduled, nothing on the wire, both engines drained.
    pub fn is_quiescent(&self) -> bool {
        self.event_queue.is_empty() && self.sender.is_quiescent() && self.receiver.is_quiescent()
    }

    /// Advance one millisecond. Returns false once the simulation is quiescent.
    pub fn step(&mut self) -> Result<bool, RdtError> {
        if self.is_quiescent() {
            return Ok(false);
        }

        self.release_due_events()?;
        self.run_node(NodeId::Sender)?;
        self.run_node(NodeId::Receiver)?;
        self.transmit(NodeId::Sender);
        self.transmit(NodeId::Receiver);

        self.time += 1;
        Ok(true)
    }

    /// Run until quiescent. Never returns on a link that loses everything;
    /// use [`Simulator::run_for`] when the outcome is not known to finish.
    pub fn run_until_complete(&mut self) -> Result<(), RdtError> {
        while self.step()? {}
        info!(
            time = self.time,
            packets = self.sender_packet_count,
            "simulation complete"
        );
        Ok(())
    }

    /// Run until quiescent or until `limit_ms` of simulated time have passed.
    /// Returns whether the run completed.
    pub fn run_for(&mut self, limit_ms: u64) -> Result<bool, RdtError> {
        while self.time <= limit_ms {
            if !self.step()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn release_due_events(&mut self) -> Result<(), RdtError> {
        while self
            .event_queue
            .peek()
            .is_some_and(|event| event.time <= self.time)
        {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            match event.event_type {
                EventType::PacketArrival {
                    to,
                    packet,
                    stream_pos,
                } => {
                    self.node_mut(to)
                        .engine
                        .substrate_mut()
                        .deliver(packet, stream_pos);
                }
                EventType::AppSend { node, data } => {
                    self.node_mut(node).backlog.push_back(data);
                }
            }
        }
        self.sender.feed_backlog()?;
        self.receiver.feed_backlog()
    }

    fn run_node(&mut self, id: NodeId) -> Result<(), RdtError> {
        let time = self.time;
        let now = Duration::from_millis(time);
        let node = match id {
            NodeId::Sender => &mut self.sender,
            NodeId::Receiver => &mut self.receiver,
        };
        let link_events = &mut self.link_events;
        let expired_count = &mut self.expired_count;
        for _ in 0..MAX_STEPS_PER_TICK {
            // Maximum packet lifetime: nothing survives the reuse of its sequence number
            while let Some(packet) = node.expire_front() {
                *expired_count += 1;
                link_events.push(LinkEventSummary {
                    time,
                    description: format!(
                        "[{:?}->{:?}] EXPIRED {:?} seq={}",
                        id.peer(),
                        id,
                        packet.kind(),
                        packet.seq()
                    ),
                });
                debug!(?id, seq = packet.seq(), "packet outlived its sequence number");
            }
            let step = node.engine.poll(now)?;
            node.sync_positions();
            node.collect_delivered()?;
            match step {
                Step::Idle | Step::AwaitingBurst(_) => break,
                Step::Retransmitted { cause, packets } => {
                    debug!(?id, ?cause, packets, "retransmission burst");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn transmit(&mut self, source_node: NodeId) {
        let rate = self.config.link_rate;
        let outgoing = self
            .node_mut(source_node)
            .engine
            .substrate_mut()
            .drain_outbox(rate);
        let target_node = source_node.peer();

        for packet in outgoing {
            let seq = packet.seq();
            let kind = packet.kind();
            let stream_pos = self.node(source_node).stream_position(&packet);

            if source_node == NodeId::Sender && kind == PacketKind::Data {
                self.sender_packet_count += 1;

                // Deterministic GBN tests: optionally drop first DATA with given seq
                if let Some(pos) = self.drop_data_once.iter().position(|s| *s == seq) {
                    self.drop_data_once.remove(pos);
                    self.record(format!("[Sender->Receiver] DROP (deterministic) data seq={seq}"));
                    debug!("Deterministically dropping data seq={}", seq);
                    continue;
                }
            }

            if source_node == NodeId::Receiver
                && kind == PacketKind::Ack
                && let Some(pos) = self.drop_ack_once.iter().position(|s| *s == seq)
            {
                self.drop_ack_once.remove(pos);
                self.record(format!("[Receiver->Sender] DROP (deterministic) ack seq={seq}"));
                debug!("Deterministically dropping ack seq={}", seq);
                continue;
            }

            // 1. Check Loss
            if self.rng.random::<f64>() < self.config.loss_rate {
                self.record(format!(
                    "[{source_node:?}->{target_node:?}] DROP (random loss) {kind:?} seq={seq}"
                ));
                debug!("Packet lost in channel");
                continue;
            }

            // 2. Check Duplication
            let copies = if self.rng.random::<f64>() < self.config.duplicate_rate {
                self.record(format!(
                    "[{source_node:?}->{target_node:?}] DUPLICATE {kind:?} seq={seq}"
                ));
                2
            } else {
                1
            };

            // 3. Latency per copy; differing latencies reorder packets
            for _ in 0..copies {
                let latency = self
                    .rng
                    .random_range(self.config.min_latency..=self.config.max_latency);
                self.record(format!(
                    "[{source_node:?}->{target_node:?}] SEND {kind:?} seq={seq} (latency={latency}ms)"
                ));
                self.push_event(
                    self.time + latency,
                    EventType::PacketArrival {
                        to: target_node,
                        packet: packet.clone(),
                        stream_pos,
                    },
                );
            }
        }
    }

    fn record(&mut self, description: String) {
        self.link_events.push(LinkEventSummary {
            time: self.time,
            description,
        });
    }

    /// Produce a serializable snapshot of the current simulation state.
    pub fn export_report(&self) -> SimulationReport {
        SimulationReport {
            config: self.config.clone(),
            engine: self.engine_config.clone(),
            duration_ms: self.time,
            sent_data: to_vecs(&self.sender.sent),
            delivered_data: to_vecs(&self.receiver.delivered),
            sender_packet_count: self.sender_packet_count,
            sender_stats: self.sender.engine.stats(),
            receiver_stats: self.receiver.engine.stats(),
            link_events: self.link_events.clone(),
        }
    }
}

fn to_vecs(payloads: &[Bytes]) -> Vec<Vec<u8>> {
    payloads.iter().map(|p| p.to_vec()).collect()
}
