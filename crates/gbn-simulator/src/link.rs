use std::collections::VecDeque;

use gbn_abstract::{Packet, Substrate};
use tracing::debug;

/// Substrate endpoint of a simulated link.
///
/// Outbound packets wait in a bounded buffer until the simulator moves them
/// onto the wire; inbound packets are placed in the inbox when their latency
/// has elapsed, tagged with their absolute position in the sender's stream.
#[derive(Debug)]
pub struct SimPort {
    inbox: VecDeque<(Packet, u64)>,
    outbox: VecDeque<Packet>,
    capacity: usize,
    overflow: u64,
}

impl SimPort {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbox: VecDeque::new(),
            outbox: VecDeque::with_capacity(capacity),
            capacity,
            overflow: 0,
        }
    }

    /// Packets refused because the outbound buffer was full.
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Nothing waiting in either direction.
    pub fn is_idle(&self) -> bool {
        self.inbox.is_empty() && self.outbox.is_empty()
    }

    pub(crate) fn deliver(&mut self, packet: Packet, stream_pos: u64) {
        self.inbox.push_back((packet, stream_pos));
    }

    /// Next packet the engine will ingest, with its stream position.
    pub(crate) fn front_arrival(&self) -> Option<(&Packet, u64)> {
        self.inbox.front().map(|(packet, pos)| (packet, *pos))
    }

    pub(crate) fn pop_arrival(&mut self) -> Option<Packet> {
        self.inbox.pop_front().map(|(packet, _)| packet)
    }

    /// Hand up to `max` buffered packets to the wire, oldest first.
    pub(crate) fn drain_outbox(&mut self, max: usize) -> Vec<Packet> {
        let n = max.min(self.outbox.len());
        self.outbox.drain(..n).collect()
    }
}

impl Substrate for SimPort {
    fn has_incoming(&mut self) -> bool {
        !self.inbox.is_empty()
    }

    fn receive(&mut self) -> Option<Packet> {
        self.pop_arrival()
    }

    fn send(&mut self, packet: Packet) {
        if self.outbox.len() >= self.capacity {
            debug!(seq = packet.seq(), kind = ?packet.kind(), "port buffer full, packet dropped");
            self.overflow += 1;
            return;
        }
        self.outbox.push_back(packet);
    }

    fn ready_to_send(&self) -> bool {
        self.outbox.len() < self.capacity
    }

    fn ready_for_burst(&self, n: usize) -> bool {
        self.outbox.len() + n <= self.capacity
    }
}
