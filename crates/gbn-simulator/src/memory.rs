use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use gbn_abstract::{Packet, SimConfig, Substrate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// In-process link between two threaded endpoints.
pub struct MemoryLink;

impl MemoryLink {
    /// Create a pair of connected substrates.
    ///
    /// Returns `(a, b)` where packets sent on `a` are received on `b` and vice
    /// versa. Loss and duplication follow `config`; each direction draws from
    /// its own generator so the pair stays reproducible for a given seed.
    /// Latency, capacity and rate are not modelled.
    pub fn pair(config: &SimConfig) -> (MemorySubstrate, MemorySubstrate) {
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();

        (
            MemorySubstrate::new(tx1, rx2, config, config.seed),
            MemorySubstrate::new(tx2, rx1, config, config.seed.wrapping_add(1)),
        )
    }
}

pub struct MemorySubstrate {
    sender: Sender<Packet>,
    receiver: Receiver<Packet>,
    peeked: Option<Packet>,
    rng: StdRng,
    loss_rate: f64,
    duplicate_rate: f64,
    dropped: u64,
}

impl MemorySubstrate {
    fn new(
        sender: Sender<Packet>,
        receiver: Receiver<Packet>,
        config: &SimConfig,
        seed: u64,
    ) -> Self {
        Self {
            sender,
            receiver,
            peeked: None,
            rng: StdRng::seed_from_u64(seed),
            loss_rate: config.loss_rate,
            duplicate_rate: config.duplicate_rate,
            dropped: 0,
        }
    }

    /// Packets this side discarded on send, including those sent to a closed peer.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn push(&mut self, packet: Packet) {
        if self.sender.send(packet).is_err() {
            self.dropped += 1;
        }
    }
}

impl Substrate for MemorySubstrate {
    fn has_incoming(&mut self) -> bool {
        if self.peeked.is_none() {
            match self.receiver.try_recv() {
                Ok(packet) => self.peeked = Some(packet),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
        }
        self.peeked.is_some()
    }

    fn receive(&mut self) -> Option<Packet> {
        self.peeked
            .take()
            .or_else(|| self.receiver.try_recv().ok())
    }

    fn send(&mut self, packet: Packet) {
        if self.rng.random::<f64>() < self.loss_rate {
            trace!(seq = packet.seq(), kind = ?packet.kind(), "memory link dropped packet");
            self.dropped += 1;
            return;
        }
        if self.rng.random::<f64>() < self.duplicate_rate {
            self.push(packet.clone());
        }
        self.push(packet);
    }

    fn ready_to_send(&self) -> bool {
        true
    }

    fn ready_for_burst(&self, _n: usize) -> bool {
        true
    }
}
