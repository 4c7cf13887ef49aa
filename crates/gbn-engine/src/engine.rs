use std::time::Duration;

use bytes::Bytes;
use gbn_abstract::{EngineConfig, Packet, PacketKind, SeqNum, Substrate};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::RdtError;
use crate::queue::{QueueRx, QueueTx};
use crate::recv::{DataOutcome, RecvState};
use crate::send::{AckOutcome, SendState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetransmitCause {
    Timeout,
    DuplicateAcks,
}

/// The single action taken by one [`Engine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A payload moved from the delivery slot to the application.
    Delivered,
    /// The whole outstanding window went out again.
    Retransmitted { cause: RetransmitCause, packets: u16 },
    /// A retransmission is waiting for the substrate to take the full burst.
    AwaitingBurst(RetransmitCause),
    /// One packet was taken from the substrate and processed.
    Ingested(PacketKind),
    /// A new DATA packet was sent.
    Originated(SeqNum),
    /// Nothing to do.
    Idle,
}

/// Counters kept by an engine over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub data_sent: u64,
    pub retransmitted: u64,
    pub timeout_bursts: u64,
    pub fast_retransmit_bursts: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub duplicate_acks: u64,
    pub stale_acks: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub max_in_flight: u16,
}

/// Go-Back-N engine for one end of a connection.
///
/// All protocol state lives here and is only touched from [`poll`](Self::poll),
/// so it needs no locking. The two application queues are the only things
/// shared with other threads.
pub struct Engine<S> {
    send: SendState,
    recv: RecvState,
    substrate: S,
    inbound: QueueRx<Bytes>,
    outbound: QueueTx<Bytes>,
    pending_burst: Option<RetransmitCause>,
    stats: EngineStats,
}

impl<S: Substrate> Engine<S> {
    /// `inbound` carries payloads from the application, `outbound` carries
    /// delivered payloads back to it.
    pub fn new(
        config: &EngineConfig,
        substrate: S,
        inbound: QueueRx<Bytes>,
        outbound: QueueTx<Bytes>,
    ) -> Result<Self, RdtError> {
        config.validate()?;
        let window = config.window();
        Ok(Self {
            send: SendState::new(window, config.timeout()),
            recv: RecvState::new(window),
            substrate,
            inbound,
            outbound,
            pending_burst: None,
            stats: EngineStats::default(),
        })
    }

    /// Run one iteration of the loop at time `now` (measured from engine start).
    ///
    /// Rules are tried in priority order and the first that applies is the only
    /// action taken:
    /// a waiting retransmission burst, delivery, fast retransmit, ingest,
    /// timeout retransmit, originate.
    pub fn poll(&mut self, now: Duration) -> Result<Step, RdtError> {
        if let Some(cause) = self.pending_burst {
            return Ok(self.retransmit(cause, now));
        }

        if let Some(payload) = self.recv.take_pending() {
            self.outbound.put(payload)?;
            self.stats.delivered += 1;
            return Ok(Step::Delivered);
        }

        if self.send.fast_retransmit_due() {
            return Ok(self.retransmit(RetransmitCause::DuplicateAcks, now));
        }

        if self.substrate.has_incoming()
            && let Some(packet) = self.substrate.receive()
        {
            let kind = packet.kind();
            self.ingest(packet, now);
            return Ok(Step::Ingested(kind));
        }

        if self.send.timed_out(now) && self.substrate.ready_to_send() {
            return Ok(self.retransmit(RetransmitCause::Timeout, now));
        }

        if self.send.has_room()
            && self.substrate.ready_to_send()
            && let Some(payload) = self.inbound.try_take()?
        {
            let packet = self.send.record_sent(payload, now);
            let seq = packet.seq();
            trace!(seq, len = packet.len(), "send data");
            self.substrate.send(packet);
            self.stats.data_sent += 1;
            return Ok(Step::Originated(seq));
        }

        Ok(Step::Idle)
    }

    fn ingest(&mut self, packet: Packet, now: Duration) {
        match packet.kind() {
            PacketKind::Data => {
                let (outcome, ack) = self.recv.on_data(packet);
                if outcome == DataOutcome::Discarded {
                    self.stats.discarded += 1;
                }
                if let Some(ack) = ack {
                    trace!(seq = ack.seq(), "send ack");
                    self.substrate.send(ack);
                    self.stats.acks_sent += 1;
                }
            }
            PacketKind::Ack => {
                self.stats.acks_received += 1;
                match self.send.on_ack(packet.seq(), now) {
                    AckOutcome::Duplicate { .. } => self.stats.duplicate_acks += 1,
                    AckOutcome::Stale => self.stats.stale_acks += 1,
                    AckOutcome::Advanced { .. } => {}
                }
            }
        }
    }

    /// Resend everything from `send_base` to `send_next - 1`, or park until
    /// the substrate can take all of it at once.
    fn retransmit(&mut self, cause: RetransmitCause, now: Duration) -> Step {
        let count = self.send.in_flight();
        if !self.substrate.ready_for_burst(usize::from(count)) {
            if self.pending_burst.is_none() {
                debug!(?cause, count, "retransmission waiting for substrate");
            }
            self.pending_burst = Some(cause);
            return Step::AwaitingBurst(cause);
        }
        self.pending_burst = None;

        for packet in self.send.outstanding() {
            self.substrate.send(packet.clone());
        }
        self.send.on_retransmit(now);

        self.stats.retransmitted += u64::from(count);
        match cause {
            RetransmitCause::Timeout => self.stats.timeout_bursts += 1,
            RetransmitCause::DuplicateAcks => self.stats.fast_retransmit_bursts += 1,
        }
        debug!(
            ?cause,
            count,
            base = self.send.base(),
            "window retransmitted"
        );
        Step::Retransmitted {
            cause,
            packets: count,
        }
    }

    /// Nothing left that a graceful stop has to wait for: no unacknowledged
    /// packets, no queued payloads, no burst in progress, nothing awaiting
    /// delivery.
    pub fn is_drained(&self) -> bool {
        self.send.is_empty()
            && self.pending_burst.is_none()
            && !self.recv.has_pending()
            && !self.inbound.has_data()
    }

    pub fn send_state(&self) -> &SendState {
        &self.send
    }

    pub fn recv_state(&self) -> &RecvState {
        &self.recv
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            max_in_flight: self.send.max_in_flight(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::app_queue;
    use std::collections::VecDeque;

    /// Substrate whose wire is a pair of vectors the test inspects directly.
    #[derive(Default)]
    struct Loopback {
        incoming: VecDeque<Packet>,
        sent: Vec<Packet>,
        burst_limit: usize,
        busy: bool,
    }

    impl Substrate for Loopback {
        fn has_incoming(&mut self) -> bool {
            !self.incoming.is_empty()
        }

        fn receive(&mut self) -> Option<Packet> {
            self.incoming.pop_front()
        }

        fn send(&mut self, packet: Packet) {
            self.sent.push(packet);
        }

        fn ready_to_send(&self) -> bool {
            !self.busy
        }

        fn ready_for_burst(&self, n: usize) -> bool {
            !self.busy && n <= self.burst_limit
        }
    }

    struct Harness {
        engine: Engine<Loopback>,
        app_tx: QueueTx<Bytes>,
        app_rx: QueueRx<Bytes>,
    }

    fn harness(window: u16) -> Harness {
        let config = EngineConfig::new(window, Duration::from_millis(500));
        let (app_tx, inbound) = app_queue("inbound", 64);
        let (outbound, app_rx) = app_queue("outbound", 64);
        let substrate = Loopback {
            burst_limit: 64,
            ..Default::default()
        };
        let engine = Engine::new(&config, substrate, inbound, outbound).unwrap();
        Harness {
            engine,
            app_tx,
            app_rx,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    impl Harness {
        fn queue(&self, n: usize) {
            for i in 0..n {
                self.app_tx.put(Bytes::from(format!("P{i}"))).unwrap();
            }
        }

        fn inject(&mut self, packet: Packet) {
            self.engine.substrate_mut().incoming.push_back(packet);
        }

        fn sent_seqs(&mut self) -> Vec<(PacketKind, SeqNum)> {
            self.engine
                .substrate_mut()
                .sent
                .drain(..)
                .map(|p| (p.kind(), p.seq()))
                .collect()
        }

        fn poll_until_idle(&mut self, now: Duration) -> Vec<Step> {
            let mut steps = Vec::new();
            loop {
                let step = self.engine.poll(now).unwrap();
                if matches!(step, Step::Idle | Step::AwaitingBurst(_)) {
                    steps.push(step);
                    return steps;
                }
                steps.push(step);
            }
        }
    }

    #[test]
    fn single_packet_exchange() {
        let mut h = harness(5);
        h.queue(1);
        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Originated(0));
        assert_eq!(h.engine.send_state().deadline(), Some(ms(500)));

        h.inject(Packet::ack(0));
        assert_eq!(h.engine.poll(ms(30)).unwrap(), Step::Ingested(PacketKind::Ack));
        assert!(h.engine.send_state().is_empty());
        assert_eq!(h.engine.send_state().deadline(), None);
        assert!(h.engine.is_drained());
        assert_eq!(h.engine.poll(ms(31)).unwrap(), Step::Idle);
    }

    #[test]
    fn full_window_blocks_origination() {
        let mut h = harness(5);
        h.queue(6);
        let steps = h.poll_until_idle(ms(0));
        assert_eq!(steps.len(), 6);
        assert_eq!(h.engine.send_state().in_flight(), 5);
        assert!(h.app_tx.len() == 1, "sixth payload still queued");

        h.inject(Packet::ack(0));
        let steps = h.poll_until_idle(ms(10));
        assert_eq!(
            steps,
            vec![
                Step::Ingested(PacketKind::Ack),
                Step::Originated(5),
                Step::Idle
            ]
        );
        assert_eq!(h.engine.stats().max_in_flight, 5);
    }

    #[test]
    fn receiver_delivers_before_ingesting_more() {
        let mut h = harness(4);
        h.inject(Packet::data(0, &b"a"[..]));
        h.inject(Packet::data(1, &b"b"[..]));

        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Ingested(PacketKind::Data));
        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Delivered);
        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Ingested(PacketKind::Data));
        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Delivered);

        assert_eq!(h.app_rx.take().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(h.app_rx.take().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(
            h.sent_seqs(),
            vec![(PacketKind::Ack, 0), (PacketKind::Ack, 1)]
        );
    }

    #[test]
    fn out_of_order_data_is_reacked_not_delivered() {
        let mut h = harness(4);
        h.inject(Packet::data(0, &b"a"[..]));
        h.inject(Packet::data(2, &b"c"[..]));
        h.inject(Packet::data(0, &b"a"[..]));
        h.poll_until_idle(ms(0));

        assert_eq!(h.app_rx.try_take().unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(h.app_rx.try_take().unwrap(), None);
        assert_eq!(
            h.sent_seqs(),
            vec![
                (PacketKind::Ack, 0),
                (PacketKind::Ack, 0),
                (PacketKind::Ack, 0)
            ]
        );
        assert_eq!(h.engine.stats().discarded, 2);
        assert_eq!(h.engine.recv_state().expected(), 1);
    }

    #[test]
    fn third_duplicate_ack_retransmits_before_timeout() {
        let mut h = harness(4);
        h.queue(4);
        h.poll_until_idle(ms(0));
        h.sent_seqs();

        h.inject(Packet::ack(0));
        for _ in 0..3 {
            h.inject(Packet::ack(0));
        }
        let steps = h.poll_until_idle(ms(50));
        assert!(steps.contains(&Step::Retransmitted {
            cause: RetransmitCause::DuplicateAcks,
            packets: 3
        }));
        assert_eq!(
            h.sent_seqs(),
            vec![
                (PacketKind::Data, 1),
                (PacketKind::Data, 2),
                (PacketKind::Data, 3)
            ]
        );
        assert_eq!(h.engine.send_state().deadline(), Some(ms(550)));
        assert_eq!(h.engine.send_state().dup_acks(), 0);
        assert_eq!(h.engine.stats().fast_retransmit_bursts, 1);
        assert_eq!(h.engine.stats().timeout_bursts, 0);
    }

    #[test]
    fn timeout_retransmits_outstanding_window() {
        let mut h = harness(4);
        h.queue(3);
        h.poll_until_idle(ms(0));
        h.sent_seqs();

        assert_eq!(h.engine.poll(ms(500)).unwrap(), Step::Idle);
        assert_eq!(
            h.engine.poll(ms(501)).unwrap(),
            Step::Retransmitted {
                cause: RetransmitCause::Timeout,
                packets: 3
            }
        );
        assert_eq!(
            h.sent_seqs(),
            vec![
                (PacketKind::Data, 0),
                (PacketKind::Data, 1),
                (PacketKind::Data, 2)
            ]
        );
        assert_eq!(h.engine.send_state().deadline(), Some(ms(1001)));
    }

    #[test]
    fn burst_waits_for_substrate_capacity() {
        let mut h = harness(4);
        h.queue(3);
        h.poll_until_idle(ms(0));
        h.sent_seqs();

        h.engine.substrate_mut().burst_limit = 2;
        assert_eq!(
            h.engine.poll(ms(600)).unwrap(),
            Step::AwaitingBurst(RetransmitCause::Timeout)
        );
        // Incoming packets stay untouched while the burst waits.
        h.inject(Packet::ack(2));
        assert_eq!(
            h.engine.poll(ms(601)).unwrap(),
            Step::AwaitingBurst(RetransmitCause::Timeout)
        );
        assert!(h.sent_seqs().is_empty());
        assert!(!h.engine.is_drained());

        h.engine.substrate_mut().burst_limit = 8;
        assert_eq!(
            h.engine.poll(ms(602)).unwrap(),
            Step::Retransmitted {
                cause: RetransmitCause::Timeout,
                packets: 3
            }
        );
        assert_eq!(h.sent_seqs().len(), 3);
        assert_eq!(h.engine.poll(ms(603)).unwrap(), Step::Ingested(PacketKind::Ack));
        assert!(h.engine.send_state().is_empty());
    }

    #[test]
    fn busy_substrate_defers_origination() {
        let mut h = harness(4);
        h.queue(1);
        h.engine.substrate_mut().busy = true;
        assert_eq!(h.engine.poll(ms(0)).unwrap(), Step::Idle);
        h.engine.substrate_mut().busy = false;
        assert_eq!(h.engine.poll(ms(1)).unwrap(), Step::Originated(0));
    }

    #[test]
    fn stale_ack_is_counted_and_ignored() {
        let mut h = harness(4);
        h.queue(2);
        h.poll_until_idle(ms(0));
        h.inject(Packet::ack(1));
        h.inject(Packet::ack(1));
        h.inject(Packet::ack(6));
        h.poll_until_idle(ms(5));
        let stats = h.engine.stats();
        assert_eq!(stats.acks_received, 3);
        assert_eq!(stats.stale_acks, 2);
        assert!(h.engine.send_state().is_empty());
    }

    #[test]
    fn closed_outbound_queue_is_fatal() {
        let Harness {
            mut engine,
            app_tx: _app_tx,
            app_rx,
        } = harness(4);
        drop(app_rx);
        engine
            .substrate_mut()
            .incoming
            .push_back(Packet::data(0, &b"a"[..]));
        assert_eq!(engine.poll(ms(0)).unwrap(), Step::Ingested(PacketKind::Data));
        assert!(matches!(
            engine.poll(ms(0)),
            Err(RdtError::QueueClosed("outbound"))
        ));
    }
}
