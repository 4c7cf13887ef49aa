//! Go-Back-N send-side state.
//!
//! [`SendState`] owns the window of unacknowledged packets, the single
//! retransmission deadline and the duplicate-ACK counter. It never touches
//! the substrate; the engine loop decides when to transmit and hands the
//! results of [`SendState::record_sent`] and [`SendState::outstanding`] to it.
//!
//! ```text
//!  send_base          send_next
//!      │                  │
//!  ────┼──────────────────┼──────────────▶ ring of 2W
//!      │ <── in flight ──▶│ <── sendable (until W in flight)
//! ```

use std::time::Duration;

use bytes::Bytes;
use gbn_abstract::{Packet, SeqNum};
use tracing::{debug, trace};

use crate::seq::SeqSpace;

/// Duplicate ACKs of `send_base - 1` that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u8 = 3;

/// What an incoming ACK did to the send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Repeated `send_base - 1`; `count` duplicates seen so far.
    Duplicate { count: u8 },
    /// Cumulative ACK that released `acked` packets.
    Advanced { acked: u16 },
    /// Already acknowledged or never sent.
    Stale,
}

#[derive(Debug)]
pub struct SendState {
    space: SeqSpace,
    window: u16,
    timeout: Duration,
    base: SeqNum,
    next: SeqNum,
    /// Indexed by `seq mod 2W`; only `base..next` is occupied.
    slots: Vec<Option<Packet>>,
    dup_acks: u8,
    deadline: Option<Duration>,
    max_in_flight: u16,
}

impl SendState {
    pub fn new(window: u16, timeout: Duration) -> Self {
        let space = SeqSpace::for_window(window);
        Self {
            space,
            window,
            timeout,
            base: 0,
            next: 0,
            slots: vec![None; usize::from(space.modulus())],
            dup_acks: 0,
            deadline: None,
            max_in_flight: 0,
        }
    }

    pub fn base(&self) -> SeqNum {
        self.base
    }

    pub fn next(&self) -> SeqNum {
        self.next
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn dup_acks(&self) -> u8 {
        self.dup_acks
    }

    /// Packets sent and not yet acknowledged.
    pub fn in_flight(&self) -> u16 {
        self.space.distance(self.next, self.base)
    }

    /// Highest in-flight count ever observed.
    pub fn max_in_flight(&self) -> u16 {
        self.max_in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    /// `true` when another packet may be put in flight.
    pub fn has_room(&self) -> bool {
        self.in_flight() < self.window
    }

    pub fn fast_retransmit_due(&self) -> bool {
        self.dup_acks >= DUP_ACK_THRESHOLD
    }

    pub fn timed_out(&self, now: Duration) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    /// Assign the next sequence number to `payload` and buffer the packet.
    /// The caller transmits the returned packet.
    ///
    /// Check [`has_room`](Self::has_room) first.
    pub fn record_sent(&mut self, payload: Bytes, now: Duration) -> Packet {
        debug_assert!(
            self.has_room(),
            "record_sent on a full window ({} / {})",
            self.in_flight(),
            self.window
        );
        let was_empty = self.is_empty();
        let packet = Packet::data(self.next, payload);
        self.slots[self.space.slot(self.next)] = Some(packet.clone());
        self.next = self.space.increment(self.next);
        self.max_in_flight = self.max_in_flight.max(self.in_flight());
        if was_empty {
            self.deadline = Some(now + self.timeout);
            trace!(deadline = ?self.deadline, "retransmission timer armed");
        }
        packet
    }

    pub fn on_ack(&mut self, seq: SeqNum, now: Duration) -> AckOutcome {
        if !self.space.is_valid(seq) {
            trace!(
                seq,
                modulus = self.space.modulus(),
                "ack outside the sequence ring ignored"
            );
            return AckOutcome::Stale;
        }
        let in_flight = self.in_flight();

        if in_flight > 0 && seq == self.space.decrement(self.base) {
            self.dup_acks = self.dup_acks.saturating_add(1);
            trace!(seq, count = self.dup_acks, "duplicate ack");
            return AckOutcome::Duplicate {
                count: self.dup_acks,
            };
        }

        if !self.space.contains(seq, self.base, in_flight) {
            trace!(seq, base = self.base, next = self.next, "stale ack ignored");
            return AckOutcome::Stale;
        }

        let acked = self.space.distance(seq, self.base) + 1;
        for s in self.space.range(self.base, acked) {
            self.slots[self.space.slot(s)] = None;
        }
        self.base = self.space.increment(seq);
        self.dup_acks = 0;

        if self.base == self.next {
            self.deadline = None;
        } else {
            self.deadline = Some(now + self.timeout);
        }
        debug!(
            seq,
            acked,
            base = self.base,
            in_flight = self.in_flight(),
            "window advanced"
        );
        AckOutcome::Advanced { acked }
    }

    /// Buffered packets from `send_base` to `send_next - 1`, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &Packet> + '_ {
        self.space
            .range(self.base, self.in_flight())
            .filter_map(|s| self.slots[self.space.slot(s)].as_ref())
    }

    /// Bookkeeping after the whole window went out again.
    pub fn on_retransmit(&mut self, now: Duration) {
        self.dup_acks = 0;
        self.deadline = Some(now + self.timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn fill(s: &mut SendState, n: usize, now: Duration) -> Vec<Packet> {
        (0..n)
            .map(|i| s.record_sent(Bytes::from(format!("P{i}")), now))
            .collect()
    }

    #[test]
    fn initial_state() {
        let s = SendState::new(4, TIMEOUT);
        assert_eq!(s.base(), 0);
        assert_eq!(s.next(), 0);
        assert!(s.is_empty());
        assert!(s.has_room());
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn first_send_arms_deadline() {
        let mut s = SendState::new(4, TIMEOUT);
        let p = s.record_sent(Bytes::from_static(b"P0"), ms(10));
        assert_eq!(p.seq(), 0);
        assert_eq!(s.deadline(), Some(ms(510)));

        // Later sends leave the running deadline alone.
        s.record_sent(Bytes::from_static(b"P1"), ms(100));
        assert_eq!(s.deadline(), Some(ms(510)));
        assert_eq!(s.in_flight(), 2);
    }

    #[test]
    fn single_packet_ack_disarms() {
        let mut s = SendState::new(4, TIMEOUT);
        s.record_sent(Bytes::from_static(b"P0"), ms(0));
        assert_eq!(s.on_ack(0, ms(20)), AckOutcome::Advanced { acked: 1 });
        assert!(s.is_empty());
        assert_eq!(s.base(), 1);
        assert_eq!(s.deadline(), None);
        assert_eq!(s.outstanding().count(), 0);
    }

    #[test]
    fn ack_past_the_ring_is_stale() {
        let mut s = SendState::new(5, TIMEOUT);
        fill(&mut s, 5, ms(0));
        s.on_ack(4, ms(5));
        fill(&mut s, 4, ms(10));
        s.on_ack(8, ms(15));
        fill(&mut s, 3, ms(20));
        assert_eq!(s.base(), 9);

        // 10 is one past the ring; read as a distance it would ack 9 and 0.
        assert_eq!(s.on_ack(10, ms(30)), AckOutcome::Stale);
        assert_eq!(s.base(), 9);
        assert_eq!(s.in_flight(), 3);
        let left: Vec<_> = s.outstanding().map(|p| p.seq()).collect();
        assert_eq!(left, vec![9, 0, 1]);
    }

    #[test]
    fn partial_cumulative_ack_rearms() {
        let mut s = SendState::new(4, TIMEOUT);
        fill(&mut s, 3, ms(0));
        assert_eq!(s.on_ack(1, ms(40)), AckOutcome::Advanced { acked: 2 });
        assert_eq!(s.base(), 2);
        assert_eq!(s.in_flight(), 1);
        assert_eq!(s.deadline(), Some(ms(540)));
        let left: Vec<_> = s.outstanding().map(|p| p.seq()).collect();
        assert_eq!(left, vec![2]);
    }

    #[test]
    fn window_full_refuses_more() {
        let mut s = SendState::new(5, TIMEOUT);
        fill(&mut s, 5, ms(0));
        assert!(!s.has_room());
        assert_eq!(s.in_flight(), 5);
        assert_eq!(s.max_in_flight(), 5);

        s.on_ack(0, ms(10));
        assert!(s.has_room());
        let p = s.record_sent(Bytes::from_static(b"P5"), ms(11));
        assert_eq!(p.seq(), 5);
        assert_eq!(s.max_in_flight(), 5);
    }

    #[test]
    fn third_duplicate_makes_fast_retransmit_due() {
        let mut s = SendState::new(4, TIMEOUT);
        fill(&mut s, 4, ms(0));
        s.on_ack(0, ms(10));

        assert_eq!(s.on_ack(0, ms(11)), AckOutcome::Duplicate { count: 1 });
        assert_eq!(s.on_ack(0, ms(12)), AckOutcome::Duplicate { count: 2 });
        assert!(!s.fast_retransmit_due());
        assert_eq!(s.on_ack(0, ms(13)), AckOutcome::Duplicate { count: 3 });
        assert!(s.fast_retransmit_due());

        s.on_retransmit(ms(14));
        assert!(!s.fast_retransmit_due());
        assert_eq!(s.deadline(), Some(ms(514)));
    }

    #[test]
    fn advance_resets_duplicates() {
        let mut s = SendState::new(4, TIMEOUT);
        fill(&mut s, 3, ms(0));
        s.on_ack(0, ms(1));
        s.on_ack(0, ms(2));
        assert_eq!(s.dup_acks(), 1);
        s.on_ack(1, ms(3));
        assert_eq!(s.dup_acks(), 0);
    }

    #[test]
    fn stale_ack_changes_nothing() {
        let mut s = SendState::new(4, TIMEOUT);
        fill(&mut s, 3, ms(0));
        s.on_ack(1, ms(5));
        let before = (s.base(), s.next(), s.deadline(), s.dup_acks());

        // Acknowledged long ago, and never sent.
        assert_eq!(s.on_ack(7, ms(6)), AckOutcome::Stale);
        assert_eq!(s.on_ack(4, ms(6)), AckOutcome::Stale);
        assert_eq!((s.base(), s.next(), s.deadline(), s.dup_acks()), before);
    }

    #[test]
    fn repeated_final_ack_on_empty_window_is_stale() {
        let mut s = SendState::new(4, TIMEOUT);
        fill(&mut s, 2, ms(0));
        s.on_ack(1, ms(5));
        assert!(s.is_empty());
        assert_eq!(s.on_ack(1, ms(6)), AckOutcome::Stale);
        assert_eq!(s.dup_acks(), 0);
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn timeout_is_strictly_after_deadline() {
        let mut s = SendState::new(4, TIMEOUT);
        s.record_sent(Bytes::from_static(b"P0"), ms(0));
        assert!(!s.timed_out(ms(500)));
        assert!(s.timed_out(ms(501)));
    }

    #[test]
    fn window_survives_wraparound() {
        let mut s = SendState::new(3, TIMEOUT);
        let mut now = ms(0);
        for round in 0..5u64 {
            let sent = fill(&mut s, 3, now);
            let last = sent.last().map(|p| p.seq()).unwrap();
            now += ms(10);
            assert_eq!(s.on_ack(last, now), AckOutcome::Advanced { acked: 3 }, "round {round}");
            assert!(s.is_empty());
        }
        // 15 packets on a ring of 6.
        assert_eq!(s.base(), 3);
    }

    #[test]
    fn outstanding_is_in_order_across_wrap() {
        let mut s = SendState::new(3, TIMEOUT);
        fill(&mut s, 3, ms(0));
        s.on_ack(2, ms(1));
        fill(&mut s, 3, ms(2));
        s.on_ack(3, ms(3));
        fill(&mut s, 1, ms(4));
        let seqs: Vec<_> = s.outstanding().map(|p| p.seq()).collect();
        assert_eq!(seqs, vec![4, 5, 0]);
    }
}
