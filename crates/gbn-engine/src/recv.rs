//! Go-Back-N receive-side state: one expected sequence number and a single
//! delivery slot. Nothing out of order is ever buffered.

use bytes::Bytes;
use gbn_abstract::{Packet, SeqNum};
use tracing::trace;

use crate::seq::SeqSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// In-order packet moved into the delivery slot.
    Accepted,
    /// Duplicate or out-of-order packet dropped.
    Discarded,
}

#[derive(Debug)]
pub struct RecvState {
    space: SeqSpace,
    expected: SeqNum,
    last_delivered: Option<SeqNum>,
    pending: Option<Bytes>,
}

impl RecvState {
    pub fn new(window: u16) -> Self {
        Self {
            space: SeqSpace::for_window(window),
            expected: 0,
            last_delivered: None,
            pending: None,
        }
    }

    pub fn expected(&self) -> SeqNum {
        self.expected
    }

    pub fn last_delivered(&self) -> Option<SeqNum> {
        self.last_delivered
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take_pending(&mut self) -> Option<Bytes> {
        self.pending.take()
    }

    /// Handle a DATA packet. Returns the outcome and, once anything has been
    /// accepted, the cumulative ACK to send back.
    ///
    /// Must not be called while a payload is still pending delivery.
    pub fn on_data(&mut self, packet: Packet) -> (DataOutcome, Option<Packet>) {
        debug_assert!(self.pending.is_none(), "delivery slot still occupied");
        let seq = packet.seq();
        if !self.space.is_valid(seq) {
            trace!(
                seq,
                modulus = self.space.modulus(),
                "data outside the sequence ring dropped"
            );
            return (DataOutcome::Discarded, None);
        }
        let outcome = if seq == self.expected {
            self.pending = Some(packet.into_payload());
            self.last_delivered = Some(seq);
            self.expected = self.space.increment(seq);
            DataOutcome::Accepted
        } else {
            trace!(seq, expected = self.expected, "out-of-order data discarded");
            DataOutcome::Discarded
        };
        (outcome, self.last_delivered.map(Packet::ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_packet_fills_slot_and_acks() {
        let mut r = RecvState::new(4);
        let (outcome, ack) = r.on_data(Packet::data(0, &b"P0"[..]));
        assert_eq!(outcome, DataOutcome::Accepted);
        assert_eq!(ack, Some(Packet::ack(0)));
        assert_eq!(r.expected(), 1);
        assert_eq!(r.take_pending(), Some(Bytes::from_static(b"P0")));
        assert!(!r.has_pending());
    }

    #[test]
    fn nothing_acked_before_first_delivery() {
        let mut r = RecvState::new(4);
        let (outcome, ack) = r.on_data(Packet::data(2, &b"P2"[..]));
        assert_eq!(outcome, DataOutcome::Discarded);
        assert_eq!(ack, None);
        assert_eq!(r.expected(), 0);
    }

    #[test]
    fn gap_produces_duplicate_ack() {
        let mut r = RecvState::new(4);
        r.on_data(Packet::data(0, &b"P0"[..]));
        r.take_pending();

        let (outcome, ack) = r.on_data(Packet::data(2, &b"P2"[..]));
        assert_eq!(outcome, DataOutcome::Discarded);
        assert_eq!(ack, Some(Packet::ack(0)));
        assert!(!r.has_pending());

        // Retransmitted duplicate of an accepted packet.
        let (outcome, ack) = r.on_data(Packet::data(0, &b"P0"[..]));
        assert_eq!(outcome, DataOutcome::Discarded);
        assert_eq!(ack, Some(Packet::ack(0)));
    }

    #[test]
    fn data_past_the_ring_is_dropped_unacked() {
        let mut r = RecvState::new(2);
        r.on_data(Packet::data(0, &b"P0"[..]));
        r.take_pending();

        let (outcome, ack) = r.on_data(Packet::data(5, &b"stray"[..]));
        assert_eq!(outcome, DataOutcome::Discarded);
        assert_eq!(ack, None);
        assert_eq!(r.expected(), 1);
        assert!(!r.has_pending());
    }

    #[test]
    fn expected_wraps_with_ring() {
        let mut r = RecvState::new(2);
        for i in 0..9u16 {
            let seq = i % 4;
            let (outcome, ack) = r.on_data(Packet::data(seq, Bytes::from(format!("P{i}"))));
            assert_eq!(outcome, DataOutcome::Accepted);
            assert_eq!(ack, Some(Packet::ack(seq)));
            assert_eq!(r.take_pending(), Some(Bytes::from(format!("P{i}"))));
        }
        assert_eq!(r.expected(), 1);
        assert_eq!(r.last_delivered(), Some(0));
    }
}
