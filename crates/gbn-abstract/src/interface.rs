use crate::packet::Packet;

/// The unreliable datagram service an engine runs on top of.
/// Implementations may drop, reorder or duplicate packets; they must never block.
pub trait Substrate {
    /// Non-blocking poll for a packet waiting to be received.
    fn has_incoming(&mut self) -> bool;

    /// Take the next incoming packet. Only meaningful after `has_incoming` returned true.
    fn receive(&mut self) -> Option<Packet>;

    /// Best-effort send to the peer.
    fn send(&mut self, packet: Packet);

    /// Capacity for a single packet.
    fn ready_to_send(&self) -> bool;

    /// Capacity to accept `n` packets at once. Used for retransmission bursts,
    /// which are never split.
    fn ready_for_burst(&self, n: usize) -> bool;
}

impl<S: Substrate + ?Sized> Substrate for Box<S> {
    fn has_incoming(&mut self) -> bool {
        (**self).has_incoming()
    }

    fn receive(&mut self) -> Option<Packet> {
        (**self).receive()
    }

    fn send(&mut self, packet: Packet) {
        (**self).send(packet)
    }

    fn ready_to_send(&self) -> bool {
        (**self).ready_to_send()
    }

    fn ready_for_burst(&self, n: usize) -> bool {
        (**self).ready_for_burst(n)
    }
}
