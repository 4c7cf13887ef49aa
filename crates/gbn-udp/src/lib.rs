//! [`Substrate`] over a connected, non-blocking UDP socket.
//!
//! Each packet travels as one datagram in the wire format of
//! [`gbn_abstract::Packet`]. The socket gives no delivery guarantee; an
//! optional `drop_rate` discards outgoing packets on purpose to exercise the
//! protocol on a clean network.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use bytes::Bytes;
use gbn_abstract::{Packet, Substrate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Largest datagram accepted from the socket.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Error)]
pub enum UdpError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("drop_rate must be within [0, 1], got {0}")]
    InvalidDropRate(f64),
    #[error("max_burst must be at least 1")]
    ZeroBurst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpOptions {
    /// Probability of discarding an outgoing packet instead of sending it.
    pub drop_rate: f64,
    /// Largest retransmission burst the substrate accepts at once.
    pub max_burst: usize,
    pub seed: u64,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            max_burst: 1024,
            seed: 0,
        }
    }
}

impl UdpOptions {
    pub fn validate(&self) -> Result<(), UdpError> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(UdpError::InvalidDropRate(self.drop_rate));
        }
        if self.max_burst == 0 {
            return Err(UdpError::ZeroBurst);
        }
        Ok(())
    }
}

/// Datagram counters of one substrate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UdpStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub malformed: u64,
}

pub struct UdpSubstrate {
    socket: UdpSocket,
    buf: Vec<u8>,
    peeked: Option<Packet>,
    rng: StdRng,
    options: UdpOptions,
    stats: UdpStats,
}

impl UdpSubstrate {
    /// Bind `local` and connect to `peer`.
    pub fn connect(
        local: impl ToSocketAddrs,
        peer: impl ToSocketAddrs,
        options: UdpOptions,
    ) -> Result<Self, UdpError> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        Self::from_socket(socket, options)
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket, options: UdpOptions) -> Result<Self, UdpError> {
        options.validate()?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buf: vec![0; MAX_DATAGRAM],
            peeked: None,
            rng: StdRng::seed_from_u64(options.seed),
            options,
            stats: UdpStats::default(),
        })
    }

    /// Two substrates on ephemeral loopback ports, connected to each other.
    pub fn loopback_pair(options: UdpOptions) -> Result<(Self, Self), UdpError> {
        let a = UdpSocket::bind("127.0.0.1:0")?;
        let b = UdpSocket::bind("127.0.0.1:0")?;
        a.connect(b.local_addr()?)?;
        b.connect(a.local_addr()?)?;

        let mut other = options.clone();
        other.seed = options.seed.wrapping_add(1);
        Ok((Self::from_socket(a, options)?, Self::from_socket(b, other)?))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UdpError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> UdpStats {
        self.stats
    }

    /// Pull datagrams until one decodes or the socket has nothing left.
    fn fill(&mut self) {
        while self.peeked.is_none() {
            match self.socket.recv(&mut self.buf) {
                Ok(n) => match Packet::decode(Bytes::copy_from_slice(&self.buf[..n])) {
                    Ok(packet) => {
                        self.stats.received += 1;
                        self.peeked = Some(packet);
                    }
                    Err(e) => {
                        self.stats.malformed += 1;
                        warn!(error = %e, len = n, "discarding malformed datagram");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Connected sockets surface ICMP unreachable here while the peer is down.
                    debug!(error = %e, "udp receive failed");
                    break;
                }
            }
        }
    }
}

impl Substrate for UdpSubstrate {
    fn has_incoming(&mut self) -> bool {
        self.fill();
        self.peeked.is_some()
    }

    fn receive(&mut self) -> Option<Packet> {
        self.fill();
        self.peeked.take()
    }

    fn send(&mut self, packet: Packet) {
        if self.options.drop_rate > 0.0 && self.rng.random::<f64>() < self.options.drop_rate {
            trace!(seq = packet.seq(), kind = ?packet.kind(), "udp drop (injected)");
            self.stats.dropped += 1;
            return;
        }
        let datagram = match packet.to_bytes() {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(error = %e, "packet cannot be encoded");
                self.stats.dropped += 1;
                return;
            }
        };
        match self.socket.send(&datagram) {
            Ok(_) => self.stats.sent += 1,
            Err(e) => {
                debug!(error = %e, seq = packet.seq(), "udp send failed");
                self.stats.dropped += 1;
            }
        }
    }

    fn ready_to_send(&self) -> bool {
        true
    }

    fn ready_for_burst(&self, n: usize) -> bool {
        n <= self.options.max_burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_incoming(s: &mut UdpSubstrate) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if s.has_incoming() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn packets_cross_loopback() {
        let (mut a, mut b) = UdpSubstrate::loopback_pair(UdpOptions::default()).unwrap();
        assert!(!b.has_incoming());

        a.send(Packet::data(3, &b"over udp"[..]));
        assert!(wait_incoming(&mut b));
        let packet = b.receive().unwrap();
        assert!(packet.is_data());
        assert_eq!(packet.seq(), 3);
        assert_eq!(packet.payload().as_ref(), b"over udp");

        b.send(Packet::ack(3));
        assert!(wait_incoming(&mut a));
        assert_eq!(a.receive().map(|p| p.seq()), Some(3));
        assert_eq!(a.stats().sent, 1);
        assert_eq!(a.stats().received, 1);
    }

    #[test]
    fn malformed_datagrams_are_skipped() {
        let (a, mut b) = UdpSubstrate::loopback_pair(UdpOptions::default()).unwrap();
        a.socket.send(&[0x01]).unwrap();
        a.socket.send(&Packet::ack(9).to_bytes().unwrap()).unwrap();

        assert!(wait_incoming(&mut b));
        assert_eq!(b.receive().map(|p| p.seq()), Some(9));
        assert_eq!(b.stats().malformed, 1);
    }

    #[test]
    fn drop_rate_discards_everything_at_one() {
        let options = UdpOptions {
            drop_rate: 1.0,
            ..Default::default()
        };
        let (mut a, _b) = UdpSubstrate::loopback_pair(options).unwrap();
        for seq in 0..5 {
            a.send(Packet::ack(seq));
        }
        assert_eq!(a.stats().dropped, 5);
        assert_eq!(a.stats().sent, 0);
    }

    #[test]
    fn burst_limit_is_honoured() {
        let options = UdpOptions {
            max_burst: 4,
            ..Default::default()
        };
        let (a, _b) = UdpSubstrate::loopback_pair(options).unwrap();
        assert!(a.ready_for_burst(4));
        assert!(!a.ready_for_burst(5));
    }

    #[test]
    fn rejects_bad_options() {
        let options = UdpOptions {
            drop_rate: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            UdpSubstrate::loopback_pair(options),
            Err(UdpError::InvalidDropRate(_))
        ));
    }
}
