use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Sequence number on the `2W` ring. The ring never exceeds 15 bits.
pub type SeqNum = u16;

/// Header layout on the wire
pub mod wire {
    /// Size of the fixed header preceding the payload.
    pub const HEADER_LEN: usize = 2;
    /// Set on acknowledgments, clear on data packets.
    pub const ACK_FLAG: u16 = 0x8000;
    /// Low 15 bits carry the sequence number.
    pub const SEQ_MASK: u16 = 0x7FFF;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Data,
    Ack,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the packet header")]
    Truncated(usize),
    #[error("ack {seq} carries {len} payload bytes")]
    AckWithPayload { seq: SeqNum, len: usize },
    #[error("sequence number {0} does not fit in 15 bits")]
    SeqOutOfRange(SeqNum),
}

/// A single datagram exchanged between two engines.
///
/// Packets are immutable once built; the payload is reference counted so that
/// retransmitting a window does not copy data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    seq: SeqNum,
    payload: Bytes,
}

impl Packet {
    pub fn data(seq: SeqNum, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Data,
            seq,
            payload: payload.into(),
        }
    }

    /// Create a pure ACK packet
    pub fn ack(seq: SeqNum) -> Self {
        Self {
            kind: PacketKind::Ack,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        wire::HEADER_LEN + self.payload.len()
    }

    /// Serialize into `buf`: a big-endian `u16` holding the ACK flag and the
    /// sequence number, then the payload.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        if self.seq & !wire::SEQ_MASK != 0 {
            return Err(PacketError::SeqOutOfRange(self.seq));
        }
        let mut header = self.seq;
        if self.is_ack() {
            header |= wire::ACK_FLAG;
        }
        buf.reserve(self.encoded_len());
        buf.put_u16(header);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut datagram: Bytes) -> Result<Self, PacketError> {
        if datagram.len() < wire::HEADER_LEN {
            return Err(PacketError::Truncated(datagram.len()));
        }
        let header = datagram.get_u16();
        let seq = header & wire::SEQ_MASK;
        if header & wire::ACK_FLAG != 0 {
            if !datagram.is_empty() {
                return Err(PacketError::AckWithPayload {
                    seq,
                    len: datagram.len(),
                });
            }
            Ok(Self::ack(seq))
        } else {
            Ok(Self::data(seq, datagram))
        }
    }
}
