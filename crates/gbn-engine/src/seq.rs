//! Circular arithmetic over the sequence ring.
//!
//! With a window of `W` the ring holds `2W` sequence numbers, which is what
//! lets a receiver tell a retransmitted old packet from a new one. Every
//! comparison between sequence numbers in this crate goes through
//! [`SeqSpace::distance`]; raw `<`/`>` on sequence numbers is never meaningful.

use gbn_abstract::SeqNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpace {
    modulus: u16,
}

impl SeqSpace {
    /// Ring for a window of `window` packets. `window` must be non-zero and at
    /// most [`gbn_abstract::MAX_WINDOW`].
    pub fn for_window(window: u16) -> Self {
        debug_assert!(window >= 1 && window <= gbn_abstract::MAX_WINDOW);
        Self {
            modulus: window * 2,
        }
    }

    /// Number of distinct sequence numbers (`2W`).
    pub fn modulus(&self) -> u16 {
        self.modulus
    }

    /// `x` lies on the ring. The wire carries 15 bits, so a peer configured
    /// with another window can produce values past `2W`.
    pub fn is_valid(&self, x: SeqNum) -> bool {
        x < self.modulus
    }

    pub fn increment(&self, x: SeqNum) -> SeqNum {
        let next = x + 1;
        if next < self.modulus { next } else { 0 }
    }

    pub fn decrement(&self, x: SeqNum) -> SeqNum {
        if x == 0 { self.modulus - 1 } else { x - 1 }
    }

    /// Steps clockwise from `y` to `x`.
    pub fn distance(&self, x: SeqNum, y: SeqNum) -> u16 {
        if x >= y { x - y } else { x + self.modulus - y }
    }

    /// True when `x` is one of the `len` sequence numbers starting at `base`.
    pub fn contains(&self, x: SeqNum, base: SeqNum, len: u16) -> bool {
        self.distance(x, base) < len
    }

    /// Arena index of the slot owned by `x`.
    pub fn slot(&self, x: SeqNum) -> usize {
        usize::from(x % self.modulus)
    }

    /// Walk `len` sequence numbers starting at `base`.
    pub fn range(&self, base: SeqNum, len: u16) -> impl Iterator<Item = SeqNum> + use<> {
        let space = *self;
        let mut cur = base;
        (0..len).map(move |_| {
            let seq = cur;
            cur = space.increment(cur);
            seq
        })
    }
}
