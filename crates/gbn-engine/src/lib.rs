//! Go-Back-N ARQ engine.
//!
//! Provides reliable, in-order delivery of discrete payloads over any
//! [`Substrate`](gbn_abstract::Substrate) that may drop, reorder or duplicate
//! packets.
//!
//! - [`seq`]   : circular arithmetic on the `2W` sequence ring
//! - [`send`]  : send window, retransmission deadline, duplicate-ACK counting
//! - [`recv`]  : expected sequence number and the single delivery slot
//! - [`engine`]: the priority-ordered poll loop tying both together
//! - [`queue`] : bounded queues between the application and the engine
//! - [`rdt`]   : threaded endpoint exposing `send` / `receive`

pub mod engine;
pub mod error;
pub mod queue;
pub mod rdt;
pub mod recv;
pub mod send;
pub mod seq;

pub use engine::{Engine, EngineStats, RetransmitCause, Step};
pub use error::RdtError;
pub use queue::{QueueRx, QueueTx, app_queue};
pub use rdt::Rdt;
pub use seq::SeqSpace;
