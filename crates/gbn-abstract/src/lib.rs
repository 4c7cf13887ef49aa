pub mod config;
pub mod interface;
pub mod packet;
pub mod scenario;

pub use interface::Substrate;
pub use packet::{Packet, PacketError, PacketKind, SeqNum};
// Re-export the wire layout so substrates can size their buffers
pub use packet::wire;

pub use config::{ConfigError, EngineConfig, MAX_WINDOW, SimConfig};
pub use scenario::{
    EngineConfigOverride, SimConfigOverride, TestAction, TestAssertion, TestScenario,
};
