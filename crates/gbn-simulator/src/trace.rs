use gbn_abstract::{EngineConfig, SimConfig};
use gbn_engine::EngineStats;
use serde::Serialize;

use crate::engine::LinkEventSummary;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub config: SimConfig,
    pub engine: EngineConfig,
    pub duration_ms: u64,
    pub sent_data: Vec<Vec<u8>>,
    pub delivered_data: Vec<Vec<u8>>,
    pub sender_packet_count: u32,
    pub sender_stats: EngineStats,
    pub receiver_stats: EngineStats,
    pub link_events: Vec<LinkEventSummary>,
}
