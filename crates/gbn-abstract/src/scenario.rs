use crate::config::{EngineConfig, SimConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub engine: EngineConfigOverride,
    #[serde(default)]
    pub config: SimConfigOverride,
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EngineConfigOverride {
    pub window_size: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
}

impl EngineConfigOverride {
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub loss_rate: Option<f64>,
    pub duplicate_rate: Option<f64>,
    pub min_latency: Option<u64>,
    pub max_latency: Option<u64>,
    pub seed: Option<u64>,
    pub link_capacity: Option<usize>,
    pub link_rate: Option<usize>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.loss_rate {
            config.loss_rate = v;
        }
        if let Some(v) = self.duplicate_rate {
            config.duplicate_rate = v;
        }
        if let Some(v) = self.min_latency {
            config.min_latency = v;
        }
        if let Some(v) = self.max_latency {
            config.max_latency = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.link_capacity {
            config.link_capacity = v;
        }
        if let Some(v) = self.link_rate {
            config.link_rate = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Application hands one payload to the sending engine at a specific time
    AppSend { time: u64, data: String },
    /// `count` payloads named `{prefix}{index}`, all handed over at `time`
    AppSendBatch {
        time: u64,
        count: u32,
        #[serde(default = "default_batch_prefix")]
        prefix: String,
    },
    /// Deterministically drop the first DATA packet on the wire with this sequence number
    DropNextData { seq: u16 },
    /// Deterministically drop the first ACK on the wire with this sequence number
    DropNextAck { seq: u16 },
}

fn default_batch_prefix() -> String {
    "P".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Assert that specific data was delivered to the receiving application
    DataDelivered { data: String },
    /// Assert that every payload sent was delivered once, in send order
    DeliveredInOrder,
    /// Assert that the number of DATA packets (including retransmissions) put on the wire is within range
    SenderPacketCount { min: u32, max: Option<u32> },
    /// Assert that the sender never had more than `max` packets in flight
    MaxInFlight { max: u16 },
    /// Assert the number of fast-retransmit bursts
    FastRetransmits { min: u64, max: Option<u64> },
    /// Assert the number of timeout-driven retransmission bursts
    TimeoutRetransmits { min: u64, max: Option<u64> },
    /// Assert that simulation finishes within time
    MaxDuration { ms: u64 },
}
