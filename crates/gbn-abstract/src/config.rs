use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Largest usable window. The sequence ring holds `2W` values and must fit in
/// the 15 bits the wire header reserves for it.
pub const MAX_WINDOW: u16 = (1 << 14) - 1;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("window_size must be at least 1")]
    ZeroWindow,
    #[error("timeout_ms must be at least 1")]
    ZeroTimeout,
    #[error("queue_capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("min_latency ({min}) exceeds max_latency ({max})")]
    LatencyRange { min: u64, max: u64 },
    #[error("link_capacity ({capacity}) must hold a full window of {window} packets")]
    LinkCapacity { capacity: usize, window: u16 },
    #[error("link_rate must be at least 1")]
    ZeroLinkRate,
}

/// Tunables of a single engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Protocol window `W`; the sequence space is `2W`.
    pub window_size: u16,
    /// Retransmission timeout in milliseconds.
    pub timeout_ms: u64,
    /// Capacity of each application-facing queue.
    pub queue_capacity: usize,
    /// Sleep applied by the threaded driver when there is nothing to do.
    pub idle_sleep_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            timeout_ms: 500,
            queue_capacity: 1000,
            idle_sleep_us: 1000,
        }
    }
}

impl EngineConfig {
    pub fn new(window_size: u16, timeout: Duration) -> Self {
        Self {
            window_size: window_size.min(MAX_WINDOW),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ..Default::default()
        }
    }

    /// Window after clamping to [`MAX_WINDOW`].
    pub fn window(&self) -> u16 {
        self.window_size.min(MAX_WINDOW)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Fault model of a simulated link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub min_latency: u64,
    pub max_latency: u64,
    pub seed: u64,
    /// Outbound packets a port buffers before it stops accepting sends.
    pub link_capacity: usize,
    /// Packets a link moves onto the wire per millisecond.
    pub link_rate: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            min_latency: 10,
            max_latency: 100,
            seed: 0,
            link_capacity: 64,
            link_rate: 4,
        }
    }
}

impl SimConfig {
    pub fn validate(&self, window: u16) -> Result<(), ConfigError> {
        for (name, value) in [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        if self.min_latency > self.max_latency {
            return Err(ConfigError::LatencyRange {
                min: self.min_latency,
                max: self.max_latency,
            });
        }
        if self.link_capacity < usize::from(window) {
            return Err(ConfigError::LinkCapacity {
                capacity: self.link_capacity,
                window,
            });
        }
        if self.link_rate == 0 {
            return Err(ConfigError::ZeroLinkRate);
        }
        Ok(())
    }
}
