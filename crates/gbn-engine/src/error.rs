use gbn_abstract::ConfigError;
use thiserror::Error;

/// Failures the engine cannot recover from locally.
///
/// Packet loss, full queues and a busy substrate are not errors; they are
/// handled by retransmission, blocking and waiting respectively.
#[derive(Debug, Error)]
pub enum RdtError {
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0} queue closed by its peer")]
    QueueClosed(&'static str),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine not running")]
    NotRunning,
    #[error("engine thread panicked")]
    Panicked,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}
