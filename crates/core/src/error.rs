use thiserror::Error;

/// Error shared across Perch crates. Each crate keeps its own error enum and
/// converts into this one at crate boundaries, so handlers and batched tasks
/// can report any failure through a single type.
#[derive(Error, Debug)]
pub enum PerchError {
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("settings: {0}")]
    Settings(String),

    #[error("entity store: {0}")]
    Store(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PerchError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("channel name {0:?} is not valid")]
    InvalidChannel(String),

    #[error("subscription pattern {0:?} is not valid")]
    InvalidPattern(String),

    #[error("event bus closed")]
    ChannelClosed,

    #[error("subscriber fell behind and missed {0} events")]
    Lagged(u64),
}
