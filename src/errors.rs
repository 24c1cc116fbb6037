use thiserror::Error;

/// Error surface of the strategy engine. Indicator warm-up gaps are not
/// errors: they travel through the data as NaN band states.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown or stopped strategy instance '{0}'")]
    UnknownInstance(String),

    #[error("strategy instance '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no open position for strategy instance '{0}'")]
    NoOpenPosition(String),

    #[error("no viewport session loaded for '{0}'")]
    UnknownSession(String),

    #[error("request superseded by a newer request for the same key")]
    Superseded,

    #[error("computation cancelled before completion")]
    Cancelled,

    #[error("strategy instance '{0}' is no longer accepting commands")]
    InstanceUnavailable(String),
}
