use thiserror::Error;

/// Failures surfaced by the engine's validation and storage boundaries.
///
/// Store failures are never allowed to wedge the request pipeline: callers in
/// the policy layer catch them, log at error severity, and fail open.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid ip address: {0}")]
    InvalidIp(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown event status: {0}")]
    UnknownEventStatus(String),

    #[error("invalid threat pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("event store unavailable: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
