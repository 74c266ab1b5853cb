use thiserror::Error;

/// Failure taxonomy for swarm operations.
///
/// Validation and not-found errors are raised before any side effect so
/// callers can surface them directly. Crashed agents are lifecycle events,
/// not errors, and never appear here.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("invalid regex: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SwarmResult<T> = Result<T, SwarmError>;

impl SwarmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SwarmError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SwarmError::NotFound(what.into())
    }

    /// Short machine-readable kind used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmError::Validation(_) => "validation",
            SwarmError::NotFound(_) => "not_found",
            SwarmError::Spawn(_) => "spawn",
            SwarmError::InvalidPattern(_) => "invalid_pattern",
            SwarmError::Io(_) => "io",
            SwarmError::Store(_) => "store",
            SwarmError::Internal(_) => "internal",
        }
    }
}
