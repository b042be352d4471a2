use thiserror::Error;

/// Error kinds the coordinator core distinguishes. The first group maps
/// one-to-one onto the failures an API caller or `GetOperation` can see;
/// the rest are plumbing that bubbles up through them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")] InvalidArgument(String),

    #[error("conflict: {0}")] Conflict(String),

    #[error("unknown key: {0}")] UnknownKey(String),

    #[error("validation-rejected: {0}")] ValidationRejected(String),

    #[error("peer unreachable: {0}")] PeerUnreachable(String),

    #[error("decryption failed")] DecryptionFailed,

    #[error("not found: {0}")] NotFound(String),

    #[error("protocol error: {0}")] Protocol(String),

    #[error("timeout: {0}")] Timeout(String),

    #[error("operation canceled")] Canceled,

    #[error("storage error: {0}")] Storage(String),

    #[error("transport error: {0}")] Transport(String),

    #[error("io error: {0}")] Io(#[from] std::io::Error),

    #[error("serialization error: {0}")] Serialization(#[from] serde_json::Error),

    #[error(transparent)] Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Whether retrying the same call could ever succeed. Callers use this
    /// to decide between resubmission and giving up; the core itself never
    /// retries application-level failures.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::PeerUnreachable(_) | Self::Timeout(_) | Self::Transport(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
