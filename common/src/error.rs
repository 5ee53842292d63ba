use std::time::Duration;

use thiserror::Error;

// download and ingestion error taxonomy
//
// the retry loop needs to match on error kinds, so unlike the rest of the
// workspace (which passes anyhow::Result around) these are typed.  anything
// not covered here is wrapped in Other and treated as terminal.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("rate limited by remote, advised wait {0}s")]
    RateLimited(u64),

    #[error("slow mode active, advised wait {0}s")]
    SlowMode(u64),

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("access denied to entity {0}")]
    AccessDenied(String),

    #[error("invalid data from remote: {0}")]
    InvalidData(String),

    #[error("file validation failed: {0}")]
    ValidationFailed(String),

    #[error("declared size {declared} exceeds limit {limit}")]
    SizeLimitExceeded { declared: i64, limit: i64 },

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },

    #[error("lost (hash,size) insert race for {0}")]
    IndexConstraintRace(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    // rate-limit and slow-mode waits are honored verbatim and do not
    // consume the retry budget; everything else retryable backs off
    // exponentially
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::RateLimited(_)
                | BackupError::SlowMode(_)
                | BackupError::NetworkTransient(_)
        )
    }

    pub fn advised_wait(&self) -> Option<Duration> {
        match self {
            BackupError::RateLimited(secs) | BackupError::SlowMode(secs) => {
                Some(Duration::from_secs(*secs))
            }
            _ => None,
        }
    }

    // stable name used as the errors_by_kind counter key
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::RateLimited(_) => "RateLimited",
            BackupError::SlowMode(_) => "SlowMode",
            BackupError::NetworkTransient(_) => "NetworkTransient",
            BackupError::AuthFailed(_) => "AuthFailed",
            BackupError::AccessDenied(_) => "AccessDenied",
            BackupError::InvalidData(_) => "InvalidData",
            BackupError::ValidationFailed(_) => "ValidationFailed",
            BackupError::SizeLimitExceeded { .. } => "SizeLimitExceeded",
            BackupError::DiskFull { .. } => "DiskFull",
            BackupError::IndexConstraintRace(_) => "IndexConstraintRace",
            BackupError::Cancelled => "Cancelled",
            BackupError::Other(_) => "Other",
        }
    }
}
