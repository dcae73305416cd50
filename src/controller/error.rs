//! Error types for the Etcd controller

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Error variants are named with the `Error` suffix where they wrap a source
/// from another layer (e.g. `SerializationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ClientError(#[from] ClientError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to render bootstrap configuration: {0}")]
    RenderError(#[from] serde_yaml::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid spec: {0}")]
    ValidationError(String),

    #[error("Secret {0} not found")]
    SecretNotFound(String),

    #[error("{kind} {name} exists and is not managed by this Etcd")]
    ForeignObject { kind: String, name: String },

    #[error("Reconcile timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gave up after {0} conflicting writes")]
    ConflictRetriesExhausted(u32),
}

/// How the worker treats a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Requeue with backoff; reported through `status.lastError` only
    Transient,
    /// Surfaced as a condition; waits for the user or retries with backoff
    Precondition,
    /// Object exists but belongs to someone else; never mutated
    ConflictForeign,
    /// Aborts the pass; Warning event and maximum backoff
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Precondition => "precondition",
            ErrorKind::ConflictForeign => "conflict_foreign",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ClientError(e) => match e {
                ClientError::NotFound { .. }
                | ClientError::AlreadyExists { .. }
                | ClientError::Conflict { .. }
                | ClientError::Transport(_) => ErrorKind::Transient,
                // 4xx other than 409 Conflict and 429 TooManyRequests will not
                // succeed on retry
                ClientError::Api { code, .. } if (400..500).contains(code) => {
                    if *code == 409 || *code == 429 {
                        ErrorKind::Transient
                    } else {
                        ErrorKind::Fatal
                    }
                }
                ClientError::Api { .. } => ErrorKind::Transient,
                ClientError::Invalid { .. } | ClientError::Serialization(_) => ErrorKind::Fatal,
            },
            Error::SerializationError(_) | Error::RenderError(_) | Error::MissingObjectKey(_) => {
                ErrorKind::Fatal
            }
            Error::ValidationError(_) | Error::SecretNotFound(_) => ErrorKind::Precondition,
            Error::ForeignObject { .. } => ErrorKind::ConflictForeign,
            Error::Timeout(_) | Error::ConflictRetriesExhausted(_) => ErrorKind::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
            || matches!(self, Error::SecretNotFound(_))
    }

    /// Optimistic-concurrency failure that warrants re-reading and retrying
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ClientError(e) if e.is_conflict())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Same curve without jitter, for deterministic schedules
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_secs = self.max_delay.as_secs_f64();
        let base_delay_secs =
            (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max_secs);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::random::<f64>() * jitter_range * 2.0 - jitter_range
        } else {
            0.0
        };
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        // Cap at max delay
        let capped_delay = delay_with_jitter.min(max_secs);

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error: fatal errors wait the maximum delay
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        match error.kind() {
            ErrorKind::Fatal => self.max_delay,
            _ => self.delay_for_attempt(attempt),
        }
    }
}
