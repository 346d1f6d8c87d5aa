use serde::{Deserialize, Serialize};

/// Classification of a failure as seen by the engine and by retry policies.
///
/// `Transient` and `Timeout` are retryable; `Permanent` short-circuits
/// remaining attempts. `DeadlineExceeded` is instance-level and forces the
/// instance to FAILED. `Canceled` is user-initiated and not an error.
/// `Integrity` marks a determinism violation (replay divergence, panic inside
/// a workflow, completion-kind mismatch) and halts the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    Permanent,
    Timeout,
    DeadlineExceeded,
    Canceled,
    Integrity,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "TRANSIENT",
            FailureKind::Permanent => "PERMANENT",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            FailureKind::Canceled => "CANCELED",
            FailureKind::Integrity => "INTEGRITY",
        };
        f.write_str(s)
    }
}

/// A failure as recorded in history and surfaced through status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DeadlineExceeded, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Canceled, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Integrity, message)
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error returned by activity handlers. The worker maps it to a
/// [`FailureInfo`] and applies the retry policy: transient errors are
/// retried, permanent ones short-circuit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn to_failure(&self) -> FailureInfo {
        match self {
            ActivityError::Transient(m) => FailureInfo::transient(m.clone()),
            ActivityError::Permanent(m) => FailureInfo::permanent(m.clone()),
        }
    }
}

/// Errors surfaced by the [`crate::client::Client`] entry points.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("provider: {0}")]
    Provider(#[from] crate::providers::ProviderError),
}

/// Error type returned by terminal-wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for terminal state")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::DeadlineExceeded.is_retryable());
        assert!(!FailureKind::Canceled.is_retryable());
        assert!(!FailureKind::Integrity.is_retryable());
    }

    #[test]
    fn failure_display_uses_stable_codes() {
        let f = FailureInfo::deadline_exceeded("budget exhausted");
        assert_eq!(f.to_string(), "DEADLINE_EXCEEDED: budget exhausted");
    }

    #[test]
    fn activity_error_maps_to_failure() {
        let e = ActivityError::permanent("no items to validate");
        assert_eq!(e.to_failure().kind, FailureKind::Permanent);
        let e = ActivityError::transient("connection reset");
        assert!(e.to_failure().kind.is_retryable());
    }
}
