/// Error surfaced by provider operations. `retryable` tells the caller
/// whether backing off and retrying the same call can succeed (lock contention,
/// transient I/O) or whether the operation is definitively rejected (unknown
/// lock token, corrupt record, seq gap).
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn io(operation: impl Into<String>, err: std::io::Error) -> Self {
        Self::retryable(operation, err.to_string())
    }

    pub fn codec(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::permanent(operation, err.to_string())
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.operation,
            if self.retryable { "retryable" } else { "permanent" },
            self.message
        )
    }
}

impl std::error::Error for ProviderError {}
