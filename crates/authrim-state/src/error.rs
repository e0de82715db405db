//! Ephemeral-state error types.

/// Errors surfaced by the ephemeral-state actors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The record does not exist, including the case where it existed and
    /// has already been consumed. Single-use consumers see this on the
    /// second attempt.
    #[error("Record not found")]
    NotFound,

    /// A record with this key already exists.
    #[error("Record already exists")]
    AlreadyExists,

    /// Challenge consumption failed.
    ///
    /// Deliberately a single undifferentiated variant: not-found, expired,
    /// already-consumed and type-mismatch are indistinguishable to callers
    /// so the error channel cannot be used for enumeration.
    #[error("Invalid or expired challenge")]
    InvalidChallenge,

    /// A backend operation failed.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// A key-manager crypto operation failed.
    #[error(transparent)]
    Crypto(#[from] authrim_crypto::CryptoError),
}

impl StateError {
    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
