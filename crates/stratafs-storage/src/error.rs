//! Error types for the zoned storage core.

use thiserror::Error;

/// Result type alias for zoned storage operations.
pub type ZbdResult<T> = Result<T, ZbdError>;

/// Error variants surfaced by the zoned storage core.
#[derive(Debug, Error)]
pub enum ZbdError {
    /// The allocator could not find an active zone, or a zone append asked
    /// for more than the remaining capacity. Retryable after space is
    /// reclaimed.
    #[error("no space: {reason}")]
    NoSpace {
        /// Description of what ran out of room.
        reason: String,
    },

    /// Device or syscall failure, short async write, sync timeout, or a read
    /// that would cross a zone boundary.
    #[error("I/O error: {reason}")]
    Io {
        /// Description of the failure.
        reason: String,
    },

    /// Metadata decoding rejected the input.
    #[error("corruption in {what}: {reason}")]
    Corruption {
        /// The record type being decoded.
        what: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A caller-supplied argument or open-time precondition was violated.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the violated precondition.
        reason: String,
    },

    /// The device cannot be driven by this crate at all.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Why the device is unusable.
        reason: String,
    },
}

impl ZbdError {
    /// Shorthand for a [`ZbdError::NoSpace`].
    pub fn no_space(reason: impl Into<String>) -> Self {
        Self::NoSpace {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ZbdError::Io`].
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ZbdError::Corruption`].
    pub fn corruption(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Corruption {
            what,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ZbdError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ZbdError::NotSupported`].
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    /// Returns true for the retryable out-of-space condition.
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace { .. })
    }
}

impl From<std::io::Error> for ZbdError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}
