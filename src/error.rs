//! Error types for the CIDR allocator

use thiserror::Error;

/// Main error type for allocator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A CIDR string could not be parsed as an IPv4 network
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// A network mask outside the valid `1..=32` range
    #[error("invalid network mask /{0}: must be 1 <= mask <= 32")]
    InvalidMask(u8),

    /// Startup/configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Leader-election lease error
    #[error("lease error: {0}")]
    Lease(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Create an `InvalidCidr` error for the given input
    pub fn invalid_cidr(cidr: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidCidr {
            cidr: cidr.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// API errors (conflicts, timeouts, transient I/O) are retriable;
    /// malformed CIDR input is not going to fix itself.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Lease(_))
    }

    /// Short category label used for error metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::InvalidCidr { .. } => "invalid_cidr",
            Error::InvalidMask(_) => "invalid_mask",
            Error::Config(_) => "config",
            Error::Lease(_) => "lease",
        }
    }
}
