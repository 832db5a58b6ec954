//! Common error types for the shroud network driver.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ShroudError`].
pub type ShroudResult<T> = Result<T, ShroudError>;

/// Coarse classification of a [`ShroudError`], as seen by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced network, endpoint or link does not exist.
    NotFound,
    /// Malformed or missing input.
    Config,
    /// The object being created already exists.
    AlreadyExists,
    /// A host port could not be allocated or released.
    Allocation,
    /// A kernel, link or rule-table operation failed.
    Infrastructure,
}

/// Errors raised by the driver.
#[derive(Error, Diagnostic, Debug)]
pub enum ShroudError {
    /// Network not found.
    #[error("network {id} does not exist")]
    #[diagnostic(code(shroud::network::not_found))]
    NetworkNotFound {
        /// The network ID that was not found.
        id: String,
    },

    /// Network already registered.
    #[error("network {id} already exists")]
    #[diagnostic(code(shroud::network::exists))]
    NetworkExists {
        /// The duplicate network ID.
        id: String,
    },

    /// Endpoint not found.
    #[error("endpoint not found: {id}")]
    #[diagnostic(code(shroud::endpoint::not_found))]
    EndpointNotFound {
        /// The endpoint ID that was not found.
        id: String,
    },

    /// Endpoint already registered in its network.
    #[error("endpoint with name {id} already exists")]
    #[diagnostic(code(shroud::endpoint::exists))]
    EndpointExists {
        /// The duplicate endpoint ID.
        id: String,
    },

    /// Invalid endpoint or network ID.
    #[error("invalid id: {id:?}")]
    #[diagnostic(
        code(shroud::invalid_id),
        help("Network and endpoint IDs must be non-empty")
    )]
    InvalidId {
        /// The invalid ID.
        id: String,
    },

    /// A kernel link could not be found.
    #[error("link {name} not found")]
    #[diagnostic(code(shroud::link::not_found))]
    LinkNotFound {
        /// The interface name.
        name: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(shroud::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Host port allocation failed.
    #[error("port allocation failed: {message}")]
    #[diagnostic(code(shroud::port::allocation))]
    Allocation {
        /// The error message.
        message: String,
    },

    /// One or more port bindings could not be released.
    #[error("{}", failures.join("\n"))]
    #[diagnostic(code(shroud::port::release))]
    PortRelease {
        /// One message per binding that failed to release.
        failures: Vec<String>,
    },

    /// The port mapper handed back an address of an unknown transport.
    #[error("unsupported address type: {kind}")]
    #[diagnostic(code(shroud::port::unsupported_address))]
    UnsupportedAddressType {
        /// Description of the address type.
        kind: String,
    },

    /// A link, bridge or rule-table operation failed.
    #[error("{operation}: {message}")]
    #[diagnostic(
        code(shroud::infrastructure),
        help("The driver needs CAP_NET_ADMIN and a working iptables binary")
    )]
    Infrastructure {
        /// The operation that failed.
        operation: String,
        /// The underlying failure.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(shroud::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(shroud::serialization))]
    Serialization(String),

    /// A failed operation whose rollback also hit errors.
    ///
    /// Displays as the primary error; the cleanup notes are carried alongside.
    #[error("{error}")]
    #[diagnostic(code(shroud::cleanup))]
    Cleanup {
        /// The error that triggered the rollback.
        error: Box<ShroudError>,
        /// Messages from cleanup steps that failed.
        notes: Vec<String>,
    },
}

impl ShroudError {
    /// Build an infrastructure error for `operation`.
    pub fn infra(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Infrastructure {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkNotFound { .. }
            | Self::EndpointNotFound { .. }
            | Self::LinkNotFound { .. } => ErrorKind::NotFound,
            Self::NetworkExists { .. } | Self::EndpointExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidId { .. }
            | Self::Config { .. }
            | Self::Serialization(_)
            | Self::UnsupportedAddressType { .. } => ErrorKind::Config,
            Self::Allocation { .. } | Self::PortRelease { .. } => ErrorKind::Allocation,
            Self::Infrastructure { .. } | Self::Io(_) => ErrorKind::Infrastructure,
            Self::Cleanup { error, .. } => error.kind(),
        }
    }

    /// Attach cleanup failures to this error.
    ///
    /// Returns `self` unchanged when `notes` is empty.
    #[must_use]
    pub fn with_cleanup(self, notes: Vec<String>) -> Self {
        if notes.is_empty() {
            return self;
        }
        match self {
            Self::Cleanup {
                error,
                notes: mut existing,
            } => {
                existing.extend(notes);
                Self::Cleanup {
                    error,
                    notes: existing,
                }
            }
            other => Self::Cleanup {
                error: Box::new(other),
                notes,
            },
        }
    }

    /// Cleanup failures recorded alongside the primary error.
    #[must_use]
    pub fn cleanup_notes(&self) -> &[String] {
        match self {
            Self::Cleanup { notes, .. } => notes,
            _ => &[],
        }
    }

    /// The error that caused the failure, without cleanup wrapping.
    #[must_use]
    pub fn primary(&self) -> &Self {
        match self {
            Self::Cleanup { error, .. } => error.primary(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ShroudError {
    fn from(err: serde_json::Error) -> Self {
        ShroudError::Serialization(err.to_string())
    }
}
