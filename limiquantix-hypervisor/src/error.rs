//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Coarse error classification exposed to RPC callers.
///
/// Lets a client decide whether to retry, fix its input, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is malformed (e.g. missing guest id).
    InvalidArgument,
    /// The backend has no such domain or network.
    NotFound,
    /// Any other backend, connection or rendering failure.
    BackendFailure,
    /// A requested disk or NIC has no matching backend statistics.
    IncompleteMetrics,
}

impl ErrorKind {
    /// Stable wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::IncompleteMetrics => "incomplete_metrics",
        }
    }
}

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The request failed validation before any backend call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Backend network was not found.
    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    /// The backend does not know the named disk or interface device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A backend primitive failed.
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    /// Descriptor rendering or parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// A requested device has no backend statistics.
    #[error("Incomplete metrics for guest {guest}: no statistics for device {device}")]
    IncompleteMetrics { guest: String, device: String },

    /// The connection pool has been shut down.
    #[error("Connection pool closed")]
    PoolClosed,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A failure annotated with the guest operation it aborted.
    #[error("{operation} {guest}: {source}")]
    Operation {
        operation: &'static str,
        guest: String,
        #[source]
        source: Box<HypervisorError>,
    },
}

impl HypervisorError {
    /// Shorthand for a failed backend primitive.
    pub fn backend(operation: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            operation,
            message: message.to_string(),
        }
    }

    /// Classify this error, looking through operation context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::DomainNotFound(_) | Self::NetworkNotFound(_) => ErrorKind::NotFound,
            Self::IncompleteMetrics { .. } => ErrorKind::IncompleteMetrics,
            Self::Operation { source, .. } => source.kind(),
            Self::ConnectionFailed(_)
            | Self::DeviceNotFound(_)
            | Self::Backend { .. }
            | Self::XmlError(_)
            | Self::PoolClosed
            | Self::Internal(_) => ErrorKind::BackendFailure,
        }
    }

    /// Innermost error with operation context stripped.
    pub fn root(&self) -> &HypervisorError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach the operation and guest that this failure aborted.
    pub fn during(self, operation: &'static str, guest: &str) -> Self {
        match self {
            // Keep the innermost operation; one layer of context is enough.
            err @ Self::Operation { .. } => err,
            err => Self::Operation {
                operation,
                guest: guest.to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<tokio::task::JoinError> for HypervisorError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Backend task failed: {}", e))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_context() {
        let err = HypervisorError::DomainNotFound("web-01".into()).during("Status", "web-01");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err.root(), HypervisorError::DomainNotFound(_)));
        assert_eq!(err.to_string(), "Status web-01: Domain not found: web-01");
    }

    #[test]
    fn test_context_is_not_nested_twice() {
        let err = HypervisorError::backend("destroy", "boom")
            .during("Delete", "db-01")
            .during("Outer", "db-01");
        match err {
            HypervisorError::Operation { operation, .. } => assert_eq!(operation, "Delete"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::InvalidArgument.as_str(), "invalid_argument");
        assert_eq!(
            HypervisorError::IncompleteMetrics {
                guest: "g".into(),
                device: "vdz".into()
            }
            .kind()
            .as_str(),
            "incomplete_metrics"
        );
        assert_eq!(HypervisorError::PoolClosed.kind(), ErrorKind::BackendFailure);
    }
}
