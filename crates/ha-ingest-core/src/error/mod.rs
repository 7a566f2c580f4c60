//! # Error Handling for the Ingestion Pipeline
//!
//! All failure modes in the pipeline are variants of [`IngestError`]. The
//! taxonomy follows the recovery behavior, not the component that raised the
//! error:
//!
//! - [`IngestError::Configuration`]: invalid or missing configuration; fatal
//!   at startup, never retried.
//! - [`IngestError::Authentication`]: a credential was rejected; fatal after
//!   a bounded number of consecutive occurrences at the owning component.
//! - [`IngestError::TransientNetwork`]: timeouts, DNS failures, connection
//!   resets; recovered by retry with backoff at the component that owns the
//!   endpoint.
//! - [`IngestError::Protocol`]: malformed or unexpected frame from the
//!   source; the frame is counted and discarded, the stream continues.
//! - [`IngestError::Transform`]: a transform rejected an event; the event is
//!   dead-lettered with the transform name, the pipeline continues.
//! - [`IngestError::Persistence`]: a store write failed; `permanent` decides
//!   between retry and dead-lettering the whole batch.
//!
//! Only `Configuration` and permanent `Persistence` errors propagate up and
//! abort the process. Everything else is recovered locally.

pub mod retry;

pub use retry::{Backoff, RetryPolicy};

/// Result alias used throughout the pipeline crates.
pub type IngestResult<T> = Result<T, IngestError>;

/// Primary error type for all ingestion pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Invalid or missing required configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A credential was rejected by an upstream or downstream endpoint.
    #[error("authentication rejected by {endpoint}: {message}")]
    Authentication { endpoint: String, message: String },

    /// A network operation failed in a way that is expected to succeed on
    /// retry: timeout, DNS, connection reset, 5xx-equivalent responses.
    #[error("transient network error against {endpoint}: {message}")]
    TransientNetwork { endpoint: String, message: String },

    /// A frame from the source was malformed or arrived in an unexpected
    /// connection state.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A transform failed on a normalized event.
    #[error("transform {transform} failed: {message}")]
    Transform { transform: String, message: String },

    /// A time-series or metadata store write failed. Transient failures are
    /// retried by the owning writer; permanent failures dead-letter the
    /// affected batch.
    #[error("{store} persistence error: {message} (permanent: {permanent})")]
    Persistence {
        store: String,
        message: String,
        permanent: bool,
    },

    /// Cooperative-cancellation marker returned from suspension points once
    /// shutdown has been requested.
    #[error("shutdown requested")]
    Shutdown,
}

impl IngestError {
    pub fn configuration(message: impl Into<String>) -> Self {
        IngestError::Configuration {
            message: message.into(),
        }
    }

    pub fn authentication(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Authentication {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn transient_network(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::TransientNetwork {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        IngestError::Protocol {
            message: message.into(),
        }
    }

    pub fn transform(transform: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Transform {
            transform: transform.into(),
            message: message.into(),
        }
    }

    pub fn persistence_transient(store: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Persistence {
            store: store.into(),
            message: message.into(),
            permanent: false,
        }
    }

    pub fn persistence_permanent(store: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Persistence {
            store: store.into(),
            message: message.into(),
            permanent: true,
        }
    }

    /// Whether the failure is expected to succeed if the operation is
    /// repeated after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::TransientNetwork { .. } => true,
            IngestError::Persistence { permanent, .. } => !permanent,
            IngestError::Configuration { .. }
            | IngestError::Authentication { .. }
            | IngestError::Protocol { .. }
            | IngestError::Transform { .. }
            | IngestError::Shutdown => false,
        }
    }

    /// Whether the error must abort the process rather than be recovered by
    /// the owning component.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Configuration { .. } | IngestError::Persistence { permanent: true, .. }
        )
    }

    /// Short stable label used for dead-letter reasons and error counters.
    pub fn reason_label(&self) -> String {
        match self {
            IngestError::Configuration { .. } => "configuration".to_string(),
            IngestError::Authentication { .. } => "authentication".to_string(),
            IngestError::TransientNetwork { .. } => "network".to_string(),
            IngestError::Protocol { .. } => "protocol".to_string(),
            IngestError::Transform { transform, .. } => format!("transform:{}", transform),
            IngestError::Persistence { store, .. } => format!("{}:write", store),
            IngestError::Shutdown => "shutdown".to_string(),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Protocol {
            message: format!("JSON decode failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_network_is_retryable_not_fatal() {
        let err = IngestError::transient_network("tsdb", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn permanent_persistence_is_fatal_not_retryable() {
        let err = IngestError::persistence_permanent("tsdb", "schema rejected");
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn transient_persistence_is_retryable() {
        let err = IngestError::persistence_transient("metadata", "database is locked");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn transform_reason_label_carries_name() {
        let err = IngestError::transform("state_to_point", "state is not numeric");
        assert_eq!(err.reason_label(), "transform:state_to_point");
    }

    #[test]
    fn authentication_is_neither_retryable_nor_immediately_fatal() {
        // The owning component decides after a bounded number of occurrences.
        let err = IngestError::authentication("ha", "auth_invalid");
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }
}
