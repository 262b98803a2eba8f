use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Coarse classification of a [`BrokerError`].
///
/// Callers branch on the class rather than on individual variants: a
/// `Contention` error is worth backing off and retrying, a `ClosedResource`
/// error never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    // ---
    /// A lock or checkout wait exceeded its configured bound.
    Contention,

    /// The handle, multiplexer, or pool has been closed or destroyed.
    ClosedResource,

    /// The physical connection to the broker failed.
    ConnectionFailure,

    /// Destination / connection / session establishment failed.
    SetupFailure,

    /// The caller asked for something the current configuration forbids.
    Usage,

    /// Any other error reported by the broker client.
    Broker,
}

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    // ---
    #[error("unable to obtain lock within {timeout:?}: {resource}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("resource closed: {0}")]
    Closed(String),

    #[error("cannot get a server session after the pool is stopped")]
    PoolStopped,

    #[error("connection failure: {0}")]
    ConnectionLost(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("invalid configuration property `{property}`: {reason}")]
    InvalidConfig { property: &'static str, reason: String },

    #[error("not supported by the broker client: {0}")]
    NotSupported(String),

    #[error("work rejected: {0}")]
    WorkRejected(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl BrokerError {
    // ---
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        // ---
        match self {
            BrokerError::LockTimeout { .. } => ErrorClass::Contention,
            BrokerError::Closed(_) | BrokerError::PoolStopped => ErrorClass::ClosedResource,
            BrokerError::ConnectionLost(_) | BrokerError::Io(_) => ErrorClass::ConnectionFailure,
            BrokerError::Setup(_) | BrokerError::NotSupported(_) => ErrorClass::SetupFailure,
            BrokerError::IllegalState(_)
            | BrokerError::Security(_)
            | BrokerError::InvalidDestination(_)
            | BrokerError::InvalidConfig { .. } => ErrorClass::Usage,
            BrokerError::WorkRejected(_)
            | BrokerError::Transaction(_)
            | BrokerError::Endpoint(_)
            | BrokerError::Broker(_) => ErrorClass::Broker,
        }
    }

    /// `true` for lock / checkout timeouts.
    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::Contention
    }

    /// `true` when the target resource is closed, destroyed, or stopped.
    pub fn is_closed(&self) -> bool {
        self.class() == ErrorClass::ClosedResource
    }

    /// Shorthand for [`BrokerError::Closed`].
    pub fn closed(what: impl Into<String>) -> Self {
        BrokerError::Closed(what.into())
    }
}

// ---

pub type Result<T> = std::result::Result<T, BrokerError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::{BrokerError, ErrorClass};

    #[test]
    fn lock_timeout_is_contention_not_failure() {
        // ---
        let e = BrokerError::LockTimeout {
            resource: "mc".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(e.is_contention());
        assert!(!e.is_closed());
        assert!(e.to_string().contains("2s"));
    }

    #[test]
    fn pool_stopped_and_closed_share_a_class() {
        assert_eq!(BrokerError::PoolStopped.class(), ErrorClass::ClosedResource);
        assert_eq!(BrokerError::closed("handle").class(), ErrorClass::ClosedResource);
    }
}
