//! Container-side collaborators: message endpoints, transactions, work
//! scheduling, and destination lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::broker::{ConnectionFactoryPtr, XaResourcePtr, Xid};
use super::error::{BrokerError, Result};
use super::message::{Destination, DestinationKind, Message};

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// The endpoint method a delivery targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    OnMessage,
}

/// One application endpoint instance, owned by exactly one worker.
pub trait Endpoint: Send {
    // ---
    fn before_delivery(&mut self, method: DeliveryMethod) -> Result<()>;

    fn on_message(&mut self, message: &Message) -> Result<()>;

    /// Always called once `before_delivery` has succeeded.
    fn after_delivery(&mut self) -> Result<()>;

    /// Final call; the instance is dropped afterwards.
    fn release(&mut self);
}

pub type EndpointPtr = Box<dyn Endpoint>;

/// Creates endpoint instances for an activation.
pub trait EndpointFactory: Send + Sync {
    // ---
    /// `resource` is `Some` when the delivering session is an XA session.
    fn create_endpoint(&self, resource: Option<XaResourcePtr>) -> Result<EndpointPtr>;

    /// Whether `on_message` must run inside a transaction.
    fn is_delivery_transacted(&self, method: DeliveryMethod) -> bool;
}

pub type EndpointFactoryPtr = Arc<dyn EndpointFactory>;

// ---------------------------------------------------------------------------
// TransactionCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

/// Distributed transaction manager, used only for transacted delivery.
pub trait TransactionCoordinator: Send + Sync {
    // ---
    /// Applies to transactions begun afterwards on the calling thread.
    fn set_transaction_timeout(&self, timeout: Duration) -> Result<()>;

    /// Start a transaction and enlist `resource` in it.
    fn begin(&self, resource: XaResourcePtr) -> Result<Xid>;

    /// Delist every resource and complete the transaction.
    fn end(&self, xid: &Xid, outcome: TxOutcome) -> Result<()>;
}

pub type TransactionCoordinatorPtr = Arc<dyn TransactionCoordinator>;

// ---------------------------------------------------------------------------
// WorkScheduler
// ---------------------------------------------------------------------------

pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs work off the calling thread.
pub trait WorkScheduler: Send + Sync {
    // ---
    /// Returns [`BrokerError::WorkRejected`] if `work` will never run.
    fn schedule_work(&self, work: Work) -> Result<()>;
}

pub type WorkSchedulerPtr = Arc<dyn WorkScheduler>;

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Ordered lookup parameters, e.g. provider URL and initial context class.
pub type DirectoryParameters = BTreeMap<String, String>;

/// Naming service resolving factory and destination names.
pub trait Directory: Send + Sync {
    // ---
    fn lookup_connection_factory(&self, name: &str, params: &DirectoryParameters) -> Result<ConnectionFactoryPtr>;

    /// With `DestinationKind::Any` the directory decides the concrete kind.
    fn lookup_destination(&self, name: &str, kind: DestinationKind, params: &DirectoryParameters) -> Result<Destination>;
}

pub type DirectoryPtr = Arc<dyn Directory>;

/// Parse `"k=v;k2=v2"` into lookup parameters.
///
/// Empty segments are skipped and a segment without `=` maps to an empty
/// value. Keys must be non-empty.
pub fn parse_directory_parameters(raw: &str) -> Result<DirectoryParameters> {
    // ---
    let mut params = DirectoryParameters::new();
    for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        // ---
        let (key, value) = match segment.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (segment, ""),
        };
        if key.is_empty() {
            return Err(BrokerError::InvalidConfig {
                property: "jndiParameters",
                reason: format!("segment `{segment}` has no key"),
            });
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
