use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use brokerlink_domain::ErrorClass;

// ---------------------------------------------------------------------------
// HandleId
// ---------------------------------------------------------------------------

/// Stable identity of a [`super::SessionHandle`] across re-association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub Uuid);

impl HandleId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConnectionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    // ---
    /// An application closed a handle; the multiplexer may be pooled again.
    Closed { handle: HandleId },

    LocalTransactionStarted,
    LocalTransactionCommitted,
    LocalTransactionRolledBack,

    /// The physical connection failed; the multiplexer should be destroyed.
    ErrorOccurred { class: ErrorClass, reason: String },
}

/// Notification sent by a multiplexer to the container's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    // ---
    pub multiplexer: Uuid,
    pub kind: ConnectionEventKind,
}

/// Container hook for multiplexer lifecycle events.
///
/// Called on whichever thread raised the event, including the broker
/// client's exception thread. Must not call back into the multiplexer's lock.
pub trait ConnectionEventListener: Send + Sync {
    fn connection_event(&self, event: &ConnectionEvent);
}

pub type ConnectionEventListenerPtr = Arc<dyn ConnectionEventListener>;
