//! Transaction views of a [`ConnectionMultiplexer`]: the container-driven
//! local transaction and an XA resource serialized with application calls.

use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    BrokerError,
    Result,
    XaResource,
    XaResourcePtr,
    Xid,
};

// ---

use super::{ConnectionEventKind, ConnectionMultiplexer};

// ---------------------------------------------------------------------------
// LocalTransaction
// ---------------------------------------------------------------------------

/// Container demarcation of the multiplexer's session transaction.
///
/// `commit` and `rollback` only reach the broker when the session is
/// transacted; either way the matching event is emitted.
pub struct LocalTransaction {
    // ---
    mc: Arc<ConnectionMultiplexer>,
}

impl LocalTransaction {
    // ---
    pub(crate) fn new(mc: Arc<ConnectionMultiplexer>) -> Self {
        Self { mc }
    }

    pub fn begin(&self) -> Result<()> {
        // ---
        {
            let _guard = self.mc.lock()?;
            self.mc.session()?;
        }
        tracing::trace!(mc = %self.mc.id(), "local transaction started");
        self.mc.send_event(ConnectionEventKind::LocalTransactionStarted);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        // ---
        {
            let _guard = self.mc.lock()?;
            let session = self.mc.session()?;
            if session.is_transacted() {
                session.commit()?;
            }
        }
        tracing::trace!(mc = %self.mc.id(), "local transaction committed");
        self.mc.send_event(ConnectionEventKind::LocalTransactionCommitted);
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        // ---
        {
            let _guard = self.mc.lock()?;
            let session = self.mc.session()?;
            if session.is_transacted() {
                session.rollback()?;
            }
        }
        tracing::trace!(mc = %self.mc.id(), "local transaction rolled back");
        self.mc.send_event(ConnectionEventKind::LocalTransactionRolledBack);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LockedXaResource
// ---------------------------------------------------------------------------

/// XA resource whose calls are serialized with every other call on the
/// physical session.
pub struct LockedXaResource {
    // ---
    mc: Weak<ConnectionMultiplexer>,
    inner: XaResourcePtr,
}

impl LockedXaResource {
    // ---
    pub(crate) fn new(mc: Weak<ConnectionMultiplexer>, inner: XaResourcePtr) -> Self {
        Self { mc, inner }
    }

    fn locked<T>(&self, f: impl FnOnce(&dyn XaResource) -> Result<T>) -> Result<T> {
        // ---
        let mc = self
            .mc
            .upgrade()
            .ok_or_else(|| BrokerError::closed("XA resource outlived its multiplexer"))?;
        let _guard = mc.lock()?;
        f(self.inner.as_ref())
    }
}

impl XaResource for LockedXaResource {
    // ---
    fn resource_manager_id(&self) -> Uuid {
        self.inner.resource_manager_id()
    }

    fn start(&self, xid: &Xid) -> Result<()> {
        self.locked(|r| r.start(xid))
    }

    fn end(&self, xid: &Xid, success: bool) -> Result<()> {
        self.locked(|r| r.end(xid, success))
    }

    fn prepare(&self, xid: &Xid) -> Result<bool> {
        self.locked(|r| r.prepare(xid))
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.locked(|r| r.commit(xid, one_phase))
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.locked(|r| r.rollback(xid))
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        self.locked(|r| r.forget(xid))
    }

    fn recover(&self) -> Result<Vec<Xid>> {
        self.locked(|r| r.recover())
    }

    // Read-only, no lock.
    fn transaction_timeout(&self) -> Duration {
        self.inner.transaction_timeout()
    }

    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool> {
        self.locked(|r| r.set_transaction_timeout(timeout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
