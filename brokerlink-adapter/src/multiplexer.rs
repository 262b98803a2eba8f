//! [`ConnectionMultiplexer`] — one physical broker connection shared by many
//! logical [`SessionHandle`]s.
//!
//! # Design
//!
//! ```text
//!   SessionHandle ─┐ Weak           ConnectionMultiplexer
//!   SessionHandle ─┼───────────────► ├── ReentrantLock   (serializes every call)
//!   SessionHandle ─┘                 ├── handles         (arena, owning)
//!                                    ├── physical        connection + session (+ XA)
//!                                    └── listeners       container event hooks
//! ```
//!
//! The multiplexer owns its handles through the arena; each handle keeps only
//! a `Weak` back-reference, so tearing down the multiplexer never has to break
//! a reference cycle. `destroy` is terminal: it invalidates every handle,
//! closes the physical resources and can never be undone.
//!
//! Asynchronous connection failures arrive on the broker client's thread via
//! a small listener holding a `Weak` to the multiplexer. They are turned into
//! an `ErrorOccurred` event; the container decides when to destroy.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

// ---

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    AckMode,
    BrokerError,
    Capabilities,
    ConnectionFactoryPtr,
    ConnectionPtr,
    ConnectionRequestInfo,
    ConnectionType,
    Credentials,
    ExceptionListener,
    ExceptionListenerPtr,
    FactoryIdentity,
    FactorySettings,
    Result,
    SessionMode,
    SessionPtr,
    XaResourcePtr,
    XaSession,
};

// ---

use super::{
    // ---
    ConnectionEvent,
    ConnectionEventKind,
    ConnectionEventListenerPtr,
    HandleId,
    HandleShared,
    LocalTransaction,
    LockGuard,
    LockedXaResource,
    ReentrantLock,
    SessionHandle,
};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    // ---
    SettingUp,
    Ready,

    /// Terminal.
    Destroyed,
}

/// Product and user information for the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerMetadata {
    // ---
    pub product_name: String,
    pub product_version: String,
    pub user: Option<String>,
}

struct Physical {
    // ---
    connection: ConnectionPtr,
    session: SessionPtr,
    xa: Option<XaResourcePtr>,
}

// ---------------------------------------------------------------------------
// ConnectionMultiplexer
// ---------------------------------------------------------------------------

pub struct ConnectionMultiplexer {
    // ---
    id: Uuid,
    factory: FactoryIdentity,
    settings: Arc<FactorySettings>,
    info: ConnectionRequestInfo,
    lock: ReentrantLock,
    lifecycle: Mutex<Lifecycle>,
    physical: RwLock<Option<Physical>>,
    handles: Mutex<HashMap<HandleId, Arc<HandleShared>>>,
    listeners: Mutex<Vec<ConnectionEventListenerPtr>>,
    xa_resource: Mutex<Option<Arc<LockedXaResource>>>,
    me: Weak<ConnectionMultiplexer>,
}

// ---

impl ConnectionMultiplexer {
    // ---
    /// Open a physical connection and its session for `info`.
    ///
    /// On failure every partially created resource is closed and a
    /// [`BrokerError::Setup`] is returned.
    pub fn open(
        factory: &ConnectionFactoryPtr,
        settings: Arc<FactorySettings>,
        info: ConnectionRequestInfo,
    ) -> Result<Arc<Self>> {
        // ---
        let id = Uuid::new_v4();
        let mc = Arc::new_cyclic(|me| Self {
            id,
            factory: settings.identity(),
            lock: ReentrantLock::new(format!("multiplexer {id}")),
            settings,
            info,
            lifecycle: Mutex::new(Lifecycle::SettingUp),
            physical: RwLock::new(None),
            handles: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            xa_resource: Mutex::new(None),
            me: me.clone(),
        });

        match mc.setup(factory) {
            Ok(physical) => {
                // ---
                let xa = physical.xa.is_some();
                *mc.physical.write() = Some(physical);
                *mc.lifecycle.lock() = Lifecycle::Ready;
                tracing::info!(mc = %id, xa, transacted = mc.info.transacted, "multiplexer ready");
                Ok(mc)
            }
            Err(e) => {
                // ---
                *mc.lifecycle.lock() = Lifecycle::Destroyed;
                tracing::warn!(mc = %id, "unable to set up connection: {e}");
                Err(BrokerError::Setup(format!("unable to set up connection: {e}")))
            }
        }
    }

    fn setup(&self, factory: &ConnectionFactoryPtr) -> Result<Physical> {
        // ---
        let caps = factory.capabilities();
        if self.info.connection_type == ConnectionType::Context && !(caps.context_api && self.settings.api_2_0) {
            return Err(BrokerError::NotSupported("the broker client has no context API".into()));
        }

        let credentials = self.info.credentials();
        tracing::debug!(mc = %self.id, user = ?self.info.user, xa = caps.xa, "creating connection");
        let connection = if caps.xa {
            factory.create_xa_connection(credentials.as_ref())?
        } else {
            factory.create_connection(credentials.as_ref())?
        };

        match self.open_session(&connection, caps) {
            Ok((session, xa)) => Ok(Physical {
                connection,
                session,
                xa,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close() {
                    tracing::debug!(mc = %self.id, "error closing half-open connection: {close_err}");
                }
                Err(e)
            }
        }
    }

    fn open_session(&self, connection: &ConnectionPtr, caps: Capabilities) -> Result<(SessionPtr, Option<XaResourcePtr>)> {
        // ---
        // Some clients refuse a client id once a session exists.
        if let Some(client_id) = &self.info.client_id {
            if connection.client_id().as_deref() != Some(client_id.as_str()) {
                connection.set_client_id(client_id)?;
            }
        }

        let (session, xa) = if caps.xa && self.info.transacted {
            let XaSession { session, resource } = connection.create_xa_session()?;
            (session, Some(resource))
        } else {
            let mode = self.session_mode(caps);
            tracing::debug!(mc = %self.id, ?mode, "creating session");
            (connection.create_session(mode)?, None)
        };

        let listener: ExceptionListenerPtr = Arc::new(OutboundListener { mc: self.me.clone() });
        connection.set_exception_listener(Some(listener))?;
        Ok((session, xa))
    }

    fn session_mode(&self, caps: Capabilities) -> SessionMode {
        // ---
        if self.info.transacted {
            SessionMode::Transacted
        } else if self.settings.api_2_0 && caps.simplified_session && self.info.ack_mode == AckMode::Auto {
            SessionMode::Simplified
        } else {
            SessionMode::Acknowledge(self.info.ack_mode)
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn info(&self) -> &ConnectionRequestInfo {
        &self.info
    }

    /// User the physical connection was opened for.
    pub fn user(&self) -> Option<&str> {
        self.info.user.as_deref()
    }

    pub fn factory_identity(&self) -> &FactoryIdentity {
        &self.factory
    }

    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    /// `true` when the session is an XA session.
    pub fn is_xa_transacted(&self) -> bool {
        self.physical.read().as_ref().is_some_and(|p| p.xa.is_some())
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Take the connection lock for one call, waiting at most the factory's
    /// lock timeout.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.lock.acquire(self.settings.lock_timeout)
    }

    /// The underlying lock, for diagnostics.
    pub fn connection_lock(&self) -> &ReentrantLock {
        &self.lock
    }

    // -----------------------------------------------------------------------
    // Physical resources
    // -----------------------------------------------------------------------

    pub(crate) fn session(&self) -> Result<SessionPtr> {
        // ---
        self.physical
            .read()
            .as_ref()
            .map(|p| p.session.clone())
            .ok_or_else(|| self.destroyed_error())
    }

    fn connection(&self) -> Result<ConnectionPtr> {
        // ---
        self.physical
            .read()
            .as_ref()
            .map(|p| p.connection.clone())
            .ok_or_else(|| self.destroyed_error())
    }

    fn destroyed_error(&self) -> BrokerError {
        BrokerError::closed(format!("multiplexer {} is destroyed", self.id))
    }

    /// Start delivery on the physical connection.
    pub fn start(&self) -> Result<()> {
        self.connection()?.start()
    }

    /// Stop delivery on the physical connection.
    pub fn stop(&self) -> Result<()> {
        self.connection()?.stop()
    }

    pub fn metadata(&self) -> Result<MultiplexerMetadata> {
        // ---
        let meta = self.connection()?.metadata();
        Ok(MultiplexerMetadata {
            product_name: meta.product_name,
            product_version: meta.product_version,
            user: self.info.user.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    /// Hand out a new logical handle.
    ///
    /// The requester must be the user this connection was opened for; an
    /// anonymous connection cannot be taken over by a named user.
    pub fn get_connection(
        &self,
        credentials: Option<&Credentials>,
        info: Option<&ConnectionRequestInfo>,
    ) -> Result<SessionHandle> {
        // ---
        let requester = credentials
            .map(|c| c.user.as_str())
            .or_else(|| info.and_then(|i| i.user.as_deref()));
        if self.user() != requester {
            return Err(BrokerError::Security(
                "credentials differ from the connection's, reauthentication not allowed".into(),
            ));
        }
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }

        let handle = SessionHandle::new(info.cloned().unwrap_or_else(|| self.info.clone()), self.me.clone());
        self.attach(&handle);
        tracing::debug!(mc = %self.id, handle = %handle.id(), "handle created");
        Ok(handle)
    }

    /// Move `handle` from wherever it is attached onto this multiplexer.
    pub fn associate(&self, handle: &SessionHandle) -> Result<()> {
        // ---
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        handle.shared().rehome(self.me.clone());
        self.attach(handle);
        tracing::debug!(mc = %self.id, handle = %handle.id(), "handle associated");
        Ok(())
    }

    pub fn attach(&self, handle: &SessionHandle) {
        self.handles.lock().insert(handle.id(), handle.shared().clone());
    }

    /// Returns `false` if the handle was not attached.
    pub fn detach(&self, handle: HandleId) -> bool {
        self.handles.lock().remove(&handle).is_some()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Stop delivery and invalidate every attached handle.
    fn destroy_handles(&self, connection: Option<&ConnectionPtr>) {
        // ---
        if let Some(conn) = connection {
            if let Err(e) = conn.stop() {
                tracing::trace!(mc = %self.id, "ignored error stopping connection: {e}");
            }
        }
        let handles: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for h in handles {
            h.invalidate();
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Tear down the physical connection. Idempotent; errors are logged.
    pub fn destroy(&self) {
        // ---
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Destroyed {
                return;
            }
            *lifecycle = Lifecycle::Destroyed;
        }

        let physical = self.physical.write().take();
        let Some(Physical {
            connection, session, ..
        }) = physical
        else {
            self.destroy_handles(None);
            return;
        };

        // Unset first: teardown must not trigger failure handling.
        if let Err(e) = connection.set_exception_listener(None) {
            tracing::debug!(mc = %self.id, "error unsetting exception listener: {e}");
        }

        self.destroy_handles(Some(&connection));
        self.xa_resource.lock().take();

        if let Err(e) = session.close() {
            tracing::debug!(mc = %self.id, "error closing session: {e}");
        }
        if let Err(e) = connection.close() {
            tracing::debug!(mc = %self.id, "error closing connection: {e}");
        }
        tracing::info!(mc = %self.id, "multiplexer destroyed");
    }

    /// Prepare for return to the pool: invalidate handles and verify nobody
    /// holds or waits for the lock. Fails if anyone does, so the container
    /// destroys this multiplexer instead of pooling it.
    pub fn cleanup(&self) -> Result<()> {
        // ---
        if self.is_destroyed() {
            return Err(BrokerError::IllegalState(format!("multiplexer {} already destroyed", self.id)));
        }
        let connection = self.connection().ok();
        self.destroy_handles(connection.as_ref());

        let mut active = false;
        let queued = self.lock.queued_threads();
        if queued > 0 {
            tracing::warn!(mc = %self.id, queued, "threads waiting for lock during cleanup");
            active = true;
        }
        if let Some(owner) = self.lock.owner() {
            tracing::warn!(mc = %self.id, %owner, holds = self.lock.hold_count(), "lock held during cleanup");
            active = true;
        }

        if active {
            return Err(BrokerError::IllegalState(format!("still active locks for multiplexer {}", self.id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn local_transaction(&self) -> Result<LocalTransaction> {
        // ---
        let me = self.me.upgrade().ok_or_else(|| self.destroyed_error())?;
        Ok(LocalTransaction::new(me))
    }

    /// XA resource whose every call runs under the connection lock.
    pub fn xa_resource(&self) -> Result<Arc<LockedXaResource>> {
        // ---
        let mut cached = self.xa_resource.lock();
        if let Some(r) = cached.as_ref() {
            return Ok(r.clone());
        }

        let inner = self
            .physical
            .read()
            .as_ref()
            .ok_or_else(|| self.destroyed_error())?
            .xa
            .clone()
            .ok_or_else(|| BrokerError::NotSupported("this connection is not XA transacted".into()))?;

        let wrapped = Arc::new(LockedXaResource::new(self.me.clone(), inner));
        *cached = Some(wrapped.clone());
        Ok(wrapped)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn add_event_listener(&self, listener: ConnectionEventListenerPtr) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_event_listener(&self, listener: &ConnectionEventListenerPtr) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deliver to a snapshot so listeners may (de)register while notified.
    pub(crate) fn send_event(&self, kind: ConnectionEventKind) {
        // ---
        let snapshot: Vec<_> = self.listeners.lock().clone();
        let event = ConnectionEvent {
            multiplexer: self.id,
            kind,
        };
        for listener in snapshot {
            listener.connection_event(&event);
        }
    }

    fn on_exception(&self, error: BrokerError) {
        // ---
        if self.is_destroyed() {
            return;
        }
        tracing::warn!(mc = %self.id, "handling broker exception: {error}");

        if let Ok(conn) = self.connection() {
            if let Err(e) = conn.set_exception_listener(None) {
                tracing::debug!(mc = %self.id, "error unsetting exception listener: {e}");
            }
        }

        self.send_event(ConnectionEventKind::ErrorOccurred {
            class: error.class(),
            reason: error.to_string(),
        });
    }
}

impl fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("ConnectionMultiplexer")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle())
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        // ---
        if let Some(p) = self.physical.get_mut().take() {
            tracing::debug!(mc = %self.id, "multiplexer dropped without destroy, closing connection");
            if let Err(e) = p.connection.set_exception_listener(None) {
                tracing::debug!(mc = %self.id, "error unsetting exception listener: {e}");
            }
            if let Err(e) = p.connection.close() {
                tracing::debug!(mc = %self.id, "error closing connection: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OutboundListener
// ---------------------------------------------------------------------------

struct OutboundListener {
    // ---
    mc: Weak<ConnectionMultiplexer>,
}

impl ExceptionListener for OutboundListener {
    fn on_exception(&self, error: BrokerError) {
        // ---
        if let Some(mc) = self.mc.upgrade() {
            mc.on_exception(error);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
