use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---

use parking_lot::Mutex;
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    BrokerConnection,
    BrokerError,
    Capabilities,
    ConnectionConsumer,
    ConnectionConsumerPtr,
    ConnectionFactory,
    ConnectionMetadata,
    ConnectionPtr,
    ConsumerOptions,
    Credentials,
    Destination,
    DestinationKind,
    ExceptionListenerPtr,
    Result,
    ServerSessionSourcePtr,
    SessionMode,
    SessionPtr,
    XaSession,
};

// ---

use super::broker::{Flow, SimBroker, Source};
use super::session::{SimSession, SimXaResource};

// ---------------------------------------------------------------------------
// SimConnectionFactory
// ---------------------------------------------------------------------------

/// Connection factory backed by a [`SimBroker`].
pub struct SimConnectionFactory {
    // ---
    broker: SimBroker,
}

// ---

impl SimConnectionFactory {
    // ---
    pub fn new(broker: SimBroker) -> Self {
        Self { broker }
    }

    fn connect(&self, credentials: Option<&Credentials>, xa: bool) -> Result<ConnectionPtr> {
        // ---
        self.broker.admit_connect()?;
        self.authenticate(credentials)?;

        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            broker: self.broker.clone(),
            xa,
            client_id: Mutex::new(None),
            session_created: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            listener: Mutex::new(None),
            dispatchers: Mutex::new(Vec::new()),
        });
        self.broker.register_connection(&inner);
        tracing::debug!(conn = %inner.id, xa, "sim connection opened");
        Ok(Arc::new(SimConnection { inner }))
    }

    fn authenticate(&self, credentials: Option<&Credentials>) -> Result<()> {
        // ---
        let Some(users) = &self.broker.config().users else {
            return Ok(());
        };
        match credentials {
            Some(c) if users.get(&c.user) == Some(&c.password) => Ok(()),
            Some(c) => Err(BrokerError::Security(format!("bad credentials for `{}`", c.user))),
            None => Err(BrokerError::Security("anonymous connections are not allowed".into())),
        }
    }
}

// ---

impl ConnectionFactory for SimConnectionFactory {
    // ---
    fn capabilities(&self) -> Capabilities {
        self.broker.config().capabilities
    }

    fn create_connection(&self, credentials: Option<&Credentials>) -> Result<ConnectionPtr> {
        self.connect(credentials, false)
    }

    fn create_xa_connection(&self, credentials: Option<&Credentials>) -> Result<ConnectionPtr> {
        // ---
        if !self.capabilities().xa {
            return Err(BrokerError::NotSupported("XA connections".into()));
        }
        self.connect(credentials, true)
    }
}

// ---------------------------------------------------------------------------
// ConnectionInner
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionInner {
    // ---
    pub(crate) id: Uuid,
    pub(crate) broker: SimBroker,
    xa: bool,
    client_id: Mutex<Option<String>>,
    session_created: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    broken: AtomicBool,
    listener: Mutex<Option<ExceptionListenerPtr>>,
    dispatchers: Mutex<Vec<Arc<AtomicBool>>>,
}

// ---

impl ConnectionInner {
    // ---
    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.broken.load(Ordering::SeqCst)
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!("connection {}", self.id)));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost(format!("connection {} is broken", self.id)));
        }
        Ok(())
    }

    /// Delivery gate shared by receivers and dispatchers.
    pub(crate) fn flow(&self) -> Flow {
        // ---
        if !self.is_open() {
            Flow::Abort
        } else if self.started.load(Ordering::SeqCst) {
            Flow::Deliver
        } else {
            Flow::Hold
        }
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    /// Break the connection and notify the listener off-thread.
    pub(crate) fn fail(&self, error: BrokerError) {
        // ---
        if !self.is_open() || self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_dispatchers();

        let Some(listener) = self.listener.lock().clone() else {
            tracing::debug!(conn = %self.id, "sim connection broke with no listener");
            return;
        };
        let spawned = std::thread::Builder::new()
            .name(format!("sim-exception-{}", &self.id.to_string()[..8]))
            .spawn(move || listener.on_exception(error));
        if let Err(e) = spawned {
            tracing::warn!(conn = %self.id, "cannot spawn exception thread: {e}");
        }
    }

    fn stop_dispatchers(&self) {
        // ---
        for stop in self.dispatchers.lock().drain(..) {
            stop.store(true, Ordering::SeqCst);
        }
        self.broker.wake_all();
    }
}

// ---------------------------------------------------------------------------
// SimConnection
// ---------------------------------------------------------------------------

pub struct SimConnection {
    // ---
    inner: Arc<ConnectionInner>,
}

// ---

impl SimConnection {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }
}

// ---

impl BrokerConnection for SimConnection {
    // ---
    fn client_id(&self) -> Option<String> {
        self.inner.client_id()
    }

    fn set_client_id(&self, client_id: &str) -> Result<()> {
        // ---
        self.inner.check_usable()?;
        if self.inner.session_created.load(Ordering::SeqCst) {
            return Err(BrokerError::IllegalState(
                "client id must be set before the first session is created".into(),
            ));
        }
        let mut current = self.inner.client_id.lock();
        if current.is_some() {
            return Err(BrokerError::IllegalState("client id already set".into()));
        }
        *current = Some(client_id.to_string());
        Ok(())
    }

    fn metadata(&self) -> ConnectionMetadata {
        // ---
        let config = self.inner.broker.config();
        ConnectionMetadata {
            product_name: config.product_name.clone(),
            product_version: config.product_version.clone(),
        }
    }

    fn create_session(&self, mode: SessionMode) -> Result<SessionPtr> {
        // ---
        self.inner.check_usable()?;
        let session = match mode {
            SessionMode::Simplified => {
                // ---
                if !self.inner.broker.config().capabilities.simplified_session {
                    return Err(BrokerError::NotSupported("simplified session creation".into()));
                }
                SimSession::new(self.inner.clone(), false, Default::default())
            }
            SessionMode::Transacted => SimSession::new(self.inner.clone(), true, Default::default()),
            SessionMode::Acknowledge(ack) => SimSession::new(self.inner.clone(), false, ack),
        };
        self.inner.session_created.store(true, Ordering::SeqCst);
        Ok(Arc::new(session))
    }

    fn create_xa_session(&self) -> Result<XaSession> {
        // ---
        self.inner.check_usable()?;
        if !self.inner.xa {
            return Err(BrokerError::NotSupported("XA session on a non-XA connection".into()));
        }
        self.inner.session_created.store(true, Ordering::SeqCst);
        Ok(XaSession {
            session: Arc::new(SimSession::new(self.inner.clone(), true, Default::default())),
            resource: Arc::new(SimXaResource::new(self.inner.broker.clone())),
        })
    }

    fn create_connection_consumer(
        &self,
        destination: &Destination,
        options: &ConsumerOptions,
        source: ServerSessionSourcePtr,
        max_messages: usize,
    ) -> Result<ConnectionConsumerPtr> {
        // ---
        self.inner.check_usable()?;
        let broker = &self.inner.broker;

        let from = match (destination.kind, &options.subscription) {
            (DestinationKind::Queue, _) => Source::Queue(destination.name.clone()),
            (DestinationKind::Topic, Some(sub)) if sub.durable => {
                // ---
                let client_id = self.inner.client_id().ok_or_else(|| {
                    BrokerError::IllegalState("durable subscription requires a client id".into())
                })?;
                broker.subscribe_durable(&client_id, &sub.name, &destination.name)
            }
            (DestinationKind::Topic, _) => broker.subscribe(&destination.name),
            (DestinationKind::Any, _) => {
                return Err(BrokerError::InvalidDestination(format!("{destination} is unresolved")));
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        self.inner.dispatchers.lock().push(stop.clone());

        let conn = self.inner.clone();
        let thread_stop = stop.clone();
        let thread_from = from.clone();
        let max = max_messages.max(1);
        std::thread::Builder::new()
            .name(format!("sim-dispatch-{}", destination.name))
            .spawn(move || dispatch_loop(conn, thread_from, source, max, thread_stop))?;

        tracing::debug!(conn = %self.inner.id, %destination, max, "sim connection consumer started");
        Ok(Box::new(SimConnectionConsumer {
            broker: broker.clone(),
            from,
            stop,
        }))
    }

    fn set_exception_listener(&self, listener: Option<ExceptionListenerPtr>) -> Result<()> {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!("connection {}", self.inner.id)));
        }
        *self.inner.listener.lock() = listener;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        // ---
        self.inner.check_usable()?;
        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.broker.wake_all();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!("connection {}", self.inner.id)));
        }
        self.inner.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.listener.lock().take();
        self.inner.stop_dispatchers();
        tracing::debug!(conn = %self.inner.id, "sim connection closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimConnectionConsumer
// ---------------------------------------------------------------------------

struct SimConnectionConsumer {
    // ---
    broker: SimBroker,
    from: Source,
    stop: Arc<AtomicBool>,
}

impl ConnectionConsumer for SimConnectionConsumer {
    // ---
    fn close(&self) -> Result<()> {
        // ---
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.broker.release_source(&self.from);
            self.broker.wake_all();
        }
        Ok(())
    }
}

/// Broker-side dispatch: take a batch, obtain a server session, hand over.
fn dispatch_loop(
    conn: Arc<ConnectionInner>,
    from: Source,
    sessions: ServerSessionSourcePtr,
    max: usize,
    stop: Arc<AtomicBool>,
) {
    // ---
    let broker = conn.broker.clone();
    let flow = || {
        if stop.load(Ordering::SeqCst) {
            Flow::Abort
        } else {
            conn.flow()
        }
    };

    loop {
        // ---
        let batch = broker.wait_take(&from, max, None, &flow);
        if batch.is_empty() {
            break;
        }

        let session = match sessions.server_session() {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(conn = %conn.id, "sim dispatcher stopping: {e}");
                broker.requeue(&from, batch);
                break;
            }
        };

        if flow() == Flow::Abort {
            // Hand the session back without delivering.
            broker.requeue(&from, batch);
            if let Err(e) = session.start(Vec::new()) {
                tracing::debug!(conn = %conn.id, "sim returning idle server session: {e}");
            }
            break;
        }

        let retained = batch.clone();
        if let Err(e) = session.start(batch) {
            tracing::warn!(conn = %conn.id, "server session refused batch: {e}");
            broker.requeue(&from, retained);
        }
    }
    tracing::trace!(conn = %conn.id, "sim dispatcher exited");
}
