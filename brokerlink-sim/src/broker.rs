//! Shared message store, fault injection and observation hooks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

// ---

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    BrokerError,
    Destination,
    DestinationKind,
    Message,
    Result,
    Xid,
};

// ---

use super::config::SimConfig;
use super::connection::ConnectionInner;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Where a consumer takes messages from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Source {
    // ---
    Queue(String),

    /// Private mailbox of one non-durable topic subscriber.
    Subscriber(Uuid),

    /// Durable subscription, keyed `client_id/name`.
    Durable(String),
}

/// What a blocked taker should do on its next wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    // ---
    Deliver,
    Hold,
    Abort,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Mailbox {
    // ---
    topic: String,
    messages: VecDeque<Message>,
}

#[derive(Default)]
struct Store {
    // ---
    queues: HashMap<String, VecDeque<Message>>,
    subscribers: HashMap<Uuid, Mailbox>,
    durables: HashMap<String, Mailbox>,
    temporaries: HashSet<String>,
}

// ---

impl Store {
    // ---
    fn messages_mut(&mut self, source: &Source) -> Option<&mut VecDeque<Message>> {
        // ---
        match source {
            Source::Queue(name) => Some(self.queues.entry(name.clone()).or_default()),
            Source::Subscriber(id) => self.subscribers.get_mut(id).map(|m| &mut m.messages),
            Source::Durable(key) => self.durables.get_mut(key).map(|m| &mut m.messages),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation records
// ---------------------------------------------------------------------------

/// One call to `create_connection` / `create_xa_connection`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectAttempt {
    // ---
    pub at: Instant,
    pub succeeded: bool,
}

/// One XA call made against a simulated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaOp {
    // ---
    Start,
    End { success: bool },
    Prepare,
    Commit { one_phase: bool },
    Rollback,
    Forget,
}

// ---------------------------------------------------------------------------
// SimBroker
// ---------------------------------------------------------------------------

/// In-process broker. Cheap to clone; clones share all state.
///
/// ```text
///   SimConnectionFactory ─► SimConnection ─► SimSession ─► SimConsumer
///            │                   │                              │
///            └───────────────────┴──────────► SimBroker ◄───────┘
///                                             (store, faults, logs)
/// ```
#[derive(Clone)]
pub struct SimBroker {
    // ---
    pub(crate) inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    // ---
    pub(crate) id: Uuid,
    pub(crate) config: SimConfig,
    store: Mutex<Store>,
    arrived: Condvar,
    connects: Mutex<Vec<ConnectAttempt>>,
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    xa_log: Mutex<Vec<(Xid, XaOp)>>,
}

// ---

impl SimBroker {
    // ---
    pub fn new(config: SimConfig) -> Self {
        // ---
        Self {
            inner: Arc::new(BrokerInner {
                id: Uuid::new_v4(),
                config,
                store: Mutex::new(Store::default()),
                arrived: Condvar::new(),
                connects: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                fail_all: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
                xa_log: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Put a message on a destination as an external producer would.
    /// Returns the assigned message id.
    pub fn publish(&self, destination: &Destination, mut message: Message) -> Result<String> {
        // ---
        let id = message.ensure_id().to_string();
        {
            let mut store = self.inner.store.lock();
            match destination.kind {
                DestinationKind::Queue => {
                    // ---
                    if destination.temporary && !store.temporaries.contains(&destination.name) {
                        return Err(BrokerError::InvalidDestination(format!(
                            "temporary destination {destination} was deleted"
                        )));
                    }
                    store
                        .queues
                        .entry(destination.name.clone())
                        .or_default()
                        .push_back(message);
                }
                DestinationKind::Topic => {
                    // ---
                    let Store {
                        subscribers, durables, ..
                    } = &mut *store;
                    for mailbox in subscribers.values_mut().chain(durables.values_mut()) {
                        if mailbox.topic == destination.name {
                            mailbox.messages.push_back(message.clone());
                        }
                    }
                }
                DestinationKind::Any => {
                    return Err(BrokerError::InvalidDestination(format!(
                        "{destination} is neither a queue nor a topic"
                    )));
                }
            }
        }
        self.inner.arrived.notify_all();
        tracing::trace!(%destination, %id, "sim publish");
        Ok(id)
    }

    /// Convenience for tests: publish a text message to a queue.
    pub fn send_text(&self, queue: &str, text: &str) -> Result<String> {
        self.publish(&Destination::queue(queue), Message::text(text))
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        // ---
        self.inner
            .store
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Messages waiting on a durable subscription, if it exists.
    pub fn durable_depth(&self, client_id: &str, name: &str) -> Option<usize> {
        // ---
        let key = durable_key(client_id, name);
        self.inner.store.lock().durables.get(&key).map(|m| m.messages.len())
    }

    /// Copy of a queue's contents, head first.
    pub(crate) fn snapshot(&self, queue: &str) -> Vec<Message> {
        // ---
        self.inner
            .store
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn take(&self, source: &Source, max: usize) -> Vec<Message> {
        // ---
        let mut store = self.inner.store.lock();
        take_from(&mut store, source, max)
    }

    /// Block until up to `max` messages can be taken from `source`.
    ///
    /// `flow` is consulted on every wake-up; an empty batch is returned on
    /// `Flow::Abort` or when `deadline` passes.
    pub(crate) fn wait_take(
        &self,
        source: &Source,
        max: usize,
        deadline: Option<Instant>,
        flow: impl Fn() -> Flow,
    ) -> Vec<Message> {
        // ---
        let poll = self.inner.config.poll_interval;
        let mut store = self.inner.store.lock();
        loop {
            // ---
            match flow() {
                Flow::Abort => return Vec::new(),
                Flow::Deliver => {
                    let batch = take_from(&mut store, source, max);
                    if !batch.is_empty() {
                        return batch;
                    }
                }
                Flow::Hold => {}
            }

            let wait = match deadline {
                None => poll,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Vec::new();
                    }
                    poll.min(d - now)
                }
            };
            self.inner.arrived.wait_for(&mut store, wait);
        }
    }

    /// Put messages back at the head of `source`, marked redelivered.
    pub(crate) fn requeue(&self, source: &Source, messages: Vec<Message>) {
        // ---
        if messages.is_empty() {
            return;
        }
        {
            let mut store = self.inner.store.lock();
            if let Some(queue) = store.messages_mut(source) {
                for mut m in messages.into_iter().rev() {
                    m.redelivered = true;
                    queue.push_front(m);
                }
            }
        }
        self.inner.arrived.notify_all();
    }

    /// Wake every blocked receiver and dispatcher.
    pub(crate) fn wake_all(&self) {
        self.inner.arrived.notify_all();
    }

    // -----------------------------------------------------------------------
    // Subscriptions and temporaries
    // -----------------------------------------------------------------------

    pub(crate) fn subscribe(&self, topic: &str) -> Source {
        // ---
        let id = Uuid::new_v4();
        self.inner.store.lock().subscribers.insert(
            id,
            Mailbox {
                topic: topic.to_string(),
                messages: VecDeque::new(),
            },
        );
        Source::Subscriber(id)
    }

    /// Create the durable subscription if it does not exist yet.
    pub(crate) fn subscribe_durable(&self, client_id: &str, name: &str, topic: &str) -> Source {
        // ---
        let key = durable_key(client_id, name);
        self.inner
            .store
            .lock()
            .durables
            .entry(key.clone())
            .or_insert_with(|| Mailbox {
                topic: topic.to_string(),
                messages: VecDeque::new(),
            });
        Source::Durable(key)
    }

    /// Drop a consumer's private mailbox. Durable subscriptions survive.
    pub(crate) fn release_source(&self, source: &Source) {
        // ---
        if let Source::Subscriber(id) = source {
            self.inner.store.lock().subscribers.remove(id);
        }
    }

    pub(crate) fn unsubscribe(&self, client_id: &str, name: &str) -> Result<()> {
        // ---
        let key = durable_key(client_id, name);
        match self.inner.store.lock().durables.remove(&key) {
            Some(_) => Ok(()),
            None => Err(BrokerError::InvalidDestination(format!(
                "no durable subscription `{name}` for client `{client_id}`"
            ))),
        }
    }

    pub(crate) fn create_temporary(&self, kind: DestinationKind) -> Destination {
        // ---
        let name = format!("temp-{}", Uuid::new_v4());
        self.inner.store.lock().temporaries.insert(name.clone());
        Destination {
            name,
            kind,
            temporary: true,
        }
    }

    pub(crate) fn delete_temporary(&self, destination: &Destination) -> Result<()> {
        // ---
        let mut store = self.inner.store.lock();
        if !store.temporaries.remove(&destination.name) {
            return Err(BrokerError::InvalidDestination(format!("{destination} is not a live temporary")));
        }
        store.queues.remove(&destination.name);
        Ok(())
    }

    pub fn temporary_count(&self) -> usize {
        self.inner.store.lock().temporaries.len()
    }

    // -----------------------------------------------------------------------
    // Connections and faults
    // -----------------------------------------------------------------------

    /// Record a connection attempt and decide whether it fails.
    pub(crate) fn admit_connect(&self) -> Result<()> {
        // ---
        if let Some(delay) = self.inner.config.connect_delay {
            std::thread::sleep(delay);
        }

        let fail = self.inner.fail_all.load(Ordering::SeqCst)
            || self
                .inner
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        self.inner.connects.lock().push(ConnectAttempt {
            at: Instant::now(),
            succeeded: !fail,
        });

        if fail {
            tracing::debug!(broker = %self.inner.id, "sim refusing connection");
            return Err(BrokerError::ConnectionLost("connection refused by broker".into()));
        }
        Ok(())
    }

    pub(crate) fn register_connection(&self, connection: &Arc<ConnectionInner>) {
        // ---
        let mut conns = self.inner.connections.lock();
        conns.retain(|w| w.strong_count() > 0);
        conns.push(Arc::downgrade(connection));
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until called with `false`.
    pub fn fail_all_connects(&self, fail: bool) {
        self.inner.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.inner.connects.lock().clone()
    }

    pub fn connect_attempt_count(&self) -> usize {
        self.inner.connects.lock().len()
    }

    /// Connections created and not yet closed or broken.
    pub fn open_connection_count(&self) -> usize {
        // ---
        self.live_connections()
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    /// Break every open connection. Exception listeners fire on a separate
    /// thread, as a real client library's reader thread would.
    pub fn kill_connections(&self) {
        // ---
        let conns = self.live_connections();
        tracing::info!(count = conns.len(), "sim killing connections");
        for conn in conns {
            conn.fail(BrokerError::ConnectionLost("connection reset by broker".into()));
        }
        self.wake_all();
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionInner>> {
        // ---
        self.inner
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    // -----------------------------------------------------------------------
    // XA
    // -----------------------------------------------------------------------

    pub(crate) fn record_xa(&self, xid: &Xid, op: XaOp) {
        self.inner.xa_log.lock().push((*xid, op));
    }

    /// Every XA call made against resources of this broker, in call order.
    pub fn xa_log(&self) -> Vec<(Xid, XaOp)> {
        self.inner.xa_log.lock().clone()
    }

    pub(crate) fn rm_id(&self) -> Uuid {
        self.inner.id
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

// ---

fn take_from(store: &mut Store, source: &Source, max: usize) -> Vec<Message> {
    // ---
    match store.messages_mut(source) {
        Some(queue) => {
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        }
        None => Vec::new(),
    }
}

pub(crate) fn durable_key(client_id: &str, name: &str) -> String {
    format!("{client_id}/{name}")
}

/// Absolute deadline for an optional timeout.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
