//! [`SessionHandle`] — the logical session an application holds.
//!
//! # Design
//!
//! A handle is a cheap, cloneable view over `HandleShared`, which the owning
//! [`ConnectionMultiplexer`] also keeps in its arena. Every operation that
//! touches the physical session resolves the current multiplexer, takes its
//! lock for exactly the duration of the call and releases it on return,
//! success or failure:
//!
//! ```text
//!   handle.commit()
//!     ├── multiplexer()  Weak → Arc, or Closed
//!     ├── lock()         bounded by the factory lock timeout
//!     ├── session.commit()
//!     └── guard drop     release
//! ```
//!
//! Pure factory calls (`create_message`, `create_queue`, `create_topic`) skip
//! the lock. Consumers and producers handed out are wrapped so their calls
//! lock the same way and are closed with the handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ---

use parking_lot::{Mutex, RwLock};

// ---

use brokerlink_domain::{
    // ---
    AckMode,
    BrokerError,
    ConnectionRequestInfo,
    ConsumerOptions,
    ConsumerPtr,
    Destination,
    DestinationKind,
    Message,
    MessageBody,
    ProducerPtr,
    Result,
    SendOptions,
    SessionPtr,
    Subscription,
};

// ---

use super::{ConnectionEventKind, ConnectionMultiplexer, HandleId};

/// How long a listener thread blocks in one receive before re-checking.
const LISTENER_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// HandleShared
// ---------------------------------------------------------------------------

pub(crate) struct HandleShared {
    // ---
    id: HandleId,
    info: ConnectionRequestInfo,
    mc: RwLock<Option<Weak<ConnectionMultiplexer>>>,
    consumers: Mutex<Vec<ConsumerPtr>>,
    producers: Mutex<Vec<ProducerPtr>>,
    temporaries: Mutex<Vec<Destination>>,
    closed: AtomicBool,
}

// ---

impl HandleShared {
    // ---
    fn multiplexer(&self) -> Result<Arc<ConnectionMultiplexer>> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!("session handle {} is closed", self.id)));
        }
        self.mc
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| BrokerError::closed("session handle is not associated with a managed connection"))
    }

    /// Called by the multiplexer on destroy or cleanup.
    pub(crate) fn invalidate(&self) {
        // ---
        *self.mc.write() = None;
        self.consumers.lock().clear();
        self.producers.lock().clear();
        self.temporaries.lock().clear();
    }

    /// Point at `target`, detaching from the previous multiplexer.
    pub(crate) fn rehome(&self, target: Weak<ConnectionMultiplexer>) {
        // ---
        let previous = self.mc.write().replace(target.clone());
        if let Some(old) = previous.and_then(|w| w.upgrade()) {
            if !Weak::ptr_eq(&Arc::downgrade(&old), &target) {
                old.detach(self.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionHandle {
    // ---
    shared: Arc<HandleShared>,
}

// ---

impl SessionHandle {
    // ---
    pub(crate) fn new(info: ConnectionRequestInfo, mc: Weak<ConnectionMultiplexer>) -> Self {
        // ---
        Self {
            shared: Arc::new(HandleShared {
                id: HandleId::new(),
                info,
                mc: RwLock::new(Some(mc)),
                consumers: Mutex::new(Vec::new()),
                producers: Mutex::new(Vec::new()),
                temporaries: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn info(&self) -> &ConnectionRequestInfo {
        &self.shared.info
    }

    pub fn is_transacted(&self) -> bool {
        self.shared.info.transacted
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.info.ack_mode
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// `true` when no multiplexer currently backs this handle.
    pub fn is_detached(&self) -> bool {
        self.shared.mc.read().as_ref().and_then(Weak::upgrade).is_none()
    }

    /// The multiplexer currently backing this handle.
    pub fn multiplexer(&self) -> Result<Arc<ConnectionMultiplexer>> {
        self.shared.multiplexer()
    }

    // -----------------------------------------------------------------------
    // Call plumbing
    // -----------------------------------------------------------------------

    fn locked<T>(&self, f: impl FnOnce(&SessionPtr) -> Result<T>) -> Result<T> {
        // ---
        let mc = self.shared.multiplexer()?;
        let _guard = mc.lock()?;
        let session = mc.session()?;
        f(&session)
    }

    fn unlocked<T>(&self, f: impl FnOnce(&SessionPtr) -> Result<T>) -> Result<T> {
        // ---
        let mc = self.shared.multiplexer()?;
        let session = mc.session()?;
        f(&session)
    }

    fn require_topic_ops(&self, what: &str) -> Result<()> {
        // ---
        if self.shared.info.connection_type.allows_topic_ops() {
            return Ok(());
        }
        Err(BrokerError::IllegalState(format!("cannot {what} from a queue session")))
    }

    fn require_queue_ops(&self, what: &str) -> Result<()> {
        // ---
        if self.shared.info.connection_type.allows_queue_ops() {
            return Ok(());
        }
        Err(BrokerError::IllegalState(format!("cannot {what} from a topic session")))
    }

    // -----------------------------------------------------------------------
    // Consumers and producers
    // -----------------------------------------------------------------------

    pub fn create_consumer(&self, destination: &Destination, options: ConsumerOptions) -> Result<HandleConsumer> {
        // ---
        if options.is_topic_only() || destination.kind == DestinationKind::Topic {
            self.require_topic_ops("create a topic subscriber")?;
        }
        if destination.kind == DestinationKind::Queue {
            self.require_queue_ops("create a queue receiver")?;
        }
        tracing::trace!(handle = %self.id(), %destination, ?options, "create consumer");

        let consumer = self.locked(|s| s.create_consumer(destination, &options))?;
        self.shared.consumers.lock().push(consumer.clone());
        Ok(HandleConsumer::new(self.clone(), consumer))
    }

    pub fn create_durable_subscriber(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<String>,
        no_local: bool,
    ) -> Result<HandleConsumer> {
        // ---
        self.require_topic_ops("create a durable subscriber")?;
        let options = ConsumerOptions {
            selector,
            no_local,
            subscription: Some(Subscription {
                name: name.to_string(),
                durable: true,
                shared: false,
            }),
        };
        self.create_consumer(topic, options)
    }

    pub fn create_shared_consumer(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<String>,
    ) -> Result<HandleConsumer> {
        // ---
        self.require_topic_ops("create a shared consumer")?;
        let options = ConsumerOptions {
            selector,
            no_local: false,
            subscription: Some(Subscription {
                name: name.to_string(),
                durable: false,
                shared: true,
            }),
        };
        self.create_consumer(topic, options)
    }

    pub fn create_shared_durable_consumer(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<String>,
    ) -> Result<HandleConsumer> {
        // ---
        self.require_topic_ops("create a shared durable consumer")?;
        let options = ConsumerOptions {
            selector,
            no_local: false,
            subscription: Some(Subscription {
                name: name.to_string(),
                durable: true,
                shared: true,
            }),
        };
        self.create_consumer(topic, options)
    }

    /// `None` creates an unidentified producer that names the destination on
    /// each send.
    pub fn create_producer(&self, destination: Option<&Destination>) -> Result<HandleProducer> {
        // ---
        if let Some(d) = destination {
            match d.kind {
                DestinationKind::Queue => self.require_queue_ops("create a queue sender")?,
                DestinationKind::Topic => self.require_topic_ops("create a topic publisher")?,
                DestinationKind::Any => {}
            }
        }
        let producer = self.locked(|s| s.create_producer(destination))?;
        self.shared.producers.lock().push(producer.clone());
        Ok(HandleProducer {
            handle: self.clone(),
            producer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn browse(&self, queue: &Destination, selector: Option<&str>) -> Result<Vec<Message>> {
        // ---
        self.require_queue_ops("create a browser")?;
        self.locked(|s| s.browse(queue, selector))
    }

    // -----------------------------------------------------------------------
    // Destinations and messages
    // -----------------------------------------------------------------------

    pub fn create_message(&self, body: MessageBody) -> Result<Message> {
        self.unlocked(|s| s.create_message(body))
    }

    pub fn create_queue(&self, name: &str) -> Result<Destination> {
        // ---
        self.require_queue_ops("create a queue")?;
        self.unlocked(|s| s.create_destination(name, DestinationKind::Queue))
    }

    pub fn create_topic(&self, name: &str) -> Result<Destination> {
        // ---
        self.require_topic_ops("create a topic")?;
        self.unlocked(|s| s.create_destination(name, DestinationKind::Topic))
    }

    pub fn create_temporary_queue(&self) -> Result<Destination> {
        // ---
        self.require_queue_ops("create a temporary queue")?;
        self.create_temporary(DestinationKind::Queue)
    }

    pub fn create_temporary_topic(&self) -> Result<Destination> {
        // ---
        self.require_topic_ops("create a temporary topic")?;
        self.create_temporary(DestinationKind::Topic)
    }

    fn create_temporary(&self, kind: DestinationKind) -> Result<Destination> {
        // ---
        let temp = self.locked(|s| s.create_temporary(kind))?;
        self.shared.temporaries.lock().push(temp.clone());
        tracing::trace!(handle = %self.id(), destination = %temp, "temporary created");
        Ok(temp)
    }

    pub fn unsubscribe(&self, subscription: &str) -> Result<()> {
        // ---
        self.require_topic_ops("unsubscribe")?;
        self.locked(|s| s.unsubscribe(subscription))
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn commit(&self) -> Result<()> {
        // ---
        self.locked(|s| {
            if !self.is_transacted() {
                return Err(BrokerError::IllegalState("not a transacted session".into()));
            }
            tracing::trace!(handle = %self.id(), "commit");
            s.commit()
        })
    }

    pub fn rollback(&self) -> Result<()> {
        // ---
        self.locked(|s| {
            if !self.is_transacted() {
                return Err(BrokerError::IllegalState("not a transacted session".into()));
            }
            tracing::trace!(handle = %self.id(), "rollback");
            s.rollback()
        })
    }

    pub fn recover(&self) -> Result<()> {
        // ---
        self.locked(|s| {
            if self.is_transacted() {
                return Err(BrokerError::IllegalState("transacted session".into()));
            }
            s.recover()
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start delivery on the backing connection.
    pub fn start(&self) -> Result<()> {
        self.shared.multiplexer()?.start()
    }

    /// Move this handle onto `mc`.
    pub fn reassociate(&self, mc: &ConnectionMultiplexer) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(BrokerError::closed(format!("session handle {} is closed", self.id())));
        }
        mc.associate(self)
    }

    /// Close the handle and everything created through it. Failures are
    /// logged and never abort the teardown. A second call is a no-op.
    pub fn close(&self) {
        // ---
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mc = self.shared.mc.write().take().and_then(|w| w.upgrade());
        let Some(mc) = mc else {
            self.shared.invalidate();
            tracing::debug!(handle = %self.id(), "closed detached session handle");
            return;
        };

        if let Err(e) = mc.stop() {
            tracing::trace!(handle = %self.id(), "ignored error stopping connection: {e}");
        }

        let mut failures = 0usize;
        for consumer in self.shared.consumers.lock().drain(..) {
            if let Err(e) = consumer.close() {
                tracing::debug!(handle = %self.id(), "error closing consumer: {e}");
                failures += 1;
            }
        }
        for producer in self.shared.producers.lock().drain(..) {
            if let Err(e) = producer.close() {
                tracing::debug!(handle = %self.id(), "error closing producer: {e}");
                failures += 1;
            }
        }

        let temporaries: Vec<_> = self.shared.temporaries.lock().drain(..).collect();
        if mc.settings().delete_temporary_destinations {
            if let Ok(session) = mc.session() {
                for temp in temporaries {
                    if let Err(e) = session.delete_temporary(&temp) {
                        tracing::debug!(handle = %self.id(), destination = %temp, "error deleting temporary: {e}");
                        failures += 1;
                    }
                }
            }
        }

        mc.detach(self.id());
        mc.send_event(ConnectionEventKind::Closed { handle: self.id() });
        tracing::debug!(handle = %self.id(), mc = %mc.id(), failures, "session handle closed");
    }

    fn untrack_consumer(&self, consumer: &ConsumerPtr) {
        self.shared.consumers.lock().retain(|c| !Arc::ptr_eq(c, consumer));
    }

    fn untrack_producer(&self, producer: &ProducerPtr) {
        self.shared.producers.lock().retain(|p| !Arc::ptr_eq(p, producer));
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HandleConsumer
// ---------------------------------------------------------------------------

struct ConsumerInner {
    // ---
    handle: SessionHandle,
    consumer: ConsumerPtr,
    closed: AtomicBool,
}

impl ConsumerInner {
    // ---
    fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("consumer"));
        }
        self.handle.locked(|_| self.consumer.receive(timeout))
    }
}

/// Consumer whose calls run under the owning multiplexer's lock.
pub struct HandleConsumer {
    // ---
    inner: Arc<ConsumerInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl HandleConsumer {
    // ---
    fn new(handle: SessionHandle, consumer: ConsumerPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(ConsumerInner {
                handle,
                consumer,
                closed: AtomicBool::new(false),
            }),
            listener: Mutex::new(None),
        }
    }

    /// `None` blocks until a message arrives or the consumer closes.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.inner.receive(timeout)
    }

    pub fn receive_no_wait(&self) -> Result<Option<Message>> {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("consumer"));
        }
        self.inner.handle.locked(|_| self.inner.consumer.receive_no_wait())
    }

    /// Push delivery. Refused in strict mode, where the container owns
    /// asynchronous delivery.
    pub fn set_message_listener(&self, listener: impl Fn(Message) + Send + 'static) -> Result<()> {
        // ---
        let mc = self.inner.handle.multiplexer()?;
        if mc.settings().strict {
            return Err(BrokerError::IllegalState(
                "message listeners are not allowed inside the container".into(),
            ));
        }

        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(BrokerError::IllegalState("a message listener is already set".into()));
        }

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("listener-{}", &inner.handle.id().to_string()[..8]))
            .spawn(move || {
                // ---
                while !inner.closed.load(Ordering::SeqCst) {
                    match inner.receive(Some(LISTENER_POLL)) {
                        Ok(Some(message)) => listener(message),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(handle = %inner.handle.id(), "message listener stopped: {e}");
                            break;
                        }
                    }
                }
            })?;
        *slot = Some(spawned);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.handle.untrack_consumer(&self.inner.consumer);
        let result = self.inner.consumer.close();

        if let Some(listener) = self.listener.lock().take() {
            if listener.thread().id() != thread::current().id() && listener.join().is_err() {
                tracing::warn!(handle = %self.inner.handle.id(), "message listener panicked");
            }
        }
        result
    }
}

impl Drop for HandleConsumer {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// HandleProducer
// ---------------------------------------------------------------------------

/// Producer whose sends run under the owning multiplexer's lock.
pub struct HandleProducer {
    // ---
    handle: SessionHandle,
    producer: ProducerPtr,
    closed: AtomicBool,
}

impl HandleProducer {
    // ---
    /// Returns the broker-assigned message id.
    pub fn send(&self, destination: Option<&Destination>, message: Message, options: &SendOptions) -> Result<String> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("producer"));
        }
        self.handle.locked(|_| self.producer.send(destination, message, options))
    }

    pub fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle.untrack_producer(&self.producer);
        self.producer.close()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use brokerlink_domain::{
        // ---
        AckMode,
        BrokerError,
        ConnectionFactoryPtr,
        ConnectionRequestInfo,
        ConnectionType,
        Destination,
        FactorySettings,
        Message,
        SendOptions,
    };
    use brokerlink_sim::{SimBroker, SimConnectionFactory};

    use crate::{ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ConnectionMultiplexer};

    fn open_with(broker: &SimBroker, info: ConnectionRequestInfo, settings: FactorySettings) -> Arc<ConnectionMultiplexer> {
        // ---
        let factory: ConnectionFactoryPtr = Arc::new(SimConnectionFactory::new(broker.clone()));
        ConnectionMultiplexer::open(&factory, Arc::new(settings), info).unwrap()
    }

    fn open(broker: &SimBroker, info: ConnectionRequestInfo) -> Arc<ConnectionMultiplexer> {
        // ---
        let settings = FactorySettings {
            lock_timeout: Some(Duration::from_secs(5)),
            ..FactorySettings::default()
        };
        open_with(broker, info, settings)
    }

    fn info(transacted: bool, kind: ConnectionType) -> ConnectionRequestInfo {
        ConnectionRequestInfo::new(transacted, AckMode::Auto, kind)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ConnectionEvent>>);

    impl ConnectionEventListener for Recorder {
        fn connection_event(&self, event: &ConnectionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    /// Many threads on many handles of one multiplexer: every send lands
    /// and the lock is never held concurrently.
    #[test]
    fn concurrent_handles_share_one_connection() {
        // ---
        const THREADS: usize = 6;
        const SENDS: usize = 25;

        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Agnostic));
        let barrier = Arc::new(Barrier::new(THREADS));
        let inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let handle = mc.get_connection(None, None).unwrap();
                let (barrier, inside, mc) = (barrier.clone(), inside.clone(), mc.clone());
                thread::spawn(move || {
                    let producer = handle.create_producer(Some(&Destination::queue("q"))).unwrap();
                    barrier.wait();
                    for i in 0..SENDS {
                        let _g = mc.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        producer.send(None, Message::text(format!("m{i}")), &SendOptions::default()).unwrap();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                    handle.close();
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(broker.queue_depth("q"), THREADS * SENDS);
        assert_eq!(broker.open_connection_count(), 1);
        assert_eq!(mc.handle_count(), 0);
        assert!(!mc.connection_lock().is_locked());
    }

    #[test]
    fn queue_session_rejects_topic_operations() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Queue));
        let handle = mc.get_connection(None, None).unwrap();

        let topic = Destination::topic("news");
        for err in [
            handle.create_durable_subscriber(&topic, "sub", None, false).err(),
            handle.create_topic("news").err(),
            handle.unsubscribe("sub").err(),
            handle.create_temporary_topic().err(),
        ] {
            assert!(matches!(err, Some(BrokerError::IllegalState(_))), "got {err:?}");
        }
        assert!(handle.create_queue("orders").is_ok());
    }

    #[test]
    fn topic_session_rejects_queue_operations() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Topic));
        let handle = mc.get_connection(None, None).unwrap();

        assert!(matches!(handle.browse(&Destination::queue("q"), None), Err(BrokerError::IllegalState(_))));
        assert!(matches!(handle.create_temporary_queue(), Err(BrokerError::IllegalState(_))));
        assert!(handle.create_topic("news").is_ok());
    }

    #[test]
    fn commit_requires_transacted_and_recover_forbids_it() {
        // ---
        let broker = SimBroker::default();
        let plain_mc = open(&broker, info(false, ConnectionType::Agnostic));
        let plain = plain_mc.get_connection(None, None).unwrap();
        assert!(matches!(plain.commit(), Err(BrokerError::IllegalState(_))));
        assert!(matches!(plain.rollback(), Err(BrokerError::IllegalState(_))));
        assert!(plain.recover().is_ok());

        let settings = FactorySettings {
            lock_timeout: Some(Duration::from_secs(5)),
            ..FactorySettings::default()
        };
        let non_xa = SimBroker::new(brokerlink_sim::SimConfig::non_xa());
        let tx_mc = open_with(&non_xa, info(true, ConnectionType::Agnostic), settings);
        let tx = tx_mc.get_connection(None, None).unwrap();
        assert!(matches!(tx.recover(), Err(BrokerError::IllegalState(_))));
        assert!(tx.commit().is_ok());
    }

    #[test]
    fn transacted_send_is_visible_only_after_commit() {
        // ---
        let broker = SimBroker::new(brokerlink_sim::SimConfig::non_xa());
        let mc = open(&broker, info(true, ConnectionType::Agnostic));
        let handle = mc.get_connection(None, None).unwrap();
        let producer = handle.create_producer(Some(&Destination::queue("q"))).unwrap();

        producer.send(None, Message::text("a"), &SendOptions::default()).unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        handle.commit().unwrap();
        assert_eq!(broker.queue_depth("q"), 1);

        producer.send(None, Message::text("b"), &SendOptions::default()).unwrap();
        handle.rollback().unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[test]
    fn close_releases_everything_and_emits_event() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Agnostic));
        let recorder = Arc::new(Recorder::default());
        mc.add_event_listener(recorder.clone());

        let handle = mc.get_connection(None, None).unwrap();
        let consumer = handle.create_consumer(&Destination::queue("q"), Default::default()).unwrap();
        handle.create_temporary_queue().unwrap();
        assert_eq!(broker.temporary_count(), 1);

        handle.close();
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(broker.temporary_count(), 0);
        assert_eq!(mc.handle_count(), 0);
        assert!(consumer.receive_no_wait().unwrap_err().is_closed());
        assert!(handle.create_message(Default::default()).unwrap_err().is_closed());

        let events = recorder.0.lock().clone();
        assert_eq!(events.len(), 1, "close twice must emit one event");
        assert_eq!(events[0].kind, ConnectionEventKind::Closed { handle: handle.id() });
    }

    #[test]
    fn temporaries_survive_close_when_deletion_is_off() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings {
            delete_temporary_destinations: false,
            ..FactorySettings::default()
        };
        let mc = open_with(&broker, info(false, ConnectionType::Agnostic), settings);
        let handle = mc.get_connection(None, None).unwrap();
        handle.create_temporary_topic().unwrap();
        handle.close();
        assert_eq!(broker.temporary_count(), 1);
    }

    #[test]
    fn reassociate_moves_handle_between_multiplexers() {
        // ---
        let broker = SimBroker::default();
        let first = open(&broker, info(false, ConnectionType::Agnostic));
        let second = open(&broker, info(false, ConnectionType::Agnostic));
        let handle = first.get_connection(None, None).unwrap();

        handle.reassociate(&second).unwrap();
        assert_eq!(first.handle_count(), 0);
        assert_eq!(second.handle_count(), 1);
        assert_eq!(handle.multiplexer().unwrap().id(), second.id());

        handle.close();
        assert!(handle.reassociate(&first).unwrap_err().is_closed());
    }

    /// A handle orphaned by `destroy` fails every call until it is moved
    /// onto a live multiplexer.
    #[test]
    fn destroyed_handle_recovers_through_reassociate() {
        // ---
        let broker = SimBroker::default();
        let doomed = open(&broker, info(false, ConnectionType::Agnostic));
        let handle = doomed.get_connection(None, None).unwrap();
        doomed.destroy();

        assert!(handle.is_detached());
        assert!(!handle.is_closed());
        assert_eq!(doomed.handle_count(), 0);
        for err in [
            handle.create_queue("q").err(),
            handle.create_producer(Some(&Destination::queue("q"))).err(),
            handle.create_message(Default::default()).err(),
            handle.start().err(),
        ] {
            assert!(err.as_ref().is_some_and(BrokerError::is_closed), "got {err:?}");
        }
        assert!(handle.reassociate(&doomed).unwrap_err().is_closed());

        let fresh = open(&broker, info(false, ConnectionType::Agnostic));
        handle.reassociate(&fresh).unwrap();
        assert!(!handle.is_detached());
        assert_eq!(fresh.handle_count(), 1);

        let producer = handle.create_producer(Some(&Destination::queue("q"))).unwrap();
        producer.send(None, Message::text("back"), &SendOptions::default()).unwrap();
        assert_eq!(broker.queue_depth("q"), 1);

        handle.start().unwrap();
        let consumer = handle.create_consumer(&Destination::queue("q"), Default::default()).unwrap();
        let got = consumer.receive(Some(Duration::from_secs(2))).unwrap().unwrap();
        assert_eq!(got.as_text(), Some("back"));
        handle.close();
    }

    #[test]
    fn handle_without_multiplexer_reports_closed() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Agnostic));
        let handle = mc.get_connection(None, None).unwrap();
        assert_eq!(broker.open_connection_count(), 1);
        drop(mc);
        assert_eq!(broker.open_connection_count(), 0, "drop closes the connection");

        let err = handle.create_queue("q").unwrap_err();
        assert!(err.is_closed(), "got {err}");
        assert!(err.to_string().contains("not associated"));
    }

    #[test]
    fn receive_holds_the_lock_and_delivers() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Agnostic));
        let handle = mc.get_connection(None, None).unwrap();
        handle.start().unwrap();

        let consumer = handle.create_consumer(&Destination::queue("q"), Default::default()).unwrap();
        assert_eq!(consumer.receive(Some(Duration::from_millis(20))).unwrap(), None);

        broker.send_text("q", "hello").unwrap();
        let got = consumer.receive(Some(Duration::from_secs(2))).unwrap().unwrap();
        assert_eq!(got.as_text(), Some("hello"));
        assert!(!mc.connection_lock().is_locked());
    }

    #[test]
    fn message_listener_is_refused_in_strict_mode() {
        // ---
        let broker = SimBroker::default();
        let mc = open(&broker, info(false, ConnectionType::Agnostic));
        let handle = mc.get_connection(None, None).unwrap();
        let consumer = handle.create_consumer(&Destination::queue("q"), Default::default()).unwrap();
        let err = consumer.set_message_listener(|_| {}).unwrap_err();
        assert!(matches!(err, BrokerError::IllegalState(_)));
    }

    #[test]
    fn message_listener_polls_when_not_strict() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings {
            strict: false,
            ..FactorySettings::default()
        };
        let mc = open_with(&broker, info(false, ConnectionType::Agnostic), settings);
        let handle = mc.get_connection(None, None).unwrap();
        handle.start().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let consumer = handle.create_consumer(&Destination::queue("q"), Default::default()).unwrap();
        {
            let seen = seen.clone();
            consumer.set_message_listener(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        broker.send_text("q", "one").unwrap();
        broker.send_text("q", "two").unwrap();
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        consumer.close().unwrap();
    }
}
