use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use parking_lot::Mutex;
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    AckMode,
    BrokerError,
    BrokerSession,
    ConsumerOptions,
    ConsumerPtr,
    Destination,
    DestinationKind,
    Message,
    MessageBody,
    ProducerPtr,
    Result,
    XaResource,
    Xid,
};

// ---

use super::broker::{SimBroker, Source, XaOp};
use super::connection::ConnectionInner;
use super::consumer::{SimConsumer, SimProducer};

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// State shared by a session and the consumers/producers it created.
pub(crate) struct SessionCore {
    // ---
    pub(crate) id: Uuid,
    pub(crate) conn: Arc<ConnectionInner>,
    transacted: bool,
    ack: AckMode,
    closed: AtomicBool,

    /// Sends held back until commit.
    pending: Mutex<Vec<(Destination, Message)>>,

    /// Received but not yet committed or acknowledged.
    unacked: Mutex<Vec<(Source, Message)>>,
}

// ---

impl SessionCore {
    // ---
    pub(crate) fn broker(&self) -> &SimBroker {
        &self.conn.broker
    }

    pub(crate) fn check(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!("session {}", self.id)));
        }
        self.conn.check_usable()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Track a received message until commit or acknowledgement.
    pub(crate) fn received(&self, source: &Source, message: &Message) {
        // ---
        if self.transacted || self.ack == AckMode::Client {
            self.unacked.lock().push((source.clone(), message.clone()));
        }
    }

    /// Publish now, or hold until commit in a transacted session.
    pub(crate) fn dispatch(&self, destination: &Destination, message: Message) -> Result<()> {
        // ---
        if self.transacted {
            self.pending.lock().push((destination.clone(), message));
            Ok(())
        } else {
            self.broker().publish(destination, message).map(|_| ())
        }
    }

    fn redeliver_unacked(&self) {
        // ---
        let unacked: Vec<_> = self.unacked.lock().drain(..).collect();
        for (source, message) in unacked {
            self.broker().requeue(&source, vec![message]);
        }
    }
}

// ---------------------------------------------------------------------------
// SimSession
// ---------------------------------------------------------------------------

pub struct SimSession {
    // ---
    core: Arc<SessionCore>,
}

// ---

impl SimSession {
    // ---
    pub(crate) fn new(conn: Arc<ConnectionInner>, transacted: bool, ack: AckMode) -> Self {
        // ---
        Self {
            core: Arc::new(SessionCore {
                id: Uuid::new_v4(),
                conn,
                transacted,
                ack,
                closed: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                unacked: Mutex::new(Vec::new()),
            }),
        }
    }

    fn client_id(&self) -> Result<String> {
        // ---
        self.core
            .conn
            .client_id()
            .ok_or_else(|| BrokerError::IllegalState("durable subscriptions require a client id".into()))
    }
}

// ---

impl BrokerSession for SimSession {
    // ---
    fn is_transacted(&self) -> bool {
        self.core.transacted
    }

    fn create_consumer(&self, destination: &Destination, options: &ConsumerOptions) -> Result<ConsumerPtr> {
        // ---
        self.core.check()?;
        let broker = self.core.broker();
        let source = match destination.kind {
            DestinationKind::Queue if options.is_topic_only() => {
                return Err(BrokerError::IllegalState(format!(
                    "subscription options are not valid on {destination}"
                )));
            }
            DestinationKind::Queue => Source::Queue(destination.name.clone()),
            DestinationKind::Topic => match &options.subscription {
                Some(sub) if sub.durable => {
                    let client_id = if sub.shared { String::from("shared") } else { self.client_id()? };
                    broker.subscribe_durable(&client_id, &sub.name, &destination.name)
                }
                _ => broker.subscribe(&destination.name),
            },
            DestinationKind::Any => {
                return Err(BrokerError::InvalidDestination(format!("{destination} is unresolved")));
            }
        };
        Ok(Arc::new(SimConsumer::new(self.core.clone(), source)))
    }

    fn create_producer(&self, destination: Option<&Destination>) -> Result<ProducerPtr> {
        // ---
        self.core.check()?;
        Ok(Arc::new(SimProducer::new(self.core.clone(), destination.cloned())))
    }

    fn browse(&self, queue: &Destination, _selector: Option<&str>) -> Result<Vec<Message>> {
        // ---
        self.core.check()?;
        if queue.kind != DestinationKind::Queue {
            return Err(BrokerError::InvalidDestination(format!("{queue} is not a queue")));
        }
        Ok(self.core.broker().snapshot(&queue.name))
    }

    fn create_message(&self, body: MessageBody) -> Result<Message> {
        // ---
        self.core.check()?;
        Ok(Message::new(body))
    }

    fn create_destination(&self, name: &str, kind: DestinationKind) -> Result<Destination> {
        // ---
        self.core.check()?;
        match kind {
            DestinationKind::Queue => Ok(Destination::queue(name)),
            DestinationKind::Topic => Ok(Destination::topic(name)),
            DestinationKind::Any => Err(BrokerError::InvalidDestination(format!(
                "`{name}` needs a queue or topic kind"
            ))),
        }
    }

    fn create_temporary(&self, kind: DestinationKind) -> Result<Destination> {
        // ---
        self.core.check()?;
        if kind == DestinationKind::Any {
            return Err(BrokerError::InvalidDestination("temporary destination needs a kind".into()));
        }
        Ok(self.core.broker().create_temporary(kind))
    }

    fn delete_temporary(&self, destination: &Destination) -> Result<()> {
        // ---
        self.core.check()?;
        self.core.broker().delete_temporary(destination)
    }

    fn unsubscribe(&self, subscription: &str) -> Result<()> {
        // ---
        self.core.check()?;
        let client_id = self.client_id()?;
        self.core.broker().unsubscribe(&client_id, subscription)
    }

    fn commit(&self) -> Result<()> {
        // ---
        self.core.check()?;
        if !self.core.transacted {
            return Err(BrokerError::IllegalState("commit on a non-transacted session".into()));
        }
        let pending: Vec<_> = self.core.pending.lock().drain(..).collect();
        for (destination, message) in pending {
            self.core.broker().publish(&destination, message)?;
        }
        self.core.unacked.lock().clear();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        // ---
        self.core.check()?;
        if !self.core.transacted {
            return Err(BrokerError::IllegalState("rollback on a non-transacted session".into()));
        }
        self.core.pending.lock().clear();
        self.core.redeliver_unacked();
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        // ---
        self.core.check()?;
        if self.core.transacted {
            return Err(BrokerError::IllegalState("recover on a transacted session".into()));
        }
        self.core.redeliver_unacked();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // ---
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.pending.lock().clear();
        self.core.redeliver_unacked();
        self.core.broker().wake_all();
        tracing::trace!(session = %self.core.id, "sim session closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimXaResource
// ---------------------------------------------------------------------------

/// XA resource that records every call in [`SimBroker::xa_log`].
pub struct SimXaResource {
    // ---
    broker: SimBroker,
    timeout: Mutex<Duration>,
}

// ---

impl SimXaResource {
    // ---
    pub(crate) fn new(broker: SimBroker) -> Self {
        // ---
        Self {
            broker,
            timeout: Mutex::new(Duration::ZERO),
        }
    }
}

// ---

impl XaResource for SimXaResource {
    // ---
    fn resource_manager_id(&self) -> Uuid {
        self.broker.rm_id()
    }

    fn start(&self, xid: &Xid) -> Result<()> {
        self.broker.record_xa(xid, XaOp::Start);
        Ok(())
    }

    fn end(&self, xid: &Xid, success: bool) -> Result<()> {
        self.broker.record_xa(xid, XaOp::End { success });
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<bool> {
        self.broker.record_xa(xid, XaOp::Prepare);
        Ok(false)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.broker.record_xa(xid, XaOp::Commit { one_phase });
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.broker.record_xa(xid, XaOp::Rollback);
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        self.broker.record_xa(xid, XaOp::Forget);
        Ok(())
    }

    fn recover(&self) -> Result<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn transaction_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool> {
        // ---
        *self.timeout.lock() = timeout;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
