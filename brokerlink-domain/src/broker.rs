//! Abstract broker client.
//!
//! Synchronous, error-signalling primitives the adapter sits on top of.
//! Nothing in this module talks to a network: implementations live in the
//! broker-specific client crates (and in `brokerlink-sim` for tests).
//!
//! # Design
//!
//! Every trait is `Send + Sync` and handed around as an `Arc<dyn ..>` so a
//! multiplexer, its handles, and the broker's own dispatch threads can share
//! the same objects. Methods take `&self`; implementations carry their own
//! interior synchronization. The adapter adds *serialization* on top, it
//! does not rely on the client for it.
//!
//! ```text
//!   ConnectionFactory ──create_connection──► BrokerConnection
//!                                               │
//!                     ┌─────────────────────────┼──────────────────────────┐
//!                     ▼                         ▼                          ▼
//!              BrokerSession            XaSession (+XaResource)   ConnectionConsumer
//!              │          │                                              │
//!              ▼          ▼                                              ▼
//!       MessageConsumer  MessageProducer                      ServerSessionSource
//!                                                              (implemented by the
//!                                                               adapter's pool)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::delivery::SendOptions;
use super::error::{BrokerError, Result};
use super::message::{Destination, DestinationKind, Message, MessageBody};

// ---------------------------------------------------------------------------
// Pointer aliases
// ---------------------------------------------------------------------------

pub type ConnectionFactoryPtr = Arc<dyn ConnectionFactory>;
pub type ConnectionPtr = Arc<dyn BrokerConnection>;
pub type SessionPtr = Arc<dyn BrokerSession>;
pub type ConsumerPtr = Arc<dyn MessageConsumer>;
pub type ProducerPtr = Arc<dyn MessageProducer>;
pub type XaResourcePtr = Arc<dyn XaResource>;
pub type ExceptionListenerPtr = Arc<dyn ExceptionListener>;
pub type ConnectionConsumerPtr = Box<dyn ConnectionConsumer>;
pub type ServerSessionPtr = Arc<dyn ServerSession>;
pub type ServerSessionSourcePtr = Arc<dyn ServerSessionSource>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a broker client supports, resolved once from the connection factory.
///
/// Replaces probing the client at runtime for optional entry points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    // ---
    /// Connections can create XA sessions.
    pub xa: bool,

    /// The factory can hand out combined connection+session contexts.
    pub context_api: bool,

    /// `create_session(SessionMode::Simplified)` is available.
    pub simplified_session: bool,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    // ---
    pub user: String,
    pub password: Option<String>,
}

// ---

impl Credentials {
    // ---
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        // ---
        Self {
            user: user.into(),
            password,
        }
    }
}

/// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session modes
// ---------------------------------------------------------------------------

/// Acknowledgement mode of a non-transacted session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AckMode {
    // ---
    #[default]
    Auto,
    Client,
    DupsOk,
}

// ---

impl AckMode {
    // ---
    /// Parse the operator spelling (`Auto-acknowledge`, `Dups-ok-acknowledge`,
    /// `Client-acknowledge`), case-insensitively.
    pub fn parse(s: &str) -> Result<Self> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "auto-acknowledge" | "auto_acknowledge" | "auto" => Ok(AckMode::Auto),
            "dups-ok-acknowledge" | "dups_ok_acknowledge" | "dups-ok" => Ok(AckMode::DupsOk),
            "client-acknowledge" | "client_acknowledge" | "client" => Ok(AckMode::Client),
            other => Err(BrokerError::InvalidConfig {
                property: "acknowledgeMode",
                reason: format!("unsupported acknowledgement mode `{other}`"),
            }),
        }
    }
}

/// How a session is created on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    // ---
    /// No-argument creation; the client derives the mode from its context.
    Simplified,
    Transacted,
    Acknowledge(AckMode),
}

// ---------------------------------------------------------------------------
// Consumer options
// ---------------------------------------------------------------------------

/// A named topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    // ---
    pub name: String,
    pub durable: bool,
    pub shared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    // ---
    pub selector: Option<String>,
    pub no_local: bool,

    /// `None` = an ordinary non-durable consumer.
    pub subscription: Option<Subscription>,
}

// ---

impl ConsumerOptions {
    // ---
    pub fn with_selector(selector: Option<String>) -> Self {
        // ---
        Self {
            selector,
            ..Self::default()
        }
    }

    /// `true` when the consumer needs topic semantics.
    pub fn is_topic_only(&self) -> bool {
        self.subscription.is_some() || self.no_local
    }
}

// ---------------------------------------------------------------------------
// XA
// ---------------------------------------------------------------------------

/// Global transaction branch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xid(pub Uuid);

// ---

impl Xid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Xid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// Two-phase-commit participant exposed by an XA session.
pub trait XaResource: Send + Sync {
    // ---
    /// Identity of the resource manager behind this resource.
    fn resource_manager_id(&self) -> Uuid;

    fn start(&self, xid: &Xid) -> Result<()>;

    /// `success == false` marks the branch rollback-only.
    fn end(&self, xid: &Xid, success: bool) -> Result<()>;

    /// Returns `true` when the branch is read-only and needs no commit.
    fn prepare(&self, xid: &Xid) -> Result<bool>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    fn rollback(&self, xid: &Xid) -> Result<()>;

    fn forget(&self, xid: &Xid) -> Result<()>;

    /// Prepared branches awaiting an outcome.
    fn recover(&self) -> Result<Vec<Xid>>;

    fn transaction_timeout(&self) -> Duration;

    /// Returns `false` if the resource ignores transaction timeouts.
    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool>;

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_manager_id() == other.resource_manager_id()
    }
}

/// A session paired with its XA resource.
#[derive(Clone)]
pub struct XaSession {
    // ---
    pub session: SessionPtr,
    pub resource: XaResourcePtr,
}

// ---------------------------------------------------------------------------
// Consumers / producers
// ---------------------------------------------------------------------------

pub trait MessageConsumer: Send + Sync {
    // ---
    /// `None` timeout blocks until a message arrives or the consumer closes.
    /// Returns `Ok(None)` on timeout or close.
    fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>>;

    fn receive_no_wait(&self) -> Result<Option<Message>>;

    fn close(&self) -> Result<()>;
}

pub trait MessageProducer: Send + Sync {
    // ---
    /// Send `message` to `destination`, or to the producer's own destination
    /// when `None`. Returns the broker-assigned message id.
    fn send(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: &SendOptions,
    ) -> Result<String>;

    fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// BrokerSession
// ---------------------------------------------------------------------------

pub trait BrokerSession: Send + Sync {
    // ---
    fn is_transacted(&self) -> bool;

    fn create_consumer(&self, destination: &Destination, options: &ConsumerOptions) -> Result<ConsumerPtr>;

    fn create_producer(&self, destination: Option<&Destination>) -> Result<ProducerPtr>;

    /// Snapshot of the messages currently on a queue.
    fn browse(&self, queue: &Destination, selector: Option<&str>) -> Result<Vec<Message>>;

    fn create_message(&self, body: MessageBody) -> Result<Message>;

    /// Look up a destination by its provider name. `kind` must not be `Any`.
    fn create_destination(&self, name: &str, kind: DestinationKind) -> Result<Destination>;

    fn create_temporary(&self, kind: DestinationKind) -> Result<Destination>;

    fn delete_temporary(&self, destination: &Destination) -> Result<()>;

    fn unsubscribe(&self, subscription: &str) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Redeliver every unacknowledged message.
    fn recover(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Listener / server-session plumbing
// ---------------------------------------------------------------------------

/// Receives asynchronous connection failures.
///
/// Invoked on a client-owned thread. Implementations must not block.
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: BrokerError);
}

/// One pooled delivery unit, loaded with a batch by the broker.
pub trait ServerSession: Send + Sync {
    // ---
    /// Deliver `batch` asynchronously. On `Err` the broker still owns the
    /// messages and the server session has already been returned to its pool.
    fn start(self: Arc<Self>, batch: Vec<Message>) -> Result<()>;
}

/// Where the broker's dispatch thread obtains server sessions.
pub trait ServerSessionSource: Send + Sync {
    // ---
    /// Block until a server session is available.
    fn server_session(&self) -> Result<ServerSessionPtr>;
}

/// Broker-driven consumer feeding a [`ServerSessionSource`].
pub trait ConnectionConsumer: Send + Sync {
    fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// BrokerConnection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    // ---
    pub product_name: String,
    pub product_version: String,
}

pub trait BrokerConnection: Send + Sync {
    // ---
    fn client_id(&self) -> Option<String>;

    /// Must be called before the first session is created.
    fn set_client_id(&self, client_id: &str) -> Result<()>;

    fn metadata(&self) -> ConnectionMetadata;

    fn create_session(&self, mode: SessionMode) -> Result<SessionPtr>;

    /// Fails with [`BrokerError::NotSupported`] on a non-XA connection.
    fn create_xa_session(&self) -> Result<XaSession>;

    fn create_connection_consumer(
        &self,
        destination: &Destination,
        options: &ConsumerOptions,
        source: ServerSessionSourcePtr,
        max_messages: usize,
    ) -> Result<ConnectionConsumerPtr>;

    /// Replace the single exception listener. `None` unsets it.
    fn set_exception_listener(&self, listener: Option<ExceptionListenerPtr>) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ConnectionFactory
// ---------------------------------------------------------------------------

pub trait ConnectionFactory: Send + Sync {
    // ---
    fn capabilities(&self) -> Capabilities;

    fn create_connection(&self, credentials: Option<&Credentials>) -> Result<ConnectionPtr>;

    /// Fails with [`BrokerError::NotSupported`] unless `capabilities().xa`.
    fn create_xa_connection(&self, credentials: Option<&Credentials>) -> Result<ConnectionPtr>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
