//! Typed configuration for outbound factories and inflow activations.
//!
//! Defaults match what operators expect from a stock deployment: a 60 s
//! lock wait, strict managed-environment checks, a 10 s reconnect interval
//! retried forever, and up to 15 delivery sessions per activation.

use std::time::Duration;

use super::broker::{AckMode, Credentials};
use super::endpoint::{parse_directory_parameters, DirectoryParameters};
use super::error::{BrokerError, Result};
use super::message::DestinationKind;

// ---------------------------------------------------------------------------
// ConnectionType
// ---------------------------------------------------------------------------

/// Which operations a handle allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    // ---
    /// Point-to-point only; topic operations are rejected.
    Queue,

    /// Publish/subscribe only; queue operations are rejected.
    Topic,

    /// Both.
    #[default]
    Agnostic,

    /// Combined connection+session context; as permissive as `Agnostic`.
    Context,
}

// ---

impl ConnectionType {
    // ---
    /// Parse an operator-supplied session default type. Unknown values fall
    /// back to `Agnostic`.
    pub fn parse(s: &str) -> Self {
        // ---
        let lower = s.trim().to_ascii_lowercase();
        if lower == "queue" || lower.ends_with(".queue") {
            ConnectionType::Queue
        } else if lower == "topic" || lower.ends_with(".topic") {
            ConnectionType::Topic
        } else if lower == "context" || lower.ends_with(".jmscontext") {
            ConnectionType::Context
        } else {
            ConnectionType::Agnostic
        }
    }

    pub fn allows_topic_ops(self) -> bool {
        self != ConnectionType::Queue
    }

    pub fn allows_queue_ops(self) -> bool {
        self != ConnectionType::Topic
    }
}

// ---------------------------------------------------------------------------
// FactorySettings
// ---------------------------------------------------------------------------

/// Settings of one managed connection factory.
#[derive(Debug, Clone)]
pub struct FactorySettings {
    // ---
    /// Directory name of the broker connection factory.
    pub connection_factory: String,

    pub directory_parameters: DirectoryParameters,

    pub connection_type: ConnectionType,

    /// Default credentials used when a request carries none.
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,

    /// Multiplexer lock wait. `None` = block indefinitely.
    pub lock_timeout: Option<Duration>,

    /// Reject calls that are illegal inside a managed environment.
    pub strict: bool,

    /// Use simplified session creation when the client supports it.
    pub api_2_0: bool,

    /// Delete a handle's temporary destinations when it closes.
    pub delete_temporary_destinations: bool,
}

// ---

impl Default for FactorySettings {
    fn default() -> Self {
        // ---
        Self {
            connection_factory: String::new(),
            directory_parameters: DirectoryParameters::new(),
            connection_type: ConnectionType::Agnostic,
            user: None,
            password: None,
            client_id: None,
            lock_timeout: Some(Duration::from_secs(60)),
            strict: true,
            api_2_0: true,
            delete_temporary_destinations: true,
        }
    }
}

// ---

impl FactorySettings {
    // ---
    /// Convert the operator's `lockTimeoutSeconds`; zero or negative blocks
    /// indefinitely.
    pub fn lock_timeout_from_secs(secs: i64) -> Option<Duration> {
        // ---
        if secs <= 0 {
            None
        } else {
            Some(Duration::from_secs(secs as u64))
        }
    }

    /// Parse `"k=v;k2=v2"` into `directory_parameters`.
    pub fn with_directory_parameters(mut self, raw: &str) -> Result<Self> {
        // ---
        self.directory_parameters = parse_directory_parameters(raw)?;
        Ok(self)
    }

    /// The attributes that make two factories interchangeable for matching.
    pub fn identity(&self) -> FactoryIdentity {
        // ---
        FactoryIdentity {
            user: self.user.clone(),
            password: self.password.clone(),
            connection_type: self.connection_type,
        }
    }
}

/// Two factories with equal identities may share physical connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactoryIdentity {
    // ---
    pub user: Option<String>,
    pub password: Option<String>,
    pub connection_type: ConnectionType,
}

// ---------------------------------------------------------------------------
// ConnectionRequestInfo
// ---------------------------------------------------------------------------

/// The per-request configuration a multiplexer is created for.
///
/// Equality covers every field and is what pool matching compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRequestInfo {
    // ---
    pub transacted: bool,
    pub ack_mode: AckMode,
    pub connection_type: ConnectionType,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
}

// ---

impl ConnectionRequestInfo {
    // ---
    pub fn new(transacted: bool, ack_mode: AckMode, connection_type: ConnectionType) -> Self {
        // ---
        Self {
            transacted,
            ack_mode,
            connection_type,
            user: None,
            password: None,
            client_id: None,
        }
    }

    /// A request built entirely from the factory's defaults.
    pub fn from_settings(settings: &FactorySettings) -> Self {
        // ---
        Self {
            transacted: true,
            ack_mode: AckMode::Auto,
            connection_type: settings.connection_type,
            user: settings.user.clone(),
            password: settings.password.clone(),
            client_id: settings.client_id.clone(),
        }
    }

    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        // ---
        self.user = Some(credentials.user.clone());
        self.password = credentials.password.clone();
        self
    }

    /// Fill user, password and client id from `settings` where unset.
    pub fn with_defaults(mut self, settings: &FactorySettings) -> Self {
        // ---
        if self.user.is_none() {
            self.user = settings.user.clone();
        }
        if self.password.is_none() {
            self.password = settings.password.clone();
        }
        if self.client_id.is_none() {
            self.client_id = settings.client_id.clone();
        }
        self
    }

    pub fn credentials(&self) -> Option<Credentials> {
        // ---
        self.user
            .as_ref()
            .map(|user| Credentials::new(user.clone(), self.password.clone()))
    }
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    // ---
    /// Sleep before each reconnect attempt.
    pub interval: Duration,

    /// `None` = retry until stopped.
    pub max_attempts: Option<u32>,
}

// ---

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // ---
        Self {
            interval: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

// ---

impl ReconnectPolicy {
    // ---
    /// Build from operator values; a negative `attempts` means unbounded.
    pub fn from_raw(interval_secs: u64, attempts: i32) -> Self {
        // ---
        Self {
            interval: Duration::from_secs(interval_secs),
            max_attempts: u32::try_from(attempts).ok(),
        }
    }

    /// Whether another attempt is allowed after `made` attempts.
    pub fn allows(&self, made: u32) -> bool {
        self.max_attempts.is_none_or(|max| made < max)
    }
}

// ---------------------------------------------------------------------------
// ForceDrain
// ---------------------------------------------------------------------------

/// Bound on how long pool shutdown waits for busy workers.
///
/// Each `interval` without a worker returning counts as one attempt; after
/// `attempts` such intervals shutdown proceeds without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceDrain {
    // ---
    pub attempts: u32,
    pub interval: Duration,
}

// ---

impl ForceDrain {
    // ---
    /// `forceClearOnShutdown`, `forceClearAttempts`,
    /// `forceClearOnShutdownInterval` as operators spell them.
    pub fn from_raw(enabled: bool, attempts: u32, interval_ms: u64) -> Option<Self> {
        // ---
        enabled.then(|| Self {
            attempts,
            interval: Duration::from_millis(interval_ms),
        })
    }
}

// ---------------------------------------------------------------------------
// ActivationConfig
// ---------------------------------------------------------------------------

/// Configuration of one inflow activation. Immutable once activated.
#[derive(Debug, Clone)]
pub struct ActivationConfig {
    // ---
    pub destination: String,
    pub destination_type: DestinationKind,

    /// Directory name of the broker connection factory.
    pub connection_factory: String,
    pub directory_parameters: DirectoryParameters,

    pub credentials: Option<Credentials>,
    pub client_id: Option<String>,

    pub message_selector: Option<String>,
    pub ack_mode: AckMode,

    /// Durable topic subscription; requires `subscription_name`.
    pub durable: bool,
    pub subscription_name: Option<String>,

    pub min_session: usize,
    pub max_session: usize,

    /// Messages the broker may hand a worker in one batch.
    pub max_messages: usize,

    pub reconnect: ReconnectPolicy,

    /// `None` = the coordinator's default.
    pub transaction_timeout: Option<Duration>,

    /// `None` = pool shutdown waits for every busy worker.
    pub force_drain: Option<ForceDrain>,
}

// ---

impl Default for ActivationConfig {
    fn default() -> Self {
        // ---
        Self {
            destination: String::new(),
            destination_type: DestinationKind::Any,
            connection_factory: String::new(),
            directory_parameters: DirectoryParameters::new(),
            credentials: None,
            client_id: None,
            message_selector: None,
            ack_mode: AckMode::Auto,
            durable: false,
            subscription_name: None,
            min_session: 1,
            max_session: 15,
            max_messages: 1,
            reconnect: ReconnectPolicy::default(),
            transaction_timeout: None,
            force_drain: None,
        }
    }
}

// ---

impl ActivationConfig {
    // ---
    pub fn new(destination: impl Into<String>, connection_factory: impl Into<String>) -> Self {
        // ---
        Self {
            destination: destination.into(),
            connection_factory: connection_factory.into(),
            ..Self::default()
        }
    }

    /// Check required fields and bounds.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.destination.trim().is_empty() {
            return Err(invalid("destination", "destination is mandatory"));
        }
        if self.connection_factory.trim().is_empty() {
            return Err(invalid("connectionFactory", "connectionFactory is mandatory"));
        }
        if self.max_session == 0 {
            return Err(invalid("maxSession", "must be at least 1"));
        }
        if self.min_session > self.max_session {
            return Err(invalid(
                "minSession",
                &format!("{} exceeds maxSession {}", self.min_session, self.max_session),
            ));
        }
        if self.max_messages == 0 {
            return Err(invalid("maxMessages", "must be at least 1"));
        }
        if self.ack_mode == AckMode::Client {
            return Err(invalid("acknowledgeMode", "client acknowledgement is not supported for inflow"));
        }
        if self.is_durable_topic() && self.subscription_name.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(invalid("subscriptionName", "required for a durable topic subscription"));
        }
        Ok(())
    }

    pub fn is_topic(&self) -> bool {
        self.destination_type == DestinationKind::Topic
    }

    pub fn is_durable_topic(&self) -> bool {
        self.durable && self.is_topic()
    }

    /// Attempts of the reconnect policy in operator notation (`-1` = forever).
    pub fn reconnect_attempts_raw(&self) -> i64 {
        self.reconnect.max_attempts.map_or(-1, i64::from)
    }
}

fn invalid(property: &'static str, reason: &str) -> BrokerError {
    // ---
    BrokerError::InvalidConfig {
        property,
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
