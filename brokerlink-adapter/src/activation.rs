//! [`InflowActivation`] — asynchronous delivery from one destination to one
//! endpoint factory, with failure detection and reconnect.
//!
//! # Design
//!
//! ```text
//!   start() ──schedule──► setup: destination → connection → pool → start
//!                             │ error
//!   broker exception ─────────┤
//!                             ▼
//!                 failure channel (capacity 1)
//!                             │ blocking_recv
//!                             ▼
//!                  recovery thread ──► handle_failure()
//!                                        teardown → sleep → setup, repeat
//! ```
//!
//! Every teardown advances the connection epoch. The
//! exception listener of a connection carries the epoch it was registered
//! under, so a signal from a connection that has already been torn down is
//! dropped instead of triggering a second recovery.
//!
//! Setup and teardown run under one lifecycle mutex. `stop` clears
//! `delivery_active` before taking it, so a setup racing with `stop` is torn
//! down as soon as it finishes, and a reconnect sleep is cut short.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

// ---

use anyhow::{anyhow, Context};
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    ActivationConfig,
    BrokerError,
    ConnectionPtr,
    DeliveryMethod,
    Destination,
    DirectoryPtr,
    EndpointFactoryPtr,
    ExceptionListener,
    ExceptionListenerPtr,
    Result,
    TransactionCoordinatorPtr,
    WorkSchedulerPtr,
};

// ---

use super::{PoolSettings, ServerSessionPool};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationId(pub Uuid);

impl ActivationId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    // ---
    Stopped,
    Starting,
    Active,
    Recovering,
}

/// How one call to [`InflowActivation::handle_failure`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    // ---
    Reconnected,

    /// Attempts used up; the activation is stopped.
    Exhausted,

    /// `stop` was called while reconnecting.
    Interrupted,

    /// Another reconnect loop is already running.
    AlreadyRecovering,

    /// Delivery is not active.
    Inactive,
}

/// Container collaborators of an activation.
#[derive(Clone)]
pub struct ActivationDeps {
    // ---
    pub directory: DirectoryPtr,
    pub endpoint_factory: EndpointFactoryPtr,
    pub scheduler: WorkSchedulerPtr,

    /// Required for transacted delivery.
    pub coordinator: Option<TransactionCoordinatorPtr>,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct Failure {
    // ---
    epoch: u64,
    error: anyhow::Error,
}

/// Resources of the current connection generation.
#[derive(Default)]
struct Live {
    // ---
    destination: Option<Destination>,
    connection: Option<ConnectionPtr>,
    pool: Option<Arc<ServerSessionPool>>,
}

/// Clears the in-failure flag however the reconnect loop exits.
struct FailureGuard<'a>(&'a AtomicBool);

impl Drop for FailureGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// InflowActivation
// ---------------------------------------------------------------------------

pub struct InflowActivation {
    // ---
    id: ActivationId,
    config: ActivationConfig,
    deps: ActivationDeps,
    transacted: bool,

    delivery_active: AtomicBool,
    in_failure: AtomicBool,
    state: Mutex<ActivationState>,

    /// Lifecycle mutex: held for a whole setup or teardown.
    live: Mutex<Live>,
    epoch: AtomicU64,

    sleep: Mutex<()>,
    wake: Condvar,

    failures: mpsc::Sender<Failure>,
    me: Weak<InflowActivation>,
}

// ---

impl InflowActivation {
    // ---
    /// Validate `config` and spawn the recovery thread. Delivery begins with
    /// [`InflowActivation::start`].
    pub fn new(config: ActivationConfig, deps: ActivationDeps) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let transacted = deps.endpoint_factory.is_delivery_transacted(DeliveryMethod::OnMessage);
        if transacted && deps.coordinator.is_none() {
            return Err(BrokerError::InvalidConfig {
                property: "transactionCoordinator",
                reason: "transacted delivery needs a transaction coordinator".into(),
            });
        }

        let (tx, rx) = mpsc::channel(1);
        let activation = Arc::new_cyclic(|me| Self {
            id: ActivationId::new(),
            config,
            deps,
            transacted,
            delivery_active: AtomicBool::new(false),
            in_failure: AtomicBool::new(false),
            state: Mutex::new(ActivationState::Stopped),
            live: Mutex::new(Live::default()),
            epoch: AtomicU64::new(0),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            failures: tx,
            me: me.clone(),
        });

        let weak = Arc::downgrade(&activation);
        thread::Builder::new()
            .name(format!("recovery-{}", &activation.id.to_string()[..8]))
            .spawn(move || recovery_loop(weak, rx))?;

        tracing::info!(
            activation = %activation.id,
            destination = %activation.config.destination,
            transacted,
            "activation created"
        );
        Ok(activation)
    }

    pub fn id(&self) -> ActivationId {
        self.id
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    pub fn state(&self) -> ActivationState {
        *self.state.lock()
    }

    pub fn is_delivery_active(&self) -> bool {
        self.delivery_active.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.in_failure.load(Ordering::SeqCst)
    }

    /// The resolved destination of the current generation.
    pub fn destination(&self) -> Option<Destination> {
        self.live.lock().destination.clone()
    }

    pub fn pool(&self) -> Option<Arc<ServerSessionPool>> {
        self.live.lock().pool.clone()
    }

    fn set_state(&self, state: ActivationState) {
        *self.state.lock() = state;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin delivery. Setup runs on the work scheduler; its failure enters
    /// the reconnect loop.
    pub fn start(&self) -> Result<()> {
        // ---
        if self.delivery_active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(ActivationState::Starting);

        let me = self.me.upgrade().ok_or_else(|| BrokerError::closed("activation"))?;
        if let Err(e) = self.deps.scheduler.schedule_work(Box::new(move || me.initial_setup())) {
            self.delivery_active.store(false, Ordering::SeqCst);
            self.set_state(ActivationState::Stopped);
            return Err(e);
        }
        Ok(())
    }

    fn initial_setup(&self) {
        // ---
        if !self.is_delivery_active() {
            return;
        }
        if let Err(e) = self.setup() {
            tracing::error!(activation = %self.id, "unable to start delivery: {e:#}");
            self.post_failure(self.epoch.load(Ordering::SeqCst), e);
        }
    }

    /// Stop delivery and release every resource. Errors are logged.
    pub fn stop(&self) {
        // ---
        self.delivery_active.store(false, Ordering::SeqCst);
        {
            let _sleeping = self.sleep.lock();
            self.wake.notify_all();
        }
        self.teardown();
        self.set_state(ActivationState::Stopped);
        tracing::info!(activation = %self.id, "activation stopped");
    }

    fn setup(&self) -> anyhow::Result<()> {
        // ---
        let mut live = self.live.lock();
        if !self.is_delivery_active() {
            return Err(anyhow!("activation {} is stopped", self.id));
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        tracing::debug!(activation = %self.id, epoch, "setting up delivery");

        let destination = self
            .deps
            .directory
            .lookup_destination(&self.config.destination, self.config.destination_type, &self.config.directory_parameters)
            .with_context(|| format!("unable to resolve destination `{}`", self.config.destination))?;
        live.destination = Some(destination.clone());

        let connection = self.open_connection(epoch).context("unable to open connection")?;
        live.connection = Some(connection.clone());

        let pool = ServerSessionPool::new(connection.clone(), self.pool_settings(&destination));
        live.pool = Some(pool.clone());
        pool.start().context("unable to start server session pool")?;

        connection.start().context("unable to start connection")?;
        self.set_state(ActivationState::Active);
        tracing::info!(activation = %self.id, %destination, "delivery active");
        Ok(())
    }

    fn open_connection(&self, epoch: u64) -> anyhow::Result<ConnectionPtr> {
        // ---
        let factory = self
            .deps
            .directory
            .lookup_connection_factory(&self.config.connection_factory, &self.config.directory_parameters)
            .with_context(|| format!("unable to look up `{}`", self.config.connection_factory))?;

        let credentials = self.config.credentials.as_ref();
        let connection = if self.transacted || factory.capabilities().xa {
            factory.create_xa_connection(credentials)?
        } else {
            factory.create_connection(credentials)?
        };

        if let Err(e) = self.configure(&connection, epoch) {
            if let Err(close_err) = connection.close() {
                tracing::debug!(activation = %self.id, "error closing misconfigured connection: {close_err}");
            }
            return Err(e.into());
        }
        Ok(connection)
    }

    fn configure(&self, connection: &ConnectionPtr, epoch: u64) -> Result<()> {
        // ---
        if let Some(client_id) = &self.config.client_id {
            connection.set_client_id(client_id)?;
        }
        let listener: ExceptionListenerPtr = Arc::new(InflowListener {
            activation: self.me.clone(),
            epoch,
        });
        connection.set_exception_listener(Some(listener))
    }

    fn pool_settings(&self, destination: &Destination) -> PoolSettings {
        // ---
        let subscription = (self.config.durable && destination.is_topic())
            .then(|| self.config.subscription_name.clone())
            .flatten();
        PoolSettings {
            activation: self.id.0,
            destination: destination.clone(),
            message_selector: self.config.message_selector.clone(),
            subscription,
            max_session: self.config.max_session,
            max_messages: self.config.max_messages,
            ack_mode: self.config.ack_mode,
            transacted: self.transacted,
            transaction_timeout: self.config.transaction_timeout,
            force_drain: self.config.force_drain,
            endpoint_factory: self.deps.endpoint_factory.clone(),
            coordinator: self.deps.coordinator.clone(),
            scheduler: self.deps.scheduler.clone(),
        }
    }

    /// Pool, then connection, then destination. Advances the epoch.
    fn teardown(&self) {
        // ---
        let mut live = self.live.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(pool) = live.pool.take() {
            if let Some(connection) = &live.connection {
                if let Err(e) = connection.stop() {
                    tracing::debug!(activation = %self.id, "error stopping connection: {e}");
                }
            }
            pool.stop();
        }

        if let Some(connection) = live.connection.take() {
            if let Err(e) = connection.set_exception_listener(None) {
                tracing::debug!(activation = %self.id, "error unsetting exception listener: {e}");
            }
            if let Err(e) = connection.close() {
                tracing::debug!(activation = %self.id, "error closing connection: {e}");
            }
        }

        live.destination = None;
        tracing::debug!(activation = %self.id, "delivery torn down");
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    fn post_failure(&self, epoch: u64, error: anyhow::Error) {
        // ---
        if epoch != self.epoch.load(Ordering::SeqCst) {
            tracing::debug!(activation = %self.id, epoch, "ignoring failure of a torn-down connection: {error:#}");
            return;
        }
        match self.failures.try_send(Failure { epoch, error }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(activation = %self.id, "recovery already pending");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(activation = %self.id, "recovery thread is gone");
            }
        }
    }

    fn on_failure_signal(&self, failure: Failure) {
        // ---
        if failure.epoch != self.epoch.load(Ordering::SeqCst) {
            tracing::debug!(activation = %self.id, epoch = failure.epoch, "dropping stale failure signal");
            return;
        }
        let outcome = self.handle_failure(failure.error);
        tracing::debug!(activation = %self.id, ?outcome, "failure handled");
    }

    /// Tear down and reconnect until setup succeeds, the policy's attempts
    /// run out or the activation is stopped. At most one loop runs at a time.
    pub fn handle_failure(&self, error: anyhow::Error) -> RecoveryOutcome {
        // ---
        if !self.is_delivery_active() {
            return RecoveryOutcome::Inactive;
        }
        if self
            .in_failure
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return RecoveryOutcome::AlreadyRecovering;
        }
        let _guard = FailureGuard(&self.in_failure);

        tracing::error!(activation = %self.id, "failure in delivery: {error:#}");
        self.set_state(ActivationState::Recovering);
        let policy = self.config.reconnect;
        let mut attempts = 0u32;

        loop {
            // ---
            if !self.is_delivery_active() {
                return RecoveryOutcome::Interrupted;
            }
            if !policy.allows(attempts) {
                break;
            }

            tracing::info!(activation = %self.id, attempt = attempts + 1, "attempting to reconnect");
            self.teardown();
            if !self.sleep_unless_stopped(policy.interval) {
                return RecoveryOutcome::Interrupted;
            }

            match self.setup() {
                Ok(()) if self.is_delivery_active() => {
                    tracing::info!(activation = %self.id, attempts = attempts + 1, "reconnected");
                    return RecoveryOutcome::Reconnected;
                }
                Ok(()) => {
                    self.teardown();
                    return RecoveryOutcome::Interrupted;
                }
                Err(e) => {
                    attempts += 1;
                    tracing::error!(activation = %self.id, attempt = attempts, "reconnect failed: {e:#}");
                }
            }
        }

        tracing::error!(activation = %self.id, attempts, "giving up on reconnect, delivery stopped");
        self.delivery_active.store(false, Ordering::SeqCst);
        self.teardown();
        self.set_state(ActivationState::Stopped);
        RecoveryOutcome::Exhausted
    }

    /// Returns `false` if `stop` interrupted the sleep.
    fn sleep_unless_stopped(&self, interval: Duration) -> bool {
        // ---
        let mut sleeping = self.sleep.lock();
        let _ = self
            .wake
            .wait_while_for(&mut sleeping, |_| self.delivery_active.load(Ordering::SeqCst), interval);
        self.is_delivery_active()
    }
}

impl fmt::Debug for InflowActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("InflowActivation")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("destination", &self.config.destination)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Recovery thread
// ---------------------------------------------------------------------------

fn recovery_loop(activation: Weak<InflowActivation>, mut rx: mpsc::Receiver<Failure>) {
    // ---
    while let Some(failure) = rx.blocking_recv() {
        let Some(activation) = activation.upgrade() else {
            break;
        };
        activation.on_failure_signal(failure);
    }
    tracing::trace!("recovery thread exiting");
}

struct InflowListener {
    // ---
    activation: Weak<InflowActivation>,
    epoch: u64,
}

impl ExceptionListener for InflowListener {
    fn on_exception(&self, error: BrokerError) {
        // ---
        if let Some(activation) = self.activation.upgrade() {
            activation.post_failure(self.epoch, anyhow::Error::new(error).context("connection failure"));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use brokerlink_domain::{
        // ---
        ActivationConfig,
        BrokerError,
        DestinationKind,
        ReconnectPolicy,
    };
    use brokerlink_sim::{SimBroker, SimConfig, SimDirectory, SimEndpointFactory, SimTransactionCoordinator};

    use super::{ActivationDeps, ActivationState, InflowActivation, RecoveryOutcome};
    use crate::ThreadWorkScheduler;

    const CF: &str = "java:/ConnectionFactory";

    fn config(reconnect: ReconnectPolicy) -> ActivationConfig {
        // ---
        ActivationConfig {
            destination_type: DestinationKind::Queue,
            max_session: 2,
            reconnect,
            ..ActivationConfig::new("in", CF)
        }
    }

    fn deps(broker: &SimBroker, endpoints: &SimEndpointFactory) -> ActivationDeps {
        // ---
        ActivationDeps {
            directory: Arc::new(SimDirectory::with_broker(CF, broker)),
            endpoint_factory: Arc::new(endpoints.clone()),
            scheduler: Arc::new(ThreadWorkScheduler::default()),
            coordinator: None,
        }
    }

    fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
        // ---
        let deadline = Instant::now() + timeout;
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn fast(attempts: i32) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(50),
            ..ReconnectPolicy::from_raw(0, attempts)
        }
    }

    #[test]
    fn start_delivers_and_stop_releases() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let activation = InflowActivation::new(config(fast(-1)), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.send_text("in", "hello").unwrap();
        assert!(endpoints.wait_for_deliveries(1, Duration::from_secs(5)));
        assert_eq!(endpoints.created(), 2);

        activation.stop();
        assert_eq!(activation.state(), ActivationState::Stopped);
        assert_eq!(broker.open_connection_count(), 0);
        assert_eq!(endpoints.released(), 2);
        assert!(activation.destination().is_none());
    }

    /// Bounded policy: the initial connect plus exactly `attempts` reconnects.
    #[test]
    fn bounded_reconnect_makes_exactly_max_attempts() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let activation = InflowActivation::new(config(fast(3)), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.fail_all_connects(true);
        let killed = Instant::now();
        broker.kill_connections();
        wait_until("give up", Duration::from_secs(5), || !activation.is_delivery_active());

        let attempts = broker.connect_attempts();
        assert_eq!(attempts.len(), 4);
        assert!(attempts[1].at.duration_since(killed) >= Duration::from_millis(50));
        for pair in attempts[1..].windows(2) {
            let gap = pair[1].at.duration_since(pair[0].at);
            assert!(gap >= Duration::from_millis(50), "attempts only {gap:?} apart");
        }
        assert_eq!(activation.state(), ActivationState::Stopped);
        assert!(!activation.is_recovering());

        thread::sleep(Duration::from_millis(200));
        assert_eq!(broker.connect_attempt_count(), 4, "no attempts after exhaustion");
    }

    /// Unbounded policy keeps trying until the broker comes back.
    #[test]
    fn unbounded_reconnect_recovers() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let activation = InflowActivation::new(config(fast(-1)), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.fail_next_connects(4);
        broker.kill_connections();
        wait_until("recovery", Duration::from_secs(5), || {
            broker.connect_attempt_count() == 6
                && activation.state() == ActivationState::Active
                && !activation.is_recovering()
        });
        assert_eq!(broker.open_connection_count(), 1);

        broker.send_text("in", "after").unwrap();
        assert!(endpoints.wait_for_deliveries(1, Duration::from_secs(5)));
        activation.stop();
    }

    #[test]
    fn stop_interrupts_reconnect_sleep() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let slow = ReconnectPolicy {
            interval: Duration::from_secs(30),
            max_attempts: None,
        };
        let activation = InflowActivation::new(config(slow), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.kill_connections();
        wait_until("recovering", Duration::from_secs(5), || activation.is_recovering());

        let started = Instant::now();
        activation.stop();
        wait_until("loop exit", Duration::from_secs(2), || !activation.is_recovering());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(broker.connect_attempt_count(), 1, "no reconnect after stop");
        assert_eq!(activation.state(), ActivationState::Stopped);
    }

    #[test]
    fn second_failure_during_recovery_is_rejected() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let slow = ReconnectPolicy {
            interval: Duration::from_secs(30),
            max_attempts: None,
        };
        let activation = InflowActivation::new(config(slow), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.kill_connections();
        wait_until("recovering", Duration::from_secs(5), || activation.is_recovering());
        let outcome = activation.handle_failure(anyhow::anyhow!("second signal"));
        assert_eq!(outcome, RecoveryOutcome::AlreadyRecovering);

        activation.stop();
        assert_eq!(activation.handle_failure(anyhow::anyhow!("late")), RecoveryOutcome::Inactive);
    }

    #[test]
    fn initial_setup_failure_enters_reconnect() {
        // ---
        let broker = SimBroker::default();
        broker.fail_next_connects(1);
        let endpoints = SimEndpointFactory::new(false);
        let activation = InflowActivation::new(config(fast(5)), deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();

        wait_until("active", Duration::from_secs(5), || {
            broker.connect_attempt_count() == 2
                && activation.state() == ActivationState::Active
                && !activation.is_recovering()
        });
        activation.stop();
    }

    #[test]
    fn durable_topic_survives_reconnect() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let cfg = ActivationConfig {
            destination_type: DestinationKind::Topic,
            durable: true,
            subscription_name: Some("audit".into()),
            client_id: Some("svc".into()),
            max_session: 1,
            reconnect: fast(-1),
            ..ActivationConfig::new("events", CF)
        };
        let activation = InflowActivation::new(cfg, deps(&broker, &endpoints)).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);
        assert_eq!(broker.durable_depth("svc", "audit"), Some(0));

        activation.stop();
        broker
            .publish(&brokerlink_domain::Destination::topic("events"), brokerlink_domain::Message::text("kept"))
            .unwrap();
        assert_eq!(broker.durable_depth("svc", "audit"), Some(1));

        activation.start().unwrap();
        assert!(endpoints.wait_for_deliveries(1, Duration::from_secs(5)));
        activation.stop();
    }

    #[test]
    fn transacted_delivery_needs_coordinator() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(true);
        let err = InflowActivation::new(config(fast(-1)), deps(&broker, &endpoints)).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig { .. }));

        let coordinator = Arc::new(SimTransactionCoordinator::new());
        let deps = ActivationDeps {
            coordinator: Some(coordinator.clone()),
            ..deps(&broker, &endpoints)
        };
        let activation = InflowActivation::new(config(fast(-1)), deps).unwrap();
        activation.start().unwrap();
        wait_until("active", Duration::from_secs(5), || activation.state() == ActivationState::Active);

        broker.send_text("in", "tx").unwrap();
        assert!(endpoints.wait_for_deliveries(1, Duration::from_secs(5)));
        wait_until("commit", Duration::from_secs(5), || coordinator.outcomes().len() == 1);
        assert!(endpoints.deliveries()[0].with_xa);
        activation.stop();
    }

    #[test]
    fn transacted_delivery_on_non_xa_client_keeps_retrying() {
        // ---
        let broker = SimBroker::new(SimConfig::non_xa());
        let endpoints = SimEndpointFactory::new(true);
        let deps = ActivationDeps {
            coordinator: Some(Arc::new(SimTransactionCoordinator::new())),
            ..deps(&broker, &endpoints)
        };
        let activation = InflowActivation::new(config(fast(2)), deps).unwrap();
        activation.start().unwrap();
        wait_until("give up", Duration::from_secs(5), || !activation.is_delivery_active());
        assert_eq!(activation.state(), ActivationState::Stopped);
        assert_eq!(endpoints.created(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let cfg = ActivationConfig {
            max_session: 0,
            ..config(fast(-1))
        };
        assert!(InflowActivation::new(cfg, deps(&broker, &endpoints)).is_err());
    }
}
