//! [`ServerSessionPool`] — fixed set of [`ServerSessionWorker`]s handed to the
//! broker as its server-session source.
//!
//! # Design
//!
//! ```text
//!   broker dispatch ──checkout()──► idle stack (LIFO) ──► worker.start(batch)
//!         ▲                                                     │
//!         └──────────── checkin(worker) ◄── delivery run ends ──┘
//! ```
//!
//! `checkout` blocks on a condvar until a worker is idle or the pool stops.
//! Once stopped, every returning worker is torn down instead of going back on
//! the stack, and `stop` waits for the live count to reach zero, or gives up
//! after the configured number of intervals without progress.

use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    AckMode,
    BrokerError,
    ConnectionConsumerPtr,
    ConnectionPtr,
    ConsumerOptions,
    Destination,
    EndpointFactoryPtr,
    ForceDrain,
    Result,
    ServerSessionPtr,
    ServerSessionSource,
    ServerSessionSourcePtr,
    Subscription,
    TransactionCoordinatorPtr,
    WorkSchedulerPtr,
};

// ---

use super::worker::DeliveryContext;
use super::{ServerSessionWorker, WorkerState};

// ---------------------------------------------------------------------------
// PoolSettings
// ---------------------------------------------------------------------------

/// What one pool needs from its activation.
#[derive(Clone)]
pub struct PoolSettings {
    // ---
    pub activation: Uuid,
    pub destination: Destination,
    pub message_selector: Option<String>,

    /// Durable subscription name, set only for durable topic activations.
    pub subscription: Option<String>,

    pub max_session: usize,
    pub max_messages: usize,
    pub ack_mode: AckMode,
    pub transacted: bool,
    pub transaction_timeout: Option<Duration>,
    pub force_drain: Option<ForceDrain>,

    pub endpoint_factory: EndpointFactoryPtr,
    pub coordinator: Option<TransactionCoordinatorPtr>,
    pub scheduler: WorkSchedulerPtr,
}

#[derive(Default)]
struct PoolState {
    // ---
    idle: Vec<Arc<ServerSessionWorker>>,

    /// Workers created and not yet torn down, idle or busy.
    live: usize,
    stopped: bool,
}

// ---------------------------------------------------------------------------
// ServerSessionPool
// ---------------------------------------------------------------------------

pub struct ServerSessionPool {
    // ---
    activation: Uuid,
    connection: ConnectionPtr,
    destination: Destination,
    options: ConsumerOptions,
    max_session: usize,
    max_messages: usize,
    force_drain: Option<ForceDrain>,
    ctx: Arc<DeliveryContext>,
    state: Mutex<PoolState>,
    changed: Condvar,
    consumer: Mutex<Option<ConnectionConsumerPtr>>,
    me: Weak<ServerSessionPool>,
}

// ---

impl ServerSessionPool {
    // ---
    pub fn new(connection: ConnectionPtr, settings: PoolSettings) -> Arc<Self> {
        // ---
        let options = ConsumerOptions {
            selector: settings.message_selector,
            no_local: false,
            subscription: settings.subscription.map(|name| Subscription {
                name,
                durable: true,
                shared: false,
            }),
        };
        let ctx = Arc::new(DeliveryContext {
            activation: settings.activation,
            endpoint_factory: settings.endpoint_factory,
            coordinator: settings.coordinator,
            scheduler: settings.scheduler,
            transacted: settings.transacted,
            ack_mode: settings.ack_mode,
            transaction_timeout: settings.transaction_timeout,
        });

        Arc::new_cyclic(|me| Self {
            activation: settings.activation,
            connection,
            destination: settings.destination,
            options,
            max_session: settings.max_session,
            max_messages: settings.max_messages,
            force_drain: settings.force_drain,
            ctx,
            state: Mutex::new(PoolState::default()),
            changed: Condvar::new(),
            consumer: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Create every worker, then register with the broker as the
    /// server-session source of a connection consumer.
    pub fn start(&self) -> Result<()> {
        // ---
        for id in 0..self.max_session {
            let worker = ServerSessionWorker::create(id, self.me.clone(), self.ctx.clone(), &self.connection)?;
            let mut st = self.state.lock();
            st.idle.push(worker);
            st.live += 1;
        }

        let source: ServerSessionSourcePtr = self
            .me
            .upgrade()
            .ok_or_else(|| BrokerError::closed("server session pool"))?;
        let consumer =
            self.connection
                .create_connection_consumer(&self.destination, &self.options, source, self.max_messages)?;
        *self.consumer.lock() = Some(consumer);

        tracing::debug!(
            activation = %self.activation,
            destination = %self.destination,
            workers = self.max_session,
            durable = self.options.subscription.is_some(),
            "server session pool started"
        );
        Ok(())
    }

    /// Take an idle worker, blocking until one is available.
    pub fn checkout(&self) -> Result<Arc<ServerSessionWorker>> {
        // ---
        let mut st = self.state.lock();
        loop {
            if st.stopped {
                return Err(BrokerError::PoolStopped);
            }
            if let Some(worker) = st.idle.pop() {
                worker.set_state(WorkerState::Delivering);
                tracing::trace!(activation = %self.activation, worker = worker.id(), "checked out");
                return Ok(worker);
            }
            self.changed.wait(&mut st);
        }
    }

    /// Return a worker. A stopped pool tears it down instead.
    pub fn checkin(&self, worker: Arc<ServerSessionWorker>) {
        // ---
        let mut st = self.state.lock();
        if st.stopped {
            worker.teardown();
            st.live = st.live.saturating_sub(1);
        } else {
            tracing::trace!(activation = %self.activation, worker = worker.id(), "checked in");
            st.idle.push(worker);
        }
        self.changed.notify_all();
    }

    /// Stop handing out workers and wait for the busy ones to return.
    pub fn stop(&self) {
        // ---
        if let Some(consumer) = self.consumer.lock().take() {
            if let Err(e) = consumer.close() {
                tracing::debug!(activation = %self.activation, "error closing connection consumer: {e}");
            }
        }

        {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            let idle = mem::take(&mut st.idle);
            st.live -= idle.len();
            for worker in idle {
                worker.teardown();
            }
            self.changed.notify_all();
        }

        self.drain();
        tracing::debug!(activation = %self.activation, "server session pool stopped");
    }

    fn drain(&self) {
        // ---
        let mut st = self.state.lock();
        let Some(ForceDrain { attempts, interval }) = self.force_drain else {
            while st.live > 0 {
                tracing::debug!(activation = %self.activation, live = st.live, "waiting for busy workers");
                self.changed.wait(&mut st);
            }
            return;
        };

        let mut stalled = 0;
        while st.live > 0 && stalled < attempts {
            let before = st.live;
            let waited = self.changed.wait_while_for(&mut st, |s| s.live == before, interval);
            if waited.timed_out() && st.live == before {
                stalled += 1;
                tracing::debug!(activation = %self.activation, live = st.live, stalled, "no worker returned");
            }
        }
        if st.live > 0 {
            tracing::warn!(
                activation = %self.activation,
                abandoned = st.live,
                "forced drain gave up on busy workers"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl ServerSessionSource for ServerSessionPool {
    fn server_session(&self) -> Result<ServerSessionPtr> {
        Ok(self.checkout()?)
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
        AckMode,
        BrokerError,
        ConnectionFactory,
        ConnectionPtr,
        Destination,
        ForceDrain,
        ServerSession,
    };
    use brokerlink_sim::{SimBroker, SimConnectionFactory, SimEndpointFactory};

    use super::{PoolSettings, ServerSessionPool};
    use crate::ThreadWorkScheduler;

    fn settings(endpoints: &SimEndpointFactory, max_session: usize, force_drain: Option<ForceDrain>) -> PoolSettings {
        // ---
        PoolSettings {
            activation: uuid::Uuid::new_v4(),
            destination: Destination::queue("in"),
            message_selector: None,
            subscription: None,
            max_session,
            max_messages: 1,
            ack_mode: AckMode::Auto,
            transacted: false,
            transaction_timeout: None,
            force_drain,
            endpoint_factory: Arc::new(endpoints.clone()),
            coordinator: None,
            scheduler: Arc::new(ThreadWorkScheduler::default()),
        }
    }

    fn connection(broker: &SimBroker) -> ConnectionPtr {
        SimConnectionFactory::new(broker.clone()).create_connection(None).unwrap()
    }

    /// Checkout is LIFO and blocks until a worker is returned.
    #[test]
    fn checkout_is_lifo_and_blocks_when_empty() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let pool = ServerSessionPool::new(connection(&broker), settings(&endpoints, 2, None));
        pool.start().unwrap();

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_eq!(pool.idle_count(), 0);

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.checkout())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "checkout must block while every worker is busy");

        let a_id = a.id();
        pool.checkin(a);
        let a = waiter.join().unwrap().unwrap();
        assert_eq!(a.id(), a_id);

        pool.checkin(b);
        pool.checkin(a);
        let last = pool.checkout().unwrap();
        assert_eq!(last.id(), a_id, "last in, first out");
        pool.checkin(last);
        assert_eq!(pool.idle_count(), 2);

        pool.stop();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(endpoints.released(), 2);
    }

    #[test]
    fn checkout_on_stopped_pool_fails() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let pool = ServerSessionPool::new(connection(&broker), settings(&endpoints, 1, None));
        pool.start().unwrap();
        let busy = pool.checkout().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.checkout().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));

        let stopper = {
            let pool = pool.clone();
            thread::spawn(move || pool.stop())
        };
        assert!(matches!(waiter.join().unwrap(), Err(BrokerError::PoolStopped)));

        pool.checkin(busy);
        stopper.join().unwrap();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(endpoints.released(), 1);
        assert!(matches!(pool.checkout(), Err(BrokerError::PoolStopped)));
    }

    /// Without forced drain, stop waits for every busy worker.
    #[test]
    fn stop_waits_for_busy_workers() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        endpoints.close_gate();
        let pool = ServerSessionPool::new(connection(&broker), settings(&endpoints, 2, None));
        pool.start().unwrap();

        let worker = pool.checkout().unwrap();
        worker.start(vec![brokerlink_domain::Message::text("slow")]).unwrap();
        assert!(endpoints.wait_in_flight(1, Duration::from_secs(2)));

        let stopper = {
            let pool = pool.clone();
            thread::spawn(move || pool.stop())
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!stopper.is_finished(), "stop returned with a worker still delivering");
        assert_eq!(pool.live_count(), 1);

        endpoints.open_gate();
        stopper.join().unwrap();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(endpoints.released(), 2);
    }

    /// Forced drain gives up after `attempts` intervals without progress.
    #[test]
    fn forced_drain_gives_up_on_stuck_worker() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        endpoints.close_gate();
        let drain = ForceDrain {
            attempts: 2,
            interval: Duration::from_millis(100),
        };
        let pool = ServerSessionPool::new(connection(&broker), settings(&endpoints, 1, Some(drain)));
        pool.start().unwrap();

        let worker = pool.checkout().unwrap();
        worker.start(vec![brokerlink_domain::Message::text("stuck")]).unwrap();
        assert!(endpoints.wait_in_flight(1, Duration::from_secs(2)));

        let started = Instant::now();
        pool.stop();
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(190), "gave up too early: {took:?}");
        assert!(took < Duration::from_secs(2), "gave up too late: {took:?}");
        assert_eq!(pool.live_count(), 1);

        endpoints.open_gate();
        for _ in 0..200 {
            if pool.live_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.live_count(), 0, "late worker is torn down on check-in");
    }

    /// With no attempts budgeted, forced drain abandons busy workers at once.
    #[test]
    fn forced_drain_with_zero_attempts_returns_immediately() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        endpoints.close_gate();
        let drain = ForceDrain {
            attempts: 0,
            interval: Duration::from_millis(500),
        };
        let pool = ServerSessionPool::new(connection(&broker), settings(&endpoints, 1, Some(drain)));
        pool.start().unwrap();

        let worker = pool.checkout().unwrap();
        worker.start(vec![brokerlink_domain::Message::text("stuck")]).unwrap();
        assert!(endpoints.wait_in_flight(1, Duration::from_secs(2)));

        let started = Instant::now();
        pool.stop();
        let took = started.elapsed();
        assert!(took < Duration::from_millis(100), "waited on a zero budget: {took:?}");
        assert_eq!(pool.live_count(), 1);

        endpoints.open_gate();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.live_count() != 0 {
            assert!(Instant::now() < deadline, "late worker never torn down");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Broker-driven delivery through the connection consumer.
    #[test]
    fn broker_delivers_through_pool() {
        // ---
        let broker = SimBroker::default();
        let endpoints = SimEndpointFactory::new(false);
        let conn = connection(&broker);
        let pool = ServerSessionPool::new(conn.clone(), settings(&endpoints, 3, None));
        pool.start().unwrap();
        conn.start().unwrap();

        for i in 0..10 {
            broker.send_text("in", &format!("m{i}")).unwrap();
        }
        assert!(endpoints.wait_for_deliveries(10, Duration::from_secs(5)));
        assert_eq!(endpoints.created(), 3);

        conn.stop().unwrap();
        pool.stop();
        assert_eq!(endpoints.released(), 3);
        assert_eq!(broker.queue_depth("in"), 0);
    }
}
