//! [`ServerSessionWorker`] — one pooled delivery unit: a broker session plus
//! the endpoint instance it delivers to.
//!
//! # Design
//!
//! The broker's dispatch thread loads a worker with a batch through
//! [`ServerSession::start`]. The worker hands the batch to the work
//! scheduler and returns immediately; the scheduled work delivers message by
//! message and always checks the worker back into its pool, including when
//! the endpoint fails or panics.
//!
//! ```text
//!   per message:
//!     [set tx timeout] → [begin] → before_delivery → on_message
//!                                 → after_delivery (always)
//!                                 → [end: Commit | Rollback]
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use parking_lot::Mutex;
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    AckMode,
    BrokerError,
    ConnectionPtr,
    DeliveryMethod,
    Endpoint,
    EndpointFactoryPtr,
    EndpointPtr,
    Message,
    Result,
    ServerSession,
    SessionMode,
    SessionPtr,
    TransactionCoordinatorPtr,
    TxOutcome,
    WorkSchedulerPtr,
    XaResourcePtr,
    XaSession,
    Xid,
};

// ---

use super::ServerSessionPool;

/// Collaborators and settings shared by every worker of one pool.
pub(crate) struct DeliveryContext {
    // ---
    pub activation: Uuid,
    pub endpoint_factory: EndpointFactoryPtr,
    pub coordinator: Option<TransactionCoordinatorPtr>,
    pub scheduler: WorkSchedulerPtr,
    pub transacted: bool,
    pub ack_mode: AckMode,
    pub transaction_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    // ---
    Idle,
    Delivering,
}

// ---------------------------------------------------------------------------
// ServerSessionWorker
// ---------------------------------------------------------------------------

pub struct ServerSessionWorker {
    // ---
    id: usize,
    pool: Weak<ServerSessionPool>,
    ctx: Arc<DeliveryContext>,
    session: SessionPtr,
    xa: Option<XaResourcePtr>,

    /// `None` once torn down.
    endpoint: Mutex<Option<EndpointPtr>>,
    state: Mutex<WorkerState>,
}

// ---

impl ServerSessionWorker {
    // ---
    /// Create the worker's session and endpoint instance.
    pub(crate) fn create(
        id: usize,
        pool: Weak<ServerSessionPool>,
        ctx: Arc<DeliveryContext>,
        connection: &ConnectionPtr,
    ) -> Result<Arc<Self>> {
        // ---
        let (session, xa) = if ctx.transacted {
            let XaSession { session, resource } = connection.create_xa_session()?;
            (session, Some(resource))
        } else {
            (connection.create_session(SessionMode::Acknowledge(ctx.ack_mode))?, None)
        };

        let endpoint = match ctx.endpoint_factory.create_endpoint(xa.clone()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(close_err) = session.close() {
                    tracing::debug!(worker = id, "error closing session: {close_err}");
                }
                return Err(e);
            }
        };

        tracing::trace!(activation = %ctx.activation, worker = id, xa = xa.is_some(), "worker created");
        Ok(Arc::new(Self {
            id,
            pool,
            ctx,
            session,
            xa,
            endpoint: Mutex::new(Some(endpoint)),
            state: Mutex::new(WorkerState::Idle),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// Release the endpoint and close the session. Idempotent.
    pub(crate) fn teardown(&self) {
        // ---
        let Some(mut endpoint) = self.endpoint.lock().take() else {
            return;
        };
        endpoint.release();
        if let Err(e) = self.session.close() {
            tracing::debug!(activation = %self.ctx.activation, worker = self.id, "error closing session: {e}");
        }
        tracing::trace!(activation = %self.ctx.activation, worker = self.id, "worker torn down");
    }

    fn check_in(self: &Arc<Self>) {
        // ---
        self.set_state(WorkerState::Idle);
        match self.pool.upgrade() {
            Some(pool) => pool.checkin(self.clone()),
            None => self.teardown(),
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    fn run(self: Arc<Self>, batch: Vec<Message>) {
        // ---
        let _checkin = CheckinGuard(self.clone());
        let mut slot = self.endpoint.lock();
        let Some(endpoint) = slot.as_mut() else {
            tracing::warn!(worker = self.id, dropped = batch.len(), "batch for a torn-down worker");
            return;
        };

        for message in &batch {
            if let Err(e) = self.deliver(endpoint.as_mut(), message) {
                tracing::error!(
                    activation = %self.ctx.activation,
                    worker = self.id,
                    message_id = message.id_for_log(),
                    "delivery failed: {e}"
                );
            }
        }
    }

    fn deliver(&self, endpoint: &mut dyn Endpoint, message: &Message) -> Result<()> {
        // ---
        let xid = self.begin()?;
        let result = invoke(endpoint, message);

        let Some((xid, coordinator)) = xid else {
            return result;
        };
        let outcome = if result.is_ok() { TxOutcome::Commit } else { TxOutcome::Rollback };
        tracing::trace!(worker = self.id, %xid, ?outcome, "ending transaction");
        match (result, coordinator.end(&xid, outcome)) {
            (Err(e), Err(end_err)) => {
                tracing::error!(worker = self.id, %xid, "rollback failed: {end_err}");
                Err(e)
            }
            (result, Ok(())) => result,
            (Ok(()), Err(end_err)) => Err(end_err),
        }
    }

    fn begin(&self) -> Result<Option<(Xid, TransactionCoordinatorPtr)>> {
        // ---
        let (Some(coordinator), Some(xa)) = (&self.ctx.coordinator, &self.xa) else {
            return Ok(None);
        };
        if let Some(timeout) = self.ctx.transaction_timeout {
            coordinator.set_transaction_timeout(timeout)?;
        }
        let xid = coordinator.begin(xa.clone())?;
        Ok(Some((xid, coordinator.clone())))
    }
}

impl ServerSession for ServerSessionWorker {
    fn start(self: Arc<Self>, batch: Vec<Message>) -> Result<()> {
        // ---
        self.set_state(WorkerState::Delivering);
        let worker = self.clone();
        if let Err(e) = self.ctx.scheduler.schedule_work(Box::new(move || worker.run(batch))) {
            tracing::warn!(activation = %self.ctx.activation, worker = self.id, "unable to schedule delivery: {e}");
            self.check_in();
            return Err(BrokerError::WorkRejected(e.to_string()));
        }
        Ok(())
    }
}

/// Checks the worker in when the delivery run ends, however it ends.
struct CheckinGuard(Arc<ServerSessionWorker>);

impl Drop for CheckinGuard {
    fn drop(&mut self) {
        self.0.check_in();
    }
}

fn invoke(endpoint: &mut dyn Endpoint, message: &Message) -> Result<()> {
    // ---
    endpoint.before_delivery(DeliveryMethod::OnMessage)?;
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| endpoint.on_message(message)))
        .unwrap_or_else(|payload| Err(BrokerError::Endpoint(format!("endpoint panicked: {}", panic_text(payload.as_ref())))));
    let after = endpoint.after_delivery();
    delivered.and(after)
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    // ---
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::Duration;

    use brokerlink_domain::{
        // ---
        AckMode,
        BrokerError,
        ConnectionFactory,
        Message,
        Result,
        ServerSession,
        TransactionCoordinatorPtr,
        TxOutcome,
        Work,
        WorkScheduler,
        WorkSchedulerPtr,
    };
    use brokerlink_sim::{
        // ---
        EndpointCall,
        SimBroker,
        SimConnectionFactory,
        SimEndpointFactory,
        SimTransactionCoordinator,
        FAIL_TEXT,
        PANIC_TEXT,
    };

    use super::{DeliveryContext, ServerSessionWorker, WorkerState};
    use crate::ThreadWorkScheduler;

    struct Rejecting;

    impl WorkScheduler for Rejecting {
        fn schedule_work(&self, _work: Work) -> Result<()> {
            Err(BrokerError::WorkRejected("full".into()))
        }
    }

    fn worker(
        endpoints: &SimEndpointFactory,
        coordinator: Option<TransactionCoordinatorPtr>,
        scheduler: WorkSchedulerPtr,
    ) -> Arc<ServerSessionWorker> {
        // ---
        let broker = SimBroker::default();
        let connection = SimConnectionFactory::new(broker).create_xa_connection(None).unwrap();
        let ctx = Arc::new(DeliveryContext {
            activation: uuid::Uuid::new_v4(),
            endpoint_factory: Arc::new(endpoints.clone()),
            transacted: coordinator.is_some(),
            coordinator,
            scheduler,
            ack_mode: AckMode::Auto,
            transaction_timeout: Some(Duration::from_secs(30)),
        });
        ServerSessionWorker::create(0, std::sync::Weak::new(), ctx, &connection).unwrap()
    }

    #[test]
    fn transacted_delivery_commits_or_rolls_back_per_message() {
        // ---
        let endpoints = SimEndpointFactory::new(true);
        let coordinator = Arc::new(SimTransactionCoordinator::new());
        let w = worker(&endpoints, Some(coordinator.clone()), Arc::new(ThreadWorkScheduler::default()));

        w.clone()
            .start(vec![Message::text("ok"), Message::text(FAIL_TEXT), Message::text(PANIC_TEXT)])
            .unwrap();
        assert!(endpoints.wait_for_deliveries(3, Duration::from_secs(5)));

        // Without a pool the worker tears itself down after the batch.
        for _ in 0..200 {
            if endpoints.released() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let outcomes: Vec<_> = coordinator.outcomes().into_iter().map(|(_, o)| o).collect();
        assert_eq!(outcomes, vec![TxOutcome::Commit, TxOutcome::Rollback, TxOutcome::Rollback]);
        assert_eq!(coordinator.last_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(coordinator.active_count(), 0);
        assert!(endpoints.deliveries().iter().all(|d| d.with_xa));
    }

    #[test]
    fn after_delivery_runs_even_when_endpoint_panics() {
        // ---
        let endpoints = SimEndpointFactory::new(false);
        let w = worker(&endpoints, None, Arc::new(ThreadWorkScheduler::default()));
        w.clone().start(vec![Message::text(PANIC_TEXT), Message::text("next")]).unwrap();
        assert!(endpoints.wait_for_deliveries(2, Duration::from_secs(5)));

        for _ in 0..200 {
            if endpoints.released() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let calls: Vec<_> = endpoints.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(
            calls,
            vec![
                EndpointCall::Before,
                EndpointCall::OnMessage,
                EndpointCall::After,
                EndpointCall::Before,
                EndpointCall::OnMessage,
                EndpointCall::After,
                EndpointCall::Release,
            ]
        );
    }

    #[test]
    fn rejected_schedule_returns_work_rejected_and_checks_in() {
        // ---
        let endpoints = SimEndpointFactory::new(false);
        let w = worker(&endpoints, None, Arc::new(Rejecting));
        let err = w.clone().start(vec![Message::text("x")]).unwrap_err();
        assert!(matches!(err, BrokerError::WorkRejected(_)));
        assert_eq!(w.state(), WorkerState::Idle);
        assert!(endpoints.deliveries().is_empty());
        assert_eq!(endpoints.released(), 1, "an orphaned worker tears down on check-in");
    }

    #[test]
    fn endpoint_creation_failure_fails_worker() {
        // ---
        let endpoints = SimEndpointFactory::new(false);
        endpoints.fail_create(true);
        let broker = SimBroker::default();
        let connection = SimConnectionFactory::new(broker).create_connection(None).unwrap();
        let ctx = Arc::new(DeliveryContext {
            activation: uuid::Uuid::new_v4(),
            endpoint_factory: Arc::new(endpoints.clone()),
            coordinator: None,
            scheduler: Arc::new(ThreadWorkScheduler::default()),
            transacted: false,
            ack_mode: AckMode::DupsOk,
            transaction_timeout: None,
        });
        assert!(ServerSessionWorker::create(0, std::sync::Weak::new(), ctx, &connection).is_err());
    }
}
