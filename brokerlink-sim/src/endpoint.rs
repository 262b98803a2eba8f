//! Recording doubles for the container-side collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use parking_lot::{Condvar, Mutex};

// ---

use brokerlink_domain::{
    // ---
    BrokerError,
    ConnectionFactoryPtr,
    DeliveryMethod,
    Destination,
    DestinationKind,
    Directory,
    DirectoryParameters,
    Endpoint,
    EndpointFactory,
    EndpointPtr,
    Message,
    Result,
    TransactionCoordinator,
    TxOutcome,
    XaResourcePtr,
    Xid,
};

// ---

use super::broker::SimBroker;
use super::connection::SimConnectionFactory;

/// Message text that makes [`SimEndpoint::on_message`] return an error.
pub const FAIL_TEXT: &str = "fail";

/// Message text that makes [`SimEndpoint::on_message`] panic.
pub const PANIC_TEXT: &str = "panic";

// ---------------------------------------------------------------------------
// Recorded calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointCall {
    // ---
    Before,
    OnMessage,
    After,
    Release,
}

/// One `on_message` call.
#[derive(Debug, Clone)]
pub struct Delivery {
    // ---
    /// Sequence number of the endpoint instance, from 1.
    pub endpoint: usize,
    pub message: Message,

    /// The endpoint was created with an XA resource.
    pub with_xa: bool,
    pub succeeded: bool,
}

// ---------------------------------------------------------------------------
// SimEndpointFactory
// ---------------------------------------------------------------------------

/// Endpoint factory that records every call its endpoints receive.
///
/// Cheap to clone; clones share all records. Closing the gate makes every
/// subsequent `on_message` block until it is reopened, which keeps workers
/// busy for shutdown tests.
#[derive(Clone)]
pub struct SimEndpointFactory {
    // ---
    shared: Arc<Shared>,
}

struct Shared {
    // ---
    transacted: bool,
    created: AtomicUsize,
    released: AtomicUsize,
    in_flight: AtomicUsize,
    fail_create: AtomicBool,
    deliveries: Mutex<Vec<Delivery>>,
    calls: Mutex<Vec<(usize, EndpointCall)>>,
    changed: Condvar,
    gate_open: Mutex<bool>,
    gate: Condvar,
}

// ---

impl SimEndpointFactory {
    // ---
    pub fn new(transacted: bool) -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                transacted,
                created: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                deliveries: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                changed: Condvar::new(),
                gate_open: Mutex::new(true),
                gate: Condvar::new(),
            }),
        }
    }

    pub fn close_gate(&self) {
        *self.shared.gate_open.lock() = false;
    }

    pub fn open_gate(&self) {
        // ---
        *self.shared.gate_open.lock() = true;
        self.shared.gate.notify_all();
    }

    /// Make `create_endpoint` fail until called with `false`.
    pub fn fail_create(&self, fail: bool) {
        self.shared.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Endpoints currently inside `on_message`.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.shared.deliveries.lock().clone()
    }

    pub fn calls(&self) -> Vec<(usize, EndpointCall)> {
        self.shared.calls.lock().clone()
    }

    /// Wait until at least `n` `on_message` calls have completed.
    pub fn wait_for_deliveries(&self, n: usize, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;
        let mut deliveries = self.shared.deliveries.lock();
        while deliveries.len() < n {
            if self.shared.changed.wait_until(&mut deliveries, deadline).timed_out() {
                return deliveries.len() >= n;
            }
        }
        true
    }

    /// Wait until `n` endpoints are blocked inside `on_message`.
    pub fn wait_in_flight(&self, n: usize, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;
        while self.in_flight() < n {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

// ---

impl EndpointFactory for SimEndpointFactory {
    // ---
    fn create_endpoint(&self, resource: Option<XaResourcePtr>) -> Result<EndpointPtr> {
        // ---
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(BrokerError::Endpoint("endpoint creation refused".into()));
        }
        let seq = self.shared.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(SimEndpoint {
            seq,
            with_xa: resource.is_some(),
            shared: self.shared.clone(),
        }))
    }

    fn is_delivery_transacted(&self, _method: DeliveryMethod) -> bool {
        self.shared.transacted
    }
}

// ---------------------------------------------------------------------------
// SimEndpoint
// ---------------------------------------------------------------------------

pub struct SimEndpoint {
    // ---
    seq: usize,
    with_xa: bool,
    shared: Arc<Shared>,
}

// ---

impl SimEndpoint {
    fn record(&self, call: EndpointCall) {
        self.shared.calls.lock().push((self.seq, call));
    }

    fn wait_gate(&self) {
        // ---
        let mut open = self.shared.gate_open.lock();
        while !*open {
            self.shared.gate.wait(&mut open);
        }
    }

    fn finish(&self, message: &Message, succeeded: bool) {
        // ---
        self.shared.deliveries.lock().push(Delivery {
            endpoint: self.seq,
            message: message.clone(),
            with_xa: self.with_xa,
            succeeded,
        });
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.changed.notify_all();
    }
}

// ---

impl Endpoint for SimEndpoint {
    // ---
    fn before_delivery(&mut self, _method: DeliveryMethod) -> Result<()> {
        self.record(EndpointCall::Before);
        Ok(())
    }

    fn on_message(&mut self, message: &Message) -> Result<()> {
        // ---
        self.record(EndpointCall::OnMessage);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        self.wait_gate();

        match message.as_text() {
            Some(FAIL_TEXT) => {
                self.finish(message, false);
                Err(BrokerError::Endpoint(format!("endpoint rejected {}", message.id_for_log())))
            }
            Some(PANIC_TEXT) => {
                self.finish(message, false);
                panic!("endpoint panicked on {}", message.id_for_log());
            }
            _ => {
                self.finish(message, true);
                Ok(())
            }
        }
    }

    fn after_delivery(&mut self) -> Result<()> {
        self.record(EndpointCall::After);
        Ok(())
    }

    fn release(&mut self) {
        // ---
        self.record(EndpointCall::Release);
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// SimTransactionCoordinator
// ---------------------------------------------------------------------------

/// One-phase coordinator driving the enlisted resource directly.
#[derive(Default)]
pub struct SimTransactionCoordinator {
    // ---
    timeout: Mutex<Option<Duration>>,
    active: Mutex<HashMap<Xid, XaResourcePtr>>,
    outcomes: Mutex<Vec<(Xid, TxOutcome)>>,
}

// ---

impl SimTransactionCoordinator {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<(Xid, TxOutcome)> {
        self.outcomes.lock().clone()
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

// ---

impl TransactionCoordinator for SimTransactionCoordinator {
    // ---
    fn set_transaction_timeout(&self, timeout: Duration) -> Result<()> {
        // ---
        *self.timeout.lock() = Some(timeout);
        Ok(())
    }

    fn begin(&self, resource: XaResourcePtr) -> Result<Xid> {
        // ---
        let xid = Xid::new();
        if let Some(timeout) = *self.timeout.lock() {
            resource.set_transaction_timeout(timeout)?;
        }
        resource.start(&xid)?;
        self.active.lock().insert(xid, resource);
        Ok(xid)
    }

    fn end(&self, xid: &Xid, outcome: TxOutcome) -> Result<()> {
        // ---
        let resource = self
            .active
            .lock()
            .remove(xid)
            .ok_or_else(|| BrokerError::Transaction(format!("{xid} is not active")))?;

        self.outcomes.lock().push((*xid, outcome));
        resource.end(xid, outcome == TxOutcome::Commit)?;
        match outcome {
            TxOutcome::Commit => resource.commit(xid, true),
            TxOutcome::Rollback => resource.rollback(xid),
        }
    }
}

// ---------------------------------------------------------------------------
// SimDirectory
// ---------------------------------------------------------------------------

/// Name registry standing in for a naming service.
///
/// Unregistered destinations resolve on the fly when the caller names a
/// concrete kind.
#[derive(Default)]
pub struct SimDirectory {
    // ---
    factories: Mutex<HashMap<String, ConnectionFactoryPtr>>,
    destinations: Mutex<HashMap<String, Destination>>,
    fail_next_lookups: AtomicU32,
    lookups: AtomicUsize,
}

// ---

impl SimDirectory {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory with `broker`'s connection factory bound at `name`.
    pub fn with_broker(name: &str, broker: &SimBroker) -> Self {
        // ---
        let dir = Self::new();
        dir.bind_factory(name, Arc::new(SimConnectionFactory::new(broker.clone())));
        dir
    }

    pub fn bind_factory(&self, name: &str, factory: ConnectionFactoryPtr) {
        self.factories.lock().insert(name.to_string(), factory);
    }

    pub fn bind_destination(&self, name: &str, destination: Destination) {
        self.destinations.lock().insert(name.to_string(), destination);
    }

    /// Fail the next `n` destination lookups.
    pub fn fail_next_lookups(&self, n: u32) {
        self.fail_next_lookups.store(n, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

// ---

impl Directory for SimDirectory {
    // ---
    fn lookup_connection_factory(&self, name: &str, _params: &DirectoryParameters) -> Result<ConnectionFactoryPtr> {
        // ---
        self.factories
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::Setup(format!("no connection factory bound at `{name}`")))
    }

    fn lookup_destination(&self, name: &str, kind: DestinationKind, _params: &DirectoryParameters) -> Result<Destination> {
        // ---
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Setup(format!("directory unavailable looking up `{name}`")));
        }

        if let Some(bound) = self.destinations.lock().get(name) {
            if kind != DestinationKind::Any && kind != bound.kind {
                return Err(BrokerError::InvalidDestination(format!(
                    "`{name}` is bound to {bound}, not a {kind:?}"
                )));
            }
            return Ok(bound.clone());
        }

        match kind {
            DestinationKind::Queue => Ok(Destination::queue(name)),
            DestinationKind::Topic => Ok(Destination::topic(name)),
            DestinationKind::Any => Err(BrokerError::InvalidDestination(format!("nothing bound at `{name}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn directory_resolves_bound_and_concrete_names() {
        // ---
        let dir = SimDirectory::new();
        dir.bind_destination("orders", Destination::queue("ORDERS.Q"));
        let params = DirectoryParameters::new();

        let bound = dir.lookup_destination("orders", DestinationKind::Any, &params).unwrap();
        assert_eq!(bound.name, "ORDERS.Q");
        assert!(dir.lookup_destination("orders", DestinationKind::Topic, &params).is_err());
        assert!(dir.lookup_destination("ghost", DestinationKind::Any, &params).is_err());
        assert!(dir.lookup_destination("ghost", DestinationKind::Topic, &params).unwrap().is_topic());
    }

    #[test]
    fn endpoint_records_call_order() {
        // ---
        let factory = SimEndpointFactory::new(false);
        let mut ep = factory.create_endpoint(None).unwrap();
        ep.before_delivery(DeliveryMethod::OnMessage).unwrap();
        ep.on_message(&Message::text("hi")).unwrap();
        ep.after_delivery().unwrap();
        ep.release();

        let calls: Vec<_> = factory.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(
            calls,
            vec![EndpointCall::Before, EndpointCall::OnMessage, EndpointCall::After, EndpointCall::Release]
        );
        assert!(factory.wait_for_deliveries(1, Duration::from_millis(10)));
    }
}
