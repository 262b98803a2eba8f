use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use brokerlink_domain::{
    // ---
    BrokerError,
    Destination,
    Message,
    MessageConsumer,
    MessageProducer,
    Result,
    SendOptions,
};

// ---

use super::broker::{deadline_after, Flow, Source};
use super::session::SessionCore;

// ---------------------------------------------------------------------------
// SimConsumer
// ---------------------------------------------------------------------------

pub struct SimConsumer {
    // ---
    session: Arc<SessionCore>,
    source: Source,
    closed: AtomicBool,
}

// ---

impl SimConsumer {
    // ---
    pub(crate) fn new(session: Arc<SessionCore>, source: Source) -> Self {
        // ---
        Self {
            session,
            source,
            closed: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("consumer"));
        }
        self.session.check()
    }

    fn flow(&self) -> Flow {
        // ---
        if self.closed.load(Ordering::SeqCst) || self.session.is_closed() {
            Flow::Abort
        } else {
            self.session.conn.flow()
        }
    }

    fn accept(&self, mut batch: Vec<Message>) -> Option<Message> {
        // ---
        let message = batch.pop()?;
        self.session.received(&self.source, &message);
        Some(message)
    }
}

// ---

impl MessageConsumer for SimConsumer {
    // ---
    fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        // ---
        self.check()?;
        let batch = self
            .session
            .broker()
            .wait_take(&self.source, 1, deadline_after(timeout), || self.flow());
        Ok(self.accept(batch))
    }

    fn receive_no_wait(&self) -> Result<Option<Message>> {
        // ---
        self.check()?;
        if self.flow() != Flow::Deliver {
            return Ok(None);
        }
        let batch = self.session.broker().take(&self.source, 1);
        Ok(self.accept(batch))
    }

    fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.session.broker().release_source(&self.source);
            self.session.broker().wake_all();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimProducer
// ---------------------------------------------------------------------------

pub struct SimProducer {
    // ---
    session: Arc<SessionCore>,
    destination: Option<Destination>,
    closed: AtomicBool,
}

// ---

impl SimProducer {
    // ---
    pub(crate) fn new(session: Arc<SessionCore>, destination: Option<Destination>) -> Self {
        // ---
        Self {
            session,
            destination,
            closed: AtomicBool::new(false),
        }
    }
}

// ---

impl MessageProducer for SimProducer {
    // ---
    fn send(
        &self,
        destination: Option<&Destination>,
        mut message: Message,
        options: &SendOptions,
    ) -> Result<String> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("producer"));
        }
        self.session.check()?;

        let target = destination
            .or(self.destination.as_ref())
            .ok_or_else(|| BrokerError::InvalidDestination("producer has no destination".into()))?
            .clone();

        message
            .properties
            .insert("JMSPriority".into(), options.priority.as_u8().to_string());
        message
            .properties
            .insert("JMSDeliveryMode".into(), format!("{:?}", options.delivery_mode));
        if let Some(ttl) = options.time_to_live {
            message
                .properties
                .insert("JMSExpiration".into(), ttl.as_millis().to_string());
        }

        let id = message.ensure_id().to_string();
        self.session.dispatch(&target, message)?;
        Ok(id)
    }

    fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
