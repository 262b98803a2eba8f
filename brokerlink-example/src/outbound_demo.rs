//! Outbound demo — N blocking tasks each take a session handle on the same
//! multiplexer and send to one queue.
//!
//! Flow:
//!   1. Allocate a multiplexer through the managed connection factory.
//!   2. Each task gets its own handle and producer and sends its messages.
//!   3. Handles close; the multiplexer survives and is matched again.
//!   4. A fresh handle drains the queue and checks the count.

use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;

// ---

use brokerlink_adapter::{ConnectionMultiplexer, ManagedConnectionFactory};
use brokerlink_domain::{
    // ---
    AckMode,
    ConnectionRequestInfo,
    ConnectionType,
    Destination,
    FactorySettings,
    Message,
    SendOptions,
};
use brokerlink_sim::{SimBroker, SimDirectory};

// ---

use super::Config;

const CF: &str = "java:/ConnectionFactory";
const QUEUE: &str = "demo.outbound";

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    // ---
    let broker = SimBroker::default();
    let settings = FactorySettings {
        connection_factory: CF.into(),
        lock_timeout: FactorySettings::lock_timeout_from_secs(cfg.lock_timeout_secs),
        ..FactorySettings::default()
    };
    let mcf = ManagedConnectionFactory::new(settings, Arc::new(SimDirectory::with_broker(CF, &broker)));
    let info = ConnectionRequestInfo::new(false, AckMode::Auto, ConnectionType::Agnostic);

    let first = mcf.allocate(&[], Some(&info), None)?;
    let mc = first.multiplexer.clone();
    first.handle.close();
    println!("multiplexer {} opened ({:?})", mc.id(), mc.metadata()?);

    // --- senders ------------------------------------------------------------

    let mut tasks = Vec::with_capacity(cfg.handles);
    for n in 0..cfg.handles {
        let mc = mc.clone();
        let messages = cfg.messages;
        tasks.push(tokio::task::spawn_blocking(move || send_batch(&mc, n, messages)));
    }
    for task in tasks {
        task.await.context("sender task panicked")??;
    }
    println!(
        "{} handles sent {} messages over {} physical connection(s)",
        cfg.handles,
        cfg.handles * cfg.messages,
        broker.connect_attempt_count()
    );

    // --- reuse and drain ----------------------------------------------------

    let idle = vec![mc.clone()];
    let again = mcf.allocate(&idle, Some(&info), None)?;
    anyhow::ensure!(!again.created, "expected the idle multiplexer to be matched");

    again.handle.start()?;
    let consumer = again.handle.create_consumer(&Destination::queue(QUEUE), Default::default())?;
    let mut received = 0;
    while consumer.receive(Some(Duration::from_millis(200)))?.is_some() {
        received += 1;
    }
    consumer.close()?;
    again.handle.close();
    println!("drained {received} messages through a reused multiplexer");
    anyhow::ensure!(received == cfg.handles * cfg.messages, "lost messages");

    mc.destroy();
    println!("open connections after destroy: {}", broker.open_connection_count());
    Ok(())
}

fn send_batch(mc: &ConnectionMultiplexer, n: usize, messages: usize) -> anyhow::Result<()> {
    // ---
    let handle = mc.get_connection(None, None)?;
    let queue = Destination::queue(QUEUE);
    let producer = handle.create_producer(Some(&queue))?;
    for i in 0..messages {
        let message = Message::text(format!("handle {n} message {i}")).with_property("sender", n.to_string());
        producer.send(None, message, &SendOptions::default())?;
    }
    producer.close()?;
    handle.close();
    tracing::info!(handle = n, messages, "sender done");
    Ok(())
}
