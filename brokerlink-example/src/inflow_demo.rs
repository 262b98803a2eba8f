//! Inflow demo — deliver through a server session pool, lose the broker,
//! reconnect.
//!
//! Flow:
//!   1. Register an activation on the resource adapter.
//!   2. Publish a batch and wait for the endpoint to see it.
//!   3. Break every connection and refuse the next few connects.
//!   4. Wait for the activation to reconnect, or report exhaustion.
//!   5. Publish again, then deactivate.

use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use brokerlink_adapter::{ActivationState, InflowActivation, ResourceAdapter, RuntimeWorkScheduler};
use brokerlink_domain::{ActivationConfig, DestinationKind, ReconnectPolicy};
use brokerlink_sim::{SimBroker, SimDirectory, SimEndpointFactory};

// ---

use super::Config;

const CF: &str = "java:/ConnectionFactory";
const QUEUE: &str = "demo.inflow";
const PATIENCE: Duration = Duration::from_secs(10);

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    // ---
    let broker = SimBroker::default();
    let ra = ResourceAdapter::new(
        Arc::new(SimDirectory::with_broker(CF, &broker)),
        Arc::new(RuntimeWorkScheduler::current()?),
        None,
    );
    let endpoints = SimEndpointFactory::new(false);

    let config = ActivationConfig {
        destination_type: DestinationKind::Queue,
        max_session: cfg.max_session,
        reconnect: ReconnectPolicy {
            interval: Duration::from_millis(cfg.reconnect_interval_ms),
            ..ReconnectPolicy::from_raw(0, cfg.reconnect_attempts)
        },
        ..ActivationConfig::new(QUEUE, CF)
    };
    let id = ra.endpoint_activation(config, Arc::new(endpoints.clone()))?;
    let activation = ra
        .activation(id)
        .ok_or_else(|| anyhow::anyhow!("activation {id} vanished"))?;

    wait_for(&activation, "activation to start", |a| a.state() == ActivationState::Active).await?;
    publish(&broker, cfg.messages, "before")?;
    anyhow::ensure!(
        tokio::task::block_in_place(|| endpoints.wait_for_deliveries(cfg.messages, PATIENCE)),
        "first batch not delivered"
    );
    println!("delivered {} messages with {} workers", cfg.messages, cfg.max_session);

    // --- failure ------------------------------------------------------------

    broker.fail_next_connects(cfg.fail_connects);
    broker.kill_connections();
    println!("broker dropped all connections, refusing the next {}", cfg.fail_connects);

    wait_for(&activation, "recovery to finish", |a| {
        !a.is_recovering() && (a.state() == ActivationState::Active || !a.is_delivery_active())
    })
    .await?;

    if !activation.is_delivery_active() {
        println!(
            "reconnect gave up after {} connection attempts; activation stopped",
            broker.connect_attempt_count()
        );
        tokio::task::block_in_place(|| ra.stop());
        return Ok(());
    }
    println!("reconnected after {} connection attempts", broker.connect_attempt_count());

    publish(&broker, cfg.messages, "after")?;
    anyhow::ensure!(
        tokio::task::block_in_place(|| endpoints.wait_for_deliveries(cfg.messages * 2, PATIENCE)),
        "second batch not delivered"
    );
    println!("delivered {} messages in total", endpoints.deliveries().len());

    tokio::task::block_in_place(|| ra.endpoint_deactivation(id))?;
    println!("deactivated; endpoints released: {}", endpoints.released());
    Ok(())
}

fn publish(broker: &SimBroker, n: usize, tag: &str) -> anyhow::Result<()> {
    // ---
    for i in 0..n {
        broker.send_text(QUEUE, &format!("{tag} {i}"))?;
    }
    Ok(())
}

async fn wait_for(
    activation: &InflowActivation,
    what: &str,
    done: impl Fn(&InflowActivation) -> bool,
) -> anyhow::Result<()> {
    // ---
    let deadline = Instant::now() + PATIENCE;
    while !done(activation) {
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
