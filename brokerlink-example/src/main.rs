//! brokerlink demo driver.
//!
//! Runs both subsystems against the in-process broker double:
//!
//! * **Outbound** — several threads share one physical connection through
//!   session handles on a single multiplexer, then read back what they sent.
//!
//! * **Inflow** — an activation delivers from a queue to a recording
//!   endpoint, the broker drops every connection, and the activation
//!   reconnects under the configured reconnect policy.
//!
//! Run with:
//!   cargo run -p brokerlink-example
//!   cargo run -p brokerlink-example -- --handles 8 --messages 50
//!   cargo run -p brokerlink-example -- --fail-connects 3 --reconnect-attempts 2

use clap::Parser;

mod inflow_demo;
mod outbound_demo;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "brokerlink-demo", about = "brokerlink resource adapter demo runner")]
struct Config {
    // ---
    /// Concurrent session handles sharing one multiplexer.
    #[arg(long, default_value_t = 4)]
    handles: usize,

    /// Messages sent per handle, and delivered through the inflow pool.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Worker sessions in the inflow pool (`maxSession`).
    #[arg(long, default_value_t = 3)]
    max_session: usize,

    /// Multiplexer lock wait in seconds; zero or negative waits forever.
    #[arg(long, default_value_t = 5)]
    lock_timeout_secs: i64,

    /// Sleep between reconnect attempts, in milliseconds.
    #[arg(long, default_value_t = 200)]
    reconnect_interval_ms: u64,

    /// Reconnect attempts after a failure; -1 retries until stopped.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    reconnect_attempts: i32,

    /// Connection attempts the broker refuses after dropping connections.
    #[arg(long, default_value_t = 2)]
    fail_connects: u32,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .with_ansi(!no_color)
        .init();

    println!("=== 1. Outbound multiplexing demo ===");
    outbound_demo::run(&cfg).await?;

    println!();
    println!("=== 2. Inflow reconnect demo ===");
    inflow_demo::run(&cfg).await?;

    Ok(())
}
