//! In-process broker client double for brokerlink unit and integration
//! testing.
//!
//! [`SimConnectionFactory`] implements [`brokerlink_domain::ConnectionFactory`]
//! over a shared in-memory [`SimBroker`] instead of a network client.
//! [`SimConfig`] picks the client capabilities; [`SimBroker`] injects faults:
//!
//! - Refuse the next N connection attempts, or all of them
//! - Break every open connection, firing exception listeners off-thread
//! - Record every connection attempt with its timestamp
//! - Record every XA call
//!
//! [`SimEndpointFactory`], [`SimTransactionCoordinator`] and [`SimDirectory`]
//! stand in for the container.
//!
//! # Quick start
//!
//! ```rust
//! use brokerlink_sim::{SimBroker, SimConfig, SimDirectory};
//!
//! let broker = SimBroker::new(SimConfig::non_xa());
//! let directory = SimDirectory::with_broker("java:/ConnectionFactory", &broker);
//! broker.send_text("orders", "hello").unwrap();
//! ```

mod broker;
mod config;
mod connection;
mod consumer;
mod endpoint;
mod session;

// --- public API
pub use broker::{ConnectAttempt, SimBroker, XaOp};
pub use config::SimConfig;
pub use connection::{SimConnection, SimConnectionFactory};
pub use consumer::{SimConsumer, SimProducer};
pub use endpoint::{
    // ---
    Delivery,
    EndpointCall,
    SimDirectory,
    SimEndpoint,
    SimEndpointFactory,
    SimTransactionCoordinator,
    FAIL_TEXT,
    PANIC_TEXT,
};
pub use session::{SimSession, SimXaResource};
