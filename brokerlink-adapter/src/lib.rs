//! brokerlink resource adapter.
//!
//! Two subsystems over the abstract broker client of `brokerlink-domain`:
//!
//! - **Outbound.** A [`ConnectionMultiplexer`] owns one physical broker
//!   connection and one session, and hands out any number of lightweight
//!   [`SessionHandle`]s. Every broker call made through a handle runs under
//!   the multiplexer's fair, timed, reentrant [`ReentrantLock`], so callers
//!   on different threads never interleave on the shared session.
//!   [`ManagedConnectionFactory`] creates multiplexers and matches idle ones
//!   against new requests with [`match_multiplexer`].
//!
//! - **Inflow.** An [`InflowActivation`] connects a destination to an
//!   endpoint factory through a [`ServerSessionPool`] of
//!   [`ServerSessionWorker`]s, and reconnects on broker failure under its
//!   [`brokerlink_domain::ReconnectPolicy`]. [`ResourceAdapter`] keeps the
//!   registry of activations.
//!
//! # Structure
//!
//! ```text
//!   handle ──► multiplexer ──► lock           (outbound)
//!     │            │
//!     │            ├──► transaction
//!     └── event ◄──┘
//!   factory ──► matcher
//!
//!   adapter ──► activation ──► pool ──► worker ──► work   (inflow)
//! ```

mod activation;
mod adapter;
mod event;
mod factory;
mod handle;
mod lock;
mod matcher;
mod multiplexer;
mod pool;
mod transaction;
mod work;
mod worker;

// --- locking
pub use lock::{LockGuard, ReentrantLock};

// --- outbound
pub use event::{
    // ---
    ConnectionEvent,
    ConnectionEventKind,
    ConnectionEventListener,
    ConnectionEventListenerPtr,
    HandleId,
};
pub use factory::{Allocation, ManagedConnectionFactory};
pub use handle::{HandleConsumer, HandleProducer, SessionHandle};
pub use matcher::match_multiplexer;
pub use multiplexer::{ConnectionMultiplexer, Lifecycle, MultiplexerMetadata};
pub use transaction::{LocalTransaction, LockedXaResource};

pub(crate) use handle::HandleShared;

// --- inflow
pub use activation::{ActivationDeps, ActivationId, ActivationState, InflowActivation, RecoveryOutcome};
pub use adapter::ResourceAdapter;
pub use pool::{PoolSettings, ServerSessionPool};
pub use worker::{ServerSessionWorker, WorkerState};

// --- work
pub use work::{RuntimeWorkScheduler, ThreadWorkScheduler};
