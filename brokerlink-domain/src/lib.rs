//! Core traits and types for the brokerlink resource adapter.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `brokerlink-domain` and speak its types. No implementations live here.
//!
//! # Structure
//!
//! - [`error`]    — [`BrokerError`], [`ErrorClass`] and [`Result<T>`] alias
//! - [`message`]  — [`Message`], [`Destination`], [`DestinationKind`]
//! - [`delivery`] — [`SendOptions`], [`Priority`], [`DeliveryMode`]
//! - [`broker`]   — the abstract broker client traits
//! - [`endpoint`] — endpoint, transaction, work and directory collaborators
//! - [`config`]   — [`ActivationConfig`], [`FactorySettings`], request info

mod broker;
mod config;
mod delivery;
mod endpoint;
mod error;
mod message;

// --- error
pub use error::{BrokerError, ErrorClass, Result};

// --- message
pub use message::{Destination, DestinationKind, Message, MessageBody};

// --- delivery
pub use delivery::{DeliveryMode, Priority, SendOptions};

// --- broker
pub use broker::{
    // ---
    AckMode,
    BrokerConnection,
    BrokerSession,
    Capabilities,
    ConnectionConsumer,
    ConnectionConsumerPtr,
    ConnectionFactory,
    ConnectionFactoryPtr,
    ConnectionMetadata,
    ConnectionPtr,
    ConsumerOptions,
    ConsumerPtr,
    Credentials,
    ExceptionListener,
    ExceptionListenerPtr,
    MessageConsumer,
    MessageProducer,
    ProducerPtr,
    ServerSession,
    ServerSessionPtr,
    ServerSessionSource,
    ServerSessionSourcePtr,
    SessionMode,
    SessionPtr,
    Subscription,
    XaResource,
    XaResourcePtr,
    XaSession,
    Xid,
};

// --- endpoint
pub use endpoint::{
    // ---
    parse_directory_parameters,
    DeliveryMethod,
    Directory,
    DirectoryParameters,
    DirectoryPtr,
    Endpoint,
    EndpointFactory,
    EndpointFactoryPtr,
    EndpointPtr,
    TransactionCoordinator,
    TransactionCoordinatorPtr,
    TxOutcome,
    Work,
    WorkScheduler,
    WorkSchedulerPtr,
};

// --- config
pub use config::{
    // ---
    ActivationConfig,
    ConnectionRequestInfo,
    ConnectionType,
    FactoryIdentity,
    FactorySettings,
    ForceDrain,
    ReconnectPolicy,
};
