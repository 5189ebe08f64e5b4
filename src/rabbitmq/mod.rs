// src/rabbitmq/mod.rs
// Connection and channel lifecycle for a durable RabbitMQ queue client

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod errors;
pub mod message;
pub mod naming;
pub mod outcome;
pub mod provider;
pub mod transport;

mod flight;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinTransport;
pub use channel_manager::{ChannelHandle, ChannelManager, DEFAULT_CHANNEL};
pub use connection::{ConnectionManager, ConnectionSettings, CtrlCExitHook, ExitHook, ShutdownFn};
pub use errors::{QueueError, Result};
pub use message::{annotate_attempts, attempts, OutboundMessage, Payload, SendOptions};
pub use naming::{complete_queue_name, QueueNaming, QueueRef};
pub use outcome::Outcome;
pub use provider::{register, register_with, RabbitMQ, CONSUMER_PREFETCH};
pub use transport::{
    BrokerChannel, BrokerConnection, CloseCause, CloseListener, DeliveryHandler, Envelope,
    Transport,
};
