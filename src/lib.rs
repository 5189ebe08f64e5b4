//! Durable RabbitMQ queue client.
//!
//! One supervised broker connection, multiplexed into named channels that are
//! opened on demand, with publish/poll/consume/ack operations on prefixed
//! queue names.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{load_config, ProviderConfig, QueueSettings};
pub use rabbitmq::{
    register, Envelope, Outcome, Payload, QueueError, RabbitMQ, SendOptions, DEFAULT_CHANNEL,
};
