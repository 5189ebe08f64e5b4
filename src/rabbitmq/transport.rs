// src/rabbitmq/transport.rs
// The broker boundary: everything the provider needs from an AMQP client

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::Result;
use super::message::{OutboundMessage, Payload};

/// Why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly close requested by either side.
    Requested,
    /// The transport failed underneath us.
    Unexpected(String),
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Requested => write!(f, "requested"),
            CloseCause::Unexpected(reason) => write!(f, "unexpected: {}", reason),
        }
    }
}

/// Fired at most once, when the resource it was registered on closes.
pub type CloseListener = Box<dyn FnOnce(CloseCause) + Send + 'static>;

/// Long-lived delivery callback for `consume`.
pub type DeliveryHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// A broker-delivered message. The provider only reads it and hands the
/// delivery tag back on ack/nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
}

impl Envelope {
    /// Parse the body as a JSON value.
    pub fn record(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Turn the delivery back into a payload for re-sending. JSON bodies come
    /// back as records so their attempt counter keeps counting.
    pub fn to_payload(&self) -> Payload {
        match self.record() {
            Ok(record) => Payload::Record(record),
            Err(_) => Payload::Bytes(self.data.clone()),
        }
    }
}

/// Opens transport sessions to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// One live transport session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Fire `listener` once when the session goes away.
    ///
    /// Transports that only surface errors (lapin's `on_error`) never report
    /// `CloseCause::Requested`. Closes made through `close` are logged by the
    /// supervisor itself, so nothing is lost for them.
    fn on_close(&self, listener: CloseListener);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A logical channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()>;

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()>;

    /// Single non-blocking fetch in manual-acknowledgment mode.
    async fn get(&self, queue: &str) -> Result<Option<Envelope>>;

    async fn ack(&self, envelope: &Envelope) -> Result<()>;

    /// Negative acknowledgment, leaving redelivery to the broker.
    async fn nack(&self, envelope: &Envelope) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Subscribe `handler`; returns the consumer tag.
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String>;

    /// Same contract as `BrokerConnection::on_close`.
    fn on_close(&self, listener: CloseListener);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
