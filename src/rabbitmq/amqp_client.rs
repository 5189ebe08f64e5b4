// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the transport boundary

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{QueueError, Result};
use super::message::OutboundMessage;
use super::transport::{
    BrokerChannel, BrokerConnection, CloseCause, CloseListener, DeliveryHandler, Envelope,
    Transport,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name("rabbitmq-provider".into())
}

/// Connects to a real broker through lapin.
#[derive(Clone)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self {
            properties: connection_properties(),
        }
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

impl Default for LapinTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        info!("Attempting to connect to RabbitMQ at {}", url);
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| QueueError::ConnectionError(format!("Failed to connect: {}", e)))?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to create channel: {}", e)))?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_close(&self, listener: CloseListener) {
        self.connection.on_error(once(listener));
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| QueueError::ConnectionError(e.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::DeclareError(format!("Failed to declare queue {}: {}", queue, e)))?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(message),
            )
            .await
            .map_err(|e| QueueError::PublishError(e.to_string()))?
            .await
            .map_err(|e| QueueError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Envelope>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| QueueError::ConsumeError(e.to_string()))?;

        Ok(message.map(|message| envelope_from(&message.delivery)))
    }

    async fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.channel
            .basic_ack(envelope.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::AckError(e.to_string()))
    }

    async fn nack(&self, envelope: &Envelope) -> Result<()> {
        self.channel
            .basic_nack(
                envelope.delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| QueueError::AckError(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ConsumeError(e.to_string()))?;

        info!("Started consuming from queue: {}", queue);

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => handler(envelope_from(&delivery)).await,
                    Err(e) => {
                        error!("Error receiving message from {}: {}", queue, e);
                        break;
                    }
                }
            }
            warn!("Consumer for {} stopped", queue);
        });

        Ok(consumer_tag)
    }

    fn on_close(&self, listener: CloseListener) {
        self.channel.on_error(once(listener));
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| QueueError::ChannelError(e.to_string()))
    }
}

// lapin error hooks are FnMut and only see errors, so the cause is always
// Unexpected. Our listeners fire once.
fn once(listener: CloseListener) -> impl FnMut(lapin::Error) + Send + 'static {
    let slot = Mutex::new(Some(listener));
    move |err| {
        let listener = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener(CloseCause::Unexpected(err.to_string()));
        }
    }
}

fn basic_properties(message: &OutboundMessage) -> BasicProperties {
    let meta = &message.properties;
    let mut properties = BasicProperties::default()
        .with_message_id(meta.message_id.clone().into())
        .with_timestamp(meta.timestamp)
        .with_priority(meta.priority);

    if let Some(content_type) = &meta.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if meta.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(expiration) = &meta.expiration {
        properties = properties.with_expiration(expiration.clone().into());
    }
    if let Some(correlation_id) = &meta.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &meta.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    properties
}

fn envelope_from(delivery: &Delivery) -> Envelope {
    let properties = &delivery.properties;
    Envelope {
        delivery_tag: delivery.delivery_tag,
        data: delivery.data.clone(),
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        content_type: properties.content_type().as_ref().map(|ct| ct.as_str().to_string()),
        timestamp: *properties.timestamp(),
        priority: *properties.priority(),
    }
}
