// src/rabbitmq/provider.rs
// Publish, poll, consume and acknowledge on top of the supervised connection

use std::future::Future;
use std::sync::Arc;

use futures::future::FutureExt;
use tracing::{debug, info, warn};

use super::amqp_client::LapinTransport;
use super::channel_manager::{ChannelHandle, ChannelManager, DEFAULT_CHANNEL};
use super::connection::{ConnectionManager, ConnectionSettings, CtrlCExitHook};
use super::errors::Result;
use super::message::{OutboundMessage, Payload, SendOptions};
use super::naming::{QueueNaming, QueueRef};
use super::outcome::Outcome;
use super::transport::{DeliveryHandler, Envelope, Transport};
use crate::config::ProviderConfig;

/// Unacknowledged deliveries allowed per consuming channel.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Queue client over one lazily (re)established broker connection.
///
/// Every operation first makes sure the connection is up. While it cannot be
/// established, operations return `Outcome::Skipped` instead of failing.
#[derive(Clone)]
pub struct RabbitMQ {
    connection: ConnectionManager,
    channels: ChannelManager,
    naming: QueueNaming,
}

impl RabbitMQ {
    pub fn new(url: &str, prefix: &str, transport: Arc<dyn Transport>) -> Self {
        Self::with_settings(url, prefix, transport, ConnectionSettings::default())
    }

    pub fn with_settings(
        url: &str,
        prefix: &str,
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> Self {
        let connection = ConnectionManager::with_settings(url, transport, settings);
        Self {
            channels: ChannelManager::new(connection.clone()),
            connection,
            naming: QueueNaming::new(prefix),
        }
    }

    /// Client for `queue.url`/`queue.prefix`, shutting down on Ctrl-C.
    pub fn from_config(config: &ProviderConfig, transport: Arc<dyn Transport>) -> Self {
        let mut settings = ConnectionSettings::new().with_exit_hook(Arc::new(CtrlCExitHook));
        if let Some(timeout) = config.connect_timeout() {
            settings = settings.with_connect_timeout(timeout);
        }
        Self::with_settings(&config.queue.url, &config.queue.prefix, transport, settings)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn naming(&self) -> &QueueNaming {
        &self.naming
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub async fn ensure_connected(&self) -> bool {
        self.connection.ensure_connected().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn close_all(&self) {
        self.connection.close_all().await
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await
    }

    pub fn complete_queue_name(&self, queue: &str) -> String {
        self.naming.complete_queue_name(queue)
    }

    pub async fn ensure_channel(&self, name: &str) -> Result<Outcome<ChannelHandle>> {
        self.channels.ensure_channel(name).await
    }

    pub async fn send(
        &self,
        queue: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<Outcome<String>> {
        self.send_on(DEFAULT_CHANNEL, queue, payload, options).await
    }

    /// Publish to `{prefix}/{queue}`. Returns the generated message id.
    pub async fn send_on(
        &self,
        channel: &str,
        queue: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<Outcome<String>> {
        let Some(queue) = self.declared(channel, queue).await? else {
            return Ok(Outcome::Skipped);
        };
        let message = OutboundMessage::build(payload.into(), options)?;
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(Outcome::Skipped);
        };

        handle.channel().publish(queue.qualified(), &message).await?;
        debug!(
            queue = %queue.qualified(),
            message_id = %message.properties.message_id,
            "Published message"
        );
        Ok(Outcome::Delivered(message.properties.message_id))
    }

    pub async fn get_message(&self, queue: &str) -> Result<Outcome<Option<Envelope>>> {
        self.get_message_on(DEFAULT_CHANNEL, queue).await
    }

    /// Fetch one message if the queue has one; never waits for a future one.
    pub async fn get_message_on(&self, channel: &str, queue: &str) -> Result<Outcome<Option<Envelope>>> {
        let Some(queue) = self.declared(channel, queue).await? else {
            return Ok(Outcome::Skipped);
        };
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(Outcome::Skipped);
        };

        let envelope = handle.channel().get(queue.qualified()).await?;
        Ok(Outcome::Delivered(envelope))
    }

    pub async fn consume<F, Fut>(&self, queue: &str, handler: F) -> Result<Outcome<String>>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.consume_on(DEFAULT_CHANNEL, queue, handler).await
    }

    /// Subscribe `handler` to `{prefix}/{queue}` with one unacknowledged
    /// delivery at a time. Returns the consumer tag once subscribed.
    pub async fn consume_on<F, Fut>(&self, channel: &str, queue: &str, handler: F) -> Result<Outcome<String>>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(queue) = self.declared(channel, queue).await? else {
            return Ok(Outcome::Skipped);
        };
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(Outcome::Skipped);
        };

        handle.ensure_prefetch(CONSUMER_PREFETCH).await?;

        let handler: DeliveryHandler = Arc::new(move |envelope| handler(envelope).boxed());
        let consumer_tag = handle.channel().consume(queue.qualified(), handler).await?;
        info!(queue = %queue.qualified(), channel = %handle.name(), "Consumer registered");
        Ok(Outcome::Delivered(consumer_tag))
    }

    pub async fn ack(&self, queue: &str, envelope: &Envelope) -> Result<Outcome<()>> {
        self.ack_on(DEFAULT_CHANNEL, queue, envelope).await
    }

    pub async fn ack_on(&self, channel: &str, queue: &str, envelope: &Envelope) -> Result<Outcome<()>> {
        let Some(_queue) = self.declared(channel, queue).await? else {
            return Ok(Outcome::Skipped);
        };
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(Outcome::Skipped);
        };

        handle.channel().ack(envelope).await?;
        Ok(Outcome::Delivered(()))
    }

    pub async fn nack(&self, queue: &str, envelope: &Envelope) -> Result<Outcome<()>> {
        self.nack_on(DEFAULT_CHANNEL, queue, envelope).await
    }

    pub async fn nack_on(&self, channel: &str, queue: &str, envelope: &Envelope) -> Result<Outcome<()>> {
        let Some(_queue) = self.declared(channel, queue).await? else {
            return Ok(Outcome::Skipped);
        };
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(Outcome::Skipped);
        };

        handle.channel().nack(envelope).await?;
        Ok(Outcome::Delivered(()))
    }

    // Shared preamble: connect, open the channel, declare the durable queue.
    async fn declared(&self, channel: &str, queue: &str) -> Result<Option<QueueRef>> {
        let Some(handle) = self.live_channel(channel).await? else {
            return Ok(None);
        };

        let queue = self.naming.resolve(queue);
        handle.channel().declare_durable_queue(queue.qualified()).await?;
        Ok(Some(queue))
    }

    async fn live_channel(&self, channel: &str) -> Result<Option<ChannelHandle>> {
        Ok(self.channels.ensure_channel(channel).await?.delivered())
    }
}

/// Build the client from configuration and connect it once.
///
/// On failure the cause is logged and no client is handed out.
pub async fn register(config: &ProviderConfig) -> Option<RabbitMQ> {
    register_with(config, Arc::new(LapinTransport::new())).await
}

pub async fn register_with(config: &ProviderConfig, transport: Arc<dyn Transport>) -> Option<RabbitMQ> {
    let client = RabbitMQ::from_config(config, transport);
    match client.connect().await {
        Ok(()) => Some(client),
        Err(err) => {
            warn!("Could not connect to RabbitMQ service: {}", err);
            None
        }
    }
}
