// In-memory broker used by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rabbitmq_provider::rabbitmq::{
    BrokerChannel, BrokerConnection, CloseCause, CloseListener, DeliveryHandler, Envelope,
    ExitHook, OutboundMessage, QueueError, Result, ShutdownFn, Transport,
};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub content_type: Option<String>,
    pub priority: u8,
    pub timestamp: u64,
    pub redelivered: bool,
}

impl StoredMessage {
    fn from_outbound(message: &OutboundMessage) -> Self {
        Self {
            body: message.body.clone(),
            message_id: message.properties.message_id.clone(),
            content_type: message.properties.content_type.clone(),
            priority: message.properties.priority,
            timestamp: message.properties.timestamp,
            redelivered: false,
        }
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("stored body is JSON")
    }
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: usize,
    connects: usize,
    channels_created: usize,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    declared: Vec<String>,
    events: Vec<(u64, String)>,
    consumers: HashMap<String, DeliveryHandler>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
    connections: Vec<Arc<MemoryConnection>>,
    channels: Vec<Arc<MemoryChannel>>,
    fail_next_channel: bool,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    held: AtomicBool,
    gate: Semaphore,
    next_id: AtomicU64,
    next_tag: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            reachable: AtomicBool::new(true),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            next_id: AtomicU64::new(1),
            next_tag: AtomicU64::new(1),
        })
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Park connect attempts until `release_connects`.
    pub fn hold_connects(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release_connects(&self, count: usize) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(count);
    }

    pub fn fail_next_channel(&self) {
        self.lock().fail_next_channel = true;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn channels_created(&self) -> usize {
        self.lock().channels_created
    }

    pub fn declared(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn channel_events(&self, channel: u64) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter(|(id, _)| *id == channel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<u64> {
        self.lock().nacked.clone()
    }

    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.lock().channels.clone()
    }

    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.lock().connections.clone()
    }

    /// Simulate the transport dropping: every open connection and its
    /// channels die, and each connection reports an unexpected close.
    pub fn drop_connections(&self) {
        let (connections, channels) = {
            let state = self.lock();
            (state.connections.clone(), state.channels.clone())
        };
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
        }
        for connection in connections {
            if connection.open.swap(false, Ordering::SeqCst) {
                connection.fire(CloseCause::Unexpected("connection reset by peer".to_string()));
            }
        }
    }

    /// Broker-initiated orderly close of every open connection.
    pub fn close_connections(&self) {
        let (connections, channels) = {
            let state = self.lock();
            (state.connections.clone(), state.channels.clone())
        };
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
        }
        for connection in connections {
            if connection.open.swap(false, Ordering::SeqCst) {
                connection.fire(CloseCause::Requested);
            }
        }
    }

    fn push(&self, queue: &str, message: StoredMessage) {
        let consumer = self.lock().consumers.get(queue).cloned();
        match consumer {
            Some(handler) => self.deliver(queue, message, handler),
            None => self
                .lock()
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(message),
        }
    }

    fn envelope(&self, queue: &str, message: StoredMessage) -> Envelope {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            delivery_tag: tag,
            data: message.body.clone(),
            redelivered: message.redelivered,
            exchange: String::new(),
            routing_key: queue.to_string(),
            message_id: Some(message.message_id.clone()),
            content_type: message.content_type.clone(),
            timestamp: Some(message.timestamp),
            priority: Some(message.priority),
        };
        self.lock().unacked.insert(tag, (queue.to_string(), message));
        envelope
    }

    fn deliver(&self, queue: &str, message: StoredMessage, handler: DeliveryHandler) {
        let envelope = self.envelope(queue, message);
        tokio::spawn(handler(envelope));
    }
}

struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.broker.lock().connect_attempts += 1;
        tokio::task::yield_now().await;

        if self.broker.held.load(Ordering::SeqCst) {
            let permit = self
                .broker
                .gate
                .acquire()
                .await
                .map_err(|e| QueueError::ConnectionError(e.to_string()))?;
            permit.forget();
        }

        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionError(format!(
                "Failed to connect to {}: connection refused",
                url
            )));
        }

        let connection = Arc::new(MemoryConnection {
            id: self.broker.next_id.fetch_add(1, Ordering::SeqCst),
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
        });
        let mut state = self.broker.lock();
        state.connects += 1;
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

pub struct MemoryConnection {
    pub id: u64,
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    listener: Mutex<Option<CloseListener>>,
}

impl MemoryConnection {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    fn fire(&self, cause: CloseCause) {
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener(cause);
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        tokio::task::yield_now().await;
        if !self.is_open() {
            return Err(QueueError::ChannelError("connection is closed".to_string()));
        }

        let mut state = self.broker.lock();
        if std::mem::take(&mut state.fail_next_channel) {
            return Err(QueueError::ChannelError("channel open refused".to_string()));
        }

        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id.fetch_add(1, Ordering::SeqCst),
            connection: self.id,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            closed_by_client: AtomicBool::new(false),
            listener: Mutex::new(None),
        });
        state.channels_created += 1;
        state.channels.push(channel.clone());
        Ok(channel)
    }

    fn on_close(&self, listener: CloseListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(QueueError::ConnectionError("already closed".to_string()));
        }
        let channels = self.broker.channels();
        for channel in channels.iter().filter(|c| c.connection == self.id) {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.fire(CloseCause::Requested);
        Ok(())
    }
}

pub struct MemoryChannel {
    pub id: u64,
    pub connection: u64,
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    closed_by_client: AtomicBool,
    listener: Mutex<Option<CloseListener>>,
}

impl MemoryChannel {
    pub fn is_open_now(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }

    /// Broker-side channel error: the channel dies and reports it.
    pub fn kill(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener(CloseCause::Unexpected(reason.to_string()));
        }
    }

    /// Channel dies without any close notification.
    pub fn vanish(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn record(&self, event: String) {
        self.broker.lock().events.push((self.id, event));
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open_now() {
            Ok(())
        } else {
            Err(QueueError::ChannelError("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()> {
        self.check_open()?;
        self.record(format!("declare {}", queue));
        let mut state = self.broker.lock();
        if !state.declared.iter().any(|q| q == queue) {
            state.declared.push(queue.to_string());
        }
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()> {
        self.check_open()?;
        self.record(format!("publish {}", queue));
        tokio::task::yield_now().await;
        self.broker.push(queue, StoredMessage::from_outbound(message));
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Envelope>> {
        self.check_open()?;
        self.record(format!("get {}", queue));
        let next = self
            .broker
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front());
        Ok(next.map(|message| self.broker.envelope(queue, message)))
    }

    async fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.check_open()?;
        self.record(format!("ack {}", envelope.delivery_tag));
        let mut state = self.broker.lock();
        if state.unacked.remove(&envelope.delivery_tag).is_none() {
            return Err(QueueError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                envelope.delivery_tag
            )));
        }
        state.acked.push(envelope.delivery_tag);
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope) -> Result<()> {
        self.check_open()?;
        self.record(format!("nack {}", envelope.delivery_tag));
        let requeued = {
            let mut state = self.broker.lock();
            let Some((queue, mut message)) = state.unacked.remove(&envelope.delivery_tag) else {
                return Err(QueueError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    envelope.delivery_tag
                )));
            };
            state.nacked.push(envelope.delivery_tag);
            message.redelivered = true;
            (queue, message)
        };
        self.broker.push(&requeued.0, requeued.1);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.check_open()?;
        self.record(format!("prefetch {}", count));
        // qos is a round trip on a real broker
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        self.check_open()?;
        self.record(format!("consume {}", queue));
        let backlog: Vec<StoredMessage> = {
            let mut state = self.broker.lock();
            state.consumers.insert(queue.to_string(), handler.clone());
            state
                .queues
                .get_mut(queue)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        };
        for message in backlog {
            self.broker.deliver(queue, message, handler.clone());
        }
        Ok(format!("consumer-{}", self.id))
    }

    fn on_close(&self, listener: CloseListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn is_open(&self) -> bool {
        self.is_open_now()
    }

    async fn close(&self) -> Result<()> {
        self.closed_by_client.store(true, Ordering::SeqCst);
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(QueueError::ChannelError("channel already closed".to_string()));
        }
        Ok(())
    }
}

/// Exit hook that keeps the registered shutdown for the test to run.
#[derive(Default)]
pub struct RecordingExitHook {
    registrations: Mutex<Vec<ShutdownFn>>,
}

impl RecordingExitHook {
    pub fn registrations(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn take(&self) -> Option<ShutdownFn> {
        self.registrations.lock().unwrap().pop()
    }
}

impl ExitHook for RecordingExitHook {
    fn register(&self, shutdown: ShutdownFn) {
        self.registrations.lock().unwrap().push(shutdown);
    }
}
