// src/rabbitmq/channel_manager.rs
// Named channels over the shared connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::errors::{QueueError, Result};
use super::flight::{flight, Slot};
use super::outcome::Outcome;
use super::transport::{BrokerChannel, BrokerConnection, CloseCause};

/// Channel used when callers do not name one.
pub const DEFAULT_CHANNEL: &str = "DEFAULT";

struct HandleInner {
    id: u64,
    name: String,
    channel: Arc<dyn BrokerChannel>,
    prefetch: OnceCell<()>,
}

/// A registered channel. Do not hold one across an await without resolving
/// it again: the registry drops channels as soon as they close.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

impl ChannelHandle {
    fn new(id: u64, name: String, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                name,
                channel,
                prefetch: OnceCell::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.channel.is_open()
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.inner.channel
    }

    /// Run `set_prefetch` once for this channel. Concurrent callers wait for
    /// that one call; a failed call is retried by the next caller.
    pub(crate) async fn ensure_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .prefetch
            .get_or_try_init(|| self.inner.channel.set_prefetch(count))
            .await?;
        Ok(())
    }

    /// Best-effort close; errors are swallowed.
    pub(crate) async fn close_quietly(&self) {
        if let Err(err) = self.inner.channel.close().await {
            debug!(channel = %self.name(), "Ignoring error while closing channel: {}", err);
        }
    }

    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        self.inner.id == other.inner.id
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// name -> open channel, or the creation currently in flight for it.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    slots: Mutex<HashMap<String, Slot<ChannelHandle>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<ChannelHandle>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready { .. }))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Empty the registry, returning the channels that were open. Pending
    /// creations notice on completion and close what they opened.
    pub(crate) fn teardown(&self) -> Vec<ChannelHandle> {
        self.lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready { value, .. } => Some(value),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    fn remove(&self, name: &str, id: u64) -> Option<Slot<ChannelHandle>> {
        let mut slots = self.lock();
        match slots.get(name) {
            Some(slot) if slot.id() == id => slots.remove(name),
            _ => None,
        }
    }

    /// Existing channel, joined in-flight creation, or a new one.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
        name: &str,
    ) -> Result<ChannelHandle> {
        let attempt = {
            let mut slots = self.lock();
            match slots.get(name) {
                Some(Slot::Ready { value, .. }) if value.is_open() => return Ok(value.clone()),
                Some(Slot::Pending { flight, .. }) => flight.clone(),
                stale => {
                    if stale.is_some() {
                        debug!(channel = %name, "Replacing channel that closed silently");
                    }
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let attempt = flight(Self::open(Arc::downgrade(self), connection, name.to_string(), id));
                    slots.insert(
                        name.to_string(),
                        Slot::Pending {
                            id,
                            flight: attempt.clone(),
                        },
                    );
                    attempt
                }
            }
        };

        attempt.await
    }

    // The attempt lives in this registry's own slots, so it only holds the
    // registry weakly.
    async fn open(
        registry: Weak<Self>,
        connection: Arc<dyn BrokerConnection>,
        name: String,
        id: u64,
    ) -> Result<ChannelHandle> {
        debug!(channel = %name, "Creating new channel");
        let created = connection.create_channel().await;
        let Some(this) = registry.upgrade() else {
            if let Ok(channel) = created {
                if let Err(err) = channel.close().await {
                    debug!(channel = %name, "Ignoring error while closing channel: {}", err);
                }
            }
            return Err(QueueError::ChannelError(format!(
                "channel {} was abandoned while opening",
                name
            )));
        };
        let channel = match created {
            Ok(channel) => channel,
            Err(err) => {
                this.remove(&name, id);
                return Err(err);
            }
        };

        let handle = ChannelHandle::new(id, name.clone(), channel);
        let registered = {
            let mut slots = this.lock();
            match slots.get_mut(&name) {
                Some(slot) if slot.id() == id => {
                    *slot = Slot::Ready {
                        id,
                        value: handle.clone(),
                    };
                    true
                }
                _ => false,
            }
        };

        if !registered {
            handle.close_quietly().await;
            return Err(QueueError::ChannelError(format!(
                "channel {} was torn down while opening",
                name
            )));
        }

        handle.channel().on_close(Box::new(move |cause| {
            if let Some(registry) = registry.upgrade() {
                registry.channel_closed(&name, id, cause);
            }
        }));

        Ok(handle)
    }

    fn channel_closed(&self, name: &str, id: u64, cause: CloseCause) {
        let Some(Slot::Ready { value, .. }) = self.remove(name, id) else {
            return;
        };
        warn!(channel = %name, "Closing channel with RabbitMQ ({})", cause);
        release_channels(vec![value]);
    }
}

/// Best-effort close of channels from synchronous close callbacks.
pub(crate) fn release_channels(channels: Vec<ChannelHandle>) {
    if channels.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                for channel in channels {
                    channel.close_quietly().await;
                }
            });
        }
        Err(_) => debug!("No runtime to close {} channels on, dropping them", channels.len()),
    }
}

/// Lazily opens and caches named channels, connecting first when needed.
#[derive(Clone)]
pub struct ChannelManager {
    connection: ConnectionManager,
}

impl ChannelManager {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// The channel registered under `name`, creating it on first use.
    /// Concurrent callers for one name converge on a single broker channel.
    pub async fn ensure_channel(&self, name: &str) -> Result<Outcome<ChannelHandle>> {
        if !self.connection.ensure_connected().await {
            return Ok(Outcome::Skipped);
        }
        let Some(connection) = self.connection.current() else {
            return Ok(Outcome::Skipped);
        };

        self.connection
            .registry()
            .acquire(connection, name)
            .await
            .map(Outcome::Delivered)
    }

    /// Names of the channels currently open, sorted.
    pub fn open_channels(&self) -> Vec<String> {
        self.connection.registry().names()
    }
}
