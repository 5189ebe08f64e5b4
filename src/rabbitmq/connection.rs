// src/rabbitmq/connection.rs
// Owns the single broker connection and its lifecycle

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use super::channel_manager::{release_channels, ChannelRegistry};
use super::errors::{QueueError, Result};
use super::flight::{flight, Flight};
use super::transport::{BrokerConnection, CloseCause, Transport};

/// Runs the provider's orderly shutdown.
pub type ShutdownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Process-lifecycle seam. The supervisor registers its shutdown here once,
/// on the first successful connect.
pub trait ExitHook: Send + Sync {
    fn register(&self, shutdown: ShutdownFn);
}

/// Runs shutdown when the process receives Ctrl-C.
#[derive(Debug, Default, Clone, Copy)]
pub struct CtrlCExitHook;

impl ExitHook for CtrlCExitHook {
    fn register(&self, shutdown: ShutdownFn) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Closing connection with RabbitMQ");
                        shutdown().await;
                    }
                });
            }
            Err(_) => warn!("No tokio runtime available, exit hook not installed"),
        }
    }
}

/// Supervisor tuning.
#[derive(Clone, Default)]
pub struct ConnectionSettings {
    connect_timeout: Option<Duration>,
    exit_hook: Option<Arc<dyn ExitHook>>,
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each connect attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_exit_hook(mut self, hook: Arc<dyn ExitHook>) -> Self {
        self.exit_hook = Some(hook);
        self
    }
}

enum Link {
    Disconnected,
    Connecting {
        epoch: u64,
        attempt: Flight<()>,
    },
    Connected {
        epoch: u64,
        connection: Arc<dyn BrokerConnection>,
    },
}

struct State {
    link: Link,
    next_epoch: u64,
    last_error: Option<String>,
}

struct Supervisor {
    url: String,
    transport: Arc<dyn Transport>,
    connect_timeout: Option<Duration>,
    exit_hook: Option<Arc<dyn ExitHook>>,
    exit_hook_registered: AtomicBool,
    shut_down: AtomicBool,
    state: Mutex<State>,
    channels: Arc<ChannelRegistry>,
}

/// Connect-once supervisor for the shared broker connection.
///
/// Cloning is cheap; clones share the same connection and channel registry.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Supervisor>,
}

impl ConnectionManager {
    pub fn new(url: &str, transport: Arc<dyn Transport>) -> Self {
        Self::with_settings(url, transport, ConnectionSettings::default())
    }

    pub fn with_settings(url: &str, transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        ConnectionManager {
            shared: Arc::new(Supervisor {
                url: url.to_string(),
                transport,
                connect_timeout: settings.connect_timeout,
                exit_hook: settings.exit_hook,
                exit_hook_registered: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                state: Mutex::new(State {
                    link: Link::Disconnected,
                    next_epoch: 0,
                    last_error: None,
                }),
                channels: Arc::new(ChannelRegistry::default()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.shared.lock_state().link, Link::Connected { .. })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// The most recent connect failure or unexpected close, cleared on the
    /// next successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock_state().last_error.clone()
    }

    /// Connect if not already connected. Concurrent callers join the attempt
    /// in flight and all observe its outcome.
    pub async fn connect(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(QueueError::ShutDown);
        }

        let attempt = {
            let mut state = self.shared.lock_state();
            match &state.link {
                Link::Connected { .. } => return Ok(()),
                Link::Connecting { attempt, .. } => attempt.clone(),
                Link::Disconnected => {
                    state.next_epoch += 1;
                    let epoch = state.next_epoch;
                    let attempt = flight(Supervisor::establish(
                        Arc::downgrade(&self.shared),
                        self.shared.transport.clone(),
                        self.shared.url.clone(),
                        self.shared.connect_timeout,
                        epoch,
                    ));
                    state.link = Link::Connecting {
                        epoch,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };

        attempt.await
    }

    /// True when connected, possibly after one connect attempt. Connect
    /// failures are logged, not returned.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.is_shut_down() {
            debug!("RabbitMQProvider: shut down, not reconnecting");
            return false;
        }

        match self.connect().await {
            Ok(()) => true,
            Err(err) => {
                warn!("RabbitMQProvider: Not connected: {}", err);
                false
            }
        }
    }

    /// Close every channel, then the connection. A no-op when disconnected.
    pub async fn close_all(&self) {
        let previous = {
            let mut state = self.shared.lock_state();
            mem::replace(&mut state.link, Link::Disconnected)
        };

        for channel in self.shared.channels.teardown() {
            warn!(channel = %channel.name(), "Close channel");
            channel.close_quietly().await;
        }

        match previous {
            Link::Connected { connection, .. } => {
                warn!("Closing connection with RabbitMQ on request");
                if let Err(err) = connection.close().await {
                    debug!("Ignoring error while closing connection: {}", err);
                }
                info!("Closed RabbitMQ connection");
            }
            Link::Connecting { .. } => debug!("Abandoned in-flight connection attempt"),
            Link::Disconnected => {}
        }
    }

    /// Terminal, idempotent shutdown. No reconnects happen afterwards.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down RabbitMQ provider");
        self.close_all().await;
    }

    pub(crate) fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        match &self.shared.lock_state().link {
            Link::Connected { connection, .. } => Some(connection.clone()),
            _ => None,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.shared.channels
    }
}

impl Supervisor {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The attempt is stored in this supervisor's state, so it only holds the
    // supervisor weakly.
    async fn establish(
        supervisor: Weak<Supervisor>,
        transport: Arc<dyn Transport>,
        url: String,
        connect_timeout: Option<Duration>,
        epoch: u64,
    ) -> Result<()> {
        let connecting = transport.connect(&url);
        let result = match connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connecting).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            },
            None => connecting.await,
        };

        let Some(supervisor) = supervisor.upgrade() else {
            if let Ok(connection) = result {
                if let Err(err) = connection.close().await {
                    debug!("Ignoring error while closing abandoned connection: {}", err);
                }
            }
            return Err(QueueError::ConnectionError(
                "connection manager dropped while connecting".to_string(),
            ));
        };

        match result {
            Ok(connection) => supervisor.connected(epoch, connection).await,
            Err(err) => {
                supervisor.connect_failed(epoch, &err);
                Err(err)
            }
        }
    }

    async fn connected(self: Arc<Self>, epoch: u64, connection: Arc<dyn BrokerConnection>) -> Result<()> {
        let current = {
            let mut state = self.lock_state();
            let current = matches!(state.link, Link::Connecting { epoch: e, .. } if e == epoch);
            if current {
                state.link = Link::Connected {
                    epoch,
                    connection: connection.clone(),
                };
                state.last_error = None;
            }
            current
        };

        if !current {
            // close_all ran while we were connecting
            if let Err(err) = connection.close().await {
                debug!("Ignoring error while closing superseded connection: {}", err);
            }
            return Err(QueueError::ConnectionError(
                "connection closed while connecting".to_string(),
            ));
        }

        let weak: Weak<Supervisor> = Arc::downgrade(&self);
        connection.on_close(Box::new(move |cause| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.connection_closed(epoch, cause);
            }
        }));
        info!("Connected to RabbitMQ");

        self.register_exit_hook();

        if !connection.is_connected() {
            self.connection_closed(epoch, CloseCause::Unexpected("closed during setup".to_string()));
        }
        Ok(())
    }

    fn connect_failed(&self, epoch: u64, err: &QueueError) {
        let current = {
            let mut state = self.lock_state();
            state.last_error = Some(err.to_string());
            let current = matches!(state.link, Link::Connecting { epoch: e, .. } if e == epoch);
            if current {
                state.link = Link::Disconnected;
            }
            current
        };
        // a superseded attempt must not touch channels of a newer session
        if current {
            release_channels(self.channels.teardown());
        }
        debug!("Connect attempt to {} failed: {}", self.url, err);
    }

    fn connection_closed(&self, epoch: u64, cause: CloseCause) {
        {
            let mut state = self.lock_state();
            if !matches!(state.link, Link::Connected { epoch: e, .. } if e == epoch) {
                return;
            }
            state.link = Link::Disconnected;
            if let CloseCause::Unexpected(reason) = &cause {
                state.last_error = Some(reason.clone());
            }
        }

        match &cause {
            CloseCause::Requested => warn!("Closing connection with RabbitMQ on request"),
            CloseCause::Unexpected(reason) => {
                warn!("Closing connection with RabbitMQ due to an error: {}", reason)
            }
        }
        release_channels(self.channels.teardown());
    }

    fn register_exit_hook(self: &Arc<Self>) {
        let Some(hook) = &self.exit_hook else {
            return;
        };
        if self.exit_hook_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        hook.register(Box::new(move || {
            async move {
                if let Some(shared) = weak.upgrade() {
                    ConnectionManager { shared }.shutdown().await;
                }
            }
            .boxed()
        }));
    }
}
