use crate::codec::AhmCodec;
use crate::error::{AhmError, Result};
use crate::listener::PushListener;
use crate::protocol::Command;
use crate::state::StateStore;
use crate::tracker::{PendingHandle, RequestTracker};
use crate::types::ConnectionState;
use futures_util::SinkExt;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Default time allowed for the TCP handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type FrameSink = FramedWrite<OwnedWriteHalf, AhmCodec>;

#[derive(Default)]
struct ConnectionTasks {
    listener: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

/// Owner of the single control socket
///
/// Writes are serialized through one lock so multi-message commands (NRPN
/// runs, mute pairs) never interleave. Each successful connect starts a
/// fresh [`PushListener`]; the generation counter lets a listener from an
/// earlier socket report its loss without tearing down a newer one.
pub struct ConnectionManager {
    addr: String,
    connect_timeout: Duration,
    state: Arc<StateStore>,
    tracker: Arc<RequestTracker>,
    writer: Mutex<Option<FrameSink>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
    /// Set by an explicit disconnect; suppresses automatic reconnects
    stopped: AtomicBool,
    tasks: SyncMutex<ConnectionTasks>,
}

impl ConnectionManager {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        state: Arc<StateStore>,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            addr: format!("{}:{}", host.into(), port),
            connect_timeout,
            state,
            tracker,
            writer: Mutex::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            tasks: SyncMutex::new(ConnectionTasks::default()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the socket and start listening. Does nothing if already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        self.establish().await
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.state.set_connection_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", self.addr);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.set_connection_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                self.state.set_connection_state(ConnectionState::Disconnected);
                return Err(AhmError::Timeout);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (read, write) = stream.into_split();

        let generation = {
            let mut writer = self.writer.lock().await;
            *writer = Some(FramedWrite::new(write, AhmCodec::new()));
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        // Mark connected before the listener can report a loss
        self.state.set_connection_state(ConnectionState::Connected);
        tracing::info!("Connected to {}", self.addr);

        let listener = PushListener::new(
            FramedRead::new(read, AhmCodec::new()),
            self.state.clone(),
            self.tracker.clone(),
            Arc::downgrade(self),
            generation,
        );
        let handle = tokio::spawn(listener.run());
        if let Some(previous) = self.tasks.lock().listener.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Write one command. Fails with [`AhmError::NotConnected`] when there is no socket.
    pub async fn send(self: &Arc<Self>, command: Command) -> Result<()> {
        let failed_generation = {
            let mut writer = self.writer.lock().await;
            let sink = writer.as_mut().ok_or(AhmError::NotConnected)?;
            match sink.send(command).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!("Write to {} failed: {}", self.addr, e);
                    self.generation.load(Ordering::SeqCst)
                }
            }
        };
        self.handle_loss(failed_generation).await;
        Err(AhmError::ConnectionLost)
    }

    /// Issue a GET through the tracker, transmitting only if no identical
    /// request is already in flight
    pub async fn request(self: &Arc<Self>, command: Command) -> Result<PendingHandle> {
        let key = command
            .query_key()
            .ok_or_else(|| AhmError::invalid(format!("{:?} expects no reply", command)))?;
        let issued = self.tracker.issue(key, self.tracker.default_timeout());
        if issued.is_new {
            if let Err(e) = self.send(command).await {
                self.tracker.cancel(&key);
                return Err(e);
            }
        }
        Ok(issued.handle)
    }

    /// Close the socket and stop background tasks. Automatic reconnects stay
    /// off until [`ConnectionManager::connect`] is called again.
    pub async fn disconnect(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let reconnect = self.tasks.lock().reconnect.take();
        if let Some(handle) = reconnect {
            handle.abort();
        }

        let _guard = self.connect_lock.lock().await;
        let listener = self.tasks.lock().listener.take();
        if let Some(handle) = listener {
            handle.abort();
        }

        let sink = {
            let mut writer = self.writer.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            writer.take()
        };
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!("Error closing socket: {}", e);
            }
        }

        let cancelled = self.tracker.cancel_all();
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending requests", cancelled);
        }
        if self.state.set_connection_state(ConnectionState::Disconnected) {
            tracing::info!("Disconnected from {}", self.addr);
        }
    }

    /// Abort background tasks without waiting; used when the owner is dropped
    pub(crate) fn abort_tasks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        for handle in [tasks.listener.take(), tasks.reconnect.take()].into_iter().flatten() {
            handle.abort();
        }
    }

    /// Tear down after the socket for `generation` failed
    pub(crate) async fn handle_loss(self: &Arc<Self>, generation: u64) {
        {
            let mut writer = self.writer.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            writer.take();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        tracing::warn!("Connection to {} lost", self.addr);
        let cancelled = self.tracker.cancel_all();
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending requests", cancelled);
        }
        self.state.set_connection_state(ConnectionState::Disconnected);
        self.schedule_reconnect();

        // May be the calling task; nothing below awaits
        let listener = self.tasks.lock().listener.take();
        if let Some(handle) = listener {
            handle.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        tasks.reconnect = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self))));
    }
}

/// Retry with exponential backoff: 1s, 2s, 4s ... 60s (max)
async fn reconnect_loop(manager: Weak<ConnectionManager>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tracing::info!("Reconnecting in {:?}", backoff);
        sleep(backoff).await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.stopped.load(Ordering::SeqCst) || manager.is_connected() {
            return;
        }
        match manager.establish().await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", manager.addr, e);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
