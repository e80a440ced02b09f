//! Server builder and runtime loops.
//!
//! The [`ServerBuilder`] collects configuration and collaborators; the
//! [`Server`] owns the lifecycle:
//! 1. Bind the TCP listener
//! 2. Start the secondary core running the domain service
//! 3. Accept clients into the registry (refusing when full)
//! 4. Per client: read, reassemble frames, open, dispatch, reply
//! 5. Periodic driver: broadcast fan-out, durable writes, idle reaping
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use homewire::service::{FixedSensor, Thermostat};
//! use homewire::Server;
//!
//! #[tokio::main]
//! async fn main() -> homewire::Result<()> {
//!     let mut builder = Server::builder().bind("127.0.0.1:4242".parse().unwrap());
//!     let thermostat = Arc::new(
//!         Thermostat::new(FixedSensor::new(21.0, 40)).with_broadcast(builder.broadcast_slot()),
//!     );
//!     let server = builder.service(thermostat).start().await?;
//!
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::broadcast::BroadcastSlot;
use crate::cipher::Cipher;
use crate::config::ServerConfig;
use crate::multicore::{CoreLink, SecondaryCore, DEFAULT_SERVICE_PERIOD};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{HomewireError, Result};
use crate::outbox::Outbox;
use crate::protocol::Outbound;
use crate::registry::{Admission, ConnectionRegistry, SessionLink};
use crate::service::DomainService;
use crate::store::DurableStore;
use crate::writer::{spawn_writer_task, WriterConfig};

/// Builder for configuring and creating a server.
pub struct ServerBuilder {
    config: ServerConfig,
    cipher: Option<Cipher>,
    service: Option<Arc<dyn DomainService>>,
    store: Option<Arc<DurableStore>>,
    broadcast: Option<Arc<BroadcastSlot>>,
    link: Arc<CoreLink>,
    writer_config: WriterConfig,
    service_period: Duration,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            cipher: None,
            service: None,
            store: None,
            broadcast: None,
            link: Arc::new(CoreLink::new()),
            writer_config: WriterConfig::default(),
            service_period: DEFAULT_SERVICE_PERIOD,
        }
    }

    /// Start from a loaded configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.config.max_clients = max_clients;
        self
    }

    /// Per-client buffer capacity C.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Periodic driver tick.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Use this cipher instead of the configured key.
    pub fn cipher(mut self, cipher: Cipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Domain service for `SET`/`GET`, run on the secondary core.
    pub fn service(mut self, service: Arc<dyn DomainService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Durable store driven by the periodic loop.
    ///
    /// Open it on [`ServerBuilder::core_link`] so writes pause the service core.
    pub fn store(mut self, store: Arc<DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Secondary core loop period.
    pub fn service_period(mut self, period: Duration) -> Self {
        self.service_period = period;
        self
    }

    /// Writer channel capacity per client.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Handshake shared by the store and the secondary core.
    pub fn core_link(&self) -> Arc<CoreLink> {
        self.link.clone()
    }

    /// Slot the domain service publishes into. Created on first use.
    pub fn broadcast_slot(&mut self) -> Arc<BroadcastSlot> {
        self.config.normalize();
        let interval = self.config.broadcast_interval();
        self.broadcast
            .get_or_insert_with(|| Arc::new(BroadcastSlot::new(interval)))
            .clone()
    }

    /// Validate, bind the listener and start the secondary core.
    pub async fn start(mut self) -> Result<Server> {
        self.config.normalize();
        self.config.validate()?;

        let cipher = match self.cipher.take() {
            Some(cipher) => cipher,
            None => self.config.cipher()?,
        };
        let broadcast = self.broadcast_slot();

        let listener = TcpListener::bind(self.config.bind).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            max_clients = self.config.max_clients,
            encrypted = cipher.is_enabled(),
            "Server listening"
        );

        let service_type = self.service.as_ref().map_or(0, |s| s.service_type());
        let dispatcher = Dispatcher::new(self.config.device_info(service_type), self.service.clone());

        let secondary = match &self.service {
            Some(service) => Some(SecondaryCore::spawn(
                service.clone(),
                self.link.clone(),
                self.service_period,
            )?),
            None => None,
        };

        let shared = Arc::new(Shared {
            registry: Mutex::new(ConnectionRegistry::new(self.config.registry_config())),
            dispatcher,
            outbox: Outbox::new(cipher),
            broadcast,
            store: self.store,
            writer_config: self.writer_config,
            idle_timeout: self.config.idle_timeout(),
            tick: self.config.tick(),
            read_chunk: self.config.buffer_capacity,
        });

        Ok(Server {
            listener,
            shared,
            secondary,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the accept loop, client tasks and the driver.
struct Shared {
    registry: Mutex<ConnectionRegistry>,
    dispatcher: Dispatcher,
    outbox: Outbox,
    broadcast: Arc<BroadcastSlot>,
    store: Option<Arc<DurableStore>>,
    writer_config: WriterConfig,
    idle_timeout: Duration,
    tick: Duration,
    read_chunk: usize,
}

/// A bound server. Call [`Server::run`] to serve until shutdown.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    secondary: Option<SecondaryCore>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of admitted clients.
    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Close every client connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        self.shared.registry.lock().close_all()
    }

    /// Serve until `shutdown` resolves, then close all clients and stop the
    /// secondary core.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let driver = tokio::spawn(drive(self.shared.clone()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => accept(&self.shared, stream, peer),
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
            }
        }

        tracing::info!("Shutting down");
        driver.abort();
        let closed = self.close_all();
        tracing::info!(closed, "Closed client connections");

        if let Some(store) = self.shared.store.clone() {
            if store.is_dirty() {
                tracing::info!("Flushing durable record");
                flush(store).await;
            }
        }

        if let Some(secondary) = self.secondary.take() {
            tokio::task::spawn_blocking(move || secondary.shutdown())
                .await
                .map_err(|e| HomewireError::Io(std::io::Error::other(e)))?;
        }
        Ok(())
    }
}

fn accept(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let identity = peer.to_string();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%identity, "set_nodelay failed: {}", e);
    }

    let (reader, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task(write_half, shared.writer_config.clone());
    let (close_tx, close_rx) = oneshot::channel();

    let admission = shared
        .registry
        .lock()
        .admit(&identity, SessionLink::new(writer, close_tx), Instant::now());

    // On refusal the link (and with it the writer) is already dropped;
    // dropping the read half here completes the close.
    let session_id = match admission {
        Ok(Admission::Admitted { session_id, .. }) => session_id,
        Ok(Admission::AlreadyConnected { .. }) => {
            tracing::debug!(%identity, "Duplicate connection closed");
            return;
        }
        Err(e) => {
            tracing::warn!(%identity, "Refusing connection: {}", e);
            return;
        }
    };

    let watcher = shared.clone();
    let watched = identity.clone();
    tokio::spawn(async move {
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(identity = %watched, "Send failed: {}", e);
                watcher.registry.lock().evict_session(&watched, session_id);
            }
            Err(e) => tracing::error!(identity = %watched, "Writer task failed: {}", e),
        }
    });

    tokio::spawn(read_loop(shared.clone(), identity, session_id, reader, close_rx));
}

async fn read_loop(
    shared: Arc<Shared>,
    identity: String,
    session_id: u64,
    mut reader: OwnedReadHalf,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; shared.read_chunk];
    // Never read more than the accumulator can hold; the rest stays in the
    // socket until the buffered frame completes.
    let mut room = shared.read_chunk;

    loop {
        let n = tokio::select! {
            _ = &mut close_rx => {
                tracing::debug!(%identity, "Read loop closed by registry");
                return;
            }
            read = reader.read(&mut buf[..room]) => match read {
                Ok(0) => {
                    tracing::info!(%identity, "Client disconnected");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(%identity, "Receive failed: {}", e);
                    break;
                }
            },
        };

        let now = Instant::now();
        let frames: Vec<_> = {
            let mut registry = shared.registry.lock();
            let Some(session) = registry.lookup_session_mut(&identity, session_id) else {
                return;
            };
            let accumulator = session.frames_mut();
            let frames: Vec<_> = accumulator.feed(&buf[..n], now).collect();
            room = accumulator
                .capacity()
                .saturating_sub(accumulator.len())
                .clamp(1, buf.len());
            frames
        };

        for frame in frames {
            match frame {
                Ok(payload) => handle_payload(&shared, &identity, session_id, &payload, now),
                Err(e) => {
                    tracing::warn!(%identity, "Closing client: {}", e);
                    shared.registry.lock().evict_session(&identity, session_id);
                    return;
                }
            }
        }
    }

    shared.registry.lock().evict_session(&identity, session_id);
}

fn handle_payload(shared: &Shared, identity: &str, session_id: u64, payload: &[u8], now: Instant) {
    let plain = match shared.outbox.cipher().open(payload) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::warn!(%identity, "Dropping undecryptable message: {}", e);
            return;
        }
    };

    let reply = match shared
        .dispatcher
        .dispatch(&shared.registry, identity, session_id, &plain, now)
    {
        DispatchOutcome::Reply(reply) => reply,
        DispatchOutcome::Dropped(_) | DispatchOutcome::Gone => return,
    };

    let registry = shared.registry.lock();
    if let Err(e) = shared.outbox.send_to(&registry, identity, &reply) {
        tracing::warn!(%identity, command = %reply.command(), "Reply not sent: {}", e);
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Instant::now();

        if let Some(payload) = shared.broadcast.take_due(now) {
            let message = Outbound::broadcast(payload);
            let registry = shared.registry.lock();
            if let Err(e) = shared.outbox.fan_out(&registry, &message) {
                tracing::warn!("Broadcast dropped: {}", e);
            }
        }

        if let Some(store) = &shared.store {
            if store.is_dirty() {
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.tick(now)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Durable write failed: {}", e),
                    Err(e) => tracing::error!("Durable write task failed: {}", e),
                }
            }
        }

        let reaped = shared.registry.lock().reap_idle(now, shared.idle_timeout);
        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Reaped idle clients");
        }
    }
}

/// Write a pending record, waiting out the rate limit if needed.
async fn flush(store: Arc<DurableStore>) {
    let result = tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.is_dirty() && Instant::now() < deadline {
            store.tick(Instant::now())?;
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok::<_, HomewireError>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Final durable write failed: {}", e),
        Err(e) => tracing::error!("Final durable write task failed: {}", e),
    }
}
