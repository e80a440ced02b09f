//! Connection registry: a fixed-capacity slot table keyed by client identity.
//!
//! The registry exclusively owns every [`ClientSession`]. Network tasks hold
//! only the identity (plus the session id they were admitted with) and must
//! look the session up again before each use; a session removed from its slot
//! is gone for good.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use homewire::registry::{Admission, ConnectionRegistry, RegistryConfig, SessionLink};
//!
//! let mut registry = ConnectionRegistry::new(RegistryConfig::default());
//! let now = Instant::now();
//!
//! let admission = registry.admit("10.0.0.2:5000", SessionLink::detached(), now).unwrap();
//! assert!(matches!(admission, Admission::Admitted { .. }));
//! assert!(registry.lookup("10.0.0.2:5000").is_some());
//!
//! registry.evict("10.0.0.2:5000");
//! registry.evict("10.0.0.2:5000");
//! assert!(registry.is_empty());
//! ```

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{HomewireError, Result};
use crate::protocol::{FrameBuffer, DEFAULT_STALE_AFTER};
use crate::writer::WriterHandle;

/// Default number of concurrent clients.
pub const DEFAULT_MAX_CLIENTS: usize = 4;

/// Default per-client buffer capacity (receive accumulator and send limit).
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Sizing for the registry and the sessions it creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of slots.
    pub max_clients: usize,
    /// Capacity C of each session's receive accumulator and send buffer.
    pub buffer_capacity: usize,
    /// Receipt gap after which a partial frame is abandoned.
    pub stale_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Transport attachments of a session.
///
/// Dropping the link drops the writer handle (the writer task drains and
/// shuts the socket down) and the close sender (the read task stops).
#[derive(Debug, Default)]
pub struct SessionLink {
    writer: Option<WriterHandle>,
    close: Option<oneshot::Sender<()>>,
}

impl SessionLink {
    /// Link a session to its writer task and its read task's close signal.
    pub fn new(writer: WriterHandle, close: oneshot::Sender<()>) -> Self {
        Self {
            writer: Some(writer),
            close: Some(close),
        }
    }

    /// A session with no transport (sends fail with `ConnectionClosed`).
    pub fn detached() -> Self {
        Self::default()
    }
}

/// Per-connection state owned by a registry slot.
#[derive(Debug)]
pub struct ClientSession {
    identity: String,
    session_id: u64,
    frames: FrameBuffer,
    send_capacity: usize,
    link: SessionLink,
    connected_at: Instant,
    last_activity: Instant,
    last_heartbeat: Option<Instant>,
}

impl ClientSession {
    fn new(identity: &str, session_id: u64, config: &RegistryConfig, link: SessionLink, now: Instant) -> Self {
        Self {
            identity: identity.to_string(),
            session_id,
            frames: FrameBuffer::with_stale_after(config.buffer_capacity, config.stale_after),
            send_capacity: config.buffer_capacity,
            link,
            connected_at: now,
            last_activity: now,
            last_heartbeat: None,
        }
    }

    /// Identity string (remote `address:port`).
    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Admission counter; distinguishes a reused identity from its predecessor.
    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Receive accumulator.
    #[inline]
    pub fn frames(&self) -> &FrameBuffer {
        &self.frames
    }

    /// Mutable receive accumulator, for feeding inbound bytes.
    #[inline]
    pub fn frames_mut(&mut self) -> &mut FrameBuffer {
        &mut self.frames
    }

    /// Largest frame this session will send.
    #[inline]
    pub fn send_capacity(&self) -> usize {
        self.send_capacity
    }

    #[inline]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    #[inline]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[inline]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Refresh liveness after a recognized command.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Record a heartbeat (also counts as activity).
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_heartbeat = Some(now);
    }

    /// Whether no recognized traffic arrived within `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Queue an already framed message. Never waits.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if frame.len() > self.send_capacity {
            return Err(HomewireError::SendBufferOverflow {
                len: frame.len(),
                capacity: self.send_capacity,
            });
        }
        match &self.link.writer {
            Some(writer) => writer.try_send(frame),
            None => Err(HomewireError::ConnectionClosed),
        }
    }

    /// Frames queued on the writer but not yet written.
    pub fn queued(&self) -> usize {
        self.link.writer.as_ref().map_or(0, WriterHandle::queued)
    }

    /// Signal the read task to stop and release the writer.
    fn close(&mut self) {
        if let Some(close) = self.link.close.take() {
            let _ = close.send(());
        }
        self.link.writer = None;
    }
}

/// Outcome of a successful [`ConnectionRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A fresh session was created in `slot`.
    Admitted { slot: usize, session_id: u64 },
    /// The identity already holds `slot`; the existing session is kept.
    AlreadyConnected { slot: usize, session_id: u64 },
}

impl Admission {
    /// Session id now registered for the identity.
    pub fn session_id(&self) -> u64 {
        match self {
            Admission::Admitted { session_id, .. } | Admission::AlreadyConnected { session_id, .. } => {
                *session_id
            }
        }
    }
}

/// Fixed-capacity table of client sessions.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Vec<Option<ClientSession>>,
    config: RegistryConfig,
    next_session_id: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry with `config.max_clients` slots.
    pub fn new(config: RegistryConfig) -> Self {
        let mut slots = Vec::with_capacity(config.max_clients);
        slots.resize_with(config.max_clients, || None);
        Self {
            slots,
            config,
            next_session_id: 1,
        }
    }

    /// Sizing this registry was created with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a new connection.
    ///
    /// An identity that is already present is a successful no-op: the
    /// existing session is kept and `link` is dropped. When every slot is
    /// occupied `link` is dropped too (closing the newcomer) and
    /// `RegistryFull` is returned.
    pub fn admit(&mut self, identity: &str, link: SessionLink, now: Instant) -> Result<Admission> {
        if let Some(slot) = self.position(identity) {
            let session_id = self.slots[slot].as_ref().map_or(0, |s| s.session_id);
            tracing::debug!(%identity, slot, "identity already connected");
            return Ok(Admission::AlreadyConnected { slot, session_id });
        }

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            tracing::warn!(%identity, capacity = self.capacity(), "registry full, refusing client");
            return Err(HomewireError::RegistryFull);
        };

        let session_id = self.next_session_id;
        self.next_session_id += 1;
        self.slots[slot] = Some(ClientSession::new(identity, session_id, &self.config, link, now));

        tracing::info!(%identity, slot, session_id, "client admitted");
        Ok(Admission::Admitted { slot, session_id })
    }

    /// Find the session registered under `identity`.
    pub fn lookup(&self, identity: &str) -> Option<&ClientSession> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.identity == identity)
    }

    /// Find the session registered under `identity`, mutably.
    pub fn lookup_mut(&mut self, identity: &str) -> Option<&mut ClientSession> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|s| s.identity == identity)
    }

    /// Find the session only if it is still the one admitted as `session_id`.
    pub fn lookup_session_mut(&mut self, identity: &str, session_id: u64) -> Option<&mut ClientSession> {
        self.lookup_mut(identity)
            .filter(|s| s.session_id == session_id)
    }

    /// Whether `identity` holds a slot.
    pub fn contains(&self, identity: &str) -> bool {
        self.position(identity).is_some()
    }

    /// Remove and close the session for `identity`.
    ///
    /// Idempotent: evicting an absent identity does nothing and returns `false`.
    pub fn evict(&mut self, identity: &str) -> bool {
        let Some(slot) = self.position(identity) else {
            return false;
        };
        self.clear_slot(slot);
        true
    }

    /// Evict only if the slot still holds the session admitted as `session_id`.
    ///
    /// A read task that outlived its session uses this so it can never tear
    /// down a newer connection that reused the same identity.
    pub fn evict_session(&mut self, identity: &str, session_id: u64) -> bool {
        let Some(slot) = self.position(identity) else {
            return false;
        };
        if self.slots[slot].as_ref().map(|s| s.session_id) != Some(session_id) {
            return false;
        }
        self.clear_slot(slot);
        true
    }

    /// Evict every session idle for longer than `timeout`. Returns their identities.
    pub fn reap_idle(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let idle: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.is_idle(now, timeout)).map(|_| i))
            .collect();

        idle.into_iter()
            .filter_map(|slot| {
                let identity = self.slots[slot].as_ref().map(|s| s.identity.clone())?;
                tracing::info!(%identity, "client idle, closing");
                self.clear_slot(slot);
                Some(identity)
            })
            .collect()
    }

    /// Close every session. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let occupied: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].is_some())
            .collect();
        for &slot in &occupied {
            self.clear_slot(slot);
        }
        occupied.len()
    }

    /// Occupied sessions, in slot order.
    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.slots.iter().flatten()
    }

    /// Identities of occupied slots, in slot order.
    pub fn identities(&self) -> Vec<String> {
        self.sessions().map(|s| s.identity.clone()).collect()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    fn position(&self, identity: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.identity == identity))
    }

    // The slot is emptied before the session is closed and dropped, so no
    // lookup can reach a session that is being torn down.
    fn clear_slot(&mut self, slot: usize) {
        if let Some(mut session) = self.slots[slot].take() {
            session.close();
            tracing::info!(identity = %session.identity, slot, "client evicted");
        }
    }
}
