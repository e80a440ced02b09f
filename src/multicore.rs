//! Two-core execution model.
//!
//! Core A (the async runtime) owns the network path and the periodic
//! drivers. Core B is a dedicated OS thread that runs the domain service's
//! own control loop. They share exactly one synchronization point besides
//! the service's internal locks: the [`CoreLink`] pause/resume handshake used
//! to quiesce core B around a flash erase/program.
//!
//! # Handshake
//!
//! ```text
//!  core A                       core B
//!  pause()   ── PauseRequested ──►  checkpoint()
//!            ◄──── Paused ───────   (parked)
//!  erase + program
//!  resume()  ── ResumeRequested ─►  (wakes)
//!            ◄──── Running ──────   loop continues
//! ```
//!
//! `pause` is bounded: if core B does not park in time the request is
//! withdrawn and the caller skips its write. `resume` is never abandoned;
//! [`CoreLink::resume_until_acknowledged`] retries forever, escalating its
//! log level as attempts pile up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{HomewireError, Result};
use crate::service::DomainService;

/// Default bound on waiting for core B to park.
pub const DEFAULT_LOCKOUT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default core B loop period.
pub const DEFAULT_SERVICE_PERIOD: Duration = Duration::from_millis(10);

/// Every this many failed resume attempts the log escalates to `error`.
const RESUME_ESCALATE_EVERY: u32 = 10;

/// Handshake state as seen by both cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Running,
    PauseRequested,
    Paused,
    ResumeRequested,
}

#[derive(Debug)]
struct LinkState {
    core: CoreState,
    /// Whether a secondary core is currently attached to the link.
    attached: bool,
}

/// Pause/resume handshake between core A and core B.
#[derive(Debug)]
pub struct CoreLink {
    state: Mutex<LinkState>,
    changed: Condvar,
}

impl Default for CoreLink {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreLink {
    /// A link with no secondary core attached; pause and resume succeed at once.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                core: CoreState::Running,
                attached: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> CoreState {
        self.state.lock().core
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Ask core B to park and wait up to `timeout` for it to acknowledge.
    ///
    /// Returns `false` (with the request withdrawn) on timeout.
    pub fn pause(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if !state.attached {
            return true;
        }

        state.core = CoreState::PauseRequested;
        self.changed.notify_all();

        while state.attached && state.core != CoreState::Paused {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        match state.core {
            CoreState::Paused => true,
            _ if !state.attached => true,
            _ => {
                state.core = CoreState::Running;
                self.changed.notify_all();
                false
            }
        }
    }

    /// Release a parked core B and wait up to `timeout` for it to run again.
    ///
    /// Returns whether core B acknowledged.
    pub fn resume(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if !state.attached || state.core == CoreState::Running {
            state.core = CoreState::Running;
            return true;
        }

        state.core = CoreState::ResumeRequested;
        self.changed.notify_all();

        while state.attached && state.core != CoreState::Running {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        state.core == CoreState::Running || !state.attached
    }

    /// Resume core B, retrying until it acknowledges. Returns the attempt count.
    pub fn resume_until_acknowledged(&self, attempt_timeout: Duration) -> u32 {
        let mut attempts = 1;
        while !self.resume(attempt_timeout) {
            if attempts % RESUME_ESCALATE_EVERY == 0 {
                tracing::error!(attempts, "Secondary core still not resumed");
            } else {
                tracing::warn!(attempts, "Secondary core did not acknowledge resume, retrying");
            }
            attempts += 1;
        }
        attempts
    }

    /// Core B side: park here if a pause was requested.
    ///
    /// Returns `true` if the core was paused.
    pub fn checkpoint(&self) -> bool {
        let mut state = self.state.lock();
        if state.core != CoreState::PauseRequested {
            return false;
        }

        state.core = CoreState::Paused;
        self.changed.notify_all();

        while matches!(state.core, CoreState::Paused) {
            self.changed.wait(&mut state);
        }

        state.core = CoreState::Running;
        self.changed.notify_all();
        true
    }

    pub(crate) fn attach(&self) {
        let mut state = self.state.lock();
        state.attached = true;
        state.core = CoreState::Running;
    }

    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = false;
        state.core = CoreState::Running;
        self.changed.notify_all();
    }
}

/// Detaches the link when core B's loop ends, including on panic.
struct AttachGuard(Arc<CoreLink>);

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.0.detach();
    }
}

/// Handle to the core B thread.
#[derive(Debug)]
pub struct SecondaryCore {
    link: Arc<CoreLink>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SecondaryCore {
    /// Start core B: `service.ready()` once, then `checkpoint → poll → sleep`.
    pub fn spawn(service: Arc<dyn DomainService>, link: Arc<CoreLink>, period: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        link.attach();

        let guard = AttachGuard(link.clone());
        let thread_stop = stop.clone();
        let spawned = std::thread::Builder::new()
            .name("core1".into())
            .spawn(move || {
                let guard = guard;
                tracing::info!("Secondary core started");
                service.ready();

                while !thread_stop.load(Ordering::Acquire) {
                    guard.0.checkpoint();
                    service.poll(Instant::now());
                    std::thread::sleep(period);
                }
                tracing::info!("Secondary core stopped");
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                link.detach();
                return Err(HomewireError::Io(e));
            }
        };

        Ok(Self {
            link,
            stop,
            handle: Some(handle),
        })
    }

    pub fn link(&self) -> &Arc<CoreLink> {
        &self.link
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Secondary core panicked");
            }
        }
    }
}

impl Drop for SecondaryCore {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Saved interrupt state returned by [`Interrupts::disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptState(pub u32);

/// Interrupt masking on the primary core, scoped around flash erase/program.
pub trait Interrupts: Send + Sync {
    fn disable(&self) -> InterruptState;
    fn restore(&self, state: InterruptState);
}

/// Hosted builds have no interrupt controller; masking is a traced no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostInterrupts;

impl Interrupts for HostInterrupts {
    fn disable(&self) -> InterruptState {
        tracing::trace!("IRQ disabled");
        InterruptState(0)
    }

    fn restore(&self, state: InterruptState) {
        tracing::trace!(saved = state.0, "IRQ restored");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::Value;

    use super::*;
    use crate::protocol::Command;

    #[derive(Default)]
    struct Counting {
        ready: AtomicBool,
        polls: AtomicUsize,
    }

    impl DomainService for Counting {
        fn service_type(&self) -> u8 {
            0
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        fn handle_command(&self, _command: Command, body: &Value) -> Result<Value> {
            Ok(body.clone())
        }

        fn ready(&self) {
            self.ready.store(true, Ordering::Release);
        }

        fn poll(&self, _now: Instant) {
            self.polls.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_detached_link_is_trivial() {
        let link = CoreLink::new();
        assert!(link.pause(Duration::ZERO));
        assert!(link.resume(Duration::ZERO));
        assert_eq!(link.resume_until_acknowledged(Duration::ZERO), 1);
        assert!(!link.checkpoint());
    }

    #[test]
    fn test_pause_times_out_without_checkpoint() {
        let link = CoreLink::new();
        link.attach();

        assert!(!link.pause(Duration::from_millis(20)));
        // The request is withdrawn so a late checkpoint does not park.
        assert_eq!(link.state(), CoreState::Running);
        assert!(!link.checkpoint());
    }

    #[test]
    fn test_pause_and_resume_with_secondary() {
        let service = Arc::new(Counting::default());
        let link = Arc::new(CoreLink::new());
        let core = SecondaryCore::spawn(service.clone(), link.clone(), Duration::from_millis(1)).unwrap();

        wait_for(|| service.polls.load(Ordering::Acquire) > 0);
        assert!(service.is_ready());

        assert!(link.pause(Duration::from_secs(2)));
        assert_eq!(link.state(), CoreState::Paused);

        let frozen = service.polls.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(service.polls.load(Ordering::Acquire), frozen);

        assert_eq!(link.resume_until_acknowledged(Duration::from_secs(2)), 1);
        wait_for(|| service.polls.load(Ordering::Acquire) > frozen);

        core.shutdown();
        assert!(!link.is_attached());
    }

    #[test]
    fn test_shutdown_detaches_link() {
        let service = Arc::new(Counting::default());
        let link = Arc::new(CoreLink::new());
        let core = SecondaryCore::spawn(service, link.clone(), Duration::from_millis(1)).unwrap();
        assert!(link.is_attached());

        drop(core);
        assert!(!link.is_attached());
        assert!(link.pause(Duration::ZERO));
    }

    #[test]
    fn test_host_interrupts_round_trip() {
        let irq = HostInterrupts;
        let saved = irq.disable();
        irq.restore(saved);
        assert_eq!(saved, InterruptState(0));
    }
}
