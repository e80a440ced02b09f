//! Durable store: one small record mirrored to a fixed flash page.
//!
//! The in-memory copy is the source of truth. Flash is read once at
//! [`DurableStore::open`] and written only by [`DurableStore::tick`] on the
//! primary core, at most once per write interval, with the secondary core
//! parked and interrupts masked around the erase/program pair.

mod flash;
mod record;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use flash::{FileFlash, Flash, MemoryFlash, ERASED, IMAGE_SIZE, PAGE_SIZE, SECTOR_SIZE, TARGET_OFFSET};
pub use record::{crc32_ieee, DurableRecord, PageError, MAX_PAYLOAD};

use crate::multicore::{CoreLink, HostInterrupts, Interrupts, DEFAULT_LOCKOUT_TIMEOUT};
use crate::error::Result;

/// Default minimum spacing between physical writes.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(1000);

/// Store timing and placement.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub write_interval: Duration,
    /// Bound on waiting for the secondary core to park (also per resume attempt).
    pub lockout_timeout: Duration,
    pub offset: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_interval: DEFAULT_WRITE_INTERVAL,
            lockout_timeout: DEFAULT_LOCKOUT_TIMEOUT,
            offset: TARGET_OFFSET,
        }
    }
}

/// What a call to [`DurableStore::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing to write.
    Clean,
    /// Dirty, but the previous write was too recent.
    Deferred,
    /// The record was written to flash.
    Written,
    /// The secondary core did not park; retried on a later tick.
    Skipped,
}

#[derive(Debug, Default)]
struct StoreState {
    record: DurableRecord,
    dirty: bool,
    last_write: Option<Instant>,
    writes: u64,
}

/// Rate-limited, cross-core-safe persistence of a [`DurableRecord`].
pub struct DurableStore {
    state: Mutex<StoreState>,
    flash: Mutex<Box<dyn Flash>>,
    link: Arc<CoreLink>,
    irq: Box<dyn Interrupts>,
    config: StoreConfig,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DurableStore")
            .field("dirty", &state.dirty)
            .field("writes", &state.writes)
            .field("config", &self.config)
            .finish()
    }
}

impl DurableStore {
    /// Open the store and load the record from flash.
    ///
    /// A blank or corrupt page yields the empty record.
    pub fn open(flash: Box<dyn Flash>, link: Arc<CoreLink>, config: StoreConfig) -> Result<Self> {
        Self::with_interrupts(flash, link, Box::new(HostInterrupts), config)
    }

    pub fn with_interrupts(
        mut flash: Box<dyn Flash>,
        link: Arc<CoreLink>,
        irq: Box<dyn Interrupts>,
        config: StoreConfig,
    ) -> Result<Self> {
        let mut page = [0u8; PAGE_SIZE];
        flash.read(config.offset, &mut page)?;

        let record = match DurableRecord::from_page(&page) {
            Ok(record) => {
                tracing::info!(len = record.payload().len(), "Loaded durable record");
                record
            }
            Err(PageError::Blank) => {
                tracing::info!("Flash page blank, starting with empty record");
                DurableRecord::default()
            }
            Err(e) => {
                tracing::warn!("Ignoring invalid durable record: {:?}", e);
                DurableRecord::default()
            }
        };

        Ok(Self {
            state: Mutex::new(StoreState {
                record,
                ..StoreState::default()
            }),
            flash: Mutex::new(flash),
            link,
            irq,
            config,
        })
    }

    /// Current in-memory record.
    pub fn read(&self) -> DurableRecord {
        self.state.lock().record.clone()
    }

    /// Replace the in-memory record and schedule a write.
    pub fn update(&self, record: DurableRecord) {
        let mut state = self.state.lock();
        state.record = record;
        state.dirty = true;
    }

    /// Schedule a write of the current record. Never writes synchronously.
    pub fn request_write(&self) {
        self.state.lock().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Number of completed physical writes.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Periodic driver step. Blocks for the duration of a physical write.
    pub fn tick(&self, now: Instant) -> Result<WriteOutcome> {
        let record = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(WriteOutcome::Clean);
            }
            if let Some(last) = state.last_write {
                if now.saturating_duration_since(last) < self.config.write_interval {
                    return Ok(WriteOutcome::Deferred);
                }
            }
            state.last_write = Some(now);
            state.dirty = false;
            state.record.clone()
        };

        // The state lock is released: the secondary core may need it to
        // reach its checkpoint.
        match self.write(&record) {
            Ok(true) => {
                self.state.lock().writes += 1;
                Ok(WriteOutcome::Written)
            }
            Ok(false) => {
                self.state.lock().dirty = true;
                Ok(WriteOutcome::Skipped)
            }
            Err(e) => {
                self.state.lock().dirty = true;
                Err(e)
            }
        }
    }

    fn write(&self, record: &DurableRecord) -> Result<bool> {
        let page = record.to_page();
        let mut flash = self.flash.lock();

        tracing::info!("Requesting secondary core lockout");
        if !self.link.pause(self.config.lockout_timeout) {
            tracing::warn!("Secondary core did not pause, skipping flash write");
            return Ok(false);
        }

        let saved = self.irq.disable();
        let result = flash
            .erase_sector(self.config.offset)
            .and_then(|()| flash.program_page(self.config.offset, &page));
        self.irq.restore(saved);

        tracing::info!("Releasing secondary core lockout");
        let attempts = self.link.resume_until_acknowledged(self.config.lockout_timeout);
        if attempts > 1 {
            tracing::warn!(attempts, "Secondary core resumed after retries");
        }

        result?;
        tracing::info!(len = record.payload().len(), "Durable record written");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};

    use super::*;
    use crate::multicore::InterruptState;

    /// Shares the image with the test after the store takes ownership.
    #[derive(Clone, Default)]
    struct SharedFlash(Arc<Mutex<MemoryFlash>>);

    impl Flash for SharedFlash {
        fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
            self.0.lock().read(offset, buf)
        }

        fn erase_sector(&mut self, offset: u32) -> Result<()> {
            self.0.lock().erase_sector(offset)
        }

        fn program_page(&mut self, offset: u32, page: &[u8; PAGE_SIZE]) -> Result<()> {
            self.0.lock().program_page(offset, page)
        }
    }

    #[derive(Clone, Default)]
    struct CountingIrq(Arc<AtomicUsize>);

    impl Interrupts for CountingIrq {
        fn disable(&self) -> InterruptState {
            self.0.fetch_add(1, Ordering::AcqRel);
            InterruptState(1)
        }

        fn restore(&self, _state: InterruptState) {}
    }

    fn store(flash: &SharedFlash) -> DurableStore {
        DurableStore::open(Box::new(flash.clone()), Arc::new(CoreLink::new()), StoreConfig::default()).unwrap()
    }

    fn record(value: Value) -> DurableRecord {
        DurableRecord::from_value(&value).unwrap()
    }

    #[test]
    fn test_blank_flash_opens_empty() {
        let flash = SharedFlash::default();
        let store = store(&flash);
        assert!(store.read().is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_clean_store_never_writes() {
        let flash = SharedFlash::default();
        let store = store(&flash);
        assert_eq!(store.tick(Instant::now()).unwrap(), WriteOutcome::Clean);
        assert_eq!(flash.0.lock().program_count(), 0);
    }

    #[test]
    fn test_write_coalescing() {
        let flash = SharedFlash::default();
        let store = store(&flash);
        let start = Instant::now();

        for i in 0..5 {
            store.update(record(json!({ "n": i })));
            store.request_write();
        }
        assert_eq!(store.tick(start).unwrap(), WriteOutcome::Written);

        // Further requests inside the window wait for it to pass.
        store.update(record(json!({ "n": 10 })));
        store.update(record(json!({ "n": 11 })));
        for ms in [100, 500, 999] {
            assert_eq!(
                store.tick(start + Duration::from_millis(ms)).unwrap(),
                WriteOutcome::Deferred
            );
        }
        assert_eq!(flash.0.lock().program_count(), 1);
        assert_eq!(flash.0.lock().erase_count(), 1);

        assert_eq!(
            store.tick(start + Duration::from_millis(1000)).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_written_record_matches_last_update() {
        let flash = SharedFlash::default();
        let store = store(&flash);

        store.update(record(json!({ "n": 1 })));
        store.update(record(json!({ "n": 2 })));
        store.tick(Instant::now()).unwrap();

        let reopened = DurableStore::open(
            Box::new(flash.clone()),
            Arc::new(CoreLink::new()),
            StoreConfig::default(),
        )
        .unwrap();
        let value: Value = reopened.read().to_value().unwrap().unwrap();
        assert_eq!(value, json!({ "n": 2 }));
    }

    #[test]
    fn test_interrupts_masked_per_write() {
        let flash = SharedFlash::default();
        let irq = CountingIrq::default();
        let store = DurableStore::with_interrupts(
            Box::new(flash.clone()),
            Arc::new(CoreLink::new()),
            Box::new(irq.clone()),
            StoreConfig::default(),
        )
        .unwrap();

        store.request_write();
        store.tick(Instant::now()).unwrap();
        assert_eq!(irq.0.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_corrupt_page_falls_back_to_default() {
        let flash = SharedFlash::default();
        {
            let store = store(&flash);
            store.update(record(json!({ "n": 3 })));
            store.tick(Instant::now()).unwrap();
        }
        flash.0.lock().image_mut()[TARGET_OFFSET as usize + 9] ^= 0xFF;

        assert!(store(&flash).read().is_empty());
    }

    #[test]
    fn test_skipped_write_stays_dirty() {
        let flash = SharedFlash::default();
        let link = Arc::new(CoreLink::new());
        // Attached secondary that never reaches a checkpoint.
        link.attach();
        let store = DurableStore::open(
            Box::new(flash.clone()),
            link,
            StoreConfig {
                lockout_timeout: Duration::from_millis(10),
                ..StoreConfig::default()
            },
        )
        .unwrap();

        store.request_write();
        let start = Instant::now();
        assert_eq!(store.tick(start).unwrap(), WriteOutcome::Skipped);
        assert!(store.is_dirty());
        assert_eq!(flash.0.lock().program_count(), 0);
    }
}
