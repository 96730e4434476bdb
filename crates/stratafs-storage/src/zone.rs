//! A single device zone: append path, async drain, finish/reset/close.
//!
//! Zones are shared handles (`Arc<Zone>`) owned by the device's pools.
//! Mutable state is atomic; the write-side fields (`wp`, `capacity`) are
//! only advanced by the single holder of `open_for_write`, by the
//! background worker while `bg_processing` is set, or by the allocator
//! under the active-zone table lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{AsyncZoneWriter, RawZone, ZoneBackend};
use crate::error::{ZbdError, ZbdResult};
use crate::hint::WriteLifetimeHint;

/// Point-in-time copy of one zone's accounting, for space reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Zone start offset in bytes.
    pub start: u64,
    /// Current write pointer.
    pub wp: u64,
    /// Writable bytes remaining.
    pub capacity: u64,
    /// Writable bytes when the zone was empty.
    pub max_capacity: u64,
    /// Live bytes referenced by file extents.
    pub used_capacity: u64,
    /// Lifetime hint assigned by the allocator.
    pub lifetime: WriteLifetimeHint,
}

/// One device zone.
pub struct Zone {
    backend: Arc<dyn ZoneBackend>,
    start: u64,
    zone_size: u64,
    block_size: u32,
    sync_timeout: Duration,
    max_capacity: AtomicU64,
    wp: AtomicU64,
    capacity: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU32,
    open_for_write: AtomicBool,
    bg_processing: AtomicBool,
    writer: Mutex<Option<Box<dyn AsyncZoneWriter>>>,
}

impl Zone {
    pub(crate) fn new(
        backend: Arc<dyn ZoneBackend>,
        raw: &RawZone,
        sync_timeout: Duration,
    ) -> Self {
        let info = backend.info();
        let zone_size = info.zone_size;
        let block_size = info.block_size;
        let capacity = if raw.is_full() || raw.is_offline() || raw.is_readonly() {
            0
        } else {
            raw.capacity - (raw.wp - raw.start)
        };
        Self {
            backend,
            start: raw.start,
            zone_size,
            block_size,
            sync_timeout,
            max_capacity: AtomicU64::new(raw.capacity),
            wp: AtomicU64::new(raw.wp),
            capacity: AtomicU64::new(capacity),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU32::new(WriteLifetimeHint::NotSet.as_u32()),
            open_for_write: AtomicBool::new(false),
            bg_processing: AtomicBool::new(false),
            writer: Mutex::new(None),
        }
    }

    /// Zone start offset in bytes.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Zone index on the device.
    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    /// Current write pointer.
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    /// Writable bytes remaining before the zone is full.
    pub fn capacity_left(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Writable bytes the zone offers when empty.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::Acquire)
    }

    /// Live bytes attributed to file extents in this zone.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    pub(crate) fn add_used(&self, n: u64) {
        self.used_capacity.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn sub_used(&self, n: u64) {
        let prev = self.used_capacity.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "zone used_capacity underflow");
    }

    /// True while a writer holds this zone.
    pub fn open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::Acquire)
    }

    pub(crate) fn set_open_for_write(&self, v: bool) {
        self.open_for_write.store(v, Ordering::Release);
    }

    /// True while a background finish or reset owns this zone.
    pub fn bg_processing(&self) -> bool {
        self.bg_processing.load(Ordering::Acquire)
    }

    pub(crate) fn set_bg_processing(&self, v: bool) {
        self.bg_processing.store(v, Ordering::Release);
    }

    /// Lifetime hint currently assigned to the zone.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        WriteLifetimeHint::from_u32(self.lifetime.load(Ordering::Acquire))
            .unwrap_or(WriteLifetimeHint::NotSet)
    }

    pub(crate) fn set_lifetime(&self, hint: WriteLifetimeHint) {
        self.lifetime.store(hint.as_u32(), Ordering::Release);
    }

    /// A zone is in use while extents reference it or a writer holds it.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0 || self.open_for_write()
    }

    /// True once the capacity is exhausted.
    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    /// True while nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    /// Appends block-aligned data at the write pointer, draining any
    /// outstanding async write first.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        debug_assert_eq!(data.len() % self.block_size as usize, 0);

        if self.capacity_left() < data.len() as u64 {
            return Err(ZbdError::no_space("not enough capacity for append"));
        }

        self.sync()?;

        let mut off = 0usize;
        while off < data.len() {
            let wp = self.wp.load(Ordering::Acquire);
            let n = self.backend.pwrite(&data[off..], wp)?;
            if n == 0 {
                return Err(ZbdError::io("zone write made no progress"));
            }
            off += n;
            self.wp.fetch_add(n as u64, Ordering::AcqRel);
            self.capacity.fetch_sub(n as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Submits one asynchronous block-aligned append at the write pointer.
    ///
    /// The write pointer advances immediately; the caller must [`sync`]
    /// before the bytes are guaranteed durable and before the next append.
    ///
    /// [`sync`]: Self::sync
    pub fn append_async(&self, data: &[u8]) -> ZbdResult<()> {
        debug_assert_eq!(data.len() % self.block_size as usize, 0);

        let mut slot = self
            .writer
            .lock()
            .map_err(|_| ZbdError::io("zone writer lock poisoned"))?;

        if let Some(w) = slot.as_mut() {
            w.wait(self.sync_timeout)?;
        }

        if self.capacity_left() < data.len() as u64 {
            return Err(ZbdError::no_space("not enough capacity for append"));
        }

        if slot.is_none() {
            *slot = Some(self.backend.async_writer()?);
        }
        let wp = self.wp.load(Ordering::Acquire);
        if let Some(w) = slot.as_mut() {
            w.submit(data, wp)?;
        }
        self.wp.fetch_add(data.len() as u64, Ordering::AcqRel);
        self.capacity.fetch_sub(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Waits for the outstanding async write, if any, within the configured
    /// timeout. A short or timed-out write surfaces as an I/O error.
    pub fn sync(&self) -> ZbdResult<()> {
        let mut slot = self
            .writer
            .lock()
            .map_err(|_| ZbdError::io("zone writer lock poisoned"))?;
        if let Some(w) = slot.as_mut() {
            w.wait(self.sync_timeout)?;
        }
        Ok(())
    }

    /// Finishes the zone at the device: capacity drops to zero and the write
    /// pointer jumps to the zone end. Must not be called while a writer
    /// holds the zone.
    pub fn finish(&self) -> ZbdResult<()> {
        debug_assert!(!self.open_for_write());

        self.backend.finish_zone(self.start)?;
        self.capacity.store(0, Ordering::Release);
        self.wp.store(self.start + self.zone_size, Ordering::Release);
        Ok(())
    }

    /// Resets the zone. Only legal when no live extents reference it and no
    /// writer holds it. Re-reports the zone afterwards: a zone that went
    /// offline keeps zero capacity.
    pub fn reset(&self) -> ZbdResult<()> {
        debug_assert!(!self.is_used());

        self.backend.reset_zone(self.start)?;
        let raw = self.backend.report_zone(self.start)?;

        if raw.is_offline() {
            self.capacity.store(0, Ordering::Release);
        } else {
            self.max_capacity.store(raw.capacity, Ordering::Release);
            self.capacity.store(raw.capacity, Ordering::Release);
        }
        self.wp.store(self.start, Ordering::Release);
        self.set_lifetime(WriteLifetimeHint::NotSet);
        debug!(zone = self.zone_nr(), "zone reset");
        Ok(())
    }

    /// Releases the zone from its writer and closes it at the device layer
    /// when it is neither empty nor full.
    pub(crate) fn close(&self) -> ZbdResult<()> {
        self.open_for_write.store(false, Ordering::Release);
        if !(self.is_empty() || self.is_full()) {
            self.backend.close_zone(self.start)?;
        }
        Ok(())
    }

    /// Drains the async slot and releases the zone. The caller must hold
    /// `open_for_write`.
    pub fn close_wr(&self) -> ZbdResult<()> {
        debug_assert!(self.open_for_write());
        self.sync()?;
        self.close()
    }

    /// Copies the zone accounting for space reports.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            wp: self.wp(),
            capacity: self.capacity_left(),
            max_capacity: self.max_capacity(),
            used_capacity: self.used_capacity(),
            lifetime: self.lifetime(),
        }
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("start", &format_args!("0x{:x}", self.start))
            .field("wp", &format_args!("0x{:x}", self.wp()))
            .field("capacity", &self.capacity_left())
            .field("used_capacity", &self.used_capacity())
            .field("lifetime", &self.lifetime())
            .field("open_for_write", &self.open_for_write())
            .field("bg_processing", &self.bg_processing())
            .finish()
    }
}
