//! The zoned block device: zone pools, the active-zone slot table, the
//! allocator, and background zone recycling.
//!
//! Zones are partitioned at open time: the first two sequential-write
//! zones hold the operation log, the next two hold metadata snapshots, and
//! everything else is data. Data zones are handed to writers through a
//! fixed-size slot table bounded by the device's active-zone budget, with
//! the first two slots reserved for latency-critical (WAL) allocations.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{DeviceModel, ZoneBackend, ZoneType};
use crate::error::{ZbdError, ZbdResult};
use crate::hint::{lifetime_diff, WriteLifetimeHint, LIFETIME_DIFF_NOT_GOOD};
use crate::metrics::ZbdMetrics;
use crate::worker::BackgroundWorker;
use crate::zone::{Zone, ZoneSnapshot};

/// Zones reserved for the operation log. Two non-offline op-log zones are
/// needed to roll the log safely.
pub const OP_LOG_ZONES: usize = 2;
/// Zones reserved for metadata snapshots.
pub const SNAPSHOT_ZONES: usize = 2;
/// Smallest device that makes sense.
pub const MIN_ZONES: u32 = 32;

/// Active zones held back from the data budget for op-log and snapshot
/// writes.
const RESERVED_ACTIVE_ZONES: u32 = 3;
/// First slot the general (non-WAL) allocation path may scan; slots below
/// this are reserved for WAL allocations.
const GENERAL_SLOT_START: usize = 2;

/// Tunables for a zoned block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZbdConfig {
    /// Background recycling finishes an active zone once its remaining
    /// capacity drops below this percentage of its max capacity.
    pub finish_threshold_pct: u32,
    /// Upper bound on waiting for one outstanding async zone write.
    pub sync_timeout_ms: u64,
}

impl Default for ZbdConfig {
    fn default() -> Self {
        Self {
            finish_threshold_pct: 10,
            sync_timeout_ms: 1000,
        }
    }
}

/// The active-zone slot table plus the counters background jobs update.
///
/// Broken out of [`ZonedBlockDevice`] so recycling jobs can hold it without
/// keeping the whole device alive through the worker queue.
struct ActiveZoneTable {
    slots: Mutex<Vec<Option<Arc<Zone>>>>,
    active_io_zones: AtomicI64,
    bg_recycling: AtomicBool,
}

enum Picked {
    /// An already-active zone was reused.
    Reused(Arc<Zone>),
    /// A data-pool zone was promoted into an empty slot.
    Promoted(Arc<Zone>),
    /// Nothing available right now; waiting may help.
    Busy,
    /// Nothing available and nothing in flight that could free a zone.
    Exhausted,
}

/// A zoned block device with its zone pools and allocator state.
pub struct ZonedBlockDevice {
    backend: Arc<dyn ZoneBackend>,
    config: ZbdConfig,
    block_size: u32,
    zone_size: u64,
    nr_zones: u32,
    max_nr_active_io_zones: u32,
    op_zones: Vec<Arc<Zone>>,
    snapshot_zones: Vec<Arc<Zone>>,
    io_zones: Vec<Arc<Zone>>,
    /// Guards the data-pool scans that populate an empty slot.
    io_zones_mtx: Mutex<()>,
    active: Arc<ActiveZoneTable>,
    wal_allocating: AtomicU32,
    metrics: Arc<ZbdMetrics>,
    data_worker: BackgroundWorker,
    meta_worker: BackgroundWorker,
}

impl std::fmt::Debug for ZonedBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedBlockDevice")
            .field("block_size", &self.block_size)
            .field("zone_size", &self.zone_size)
            .field("nr_zones", &self.nr_zones)
            .field("max_nr_active_io_zones", &self.max_nr_active_io_zones)
            .finish()
    }
}

impl ZonedBlockDevice {
    /// Opens the device: verifies the model, zone count and scheduler,
    /// partitions the zones into the op-log / snapshot / data pools, and
    /// reconciles zones the device reports as open.
    pub fn open(backend: Arc<dyn ZoneBackend>, config: ZbdConfig) -> ZbdResult<Arc<Self>> {
        let info = backend.info().clone();

        if info.model != DeviceModel::HostManaged {
            return Err(ZbdError::not_supported("not a host-managed block device"));
        }
        if info.nr_zones < MIN_ZONES {
            return Err(ZbdError::invalid(format!(
                "too few zones on device: {} ({} required)",
                info.nr_zones, MIN_ZONES
            )));
        }
        backend.check_scheduler()?;

        if info.max_active_zones <= RESERVED_ACTIVE_ZONES {
            return Err(ZbdError::invalid(format!(
                "device active-zone limit {} cannot cover the {} reserved metadata zones",
                info.max_active_zones, RESERVED_ACTIVE_ZONES
            )));
        }
        let max_nr_active_io_zones = info.max_active_zones - RESERVED_ACTIVE_ZONES;

        let sync_timeout = Duration::from_millis(config.sync_timeout_ms);
        let raw_zones = backend.list_zones()?;

        let mut op_zones = Vec::new();
        let mut snapshot_zones = Vec::new();
        let mut io_zones = Vec::new();
        let mut slots: Vec<Option<Arc<Zone>>> = vec![None; max_nr_active_io_zones as usize];
        let mut active_count: i64 = 0;

        let mut i = 0usize;
        for (pool, quota) in [
            (&mut op_zones, OP_LOG_ZONES),
            (&mut snapshot_zones, SNAPSHOT_ZONES),
        ] {
            let mut m = 0usize;
            while m < quota && i < raw_zones.len() {
                let raw = &raw_zones[i];
                i += 1;
                // Only sequential-write-required zones carry data; an
                // offline zone still consumes its reservation.
                if raw.zone_type == ZoneType::SeqWriteRequired {
                    if !raw.is_offline() {
                        pool.push(Arc::new(Zone::new(
                            Arc::clone(&backend),
                            raw,
                            sync_timeout,
                        )));
                    }
                    m += 1;
                }
            }
        }

        for raw in &raw_zones[i..] {
            if raw.zone_type != ZoneType::SeqWriteRequired || raw.is_offline() {
                continue;
            }
            let zone = Arc::new(Zone::new(Arc::clone(&backend), raw, sync_timeout));
            io_zones.push(Arc::clone(&zone));
            if raw.is_open() || raw.is_closed() {
                if (active_count as usize) < slots.len() {
                    slots[active_count as usize] = Some(Arc::clone(&zone));
                    active_count += 1;
                }
                if raw.is_open() && !backend.is_readonly() {
                    // Start from a known state: no zone is open at the
                    // device until a writer claims it.
                    if let Err(e) = zone.close() {
                        warn!(zone = zone.zone_nr(), error = %e, "failed to close pre-open zone");
                    }
                }
            }
        }

        info!(
            path = %info.path,
            nr_zones = info.nr_zones,
            max_active = info.max_active_zones,
            data_zones = io_zones.len(),
            pre_active = active_count,
            "opened zoned block device"
        );

        Ok(Arc::new(Self {
            backend,
            config,
            block_size: info.block_size,
            zone_size: info.zone_size,
            nr_zones: info.nr_zones,
            max_nr_active_io_zones,
            op_zones,
            snapshot_zones,
            io_zones,
            io_zones_mtx: Mutex::new(()),
            active: Arc::new(ActiveZoneTable {
                slots: Mutex::new(slots),
                active_io_zones: AtomicI64::new(active_count),
                bg_recycling: AtomicBool::new(false),
            }),
            wal_allocating: AtomicU32::new(0),
            metrics: Arc::new(ZbdMetrics::default()),
            data_worker: BackgroundWorker::new("zbd-data"),
            meta_worker: BackgroundWorker::new("zbd-meta"),
        }))
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Zone address-space size in bytes.
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    /// Number of zones on the device.
    pub fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    /// Data-zone active budget.
    pub fn max_nr_active_io_zones(&self) -> u32 {
        self.max_nr_active_io_zones
    }

    /// Data zones currently counted against the active budget.
    pub fn active_io_zones(&self) -> i64 {
        self.active.active_io_zones.load(Ordering::Acquire)
    }

    /// The device backend.
    pub fn backend(&self) -> &Arc<dyn ZoneBackend> {
        &self.backend
    }

    /// Operation counters.
    pub fn metrics(&self) -> &Arc<ZbdMetrics> {
        &self.metrics
    }

    /// Worker that runs zone finish/reset jobs.
    pub fn data_worker(&self) -> &BackgroundWorker {
        &self.data_worker
    }

    /// Worker available to the embedder for metadata persistence.
    pub fn meta_worker(&self) -> &BackgroundWorker {
        &self.meta_worker
    }

    /// The data-zone pool.
    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    /// The op-log zone pool.
    pub fn op_zones(&self) -> &[Arc<Zone>] {
        &self.op_zones
    }

    /// The metadata-snapshot zone pool.
    pub fn snapshot_zones(&self) -> &[Arc<Zone>] {
        &self.snapshot_zones
    }

    /// Copy of the active-zone slot table.
    pub fn active_slots(&self) -> ZbdResult<Vec<Option<Arc<Zone>>>> {
        Ok(self
            .active
            .slots
            .lock()
            .map_err(|_| ZbdError::io("active zone table lock poisoned"))?
            .clone())
    }

    /// Returns the first empty op-log zone, if any.
    pub fn allocate_meta_zone(&self) -> Option<Arc<Zone>> {
        self.metrics.record_meta_allocation();
        self.op_zones.iter().find(|z| z.is_empty()).cloned()
    }

    /// Returns the first empty metadata-snapshot zone, if any.
    pub fn allocate_snapshot_zone(&self) -> Option<Arc<Zone>> {
        self.metrics.record_meta_allocation();
        self.snapshot_zones.iter().find(|z| z.is_empty()).cloned()
    }

    /// Returns the data zone whose address span contains `offset`.
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + self.zone_size)
            .cloned()
    }

    /// Allocates an active data zone for a writer, returned with
    /// `open_for_write` set.
    ///
    /// WAL callers take priority: they announce themselves through an
    /// in-flight counter and scan the slot table from slot 0, while non-WAL
    /// callers wait for the counter to clear and scan from slot 2. A
    /// caller whose previous zone just filled up passes it as `full_zone`
    /// so it is finished in the background and its slot freed.
    ///
    /// Fails with `NoSpace` only when no zone is allocatable and nothing in
    /// flight could change that; the caller may retry after reclaim.
    pub fn allocate_zone(
        &self,
        file_lifetime: WriteLifetimeHint,
        is_wal: bool,
        full_zone: Option<&Arc<Zone>>,
    ) -> ZbdResult<Arc<Zone>> {
        if self.backend.is_readonly() {
            return Err(ZbdError::invalid("device opened read-only"));
        }

        loop {
            let picked = if is_wal {
                self.wal_allocating.fetch_add(1, Ordering::AcqRel);
                let r = self.get_active_zone(0, file_lifetime, full_zone);
                self.wal_allocating.fetch_sub(1, Ordering::AcqRel);
                r?
            } else {
                while self.wal_allocating.load(Ordering::Acquire) != 0 {
                    std::thread::yield_now();
                }
                self.get_active_zone(GENERAL_SLOT_START, file_lifetime, full_zone)?
            };

            match picked {
                Picked::Reused(z) => {
                    self.metrics.record_io_allocation(is_wal);
                    return Ok(z);
                }
                Picked::Promoted(z) => {
                    if !is_wal {
                        self.trigger_bg_finish_and_reset();
                    }
                    self.metrics.record_io_allocation(is_wal);
                    return Ok(z);
                }
                Picked::Exhausted => {
                    return Err(ZbdError::no_space("zone allocation failure"));
                }
                Picked::Busy => {}
            }

            if !is_wal {
                self.trigger_bg_finish_and_reset();
            }
            std::thread::yield_now();
        }
    }

    /// One pass over the slot table starting at `start`.
    fn get_active_zone(
        &self,
        start: usize,
        file_lifetime: WriteLifetimeHint,
        full_zone: Option<&Arc<Zone>>,
    ) -> ZbdResult<Picked> {
        let mut slots = self
            .active
            .slots
            .lock()
            .map_err(|_| ZbdError::io("active zone table lock poisoned"))?;

        // The caller's previous zone filled up: release it and finish it in
        // the background so its slot becomes reusable.
        if let Some(fz) = full_zone {
            if !fz.bg_processing() {
                let found = slots
                    .iter()
                    .position(|s| s.as_ref().is_some_and(|z| Arc::ptr_eq(z, fz)));
                if let Some(idx) = found {
                    fz.set_open_for_write(false);
                    fz.set_bg_processing(true);
                    self.bg_finish_data_zone(Arc::clone(fz), idx);
                }
            }
        }

        let mut saw_starved_slot = false;
        for i in start..slots.len() {
            match &slots[i] {
                Some(z) => {
                    if z.bg_processing() {
                        continue;
                    }
                    if !z.open_for_write() {
                        z.set_open_for_write(true);
                        return Ok(Picked::Reused(Arc::clone(z)));
                    }
                }
                None => {
                    let _io_guard = self
                        .io_zones_mtx
                        .lock()
                        .map_err(|_| ZbdError::io("io zone list lock poisoned"))?;
                    if let Some((zone, from_empty)) = self.pick_io_zone(&slots, file_lifetime) {
                        zone.set_open_for_write(true);
                        if from_empty {
                            zone.set_lifetime(file_lifetime);
                        }
                        slots[i] = Some(Arc::clone(&zone));
                        self.active.active_io_zones.fetch_add(1, Ordering::AcqRel);
                        debug!(
                            zone = zone.zone_nr(),
                            slot = i,
                            lifetime = ?zone.lifetime(),
                            "promoted data zone into active slot"
                        );
                        return Ok(Picked::Promoted(zone));
                    }
                    saw_starved_slot = true;
                }
            }
        }

        if saw_starved_slot {
            let bg_busy = self.io_zones.iter().any(|z| z.bg_processing());
            let writer_busy = slots.iter().flatten().any(|z| z.open_for_write());
            if !bg_busy && !writer_busy {
                return Ok(Picked::Exhausted);
            }
        }
        Ok(Picked::Busy)
    }

    /// Picks a data-pool zone to promote into an empty slot.
    ///
    /// Prefers the still-open zone whose lifetime hint best matches the
    /// file (ties keep the last candidate); when no acceptable match
    /// exists, falls back to the last empty zone, which then adopts the
    /// file's hint.
    fn pick_io_zone(
        &self,
        slots: &[Option<Arc<Zone>>],
        file_lifetime: WriteLifetimeHint,
    ) -> Option<(Arc<Zone>, bool)> {
        let in_slots =
            |z: &Arc<Zone>| slots.iter().flatten().any(|s| Arc::ptr_eq(s, z));

        let mut best: Option<Arc<Zone>> = None;
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        for z in &self.io_zones {
            if z.bg_processing() || z.open_for_write() || in_slots(z) {
                continue;
            }
            if z.used_capacity() > 0 && !z.is_full() {
                let diff = lifetime_diff(z.lifetime(), file_lifetime);
                if diff <= best_diff {
                    best = Some(Arc::clone(z));
                    best_diff = diff;
                }
            }
        }
        if best_diff < LIFETIME_DIFF_NOT_GOOD {
            if let Some(z) = best {
                return Some((z, false));
            }
        }

        let mut empty: Option<Arc<Zone>> = None;
        for z in &self.io_zones {
            if z.bg_processing() || z.open_for_write() || in_slots(z) {
                continue;
            }
            if z.is_empty() {
                empty = Some(Arc::clone(z));
            }
        }
        empty.map(|z| (z, true))
    }

    fn bg_finish_data_zone(&self, zone: Arc<Zone>, slot: usize) {
        let table = Arc::clone(&self.active);
        let metrics = Arc::clone(&self.metrics);
        self.data_worker.submit(move || {
            if let Err(e) = zone.finish() {
                // The zone stays in bg_processing until operator
                // intervention; foreground writers are unaffected.
                error!(zone = zone.zone_nr(), error = %e, "background zone finish failed");
                return;
            }
            table.active_io_zones.fetch_sub(1, Ordering::AcqRel);
            zone.set_bg_processing(false);
            if let Ok(mut slots) = table.slots.lock() {
                if let Some(s) = slots.get_mut(slot) {
                    if s.as_ref().is_some_and(|z| Arc::ptr_eq(z, &zone)) {
                        *s = None;
                    }
                }
            }
            metrics.record_bg_finish();
        });
    }

    fn bg_reset_data_zone(&self, zone: Arc<Zone>, slot: usize) {
        let table = Arc::clone(&self.active);
        let metrics = Arc::clone(&self.metrics);
        self.data_worker.submit(move || {
            if let Err(e) = zone.reset() {
                error!(zone = zone.zone_nr(), error = %e, "background zone reset failed");
                return;
            }
            table.active_io_zones.fetch_sub(1, Ordering::AcqRel);
            zone.set_bg_processing(false);
            if let Ok(mut slots) = table.slots.lock() {
                if let Some(s) = slots.get_mut(slot) {
                    if s.as_ref().is_some_and(|z| Arc::ptr_eq(z, &zone)) {
                        *s = None;
                    }
                }
            }
            metrics.record_bg_reset();
        });
    }

    /// One background recycling pass over the slot table: unused zones are
    /// reset, nearly-full zones are finished. At most one pass runs at a
    /// time.
    pub fn trigger_bg_finish_and_reset(&self) {
        if self
            .active
            .bg_recycling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Ok(slots) = self.active.slots.lock() {
            for (i, s) in slots.iter().enumerate() {
                let Some(z) = s else { continue };
                if z.bg_processing() {
                    continue;
                }
                if z.open_for_write() || z.is_empty() || (z.is_full() && z.is_used()) {
                    continue;
                }
                if !z.is_used() {
                    z.set_bg_processing(true);
                    self.bg_reset_data_zone(Arc::clone(z), i);
                    continue;
                }
                if z.capacity_left()
                    < z.max_capacity() * self.config.finish_threshold_pct as u64 / 100
                {
                    z.set_bg_processing(true);
                    self.bg_finish_data_zone(Arc::clone(z), i);
                }
            }
        }

        self.active.bg_recycling.store(false, Ordering::Release);
    }

    /// Synchronous sweep used at shutdown and mount: resets every written
    /// zone that no extent references.
    pub fn reset_unused_io_zones(&self) -> ZbdResult<()> {
        let mut slots = self
            .active
            .slots
            .lock()
            .map_err(|_| ZbdError::io("active zone table lock poisoned"))?;

        for z in &self.io_zones {
            if z.is_used() || z.is_empty() || z.bg_processing() {
                continue;
            }
            let was_full = z.is_full();
            if let Err(e) = z.reset() {
                warn!(zone = z.zone_nr(), error = %e, "failed resetting zone");
                continue;
            }
            if !was_full {
                self.active.active_io_zones.fetch_sub(1, Ordering::AcqRel);
                for s in slots.iter_mut() {
                    if s.as_ref().is_some_and(|sz| Arc::ptr_eq(sz, z)) {
                        *s = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Total unwritten capacity across data zones.
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity_left()).sum()
    }

    /// Total live bytes across data zones.
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    /// Dead bytes in full zones, reclaimable by relocation and reset.
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used_capacity())
            .sum()
    }

    /// Copies the accounting of every data zone.
    pub fn zone_snapshots(&self) -> Vec<ZoneSnapshot> {
        self.io_zones.iter().map(|z| z.snapshot()).collect()
    }

    /// Emits one structured log line summarizing zone usage.
    pub fn log_zone_stats(&self) {
        let mut used_capacity = 0u64;
        let mut reclaimable = 0u64;
        let mut partially_written = 0u64;
        for z in &self.io_zones {
            used_capacity += z.used_capacity();
            if z.used_capacity() > 0 {
                reclaimable += z.max_capacity() - z.used_capacity();
            }
            if !(z.is_full() || z.is_empty()) {
                partially_written += 1;
            }
        }
        info!(
            used_mb = used_capacity >> 20,
            reclaimable_mb = reclaimable >> 20,
            partially_written,
            active_io_zones = self.active_io_zones(),
            "zone stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemBackendConfig};

    fn open_device(config: MemBackendConfig) -> Arc<ZonedBlockDevice> {
        let backend: Arc<dyn ZoneBackend> = Arc::new(MemBackend::new(config));
        ZonedBlockDevice::open(backend, ZbdConfig::default()).unwrap()
    }

    fn small_zones() -> MemBackendConfig {
        MemBackendConfig {
            nr_zones: 40,
            zone_size: 65536,
            zone_capacity: 8192,
            block_size: 4096,
            max_active_zones: 7,
            readonly: false,
        }
    }

    #[test]
    fn test_open_partitions_pools() {
        let zbd = open_device(small_zones());
        assert_eq!(zbd.op_zones().len(), OP_LOG_ZONES);
        assert_eq!(zbd.snapshot_zones().len(), SNAPSHOT_ZONES);
        assert_eq!(zbd.io_zones().len(), 36);
        assert_eq!(zbd.max_nr_active_io_zones(), 4);
        assert_eq!(zbd.active_io_zones(), 0);
    }

    #[test]
    fn test_open_rejects_small_device() {
        let backend: Arc<dyn ZoneBackend> = Arc::new(MemBackend::new(MemBackendConfig {
            nr_zones: 16,
            ..small_zones()
        }));
        let err = ZonedBlockDevice::open(backend, ZbdConfig::default()).unwrap_err();
        assert!(matches!(err, ZbdError::InvalidArgument { .. }));
    }

    #[test]
    fn test_meta_and_snapshot_allocation_prefers_empty() {
        let zbd = open_device(small_zones());
        let meta = zbd.allocate_meta_zone().unwrap();
        assert!(Arc::ptr_eq(&meta, &zbd.op_zones()[0]));

        meta.append(&[1u8; 4096]).unwrap();
        let next = zbd.allocate_meta_zone().unwrap();
        assert!(Arc::ptr_eq(&next, &zbd.op_zones()[1]));

        let snap = zbd.allocate_snapshot_zone().unwrap();
        assert!(Arc::ptr_eq(&snap, &zbd.snapshot_zones()[0]));
    }

    #[test]
    fn test_allocate_zone_populates_general_slot() {
        let zbd = open_device(small_zones());
        let z = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        assert!(z.open_for_write());
        assert_eq!(z.lifetime(), WriteLifetimeHint::Short);
        assert_eq!(zbd.active_io_zones(), 1);

        let slots = zbd.active_slots().unwrap();
        assert!(slots[0].is_none());
        assert!(slots[1].is_none());
        assert!(slots[2].as_ref().is_some_and(|s| Arc::ptr_eq(s, &z)));
    }

    #[test]
    fn test_wal_allocation_lands_in_reserved_slot() {
        let zbd = open_device(small_zones());
        let non_wal = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        let wal = zbd
            .allocate_zone(WriteLifetimeHint::Short, true, None)
            .unwrap();
        assert!(!Arc::ptr_eq(&non_wal, &wal));

        let slots = zbd.active_slots().unwrap();
        assert!(slots[0].as_ref().is_some_and(|s| Arc::ptr_eq(s, &wal)));
        assert!(slots[2].as_ref().is_some_and(|s| Arc::ptr_eq(s, &non_wal)));
    }

    #[test]
    fn test_slot_reuse_after_writer_releases() {
        let zbd = open_device(small_zones());
        let z1 = zbd
            .allocate_zone(WriteLifetimeHint::Medium, false, None)
            .unwrap();
        z1.append(&[1u8; 4096]).unwrap();
        z1.add_used(4096);
        z1.close_wr().unwrap();

        let z2 = zbd
            .allocate_zone(WriteLifetimeHint::Medium, false, None)
            .unwrap();
        assert!(Arc::ptr_eq(&z1, &z2));
        assert_eq!(zbd.active_io_zones(), 1);
        z2.sub_used(4096);
    }

    #[test]
    fn test_lifetime_matching_prefers_closest() {
        let zbd = open_device(small_zones());

        // A written, closed zone with a Long hint and one with Extreme.
        let long_zone = Arc::clone(&zbd.io_zones()[5]);
        long_zone.append(&[1u8; 4096]).unwrap();
        long_zone.add_used(4096);
        long_zone.set_lifetime(WriteLifetimeHint::Long);

        let extreme_zone = Arc::clone(&zbd.io_zones()[6]);
        extreme_zone.append(&[1u8; 4096]).unwrap();
        extreme_zone.add_used(4096);
        extreme_zone.set_lifetime(WriteLifetimeHint::Extreme);

        // Medium data fits best in the Long zone (diff 1 beats diff 2).
        let picked = zbd
            .allocate_zone(WriteLifetimeHint::Medium, false, None)
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &long_zone));
        // Matched zones keep their own hint.
        assert_eq!(picked.lifetime(), WriteLifetimeHint::Long);

        long_zone.sub_used(4096);
        extreme_zone.sub_used(4096);
    }

    #[test]
    fn test_unhinted_file_falls_back_to_empty_zone() {
        let zbd = open_device(small_zones());

        let hinted = Arc::clone(&zbd.io_zones()[3]);
        hinted.append(&[1u8; 4096]).unwrap();
        hinted.add_used(4096);
        hinted.set_lifetime(WriteLifetimeHint::Short);

        let picked = zbd
            .allocate_zone(WriteLifetimeHint::NotSet, false, None)
            .unwrap();
        assert!(!Arc::ptr_eq(&picked, &hinted));
        assert!(picked.wp() == picked.start());
        assert_eq!(picked.lifetime(), WriteLifetimeHint::NotSet);
        hinted.sub_used(4096);
    }

    #[test]
    fn test_bg_recycling_resets_unused_slot_zone() {
        let zbd = open_device(small_zones());
        let z = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        z.append(&[1u8; 4096]).unwrap();
        z.close_wr().unwrap();

        // Written but referenced by no extent: recycling resets it.
        zbd.trigger_bg_finish_and_reset();
        zbd.data_worker().flush();

        assert!(z.is_empty());
        assert_eq!(zbd.active_io_zones(), 0);
        let slots = zbd.active_slots().unwrap();
        assert!(slots.iter().all(|s| s.is_none()));
        assert_eq!(zbd.metrics().snapshot().bg_resets, 1);
    }

    #[test]
    fn test_bg_recycling_finishes_nearly_full_zone() {
        // Full-size zone capacity so "nearly full" is reachable: the 10%
        // threshold on 65536 bytes is 6553.
        let zbd = open_device(MemBackendConfig {
            zone_capacity: 65536,
            ..small_zones()
        });
        let z = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        z.append(&[1u8; 4096]).unwrap();
        z.add_used(4096);
        z.close_wr().unwrap();

        zbd.trigger_bg_finish_and_reset();
        zbd.data_worker().flush();

        // 61440 of 65536 free is far above the threshold: untouched.
        assert!(!z.is_empty());
        assert!(!z.is_full());

        // Refill until one block remains: 4096 < 6553 queues a finish.
        z.set_open_for_write(true);
        z.append(&vec![1u8; 57344]).unwrap();
        z.close_wr().unwrap();
        zbd.trigger_bg_finish_and_reset();
        zbd.data_worker().flush();

        assert!(z.is_full());
        assert_eq!(zbd.active_io_zones(), 0);
        assert_eq!(zbd.metrics().snapshot().bg_finishes, 1);
        z.sub_used(4096);
    }

    #[test]
    fn test_full_zone_handoff_enqueues_finish() {
        let zbd = open_device(small_zones());
        let z = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        z.append(&vec![1u8; 8192]).unwrap();
        z.add_used(8192);
        assert!(z.is_full());
        z.close_wr().unwrap();

        let next = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, Some(&z))
            .unwrap();
        assert!(!Arc::ptr_eq(&next, &z));

        zbd.data_worker().flush();
        assert_eq!(zbd.metrics().snapshot().bg_finishes, 1);
        let slots = zbd.active_slots().unwrap();
        assert!(!slots
            .iter()
            .flatten()
            .any(|s| Arc::ptr_eq(s, &z)));
        z.sub_used(8192);
    }

    #[test]
    fn test_allocator_exhaustion_returns_no_space() {
        let zbd = open_device(small_zones());
        for z in zbd.io_zones() {
            z.append(&vec![1u8; 8192]).unwrap();
            z.add_used(8192);
        }
        let err = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap_err();
        assert!(err.is_no_space());
        for z in zbd.io_zones() {
            z.sub_used(8192);
        }
    }

    #[test]
    fn test_get_io_zone_by_offset() {
        let zbd = open_device(small_zones());
        let third = &zbd.io_zones()[2];
        let found = zbd.get_io_zone(third.start() + 100).unwrap();
        assert!(Arc::ptr_eq(&found, third));
        assert!(zbd.get_io_zone(40 * 65536).is_none());
    }

    #[test]
    fn test_space_accounting() {
        let zbd = open_device(small_zones());
        let free0 = zbd.free_space();
        assert_eq!(free0, 36 * 8192);

        let z = Arc::clone(&zbd.io_zones()[0]);
        z.append(&vec![1u8; 8192]).unwrap();
        z.add_used(4096);

        assert_eq!(zbd.free_space(), free0 - 8192);
        assert_eq!(zbd.used_space(), 4096);
        // Zone is full with 4096 dead bytes.
        assert_eq!(zbd.reclaimable_space(), 4096);
        z.sub_used(4096);
    }

    #[test]
    fn test_reset_unused_io_zones_sweep() {
        let zbd = open_device(small_zones());
        let z = zbd
            .allocate_zone(WriteLifetimeHint::Short, false, None)
            .unwrap();
        z.append(&[1u8; 4096]).unwrap();
        z.close_wr().unwrap();
        assert_eq!(zbd.active_io_zones(), 1);

        zbd.reset_unused_io_zones().unwrap();
        assert!(z.is_empty());
        assert_eq!(zbd.active_io_zones(), 0);
        assert!(zbd.active_slots().unwrap().iter().all(|s| s.is_none()));
    }
}
