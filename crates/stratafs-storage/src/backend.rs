//! Device backend abstraction for zoned block devices.
//!
//! The [`ZoneBackend`] trait is the seam between the storage core and the
//! hardware: the Linux implementation drives real zoned-device ioctls, and
//! [`MemBackend`] is an in-memory device that enforces the same sequential
//! write rules for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ZbdError, ZbdResult};

/// Zone model reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    /// All sequential zones must be written at the write pointer.
    HostManaged,
    /// Sequential writes preferred but not required.
    HostAware,
    /// No zone semantics.
    Conventional,
}

/// Type of a single zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    /// Randomly writable zone.
    Conventional,
    /// Sequential write required.
    SeqWriteRequired,
    /// Sequential write preferred.
    SeqWritePreferred,
}

/// Condition of a zone as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneCondition {
    /// Zone has no write pointer (conventional zones).
    NotWp,
    /// Nothing written since the last reset.
    Empty,
    /// Opened implicitly by a write.
    ImplicitOpen,
    /// Opened explicitly by an open command.
    ExplicitOpen,
    /// Closed by the device or a close command; not full.
    Closed,
    /// Zone can no longer be written.
    ReadOnly,
    /// Write pointer reached the zone capacity.
    Full,
    /// Zone is permanently unusable.
    Offline,
}

/// Static geometry and identity of a zoned device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device path, for logging.
    pub path: String,
    /// Zone model.
    pub model: DeviceModel,
    /// Physical block size in bytes; all appends are multiples of this.
    pub block_size: u32,
    /// Address-space size of every zone in bytes.
    pub zone_size: u64,
    /// Number of zones on the device.
    pub nr_zones: u32,
    /// Device limit on concurrently active zones.
    pub max_active_zones: u32,
    /// Device limit on concurrently open zones.
    pub max_open_zones: u32,
}

/// One entry of a device zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawZone {
    /// Zone start offset in bytes.
    pub start: u64,
    /// Zone address-space length in bytes.
    pub len: u64,
    /// Writable bytes in the zone (`capacity <= len`).
    pub capacity: u64,
    /// Current write pointer in bytes.
    pub wp: u64,
    /// Zone type.
    pub zone_type: ZoneType,
    /// Zone condition.
    pub cond: ZoneCondition,
}

impl RawZone {
    /// True when the zone is permanently unusable.
    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCondition::Offline
    }

    /// True when the zone cannot be written any further.
    pub fn is_full(&self) -> bool {
        self.cond == ZoneCondition::Full
    }

    /// True when the zone is read-only.
    pub fn is_readonly(&self) -> bool {
        self.cond == ZoneCondition::ReadOnly
    }

    /// True when the device considers the zone implicitly or explicitly open.
    pub fn is_open(&self) -> bool {
        matches!(
            self.cond,
            ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen
        )
    }

    /// True when the device closed the zone without filling it.
    pub fn is_closed(&self) -> bool {
        self.cond == ZoneCondition::Closed
    }
}

/// One-deep asynchronous append channel for a single zone.
///
/// At most one write may be in flight; callers must [`wait`](Self::wait)
/// before submitting again. `submit` copies the data into a writer-owned
/// buffer, so the caller's slice may be reused immediately.
pub trait AsyncZoneWriter: Send {
    /// Submits one write at `offset`. Fails if a write is already in flight.
    fn submit(&mut self, data: &[u8], offset: u64) -> ZbdResult<()>;

    /// Waits for the outstanding write, verifying it completed in full.
    /// Returns immediately when nothing is in flight.
    fn wait(&mut self, timeout: Duration) -> ZbdResult<()>;

    /// Bytes currently in flight.
    fn inflight(&self) -> u32;
}

/// Operations the storage core needs from a zoned block device.
pub trait ZoneBackend: Send + Sync {
    /// Device geometry and identity.
    fn info(&self) -> &DeviceInfo;

    /// True when the device was opened without a write descriptor.
    fn is_readonly(&self) -> bool;

    /// Verifies the kernel-side I/O scheduler precondition, where one exists.
    fn check_scheduler(&self) -> ZbdResult<()>;

    /// Reports every zone on the device.
    fn list_zones(&self) -> ZbdResult<Vec<RawZone>>;

    /// Reports the single zone starting at `start`.
    fn report_zone(&self, start: u64) -> ZbdResult<RawZone>;

    /// Resets the zone starting at `start`.
    fn reset_zone(&self, start: u64) -> ZbdResult<()>;

    /// Finishes (fills) the zone starting at `start`.
    fn finish_zone(&self, start: u64) -> ZbdResult<()>;

    /// Closes the open zone starting at `start`.
    fn close_zone(&self, start: u64) -> ZbdResult<()>;

    /// Positioned write on the write descriptor. Returns bytes written,
    /// which may be short.
    fn pwrite(&self, data: &[u8], offset: u64) -> ZbdResult<usize>;

    /// Positioned read. `direct` selects the `O_DIRECT` descriptor and
    /// requires a block-aligned length. Returns bytes read.
    fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize>;

    /// Creates the one-deep async append channel for one zone.
    fn async_writer(&self) -> ZbdResult<Box<dyn AsyncZoneWriter>>;

    /// Stable `(device, inode)` identity pair used to build unique file ids.
    fn device_id(&self) -> ZbdResult<(u64, u64)>;
}

/// Configuration for the in-memory mock device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemBackendConfig {
    /// Number of zones.
    pub nr_zones: u32,
    /// Address-space size of each zone in bytes.
    pub zone_size: u64,
    /// Writable bytes per zone; 0 means the full zone size.
    pub zone_capacity: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Reported active-zone limit.
    pub max_active_zones: u32,
    /// Open the device without write support.
    pub readonly: bool,
}

impl Default for MemBackendConfig {
    fn default() -> Self {
        Self {
            nr_zones: 40,
            zone_size: 4 << 20,
            zone_capacity: 0,
            block_size: 4096,
            max_active_zones: 14,
            readonly: false,
        }
    }
}

struct MemZone {
    start: u64,
    len: u64,
    capacity: u64,
    wp: u64,
    zone_type: ZoneType,
    cond: ZoneCondition,
    data: Vec<u8>,
}

impl MemZone {
    fn raw(&self) -> RawZone {
        RawZone {
            start: self.start,
            len: self.len,
            capacity: self.capacity,
            wp: self.wp,
            zone_type: self.zone_type,
            cond: self.cond,
        }
    }
}

struct MemState {
    zone_size: u64,
    block_size: u32,
    readonly: bool,
    zones: Vec<Mutex<MemZone>>,
}

impl MemState {
    fn zone_at(&self, offset: u64) -> ZbdResult<&Mutex<MemZone>> {
        let idx = (offset / self.zone_size) as usize;
        self.zones
            .get(idx)
            .ok_or_else(|| ZbdError::io(format!("offset {offset} beyond device end")))
    }

    fn lock_zone<'a>(&self, zone: &'a Mutex<MemZone>) -> ZbdResult<std::sync::MutexGuard<'a, MemZone>> {
        zone.lock()
            .map_err(|_| ZbdError::io("mock zone lock poisoned"))
    }

    fn do_pwrite(&self, data: &[u8], offset: u64) -> ZbdResult<usize> {
        if self.readonly {
            return Err(ZbdError::invalid("device opened read-only"));
        }
        let mut z = self.lock_zone(self.zone_at(offset)?)?;
        match z.cond {
            ZoneCondition::Offline | ZoneCondition::ReadOnly | ZoneCondition::NotWp => {
                return Err(ZbdError::io(format!(
                    "write to zone 0x{:x} in condition {:?}",
                    z.start, z.cond
                )));
            }
            _ => {}
        }
        if offset != z.wp {
            return Err(ZbdError::io(format!(
                "unaligned zone write: offset 0x{offset:x}, write pointer 0x{:x}",
                z.wp
            )));
        }
        if offset + data.len() as u64 > z.start + z.capacity {
            return Err(ZbdError::io("write beyond zone capacity"));
        }
        let at = (offset - z.start) as usize;
        if z.data.len() < at + data.len() {
            z.data.resize(at + data.len(), 0);
        }
        z.data[at..at + data.len()].copy_from_slice(data);
        z.wp += data.len() as u64;
        z.cond = if z.wp == z.start + z.capacity {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };
        Ok(data.len())
    }
}

/// In-memory mock zoned device.
///
/// Enforces the hardware rules that matter to the core: writes only at the
/// write pointer, never beyond the zone capacity, and the full zone state
/// machine for reset/finish/close. Zone payloads grow lazily so large
/// address spaces stay cheap.
pub struct MemBackend {
    info: DeviceInfo,
    state: Arc<MemState>,
}

impl MemBackend {
    /// Creates a mock device from the given geometry.
    pub fn new(config: MemBackendConfig) -> Self {
        let capacity = if config.zone_capacity == 0 {
            config.zone_size
        } else {
            config.zone_capacity
        };
        let zones = (0..config.nr_zones)
            .map(|i| {
                Mutex::new(MemZone {
                    start: i as u64 * config.zone_size,
                    len: config.zone_size,
                    capacity,
                    wp: i as u64 * config.zone_size,
                    zone_type: ZoneType::SeqWriteRequired,
                    cond: ZoneCondition::Empty,
                    data: Vec::new(),
                })
            })
            .collect();
        debug!(
            nr_zones = config.nr_zones,
            zone_size = config.zone_size,
            zone_capacity = capacity,
            "created mock zoned device"
        );
        Self {
            info: DeviceInfo {
                path: "mem:0".to_string(),
                model: DeviceModel::HostManaged,
                block_size: config.block_size,
                zone_size: config.zone_size,
                nr_zones: config.nr_zones,
                max_active_zones: config.max_active_zones,
                max_open_zones: config.max_active_zones,
            },
            state: Arc::new(MemState {
                zone_size: config.zone_size,
                block_size: config.block_size,
                readonly: config.readonly,
                zones,
            }),
        }
    }

    /// Test hook: overrides one zone's condition.
    pub fn set_zone_condition(&self, idx: usize, cond: ZoneCondition) {
        if let Some(z) = self.state.zones.get(idx) {
            if let Ok(mut z) = z.lock() {
                z.cond = cond;
                if cond == ZoneCondition::Offline {
                    z.capacity = 0;
                }
            }
        }
    }

    /// Test hook: overrides one zone's type.
    pub fn set_zone_type(&self, idx: usize, zone_type: ZoneType) {
        if let Some(z) = self.state.zones.get(idx) {
            if let Ok(mut z) = z.lock() {
                z.zone_type = zone_type;
            }
        }
    }
}

impl ZoneBackend for MemBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn is_readonly(&self) -> bool {
        self.state.readonly
    }

    fn check_scheduler(&self) -> ZbdResult<()> {
        Ok(())
    }

    fn list_zones(&self) -> ZbdResult<Vec<RawZone>> {
        self.state
            .zones
            .iter()
            .map(|z| Ok(self.state.lock_zone(z)?.raw()))
            .collect()
    }

    fn report_zone(&self, start: u64) -> ZbdResult<RawZone> {
        let z = self.state.lock_zone(self.state.zone_at(start)?)?;
        Ok(z.raw())
    }

    fn reset_zone(&self, start: u64) -> ZbdResult<()> {
        if self.state.readonly {
            return Err(ZbdError::invalid("device opened read-only"));
        }
        let mut z = self.state.lock_zone(self.state.zone_at(start)?)?;
        match z.cond {
            ZoneCondition::Offline | ZoneCondition::ReadOnly => {
                return Err(ZbdError::io(format!(
                    "reset of zone 0x{:x} in condition {:?}",
                    z.start, z.cond
                )));
            }
            _ => {}
        }
        z.wp = z.start;
        z.cond = ZoneCondition::Empty;
        z.data.clear();
        Ok(())
    }

    fn finish_zone(&self, start: u64) -> ZbdResult<()> {
        if self.state.readonly {
            return Err(ZbdError::invalid("device opened read-only"));
        }
        let mut z = self.state.lock_zone(self.state.zone_at(start)?)?;
        match z.cond {
            ZoneCondition::Offline | ZoneCondition::ReadOnly => {
                return Err(ZbdError::io(format!(
                    "finish of zone 0x{:x} in condition {:?}",
                    z.start, z.cond
                )));
            }
            _ => {}
        }
        z.wp = z.start + z.len;
        z.cond = ZoneCondition::Full;
        Ok(())
    }

    fn close_zone(&self, start: u64) -> ZbdResult<()> {
        if self.state.readonly {
            return Err(ZbdError::invalid("device opened read-only"));
        }
        let mut z = self.state.lock_zone(self.state.zone_at(start)?)?;
        if !matches!(
            z.cond,
            ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen
        ) {
            return Err(ZbdError::io(format!(
                "close of zone 0x{:x} in condition {:?}",
                z.start, z.cond
            )));
        }
        z.cond = ZoneCondition::Closed;
        Ok(())
    }

    fn pwrite(&self, data: &[u8], offset: u64) -> ZbdResult<usize> {
        self.state.do_pwrite(data, offset)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize> {
        if direct && buf.len() % self.state.block_size as usize != 0 {
            return Err(ZbdError::io("direct read length not block aligned"));
        }
        let z = self.state.lock_zone(self.state.zone_at(offset)?)?;
        if offset + buf.len() as u64 > z.start + z.len {
            return Err(ZbdError::io("read crosses zone boundary"));
        }
        let at = (offset - z.start) as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = z.data.get(at + i).copied().unwrap_or(0);
        }
        Ok(buf.len())
    }

    fn async_writer(&self) -> ZbdResult<Box<dyn AsyncZoneWriter>> {
        Ok(Box::new(MemAsyncWriter {
            state: Arc::clone(&self.state),
            inflight: 0,
        }))
    }

    fn device_id(&self) -> ZbdResult<(u64, u64)> {
        Ok((0x6d65, 0x6d30))
    }
}

/// Mock async writer: the write is applied at submit time, so `wait` only
/// clears the in-flight marker.
struct MemAsyncWriter {
    state: Arc<MemState>,
    inflight: u32,
}

impl AsyncZoneWriter for MemAsyncWriter {
    fn submit(&mut self, data: &[u8], offset: u64) -> ZbdResult<()> {
        if self.inflight != 0 {
            return Err(ZbdError::io("async write already in flight"));
        }
        self.state.do_pwrite(data, offset)?;
        self.inflight = data.len() as u32;
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> ZbdResult<()> {
        self.inflight = 0;
        Ok(())
    }

    fn inflight(&self) -> u32 {
        self.inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemBackend {
        MemBackend::new(MemBackendConfig {
            nr_zones: 4,
            zone_size: 65536,
            zone_capacity: 32768,
            block_size: 4096,
            max_active_zones: 8,
            readonly: false,
        })
    }

    #[test]
    fn test_sequential_write_enforced() {
        let b = backend();
        assert_eq!(b.pwrite(&[1u8; 4096], 0).unwrap(), 4096);
        // Writing anywhere but the write pointer is rejected.
        assert!(b.pwrite(&[1u8; 4096], 0).is_err());
        assert!(b.pwrite(&[1u8; 4096], 8192).is_err());
        assert_eq!(b.pwrite(&[2u8; 4096], 4096).unwrap(), 4096);

        let raw = b.report_zone(0).unwrap();
        assert_eq!(raw.wp, 8192);
        assert_eq!(raw.cond, ZoneCondition::ImplicitOpen);
    }

    #[test]
    fn test_capacity_limit_and_full() {
        let b = backend();
        assert!(b.pwrite(&vec![0u8; 36864], 0).is_err());
        b.pwrite(&vec![3u8; 32768], 0).unwrap();
        let raw = b.report_zone(0).unwrap();
        assert!(raw.is_full());
        assert!(b.pwrite(&[0u8; 4096], raw.wp).is_err());
    }

    #[test]
    fn test_reset_and_finish() {
        let b = backend();
        b.pwrite(&[7u8; 4096], 65536).unwrap();
        b.finish_zone(65536).unwrap();
        let raw = b.report_zone(65536).unwrap();
        assert!(raw.is_full());
        assert_eq!(raw.wp, 65536 + 65536);

        b.reset_zone(65536).unwrap();
        let raw = b.report_zone(65536).unwrap();
        assert_eq!(raw.cond, ZoneCondition::Empty);
        assert_eq!(raw.wp, 65536);
    }

    #[test]
    fn test_read_zero_fills_unwritten() {
        let b = backend();
        b.pwrite(&[0xa5u8; 4096], 0).unwrap();
        let mut buf = vec![0xffu8; 8192];
        assert_eq!(b.pread(&mut buf, 0, false).unwrap(), 8192);
        assert!(buf[..4096].iter().all(|&x| x == 0xa5));
        assert!(buf[4096..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_read_cannot_cross_zone() {
        let b = backend();
        let mut buf = vec![0u8; 8192];
        assert!(b.pread(&mut buf, 65536 - 4096, false).is_err());
    }

    #[test]
    fn test_close_requires_open_zone() {
        let b = backend();
        assert!(b.close_zone(0).is_err());
        b.pwrite(&[1u8; 4096], 0).unwrap();
        b.close_zone(0).unwrap();
        assert_eq!(b.report_zone(0).unwrap().cond, ZoneCondition::Closed);
    }

    #[test]
    fn test_readonly_rejects_mutation() {
        let b = MemBackend::new(MemBackendConfig {
            readonly: true,
            ..MemBackendConfig::default()
        });
        assert!(b.pwrite(&[0u8; 4096], 0).is_err());
        assert!(b.reset_zone(0).is_err());
        assert!(b.finish_zone(0).is_err());
    }

    #[test]
    fn test_async_writer_single_slot() {
        let b = backend();
        let mut w = b.async_writer().unwrap();
        w.submit(&[9u8; 4096], 0).unwrap();
        assert_eq!(w.inflight(), 4096);
        assert!(w.submit(&[9u8; 4096], 4096).is_err());
        w.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(w.inflight(), 0);
        w.submit(&[8u8; 4096], 4096).unwrap();
        w.wait(Duration::from_secs(1)).unwrap();

        let mut buf = vec![0u8; 8192];
        b.pread(&mut buf, 0, false).unwrap();
        assert!(buf[..4096].iter().all(|&x| x == 9));
        assert!(buf[4096..].iter().all(|&x| x == 8));
    }
}
