//! Linux zoned-block-device backend.
//!
//! Talks to the kernel through the blkzoned ioctls and sysfs queue
//! attributes, reads and writes with positioned I/O on three descriptors
//! (buffered read, `O_DIRECT` read, `O_DIRECT | O_EXCL` write), and runs
//! the one-deep asynchronous zone append over a private io_uring instance
//! per zone.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};
use nix::errno::Errno;
use tracing::info;

use crate::aligned::AlignedBuf;
use crate::backend::{
    AsyncZoneWriter, DeviceInfo, DeviceModel, RawZone, ZoneBackend, ZoneCondition, ZoneType,
};
use crate::error::{ZbdError, ZbdResult};

const SECTOR_SHIFT: u64 = 9;
/// Zones fetched per report ioctl.
const REPORT_BATCH: u32 = 256;

/// Ioctl definitions from `linux/blkzoned.h`. These don't belong in libc,
/// and nix has no wrappers for them.
mod ffi {
    use nix::{ioctl_readwrite, ioctl_write_ptr};

    pub const BLK_ZONE_TYPE_CONVENTIONAL: u8 = 0x1;
    pub const BLK_ZONE_TYPE_SEQWRITE_PREF: u8 = 0x3;

    pub const BLK_ZONE_COND_NOT_WP: u8 = 0x0;
    pub const BLK_ZONE_COND_EMPTY: u8 = 0x1;
    pub const BLK_ZONE_COND_IMP_OPEN: u8 = 0x2;
    pub const BLK_ZONE_COND_EXP_OPEN: u8 = 0x3;
    pub const BLK_ZONE_COND_CLOSED: u8 = 0x4;
    pub const BLK_ZONE_COND_READONLY: u8 = 0xd;
    pub const BLK_ZONE_COND_FULL: u8 = 0xe;

    /// Set when the report carries per-zone capacities distinct from the
    /// zone length.
    pub const BLK_ZONE_REP_CAPACITY: u32 = 1 << 0;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct BlkZone {
        pub start: u64,
        pub len: u64,
        pub wp: u64,
        pub zone_type: u8,
        pub cond: u8,
        pub non_seq: u8,
        pub reset: u8,
        pub resv: [u8; 4],
        pub capacity: u64,
        pub reserved: [u8; 24],
    }

    #[repr(C)]
    pub struct BlkZoneReport {
        pub sector: u64,
        pub nr_zones: u32,
        pub flags: u32,
    }

    #[repr(C)]
    pub struct BlkZoneRange {
        pub sector: u64,
        pub nr_sectors: u64,
    }

    ioctl_readwrite!(blk_report_zone, 0x12, 130, BlkZoneReport);
    ioctl_write_ptr!(blk_reset_zone, 0x12, 131, BlkZoneRange);
    ioctl_write_ptr!(blk_close_zone, 0x12, 135, BlkZoneRange);
    ioctl_write_ptr!(blk_finish_zone, 0x12, 136, BlkZoneRange);
}

/// Backend for a real host-managed zoned block device.
pub struct BlkZonedBackend {
    info: DeviceInfo,
    devname: String,
    read_file: File,
    read_direct_file: File,
    write_file: Option<File>,
}

impl BlkZonedBackend {
    /// Opens the device at `path` (e.g. `/dev/nvme0n1`). Without
    /// `readonly`, the write descriptor takes `O_DIRECT | O_EXCL`, so one
    /// opener owns the device.
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> ZbdResult<Self> {
        let path = path.as_ref();
        let devname = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ZbdError::invalid(format!("bad device path {}", path.display())))?
            .to_string();

        let open_err = |e: std::io::Error| {
            ZbdError::invalid(format!(
                "failed to open zoned block device {}: {e}",
                path.display()
            ))
        };
        let read_file = OpenOptions::new().read(true).open(path).map_err(open_err)?;
        let read_direct_file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
            .map_err(open_err)?;
        let write_file = if readonly {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_DIRECT | libc::O_EXCL)
                    .open(path)
                    .map_err(open_err)?,
            )
        };

        let model = match Self::sysfs_attr(&devname, "queue/zoned")?.as_str() {
            "host-managed" => DeviceModel::HostManaged,
            "host-aware" => DeviceModel::HostAware,
            _ => DeviceModel::Conventional,
        };
        let block_size = Self::sysfs_u64(&devname, "queue/physical_block_size")? as u32;
        let zone_sectors = Self::sysfs_u64(&devname, "queue/chunk_sectors")?;
        if zone_sectors == 0 {
            return Err(ZbdError::not_supported(format!(
                "{} reports no zone size",
                path.display()
            )));
        }
        let nr_zones = Self::sysfs_u64(&devname, "queue/nr_zones")? as u32;
        let max_active_zones = Self::sysfs_u64(&devname, "queue/max_active_zones")? as u32;
        let max_open_zones = Self::sysfs_u64(&devname, "queue/max_open_zones")? as u32;

        let info = DeviceInfo {
            path: path.display().to_string(),
            model,
            block_size,
            zone_size: zone_sectors << SECTOR_SHIFT,
            nr_zones,
            max_active_zones,
            max_open_zones,
        };
        info!(
            path = %info.path,
            nr_zones,
            max_active_zones,
            max_open_zones,
            zone_size = info.zone_size,
            "opened zoned block device"
        );

        Ok(Self {
            info,
            devname,
            read_file,
            read_direct_file,
            write_file,
        })
    }

    fn sysfs_attr(devname: &str, attr: &str) -> ZbdResult<String> {
        let path = format!("/sys/block/{devname}/{attr}");
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| ZbdError::invalid(format!("failed to read {path}: {e}")))
    }

    fn sysfs_u64(devname: &str, attr: &str) -> ZbdResult<u64> {
        let raw = Self::sysfs_attr(devname, attr)?;
        raw.parse()
            .map_err(|_| ZbdError::invalid(format!("unparsable sysfs value {attr}={raw}")))
    }

    fn write_fd(&self) -> ZbdResult<&File> {
        self.write_file
            .as_ref()
            .ok_or_else(|| ZbdError::invalid("device opened read-only"))
    }

    fn raw_zone(z: &ffi::BlkZone, flags: u32) -> RawZone {
        let capacity = if flags & ffi::BLK_ZONE_REP_CAPACITY != 0 {
            z.capacity
        } else {
            z.len
        };
        RawZone {
            start: z.start << SECTOR_SHIFT,
            len: z.len << SECTOR_SHIFT,
            capacity: capacity << SECTOR_SHIFT,
            wp: z.wp << SECTOR_SHIFT,
            zone_type: match z.zone_type {
                ffi::BLK_ZONE_TYPE_CONVENTIONAL => ZoneType::Conventional,
                ffi::BLK_ZONE_TYPE_SEQWRITE_PREF => ZoneType::SeqWritePreferred,
                _ => ZoneType::SeqWriteRequired,
            },
            cond: match z.cond {
                ffi::BLK_ZONE_COND_NOT_WP => ZoneCondition::NotWp,
                ffi::BLK_ZONE_COND_EMPTY => ZoneCondition::Empty,
                ffi::BLK_ZONE_COND_IMP_OPEN => ZoneCondition::ImplicitOpen,
                ffi::BLK_ZONE_COND_EXP_OPEN => ZoneCondition::ExplicitOpen,
                ffi::BLK_ZONE_COND_CLOSED => ZoneCondition::Closed,
                ffi::BLK_ZONE_COND_READONLY => ZoneCondition::ReadOnly,
                ffi::BLK_ZONE_COND_FULL => ZoneCondition::Full,
                _ => ZoneCondition::Offline,
            },
        }
    }

    fn report_range(&self, sector: u64, nr: u32) -> ZbdResult<Vec<RawZone>> {
        let hdr = std::mem::size_of::<ffi::BlkZoneReport>();
        let mut buf = vec![0u8; hdr + nr as usize * std::mem::size_of::<ffi::BlkZone>()];
        let report = buf.as_mut_ptr() as *mut ffi::BlkZoneReport;

        // SAFETY: buf holds a BlkZoneReport header followed by nr BlkZone
        // entries, matching what the ioctl expects.
        let (reported, flags) = unsafe {
            (*report).sector = sector;
            (*report).nr_zones = nr;
            (*report).flags = 0;
            ffi::blk_report_zone(self.read_file.as_raw_fd(), report)
                .map_err(|e| ZbdError::io(format!("zone report failed: {e}")))?;
            ((*report).nr_zones, (*report).flags)
        };

        let mut zones = Vec::with_capacity(reported as usize);
        let entries = unsafe { buf.as_ptr().add(hdr) } as *const ffi::BlkZone;
        for i in 0..reported.min(nr) as usize {
            // SAFETY: the kernel filled `reported` entries after the header.
            let z = unsafe { *entries.add(i) };
            zones.push(Self::raw_zone(&z, flags));
        }
        Ok(zones)
    }

    fn zone_range(&self, start: u64) -> ffi::BlkZoneRange {
        ffi::BlkZoneRange {
            sector: start >> SECTOR_SHIFT,
            nr_sectors: self.info.zone_size >> SECTOR_SHIFT,
        }
    }
}

impl ZoneBackend for BlkZonedBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn is_readonly(&self) -> bool {
        self.write_file.is_none()
    }

    fn check_scheduler(&self) -> ZbdResult<()> {
        let scheduler = Self::sysfs_attr(&self.devname, "queue/scheduler")?;
        if !scheduler.contains("[mq-deadline]") {
            return Err(ZbdError::invalid(
                "zoned block device scheduler is not mq-deadline; set it to mq-deadline",
            ));
        }
        Ok(())
    }

    fn list_zones(&self) -> ZbdResult<Vec<RawZone>> {
        let mut zones = Vec::with_capacity(self.info.nr_zones as usize);
        let mut sector = 0u64;
        while zones.len() < self.info.nr_zones as usize {
            let batch = self.report_range(sector, REPORT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let last = &batch[batch.len() - 1];
            sector = (last.start + last.len) >> SECTOR_SHIFT;
            zones.extend(batch);
        }
        if zones.len() != self.info.nr_zones as usize {
            return Err(ZbdError::io(format!(
                "zone report returned {} of {} zones",
                zones.len(),
                self.info.nr_zones
            )));
        }
        Ok(zones)
    }

    fn report_zone(&self, start: u64) -> ZbdResult<RawZone> {
        self.report_range(start >> SECTOR_SHIFT, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| ZbdError::io("zone report returned no zones"))
    }

    fn reset_zone(&self, start: u64) -> ZbdResult<()> {
        let range = self.zone_range(start);
        // SAFETY: range describes one whole zone on this open device.
        unsafe { ffi::blk_reset_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| ZbdError::io(format!("zone reset failed: {e}")))?;
        Ok(())
    }

    fn finish_zone(&self, start: u64) -> ZbdResult<()> {
        let range = self.zone_range(start);
        // SAFETY: as above.
        unsafe { ffi::blk_finish_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| ZbdError::io(format!("zone finish failed: {e}")))?;
        Ok(())
    }

    fn close_zone(&self, start: u64) -> ZbdResult<()> {
        let range = self.zone_range(start);
        // SAFETY: as above.
        unsafe { ffi::blk_close_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| ZbdError::io(format!("zone close failed: {e}")))?;
        Ok(())
    }

    fn pwrite(&self, data: &[u8], offset: u64) -> ZbdResult<usize> {
        let f = self.write_fd()?;
        loop {
            match nix::sys::uio::pwrite(f, data, offset as i64) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ZbdError::io(format!("pwrite failed: {e}"))),
            }
        }
    }

    fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize> {
        let f = if direct {
            &self.read_direct_file
        } else {
            &self.read_file
        };
        loop {
            match nix::sys::uio::pread(f, buf, offset as i64) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ZbdError::io(format!("pread failed: {e}"))),
            }
        }
    }

    fn async_writer(&self) -> ZbdResult<Box<dyn AsyncZoneWriter>> {
        let fd = self.write_fd()?.as_raw_fd();
        let ring = IoUring::new(2)
            .map_err(|e| ZbdError::io(format!("failed to set up io context: {e}")))?;
        Ok(Box::new(UringZoneWriter {
            ring,
            fd,
            buf: None,
            inflight: 0,
        }))
    }

    fn device_id(&self) -> ZbdResult<(u64, u64)> {
        let st = nix::sys::stat::fstat(self.read_file.as_raw_fd())
            .map_err(|e| ZbdError::io(format!("fstat failed: {e}")))?;
        Ok((st.st_dev as u64, st.st_ino))
    }
}

/// One-deep async append channel over a private io_uring.
///
/// The submitted data is copied into a writer-owned aligned buffer, so the
/// kernel never sees caller memory. The raw write descriptor stays valid
/// for the writer's lifetime because every zone holds the backend alive.
struct UringZoneWriter {
    ring: IoUring,
    fd: RawFd,
    buf: Option<AlignedBuf>,
    inflight: u32,
}

impl AsyncZoneWriter for UringZoneWriter {
    fn submit(&mut self, data: &[u8], offset: u64) -> ZbdResult<()> {
        if self.inflight != 0 {
            return Err(ZbdError::io("async write already in flight"));
        }

        if self.buf.as_ref().map_or(true, |b| b.len() < data.len()) {
            self.buf = Some(AlignedBuf::new(data.len())?);
        }
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| ZbdError::io("async write buffer missing"))?;
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);

        let sqe = opcode::Write::new(types::Fd(self.fd), buf.as_ptr(), data.len() as u32)
            .offset(offset)
            .build();
        // SAFETY: the buffer outlives the submission; wait() reaps the
        // completion before the buffer can be reused or freed.
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| ZbdError::io("failed to queue async write"))?;
        }
        self.ring
            .submit()
            .map_err(|e| ZbdError::io(format!("failed to submit io: {e}")))?;
        self.inflight = data.len() as u32;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> ZbdResult<()> {
        if self.inflight == 0 {
            return Ok(());
        }

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => {
                return Err(ZbdError::io("failed to complete io: timeout"));
            }
            Err(e) => return Err(ZbdError::io(format!("failed to complete io: {e}"))),
        }

        let cqe = self
            .ring
            .completion()
            .next()
            .ok_or_else(|| ZbdError::io("failed to complete io: timeout"))?;
        let expected = self.inflight;
        self.inflight = 0;

        let res = cqe.result();
        if res < 0 {
            return Err(ZbdError::io(format!(
                "async write failed: {}",
                Errno::from_i32(-res)
            )));
        }
        if res as u32 != expected {
            return Err(ZbdError::io("failed to complete io: short write"));
        }
        Ok(())
    }

    fn inflight(&self) -> u32 {
        self.inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffi_struct_layout() {
        assert_eq!(std::mem::size_of::<ffi::BlkZone>(), 64);
        assert_eq!(std::mem::size_of::<ffi::BlkZoneReport>(), 16);
        assert_eq!(std::mem::size_of::<ffi::BlkZoneRange>(), 16);
    }

    #[test]
    fn test_raw_zone_conversion() {
        let z = ffi::BlkZone {
            start: 0x1000,
            len: 0x800,
            wp: 0x1200,
            zone_type: 0x2,
            cond: ffi::BLK_ZONE_COND_IMP_OPEN,
            non_seq: 0,
            reset: 0,
            resv: [0; 4],
            capacity: 0x700,
            reserved: [0; 24],
        };

        let with_cap = BlkZonedBackend::raw_zone(&z, ffi::BLK_ZONE_REP_CAPACITY);
        assert_eq!(with_cap.start, 0x1000 << 9);
        assert_eq!(with_cap.len, 0x800 << 9);
        assert_eq!(with_cap.wp, 0x1200 << 9);
        assert_eq!(with_cap.capacity, 0x700 << 9);
        assert_eq!(with_cap.zone_type, ZoneType::SeqWriteRequired);
        assert_eq!(with_cap.cond, ZoneCondition::ImplicitOpen);
        assert!(with_cap.is_open());

        // Without the capacity flag the zone length is the capacity.
        let without_cap = BlkZonedBackend::raw_zone(&z, 0);
        assert_eq!(without_cap.capacity, 0x800 << 9);
    }

    #[test]
    fn test_unknown_condition_maps_to_offline() {
        let z = ffi::BlkZone {
            start: 0,
            len: 1,
            wp: 0,
            zone_type: 0x2,
            cond: 0xf,
            non_seq: 0,
            reset: 0,
            resv: [0; 4],
            capacity: 1,
            reserved: [0; 24],
        };
        let raw = BlkZonedBackend::raw_zone(&z, 0);
        assert!(raw.is_offline());
    }
}
