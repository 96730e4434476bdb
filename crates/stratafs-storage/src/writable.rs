//! The buffered/unbuffered writable file adapter.
//!
//! Buffered mode accumulates small appends in one page-aligned bounce
//! buffer of 256 blocks; large residuals bypass the buffer in whole-block
//! chunks. Fsync orders buffer flush, extent push, then metadata persist.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::aligned::AlignedBuf;
use crate::error::{ZbdError, ZbdResult};
use crate::file::{MetadataWriter, ZoneFile};
use crate::hint::WriteLifetimeHint;

/// Bounce-buffer size in blocks.
const BUFFER_BLOCKS: usize = 256;

struct WriteState {
    buffer: Option<AlignedBuf>,
    buffer_pos: usize,
    /// User-visible bytes accepted so far.
    wp: u64,
}

/// Append-only writable file handle.
pub struct ZonedWritableFile {
    file: Arc<ZoneFile>,
    metadata_writer: Arc<dyn MetadataWriter>,
    block_size: usize,
    buffer_size: usize,
    buffered: bool,
    state: Mutex<WriteState>,
}

impl ZonedWritableFile {
    /// Opens `file` for appending. Only fresh (empty) files may be opened
    /// for write.
    pub fn new(
        file: Arc<ZoneFile>,
        buffered: bool,
        metadata_writer: Arc<dyn MetadataWriter>,
    ) -> ZbdResult<Self> {
        let wp = file.file_size();
        debug_assert_eq!(wp, 0);

        let block_size = file.zbd().block_size() as usize;
        let buffer_size = block_size * BUFFER_BLOCKS;
        let buffer = if buffered {
            Some(AlignedBuf::new(buffer_size)?)
        } else {
            None
        };

        file.open_wr()?;
        Ok(Self {
            file,
            metadata_writer,
            block_size,
            buffer_size,
            buffered,
            state: Mutex::new(WriteState {
                buffer,
                buffer_pos: 0,
                wp,
            }),
        })
    }

    /// The underlying file.
    pub fn file(&self) -> &Arc<ZoneFile> {
        &self.file
    }

    /// User-visible bytes accepted so far.
    pub fn wp(&self) -> u64 {
        self.lock_state().map(|s| s.wp).unwrap_or(0)
    }

    fn lock_state(&self) -> ZbdResult<MutexGuard<'_, WriteState>> {
        self.state
            .lock()
            .map_err(|_| ZbdError::io("writable file lock poisoned"))
    }

    /// Appends `data` at the current write position.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        let mut st = self.lock_state()?;
        self.append_locked(&mut st, data)
    }

    /// Appends `data`, requiring `offset` to equal the current write
    /// position. Fails without mutating state otherwise.
    pub fn positioned_append(&self, data: &[u8], offset: u64) -> ZbdResult<()> {
        let mut st = self.lock_state()?;
        if offset != st.wp {
            return Err(ZbdError::io("positioned append not at write pointer"));
        }
        self.append_locked(&mut st, data)
    }

    fn append_locked(&self, st: &mut WriteState, data: &[u8]) -> ZbdResult<()> {
        if self.buffered {
            self.buffered_write(st, data)
        } else {
            self.file.append(data, data.len())?;
            st.wp += data.len() as u64;
            Ok(())
        }
    }

    fn buffered_write(&self, st: &mut WriteState, data: &[u8]) -> ZbdResult<()> {
        let mut data = data;

        let buffer_left = self.buffer_size - st.buffer_pos;
        if st.buffer_pos > 0 || data.len() <= buffer_left {
            let tobuffer = data.len().min(buffer_left);
            let pos = st.buffer_pos;
            let buffer = st
                .buffer
                .as_mut()
                .ok_or_else(|| ZbdError::io("buffered write without a buffer"))?;
            buffer.as_mut_slice()[pos..pos + tobuffer].copy_from_slice(&data[..tobuffer]);
            st.buffer_pos += tobuffer;
            st.wp += tobuffer as u64;
            data = &data[tobuffer..];
            if data.is_empty() {
                return Ok(());
            }
        }

        if st.buffer_pos == self.buffer_size {
            self.flush_buffer(st)?;
        }

        // A residual at least as large as the buffer goes to the device
        // directly, whole blocks at a time.
        if data.len() >= self.buffer_size {
            let aligned_sz = (data.len() / self.block_size) * self.block_size;
            let mut scratch = AlignedBuf::new(aligned_sz)?;
            scratch.as_mut_slice().copy_from_slice(&data[..aligned_sz]);
            self.file.append(scratch.as_slice(), aligned_sz)?;
            st.wp += aligned_sz as u64;
            data = &data[aligned_sz..];
        }

        if !data.is_empty() {
            let buffer = st
                .buffer
                .as_mut()
                .ok_or_else(|| ZbdError::io("buffered write without a buffer"))?;
            buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
            st.buffer_pos = data.len();
            st.wp += data.len() as u64;
        }

        Ok(())
    }

    fn flush_buffer(&self, st: &mut WriteState) -> ZbdResult<()> {
        if st.buffer_pos == 0 {
            return Ok(());
        }

        let pos = st.buffer_pos;
        let align = pos % self.block_size;
        let pad = if align != 0 { self.block_size - align } else { 0 };
        let wr_sz = pos + pad;

        let buffer = st
            .buffer
            .as_mut()
            .ok_or_else(|| ZbdError::io("flush on an unbuffered file"))?;
        if pad > 0 {
            buffer.as_mut_slice()[pos..wr_sz].fill(0);
        }
        self.file.append(&buffer.as_slice()[..wr_sz], pos)?;

        st.buffer_pos = 0;
        Ok(())
    }

    /// Flushes the buffer, seals the pending extent and persists the file
    /// metadata. After a successful fsync every appended byte is readable.
    pub fn fsync(&self) -> ZbdResult<()> {
        {
            let mut st = self.lock_state()?;
            if self.buffered {
                self.flush_buffer(&mut st)?;
            }
        }
        self.file.push_extent()?;
        self.file.zbd().metrics().record_sync();
        self.metadata_writer.persist(&self.file)
    }

    /// Same durability contract as [`fsync`](Self::fsync).
    pub fn sync(&self) -> ZbdResult<()> {
        self.fsync()
    }

    /// No-op; data is staged in the bounce buffer until fsync.
    pub fn flush(&self) -> ZbdResult<()> {
        Ok(())
    }

    /// Syncs only when `[offset, offset + nbytes)` has not been accepted
    /// yet in full.
    pub fn range_sync(&self, offset: u64, nbytes: u64) -> ZbdResult<()> {
        let wp = self.lock_state()?.wp;
        if wp < offset + nbytes {
            return self.fsync();
        }
        Ok(())
    }

    /// Fsyncs and releases the file's active zone.
    pub fn close(&self) -> ZbdResult<()> {
        self.fsync()?;
        self.file.close_wr()
    }

    /// Sets the file size without freeing device storage.
    pub fn truncate(&self, size: u64) -> ZbdResult<()> {
        self.file.set_file_size(size)
    }

    /// Forwards the lifetime hint to the file.
    pub fn set_lifetime_hint(&self, hint: WriteLifetimeHint) -> ZbdResult<()> {
        self.file.set_lifetime(hint)
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        let _ = self.file.close_wr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemBackendConfig, ZoneBackend};
    use crate::device::{ZbdConfig, ZonedBlockDevice};

    struct NoopMetadataWriter;
    impl MetadataWriter for NoopMetadataWriter {
        fn persist(&self, _file: &Arc<ZoneFile>) -> ZbdResult<()> {
            Ok(())
        }
    }

    fn open_device() -> Arc<ZonedBlockDevice> {
        let backend: Arc<dyn ZoneBackend> = Arc::new(MemBackend::new(MemBackendConfig {
            nr_zones: 40,
            zone_size: 8 << 20,
            zone_capacity: 4 << 20,
            block_size: 4096,
            max_active_zones: 8,
            readonly: false,
        }));
        ZonedBlockDevice::open(backend, ZbdConfig::default()).unwrap()
    }

    fn writable(zbd: &Arc<ZonedBlockDevice>, name: &str, buffered: bool) -> ZonedWritableFile {
        let file = ZoneFile::new(Arc::clone(zbd), name, 1);
        ZonedWritableFile::new(file, buffered, Arc::new(NoopMetadataWriter)).unwrap()
    }

    #[test]
    fn test_buffered_small_appends_coalesce() {
        let zbd = open_device();
        let w = writable(&zbd, "w1", true);

        for i in 0..100u8 {
            w.append(&[i; 100]).unwrap();
        }
        assert_eq!(w.wp(), 10_000);
        // Nothing reached the device yet.
        assert_eq!(w.file().file_size(), 0);

        w.fsync().unwrap();
        assert_eq!(w.file().file_size(), 10_000);

        let mut buf = vec![0u8; 10_000];
        assert_eq!(w.file().positioned_read(0, &mut buf, false).unwrap(), 10_000);
        for i in 0..100usize {
            assert!(buf[i * 100..(i + 1) * 100].iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_large_append_bypasses_buffer() {
        let zbd = open_device();
        let w = writable(&zbd, "w2", true);

        // Larger than the 1 MiB bounce buffer plus an unaligned tail.
        let big = vec![0x42u8; (1 << 20) + 4096 + 100];
        w.append(&big).unwrap();
        assert_eq!(w.wp(), big.len() as u64);
        // The whole-block prefix is already on the device.
        assert_eq!(w.file().file_size(), (1 << 20) + 4096);

        w.fsync().unwrap();
        assert_eq!(w.file().file_size(), big.len() as u64);

        let mut buf = vec![0u8; big.len()];
        assert_eq!(
            w.file().positioned_read(0, &mut buf, false).unwrap(),
            big.len()
        );
        assert_eq!(buf, big);
    }

    #[test]
    fn test_positioned_append_requires_wp() {
        let zbd = open_device();
        let w = writable(&zbd, "w3", true);
        w.append(&[1u8; 512]).unwrap();

        let err = w.positioned_append(&[2u8; 512], 0).unwrap_err();
        assert!(matches!(err, ZbdError::Io { .. }));
        assert_eq!(w.wp(), 512);

        w.positioned_append(&[2u8; 512], 512).unwrap();
        assert_eq!(w.wp(), 1024);
    }

    #[test]
    fn test_range_sync_noop_when_covered() {
        let zbd = open_device();
        let w = writable(&zbd, "w4", true);
        w.append(&[3u8; 4096]).unwrap();
        w.fsync().unwrap();
        let synced_extents = w.file().extents().len();

        // Already covered by the fsync above: no new extent appears.
        w.range_sync(0, 4096).unwrap();
        assert_eq!(w.file().extents().len(), synced_extents);

        // Ranges reaching past the accepted bytes force a sync.
        w.append(&[4u8; 4096]).unwrap();
        w.range_sync(4096, 8192).unwrap();
        assert_eq!(w.file().file_size(), 8192);
    }

    #[test]
    fn test_unbuffered_append_delegates() {
        let zbd = open_device();
        let w = writable(&zbd, "w5", false);
        w.append(&[5u8; 8192]).unwrap();
        assert_eq!(w.wp(), 8192);
        assert_eq!(w.file().file_size(), 8192);
    }

    #[test]
    fn test_truncate_sets_size_only() {
        let zbd = open_device();
        let w = writable(&zbd, "w6", false);
        w.append(&[6u8; 8192]).unwrap();
        w.fsync().unwrap();
        w.truncate(4096).unwrap();
        assert_eq!(w.file().file_size(), 4096);
    }

    #[test]
    fn test_close_releases_zone() {
        let zbd = open_device();
        let w = writable(&zbd, "w7", true);
        w.append(&[7u8; 100]).unwrap();
        w.close().unwrap();
        assert_eq!(w.file().file_size(), 100);
        assert!(w.file().extents()[0].zone().used_capacity() == 100);
        assert!(!w.file().extents()[0].zone().open_for_write());
    }
}
