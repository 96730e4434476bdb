//! Append-only files backed by zone extents, and their on-device metadata
//! codec.
//!
//! A `ZoneFile` is an ordered list of extents. Appends go to one active
//! zone at a time; when the zone fills up the pending extent is sealed and
//! the next zone is allocated. Metadata is a tagged record stream so file
//! updates can be logged incrementally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::coding::{
    get_fixed32, get_fixed64, get_length_prefixed_slice, put_fixed32, put_fixed64,
    put_length_prefixed_slice, put_varint64, MAX_VARINT64_LEN,
};
use crate::device::ZonedBlockDevice;
use crate::error::{ZbdError, ZbdResult};
use crate::extent::{ZoneExtent, EXTENT_ENCODED_LEN};
use crate::hint::WriteLifetimeHint;
use crate::zone::Zone;

/// Persists a file's metadata record; implemented by the surrounding file
/// system (typically by appending to its metadata log and syncing).
pub trait MetadataWriter: Send + Sync {
    /// Makes the file's current metadata durable.
    fn persist(&self, file: &Arc<ZoneFile>) -> ZbdResult<()>;
}

/// Re-persists a file's metadata after garbage collection moved its
/// extents.
pub trait MetadataSync: Send + Sync {
    /// Makes the file's relocated extent list durable.
    fn sync_file_metadata(&self, file: &Arc<ZoneFile>) -> ZbdResult<()>;
}

const TAG_FILE_ID: u32 = 1;
const TAG_FILE_NAME: u32 = 2;
const TAG_FILE_SIZE: u32 = 3;
const TAG_WRITE_LIFETIME_HINT: u32 = 4;
const TAG_EXTENT: u32 = 5;
const TAG_MODIFICATION_TIME: u32 = 6;

struct FileInner {
    filename: String,
    file_size: u64,
    lifetime: WriteLifetimeHint,
    m_time: u64,
    extents: Vec<ZoneExtent>,
    nr_synced_extents: usize,
    active_zone: Option<Arc<Zone>>,
    /// Device offset where the pending extent begins.
    extent_start: u64,
    /// File offset covered by already-pushed extents.
    extent_filepos: u64,
    open_for_wr: bool,
}

/// One append-only file stored in zone extents.
pub struct ZoneFile {
    zbd: Arc<ZonedBlockDevice>,
    file_id: AtomicU64,
    is_wal: AtomicBool,
    inner: Mutex<FileInner>,
}

impl ZoneFile {
    /// Creates an empty file handle.
    pub fn new(zbd: Arc<ZonedBlockDevice>, filename: impl Into<String>, file_id: u64) -> Arc<Self> {
        Arc::new(Self {
            zbd,
            file_id: AtomicU64::new(file_id),
            is_wal: AtomicBool::new(false),
            inner: Mutex::new(FileInner {
                filename: filename.into(),
                file_size: 0,
                lifetime: WriteLifetimeHint::NotSet,
                m_time: 0,
                extents: Vec::new(),
                nr_synced_extents: 0,
                active_zone: None,
                extent_start: 0,
                extent_filepos: 0,
                open_for_wr: false,
            }),
        })
    }

    fn lock_inner(&self) -> ZbdResult<MutexGuard<'_, FileInner>> {
        self.inner
            .lock()
            .map_err(|_| ZbdError::io("zone file lock poisoned"))
    }

    /// The owning device.
    pub fn zbd(&self) -> &Arc<ZonedBlockDevice> {
        &self.zbd
    }

    /// File id, unique within the file system instance.
    pub fn id(&self) -> u64 {
        self.file_id.load(Ordering::Acquire)
    }

    /// Current file name.
    pub fn filename(&self) -> String {
        self.lock_inner()
            .map(|i| i.filename.clone())
            .unwrap_or_default()
    }

    /// Renames the file. The metadata record becomes durable on the next
    /// persist.
    pub fn rename(&self, name: impl Into<String>) -> ZbdResult<()> {
        self.lock_inner()?.filename = name.into();
        Ok(())
    }

    /// Current file size in bytes, including not-yet-synced appends.
    pub fn file_size(&self) -> u64 {
        self.lock_inner().map(|i| i.file_size).unwrap_or(0)
    }

    /// Sets the file size without touching device storage.
    pub fn set_file_size(&self, size: u64) -> ZbdResult<()> {
        self.lock_inner()?.file_size = size;
        Ok(())
    }

    /// Modification time, seconds since the epoch.
    pub fn mtime(&self) -> u64 {
        self.lock_inner().map(|i| i.m_time).unwrap_or(0)
    }

    /// Sets the modification time.
    pub fn set_mtime(&self, mtime: u64) -> ZbdResult<()> {
        self.lock_inner()?.m_time = mtime;
        Ok(())
    }

    /// The file's write-lifetime hint.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.lock_inner()
            .map(|i| i.lifetime)
            .unwrap_or(WriteLifetimeHint::NotSet)
    }

    /// Sets the write-lifetime hint used for zone allocation.
    pub fn set_lifetime(&self, hint: WriteLifetimeHint) -> ZbdResult<()> {
        self.lock_inner()?.lifetime = hint;
        Ok(())
    }

    /// Marks the file as part of the write-ahead log, giving its zone
    /// allocations priority.
    pub fn set_wal(&self, is_wal: bool) {
        self.is_wal.store(is_wal, Ordering::Release);
    }

    /// True when allocations for this file take the high-priority path.
    pub fn is_wal(&self) -> bool {
        self.is_wal.load(Ordering::Acquire)
    }

    /// Marks the file open for writing.
    pub fn open_wr(&self) -> ZbdResult<()> {
        self.lock_inner()?.open_for_wr = true;
        Ok(())
    }

    /// True while a writer owns the file.
    pub fn is_open_for_wr(&self) -> bool {
        self.lock_inner().map(|i| i.open_for_wr).unwrap_or(false)
    }

    /// Releases the active zone, if any, and closes the file for writing.
    pub fn close_wr(&self) -> ZbdResult<()> {
        let mut inner = self.lock_inner()?;
        if let Some(zone) = inner.active_zone.take() {
            zone.close_wr()?;
        }
        inner.open_for_wr = false;
        Ok(())
    }

    /// Number of extents covered by the last metadata persist.
    pub fn nr_synced_extents(&self) -> usize {
        self.lock_inner().map(|i| i.nr_synced_extents).unwrap_or(0)
    }

    /// Copy of the extent list.
    pub fn extents(&self) -> Vec<ZoneExtent> {
        self.lock_inner()
            .map(|i| i.extents.clone())
            .unwrap_or_default()
    }

    /// Appends block-aligned data, rolling over to a new zone whenever the
    /// active one fills up. `valid_size` is the number of meaningful bytes;
    /// alignment padding beyond it does not count towards the file size.
    pub fn append(&self, data: &[u8], valid_size: usize) -> ZbdResult<()> {
        debug_assert!(valid_size <= data.len());
        debug_assert_eq!(data.len() % self.zbd.block_size() as usize, 0);

        let is_wal = self.is_wal();
        let mut inner = self.lock_inner()?;
        let lifetime = inner.lifetime;

        if inner.active_zone.is_none() {
            let zone = self.zbd.allocate_zone(lifetime, is_wal, None)?;
            inner.extent_start = zone.wp();
            inner.extent_filepos = inner.file_size;
            inner.active_zone = Some(zone);
        }

        let mut off = 0usize;
        while off < data.len() {
            let zone = inner
                .active_zone
                .clone()
                .ok_or_else(|| ZbdError::io("append lost its active zone"))?;

            if zone.capacity_left() == 0 {
                Self::push_extent_locked(&mut inner);
                zone.close_wr()?;
                inner.active_zone = None;
                let next = self.zbd.allocate_zone(lifetime, is_wal, Some(&zone))?;
                inner.extent_start = next.wp();
                inner.extent_filepos = inner.file_size;
                inner.active_zone = Some(next);
                continue;
            }

            let wr_size = (data.len() - off).min(zone.capacity_left() as usize);
            zone.append(&data[off..off + wr_size])?;
            inner.file_size += wr_size as u64;
            off += wr_size;
        }

        inner.file_size -= (data.len() - valid_size) as u64;
        self.zbd.metrics().record_write(data.len() as u64);
        Ok(())
    }

    fn push_extent_locked(inner: &mut FileInner) {
        debug_assert!(inner.file_size >= inner.extent_filepos);

        let Some(zone) = inner.active_zone.clone() else {
            return;
        };
        let length = inner.file_size - inner.extent_filepos;
        if length == 0 {
            return;
        }

        debug_assert!(length <= zone.wp() - inner.extent_start);
        inner
            .extents
            .push(ZoneExtent::new(inner.extent_start, length as u32, Arc::clone(&zone)));
        zone.add_used(length);
        inner.extent_start = zone.wp();
        inner.extent_filepos = inner.file_size;
    }

    /// Seals the pending extent covering everything appended since the last
    /// push. A no-op when nothing new was appended.
    pub fn push_extent(&self) -> ZbdResult<()> {
        let mut inner = self.lock_inner()?;
        Self::push_extent_locked(&mut inner);
        Ok(())
    }

    fn find_extent(extents: &[ZoneExtent], mut file_offset: u64) -> Option<(usize, u64)> {
        for (i, e) in extents.iter().enumerate() {
            if file_offset < e.length() as u64 {
                return Some((i, e.start() + file_offset));
            }
            file_offset -= e.length() as u64;
        }
        None
    }

    /// Reads up to `scratch.len()` bytes starting at `offset`, crossing
    /// extent boundaries as needed. Requests at or past the end of file
    /// return zero bytes; reads reaching into not-yet-synced data return
    /// the partial count.
    ///
    /// `direct` routes block-aligned chunks through the `O_DIRECT`
    /// descriptor; unaligned tails fall back to the buffered one.
    pub fn positioned_read(
        &self,
        offset: u64,
        scratch: &mut [u8],
        direct: bool,
    ) -> ZbdResult<usize> {
        let (file_size, extents) = {
            let inner = self.lock_inner()?;
            (inner.file_size, inner.extents.clone())
        };

        if offset >= file_size {
            return Ok(0);
        }
        let n = scratch.len().min((file_size - offset) as usize);

        let Some((mut idx, mut r_off)) = Self::find_extent(&extents, offset) else {
            // Read starts beyond the synced extents.
            return Ok(0);
        };
        let mut extent_end = extents[idx].start() + extents[idx].length() as u64;

        let backend = self.zbd.backend();
        let block_size = self.zbd.block_size() as usize;
        let mut read = 0usize;

        while read != n {
            let mut pread_sz = n - read;
            if r_off + pread_sz as u64 > extent_end {
                pread_sz = (extent_end - r_off) as usize;
            }

            // Unaligned extent tails cannot go through the direct
            // descriptor.
            let aligned = pread_sz % block_size == 0;
            let r = backend.pread(&mut scratch[read..read + pread_sz], r_off, direct && aligned)?;
            if r == 0 {
                break;
            }
            read += r;
            r_off += r as u64;

            if read != n && r_off == extent_end {
                idx += 1;
                if idx >= extents.len() {
                    // Read reaches beyond the synced file data.
                    break;
                }
                r_off = extents[idx].start();
                extent_end = r_off + extents[idx].length() as u64;
            }
        }

        self.zbd.metrics().record_read(read as u64);
        Ok(read)
    }

    fn encode_locked(&self, inner: &FileInner, out: &mut Vec<u8>, extent_start: usize) {
        put_fixed32(out, TAG_FILE_ID);
        put_fixed64(out, self.id());

        put_fixed32(out, TAG_FILE_NAME);
        put_length_prefixed_slice(out, inner.filename.as_bytes());

        put_fixed32(out, TAG_FILE_SIZE);
        put_fixed64(out, inner.file_size);

        put_fixed32(out, TAG_WRITE_LIFETIME_HINT);
        put_fixed32(out, inner.lifetime.as_u32());

        for e in inner.extents.iter().skip(extent_start) {
            let mut extent_buf = Vec::with_capacity(EXTENT_ENCODED_LEN);
            e.encode_to(&mut extent_buf);
            put_fixed32(out, TAG_EXTENT);
            put_length_prefixed_slice(out, &extent_buf);
        }

        put_fixed32(out, TAG_MODIFICATION_TIME);
        put_fixed64(out, inner.m_time);
        // The active zone and pending-extent markers are not encoded:
        // files are read-only after mount.
    }

    /// Encodes the metadata record, emitting only extents with index
    /// `>= extent_start` so updates can be logged incrementally.
    pub fn encode_to(&self, out: &mut Vec<u8>, extent_start: usize) -> ZbdResult<()> {
        let inner = self.lock_inner()?;
        self.encode_locked(&inner, out, extent_start);
        Ok(())
    }

    /// Encodes an incremental update covering everything since the last
    /// one, then marks those extents synced.
    pub fn encode_update(&self, out: &mut Vec<u8>) -> ZbdResult<()> {
        let mut inner = self.lock_inner()?;
        let start = inner.nr_synced_extents;
        self.encode_locked(&inner, out, start);
        inner.nr_synced_extents = inner.extents.len();
        Ok(())
    }

    /// Marks every current extent as covered by persisted metadata.
    pub fn metadata_synced(&self) -> ZbdResult<()> {
        let mut inner = self.lock_inner()?;
        inner.nr_synced_extents = inner.extents.len();
        Ok(())
    }

    /// Decodes a metadata record into this file. The file-id tag must come
    /// first; every extent is resolved against the device and its length
    /// added to the owning zone's live accounting.
    pub fn decode_from(&self, input: &mut &[u8]) -> ZbdResult<()> {
        let mut inner = self.lock_inner()?;

        match get_fixed32(input) {
            Some(TAG_FILE_ID) => {}
            _ => return Err(ZbdError::corruption("zone file", "file id missing")),
        }
        let id = get_fixed64(input)
            .ok_or_else(|| ZbdError::corruption("zone file", "file id missing"))?;
        self.file_id.store(id, Ordering::Release);

        while let Some(tag) = get_fixed32(input) {
            match tag {
                TAG_FILE_NAME => {
                    let raw = get_length_prefixed_slice(input)
                        .ok_or_else(|| ZbdError::corruption("zone file", "filename missing"))?;
                    let name = String::from_utf8(raw.to_vec()).map_err(|_| {
                        ZbdError::corruption("zone file", "filename is not valid utf-8")
                    })?;
                    if name.is_empty() {
                        return Err(ZbdError::corruption("zone file", "zero length filename"));
                    }
                    inner.filename = name;
                }
                TAG_FILE_SIZE => {
                    inner.file_size = get_fixed64(input)
                        .ok_or_else(|| ZbdError::corruption("zone file", "missing file size"))?;
                }
                TAG_WRITE_LIFETIME_HINT => {
                    let raw = get_fixed32(input).ok_or_else(|| {
                        ZbdError::corruption("zone file", "missing lifetime hint")
                    })?;
                    inner.lifetime = WriteLifetimeHint::from_u32(raw).ok_or_else(|| {
                        ZbdError::corruption("zone file", "invalid lifetime hint")
                    })?;
                }
                TAG_EXTENT => {
                    let raw = get_length_prefixed_slice(input)
                        .ok_or_else(|| ZbdError::corruption("zone file", "extent missing"))?;
                    let (start, length) = ZoneExtent::decode_raw(raw)?;
                    let zone = self.zbd.get_io_zone(start).ok_or_else(|| {
                        ZbdError::corruption("zone file", "invalid zone extent")
                    })?;
                    zone.add_used(length as u64);
                    inner.extents.push(ZoneExtent::new(start, length, zone));
                }
                TAG_MODIFICATION_TIME => {
                    inner.m_time = get_fixed64(input).ok_or_else(|| {
                        ZbdError::corruption("zone file", "missing modification time")
                    })?;
                }
                _ => return Err(ZbdError::corruption("zone file", "unexpected tag")),
            }
        }

        inner.nr_synced_extents = inner.extents.len();
        Ok(())
    }

    /// Folds a decoded update record into this file: identity fields are
    /// adopted and the update's extents are appended as fresh copies.
    pub fn merge_update(&self, update: &Arc<ZoneFile>) -> ZbdResult<()> {
        if self.id() != update.id() {
            return Err(ZbdError::corruption("zone file update", "id mismatch"));
        }

        let (name, size, hint, mtime, extents) = {
            let u = update.lock_inner()?;
            (
                u.filename.clone(),
                u.file_size,
                u.lifetime,
                u.m_time,
                u.extents.clone(),
            )
        };

        let mut inner = self.lock_inner()?;
        inner.filename = name;
        inner.file_size = size;
        inner.lifetime = hint;
        inner.m_time = mtime;
        for e in extents {
            e.zone().add_used(e.length() as u64);
            inner.extents.push(e);
        }
        inner.nr_synced_extents = inner.extents.len();
        Ok(())
    }

    /// Writes a varint-encoded `(device, inode, file id)` triple into
    /// `out`. Returns the encoded length, or 0 when `out` is too small or
    /// the device identity is unavailable.
    pub fn unique_id(&self, out: &mut [u8]) -> usize {
        if out.len() < MAX_VARINT64_LEN * 3 {
            return 0;
        }
        let Ok((dev, ino)) = self.zbd.backend().device_id() else {
            return 0;
        };
        let mut buf = Vec::with_capacity(MAX_VARINT64_LEN * 3);
        put_varint64(&mut buf, dev);
        put_varint64(&mut buf, ino);
        put_varint64(&mut buf, self.id());
        out[..buf.len()].copy_from_slice(&buf);
        buf.len()
    }

    /// Updates one extent in place after garbage collection moved its
    /// bytes. Returns false when the extent no longer matches the recorded
    /// position.
    pub(crate) fn relocate_extent(
        &self,
        idx: usize,
        expected_start: u64,
        new_start: u64,
        new_zone: Arc<Zone>,
    ) -> ZbdResult<bool> {
        let mut inner = self.lock_inner()?;
        match inner.extents.get_mut(idx) {
            Some(e) if e.start() == expected_start => {
                e.relocate(new_start, new_zone);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Drop for ZoneFile {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            for e in &inner.extents {
                e.zone().sub_used(e.length() as u64);
            }
            if let Some(zone) = inner.active_zone.take() {
                if zone.open_for_write() {
                    if let Err(e) = zone.close_wr() {
                        warn!(error = %e, "failed to close zone while dropping file");
                    }
                }
            }
        }
    }
}

/// The live file registry shared between writers and the garbage
/// collector.
#[derive(Default)]
pub struct FileTable {
    files: Mutex<HashMap<String, Arc<ZoneFile>>>,
}

impl FileTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ZbdResult<MutexGuard<'_, HashMap<String, Arc<ZoneFile>>>> {
        self.files
            .lock()
            .map_err(|_| ZbdError::io("file table lock poisoned"))
    }

    /// Registers a file under its current name, replacing any previous
    /// entry.
    pub fn insert(&self, file: Arc<ZoneFile>) -> ZbdResult<()> {
        let name = file.filename();
        self.lock()?.insert(name, file);
        Ok(())
    }

    /// Removes and returns the file registered under `name`.
    pub fn remove(&self, name: &str) -> ZbdResult<Option<Arc<ZoneFile>>> {
        Ok(self.lock()?.remove(name))
    }

    /// Looks up a file by name.
    pub fn get(&self, name: &str) -> ZbdResult<Option<Arc<ZoneFile>>> {
        Ok(self.lock()?.get(name).cloned())
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> ZbdResult<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// True when no files are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` with the table locked, for enumeration.
    pub fn with_files<R>(
        &self,
        f: impl FnOnce(&HashMap<String, Arc<ZoneFile>>) -> R,
    ) -> ZbdResult<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemBackendConfig, ZoneBackend};
    use crate::device::ZbdConfig;

    fn open_device(zone_capacity: u64) -> Arc<ZonedBlockDevice> {
        let backend: Arc<dyn ZoneBackend> = Arc::new(MemBackend::new(MemBackendConfig {
            nr_zones: 40,
            zone_size: 65536,
            zone_capacity,
            block_size: 4096,
            max_active_zones: 8,
            readonly: false,
        }));
        ZonedBlockDevice::open(backend, ZbdConfig::default()).unwrap()
    }

    #[test]
    fn test_append_and_read_single_zone() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "000001.sst", 1);
        file.set_lifetime(WriteLifetimeHint::Medium).unwrap();

        let mut data = vec![0xa5u8; 4096];
        data.extend_from_slice(&[0x5a; 4096]);
        file.append(&data, 8192).unwrap();
        file.push_extent().unwrap();

        assert_eq!(file.file_size(), 8192);
        let extents = file.extents();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length(), 8192);
        assert_eq!(extents[0].zone().used_capacity(), 8192);

        let mut buf = vec![0u8; 8192];
        assert_eq!(file.positioned_read(0, &mut buf, false).unwrap(), 8192);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_valid_size_excludes_padding() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "000002.log", 2);

        // 5000 meaningful bytes padded to two blocks.
        let mut data = vec![7u8; 5000];
        data.resize(8192, 0);
        file.append(&data, 5000).unwrap();
        file.push_extent().unwrap();

        assert_eq!(file.file_size(), 5000);
        let extents = file.extents();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length(), 5000);

        let mut buf = vec![0u8; 5000];
        assert_eq!(file.positioned_read(0, &mut buf, false).unwrap(), 5000);
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_append_rolls_over_zones() {
        let zbd = open_device(8192);
        let file = ZoneFile::new(Arc::clone(&zbd), "000003.sst", 3);

        file.append(&vec![9u8; 12288], 12288).unwrap();
        file.push_extent().unwrap();

        let extents = file.extents();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].length(), 8192);
        assert_eq!(extents[1].length(), 4096);
        assert!(extents[0].zone().is_full());
        assert!(!Arc::ptr_eq(extents[0].zone(), extents[1].zone()));

        let mut buf = vec![0u8; 12288];
        assert_eq!(file.positioned_read(0, &mut buf, false).unwrap(), 12288);
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_push_extent_is_idempotent() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "000004.sst", 4);
        file.append(&[1u8; 4096], 4096).unwrap();
        file.push_extent().unwrap();
        file.push_extent().unwrap();
        assert_eq!(file.extents().len(), 1);
        assert_eq!(file.extents()[0].zone().used_capacity(), 4096);
    }

    #[test]
    fn test_read_past_eof_returns_empty() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "000005.sst", 5);
        file.append(&[1u8; 4096], 4096).unwrap();
        file.push_extent().unwrap();

        let mut buf = vec![0u8; 4096];
        assert_eq!(file.positioned_read(4096, &mut buf, false).unwrap(), 0);
        assert_eq!(file.positioned_read(8192, &mut buf, false).unwrap(), 0);
        // A read clamped by file size returns the remainder.
        assert_eq!(file.positioned_read(2048, &mut buf, false).unwrap(), 2048);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let zbd = open_device(8192);
        let file = ZoneFile::new(Arc::clone(&zbd), "000123.sst", 42);
        file.set_lifetime(WriteLifetimeHint::Long).unwrap();
        file.set_mtime(1_700_000_000).unwrap();
        file.append(&vec![3u8; 20480], 20480).unwrap();
        file.push_extent().unwrap();
        file.close_wr().unwrap();

        let mut buf = Vec::new();
        file.encode_to(&mut buf, 0).unwrap();

        let decoded = ZoneFile::new(Arc::clone(&zbd), "placeholder", 0);
        let mut input = buf.as_slice();
        decoded.decode_from(&mut input).unwrap();

        assert_eq!(decoded.id(), 42);
        assert_eq!(decoded.filename(), "000123.sst");
        assert_eq!(decoded.file_size(), 20480);
        assert_eq!(decoded.lifetime(), WriteLifetimeHint::Long);
        assert_eq!(decoded.mtime(), 1_700_000_000);

        let a = file.extents();
        let b = decoded.extents();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.start(), y.start());
            assert_eq!(x.length(), y.length());
            assert!(Arc::ptr_eq(x.zone(), y.zone()));
        }
        assert_eq!(decoded.nr_synced_extents(), 3);
    }

    #[test]
    fn test_decode_rejects_corrupt_records() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "a", 7);
        file.append(&[1u8; 4096], 4096).unwrap();
        file.push_extent().unwrap();

        // Missing file-id tag.
        let fresh = ZoneFile::new(Arc::clone(&zbd), "", 0);
        let mut bad = Vec::new();
        put_fixed32(&mut bad, TAG_FILE_SIZE);
        put_fixed64(&mut bad, 10);
        assert!(fresh.decode_from(&mut bad.as_slice()).is_err());

        // Unknown tag.
        let mut buf = Vec::new();
        file.encode_to(&mut buf, 0).unwrap();
        let mut bad = buf.clone();
        put_fixed32(&mut bad, 99);
        let fresh = ZoneFile::new(Arc::clone(&zbd), "", 0);
        assert!(fresh.decode_from(&mut bad.as_slice()).is_err());

        // Zero-length filename.
        let mut bad = Vec::new();
        put_fixed32(&mut bad, TAG_FILE_ID);
        put_fixed64(&mut bad, 1);
        put_fixed32(&mut bad, TAG_FILE_NAME);
        put_length_prefixed_slice(&mut bad, b"");
        let fresh = ZoneFile::new(Arc::clone(&zbd), "", 0);
        assert!(fresh.decode_from(&mut bad.as_slice()).is_err());

        // Extent pointing outside every data zone.
        let mut bad = Vec::new();
        put_fixed32(&mut bad, TAG_FILE_ID);
        put_fixed64(&mut bad, 1);
        put_fixed32(&mut bad, TAG_EXTENT);
        let mut ext = Vec::new();
        put_fixed64(&mut ext, u64::MAX - 4096);
        put_fixed32(&mut ext, 4096);
        put_length_prefixed_slice(&mut bad, &ext);
        let fresh = ZoneFile::new(Arc::clone(&zbd), "", 0);
        assert!(fresh.decode_from(&mut bad.as_slice()).is_err());
    }

    #[test]
    fn test_merge_update_adopts_fields_and_extents() {
        let zbd = open_device(32768);
        let base = ZoneFile::new(Arc::clone(&zbd), "old-name", 9);

        let update = ZoneFile::new(Arc::clone(&zbd), "new-name", 9);
        update.set_lifetime(WriteLifetimeHint::Short).unwrap();
        update.set_mtime(77).unwrap();
        update.append(&[2u8; 4096], 4096).unwrap();
        update.push_extent().unwrap();
        let zone = Arc::clone(update.extents()[0].zone());
        assert_eq!(zone.used_capacity(), 4096);

        base.merge_update(&update).unwrap();
        assert_eq!(base.filename(), "new-name");
        assert_eq!(base.file_size(), 4096);
        assert_eq!(base.lifetime(), WriteLifetimeHint::Short);
        assert_eq!(base.mtime(), 77);
        assert_eq!(base.extents().len(), 1);
        // Both the update's and the merged copy's extents are accounted.
        assert_eq!(zone.used_capacity(), 8192);

        let other = ZoneFile::new(Arc::clone(&zbd), "x", 10);
        assert!(base.merge_update(&other).is_err());
    }

    #[test]
    fn test_unique_id_requires_room() {
        let zbd = open_device(32768);
        let file = ZoneFile::new(Arc::clone(&zbd), "f", 0x1234);
        let mut small = [0u8; 29];
        assert_eq!(file.unique_id(&mut small), 0);
        let mut big = [0u8; 32];
        let n = file.unique_id(&mut big);
        assert!(n > 0 && n <= 30);
    }

    #[test]
    fn test_drop_releases_used_capacity() {
        let zbd = open_device(32768);
        let zone;
        {
            let file = ZoneFile::new(Arc::clone(&zbd), "tmp", 11);
            file.append(&[1u8; 8192], 8192).unwrap();
            file.push_extent().unwrap();
            zone = Arc::clone(file.extents()[0].zone());
            assert_eq!(zone.used_capacity(), 8192);
        }
        assert_eq!(zone.used_capacity(), 0);
        assert!(!zone.open_for_write());
    }

    #[test]
    fn test_file_table_operations() {
        let zbd = open_device(32768);
        let table = FileTable::new();
        let file = ZoneFile::new(Arc::clone(&zbd), "000010.sst", 10);
        table.insert(Arc::clone(&file)).unwrap();

        assert!(table.contains("000010.sst").unwrap());
        assert_eq!(table.len(), 1);
        assert!(table.get("000010.sst").unwrap().is_some());

        let names =
            table.with_files(|m| m.keys().cloned().collect::<Vec<_>>()).unwrap();
        assert_eq!(names, vec!["000010.sst".to_string()]);

        assert!(table.remove("000010.sst").unwrap().is_some());
        assert!(table.is_empty());
    }
}
