//! Garbage collection: relocating live extents out of full zones so the
//! zones can be reset.
//!
//! A worker instance runs one collection pass over the file table. The
//! phases are ordered for crash safety: until the relocated metadata is
//! re-persisted, the old records keep referencing the old zones, so a
//! crash between relocation and resync loses nothing. Source zones are
//! only reset after the resync completes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::aligned::AlignedBuf;
use crate::backend::ZoneBackend;
use crate::device::ZonedBlockDevice;
use crate::error::{ZbdError, ZbdResult};
use crate::file::{FileTable, MetadataSync, ZoneFile};
use crate::zone::Zone;

struct GcExtent {
    file: Arc<ZoneFile>,
    index: usize,
    start: u64,
    length: u32,
    zone: Arc<Zone>,
}

/// One garbage-collection pass.
pub struct GcWorker {
    zbd: Arc<ZonedBlockDevice>,
    files: Arc<FileTable>,
    dst_zones: Vec<Arc<Zone>>,
    zone_residue: HashMap<u64, (Arc<Zone>, u64)>,
    total_residue: u64,
    extent_list: Vec<GcExtent>,
    files_to_resync: Vec<Arc<ZoneFile>>,
}

impl GcWorker {
    /// Creates a pass over `files`, relocating into the caller-supplied
    /// destination zones.
    pub fn new(
        zbd: Arc<ZonedBlockDevice>,
        files: Arc<FileTable>,
        dst_zones: Vec<Arc<Zone>>,
    ) -> Self {
        Self {
            zbd,
            files,
            dst_zones,
            zone_residue: HashMap::new(),
            total_residue: 0,
            extent_list: Vec::new(),
            files_to_resync: Vec::new(),
        }
    }

    /// Live bytes found in full zones by the scan.
    pub fn total_residue(&self) -> u64 {
        self.total_residue
    }

    /// Live bytes the scan attributed to the zone starting at `start`.
    pub fn residue_for(&self, start: u64) -> u64 {
        self.zone_residue.get(&start).map(|(_, r)| *r).unwrap_or(0)
    }

    /// The source zones holding residue.
    pub fn source_zones(&self) -> Vec<Arc<Zone>> {
        self.zone_residue.values().map(|(z, _)| Arc::clone(z)).collect()
    }

    /// Phase 1: under the file-table lock, credit every extent living in a
    /// full zone. A file stops contributing at its first extent in a
    /// non-full zone, since everything after it is still being written
    /// near the head.
    pub fn scan(&mut self) -> ZbdResult<()> {
        let files = Arc::clone(&self.files);
        files.with_files(|map| {
            for file in map.values() {
                let extents = file.extents();
                let mut contributed = false;
                for (i, e) in extents.iter().enumerate() {
                    if !e.zone().is_full() {
                        break;
                    }
                    let entry = self
                        .zone_residue
                        .entry(e.zone().start())
                        .or_insert_with(|| (Arc::clone(e.zone()), 0));
                    entry.1 += e.length() as u64;
                    self.total_residue += e.length() as u64;
                    self.extent_list.push(GcExtent {
                        file: Arc::clone(file),
                        index: i,
                        start: e.start(),
                        length: e.length(),
                        zone: Arc::clone(e.zone()),
                    });
                    contributed = true;
                }
                if contributed {
                    self.files_to_resync.push(Arc::clone(file));
                }
            }
        })?;
        debug!(
            extents = self.extent_list.len(),
            residue = self.total_residue,
            sources = self.zone_residue.len(),
            "gc scan complete"
        );
        Ok(())
    }

    fn read_extent(
        backend: &Arc<dyn ZoneBackend>,
        buf: &mut [u8],
        start: u64,
        zone: &Arc<Zone>,
    ) -> ZbdResult<()> {
        if start >= zone.wp() {
            return Err(ZbdError::io("extent beyond source zone write pointer"));
        }
        if start + buf.len() as u64 > zone.start() + zone.max_capacity() {
            return Err(ZbdError::io("read across zone"));
        }

        let mut read = 0usize;
        let mut pos = start;
        while read < buf.len() {
            let r = backend.pread(&mut buf[read..], pos, false)?;
            if r == 0 {
                return Err(ZbdError::io("short read from source zone"));
            }
            read += r;
            pos += r as u64;
        }
        Ok(())
    }

    /// Phase 2: move extents, longest first, into the destination zones.
    ///
    /// On a destination running out of room the already-read bytes are kept
    /// and the cursor advances to the next destination; once the list is
    /// exhausted the pass stops with `NoSpace`. Each successful move
    /// transfers the extent's live accounting from source to destination.
    pub fn relocate(&mut self) -> ZbdResult<()> {
        if self.extent_list.is_empty() {
            return Ok(());
        }

        self.extent_list.sort_by(|a, b| b.length.cmp(&a.length));

        let block_size = self.zbd.block_size() as usize;
        let max_len = self.extent_list[0].length as usize;
        let mut scratch = AlignedBuf::new(max_len.next_multiple_of(block_size))?;

        let mut dst_idx = 0usize;
        let mut have_data = false;
        let mut i = 0usize;

        while i < self.extent_list.len() {
            let ext = &self.extent_list[i];
            let dst = self
                .dst_zones
                .get(dst_idx)
                .ok_or_else(|| ZbdError::no_space("destination zones exhausted"))?;

            let len = ext.length as usize;
            let padded = len.next_multiple_of(block_size);

            if !have_data {
                Self::read_extent(
                    self.zbd.backend(),
                    &mut scratch.as_mut_slice()[..len],
                    ext.start,
                    &ext.zone,
                )?;
                scratch.as_mut_slice()[len..padded].fill(0);
            }

            let new_start = dst.wp();
            match dst.append(&scratch.as_slice()[..padded]) {
                Ok(()) => {
                    let moved = ext.file.relocate_extent(
                        ext.index,
                        ext.start,
                        new_start,
                        Arc::clone(dst),
                    )?;
                    if moved {
                        ext.zone.sub_used(len as u64);
                        dst.add_used(len as u64);
                    } else {
                        warn!(
                            start = ext.start,
                            "extent changed during relocation; skipping accounting transfer"
                        );
                    }
                    i += 1;
                    scratch.clear();
                    have_data = false;
                }
                Err(e) if e.is_no_space() => {
                    // The bytes are already in the scratch buffer; try the
                    // next destination without re-reading.
                    have_data = true;
                    dst_idx += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Phase 3: re-persist every file whose extents moved. Files deleted in
    /// the meantime already synced their removal and are skipped.
    pub fn resync_metadata(&self, meta: &dyn MetadataSync) -> ZbdResult<()> {
        for file in &self.files_to_resync {
            if !self.files.contains(&file.filename())? {
                continue;
            }
            meta.sync_file_metadata(file)?;
        }
        Ok(())
    }

    /// Phase 4: reset every fully-relocated source zone.
    pub fn reset_source_zones(&self) -> ZbdResult<()> {
        for (zone, _) in self.zone_residue.values() {
            if zone.is_used() {
                warn!(
                    zone = zone.zone_nr(),
                    used = zone.used_capacity(),
                    "skipping reset of source zone still referenced"
                );
                continue;
            }
            if let Err(e) = zone.reset() {
                warn!(zone = zone.zone_nr(), error = %e, "failed resetting source zone");
            }
        }
        Ok(())
    }

    /// Runs all phases in order. Metadata resync completes before any
    /// source zone is reset.
    pub fn run(&mut self, meta: &dyn MetadataSync) -> ZbdResult<()> {
        self.scan()?;
        if self.extent_list.is_empty() {
            return Ok(());
        }
        self.relocate()?;
        self.resync_metadata(meta)?;
        self.reset_source_zones()?;
        info!(
            relocated = self.extent_list.len(),
            bytes = self.total_residue,
            "gc pass complete"
        );
        Ok(())
    }
}
