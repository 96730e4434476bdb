//! Sequential and random-access read adapters over a zone file.

use std::sync::Arc;

use crate::error::{ZbdError, ZbdResult};
use crate::file::ZoneFile;

/// Cursor-based sequential reader.
pub struct ZonedSequentialFile {
    file: Arc<ZoneFile>,
    rp: u64,
    direct: bool,
}

impl ZonedSequentialFile {
    /// Opens a sequential reader at offset zero. `direct` routes aligned
    /// reads through the `O_DIRECT` descriptor.
    pub fn new(file: Arc<ZoneFile>, direct: bool) -> Self {
        Self {
            file,
            rp: 0,
            direct,
        }
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.rp
    }

    /// Reads up to `scratch.len()` bytes at the cursor and advances it by
    /// the bytes actually read.
    pub fn read(&mut self, scratch: &mut [u8]) -> ZbdResult<usize> {
        let n = self.file.positioned_read(self.rp, scratch, self.direct)?;
        self.rp += n as u64;
        Ok(n)
    }

    /// Advances the cursor without reading. Skipping to or past the end of
    /// file is rejected.
    pub fn skip(&mut self, n: u64) -> ZbdResult<()> {
        if self.rp + n >= self.file.file_size() {
            return Err(ZbdError::invalid("skip beyond end of file"));
        }
        self.rp += n;
        Ok(())
    }

    /// Reads at an absolute offset without moving the cursor.
    pub fn positioned_read(&self, offset: u64, scratch: &mut [u8]) -> ZbdResult<usize> {
        self.file.positioned_read(offset, scratch, self.direct)
    }
}

/// Stateless positioned reader.
pub struct ZonedRandomAccessFile {
    file: Arc<ZoneFile>,
    direct: bool,
}

impl ZonedRandomAccessFile {
    /// Opens a random-access reader.
    pub fn new(file: Arc<ZoneFile>, direct: bool) -> Self {
        Self { file, direct }
    }

    /// Reads up to `scratch.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, scratch: &mut [u8]) -> ZbdResult<usize> {
        self.file.positioned_read(offset, scratch, self.direct)
    }

    /// Writes the file's unique id into `out`; see
    /// [`ZoneFile::unique_id`].
    pub fn unique_id(&self, out: &mut [u8]) -> usize {
        self.file.unique_id(out)
    }
}
