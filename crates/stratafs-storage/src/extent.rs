//! File extents: contiguous device byte ranges owned by one file.

use std::sync::Arc;

use crate::coding::{get_fixed32, get_fixed64, put_fixed32, put_fixed64};
use crate::error::{ZbdError, ZbdResult};
use crate::zone::Zone;

/// Encoded size of an extent: `u64` start plus `u32` length, little-endian.
pub const EXTENT_ENCODED_LEN: usize = 12;

/// A contiguous device byte range belonging to one file, pinned to the zone
/// that stores it.
#[derive(Debug, Clone)]
pub struct ZoneExtent {
    start: u64,
    length: u32,
    zone: Arc<Zone>,
}

impl ZoneExtent {
    /// Creates an extent covering `length` bytes at device offset `start`.
    pub fn new(start: u64, length: u32, zone: Arc<Zone>) -> Self {
        Self {
            start,
            length,
            zone,
        }
    }

    /// Device offset of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Extent length in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// The zone storing this extent.
    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    pub(crate) fn relocate(&mut self, new_start: u64, new_zone: Arc<Zone>) {
        self.start = new_start;
        self.zone = new_zone;
    }

    /// Appends the 12-byte wire encoding.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        put_fixed64(out, self.start);
        put_fixed32(out, self.length);
    }

    /// Decodes the `(start, length)` pair from exactly 12 bytes. The zone is
    /// resolved separately against the device.
    pub fn decode_raw(input: &[u8]) -> ZbdResult<(u64, u32)> {
        if input.len() != EXTENT_ENCODED_LEN {
            return Err(ZbdError::corruption("zone extent", "length mismatch"));
        }
        let mut input = input;
        let start = get_fixed64(&mut input)
            .ok_or_else(|| ZbdError::corruption("zone extent", "missing start"))?;
        let length = get_fixed32(&mut input)
            .ok_or_else(|| ZbdError::corruption("zone extent", "missing length"))?;
        Ok((start, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemBackendConfig, ZoneBackend};
    use std::time::Duration;

    fn test_zone() -> Arc<Zone> {
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(MemBackend::new(MemBackendConfig::default()));
        let raw = backend.report_zone(0).unwrap();
        Arc::new(Zone::new(backend, &raw, Duration::from_secs(1)))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let extent = ZoneExtent::new(0x1234_5678_9abc, 8192, test_zone());
        let mut buf = Vec::new();
        extent.encode_to(&mut buf);
        assert_eq!(buf.len(), EXTENT_ENCODED_LEN);

        let (start, length) = ZoneExtent::decode_raw(&buf).unwrap();
        assert_eq!(start, 0x1234_5678_9abc);
        assert_eq!(length, 8192);
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let extent = ZoneExtent::new(0x0102_0304, 0x0a0b, test_zone());
        let mut buf = Vec::new();
        extent.encode_to(&mut buf);
        assert_eq!(&buf[..8], &0x0102_0304u64.to_le_bytes());
        assert_eq!(&buf[8..], &0x0a0bu32.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(ZoneExtent::decode_raw(&[0u8; 11]).is_err());
        assert!(ZoneExtent::decode_raw(&[0u8; 13]).is_err());
        assert!(ZoneExtent::decode_raw(&[]).is_err());
    }
}
