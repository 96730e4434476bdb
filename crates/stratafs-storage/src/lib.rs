#![warn(missing_docs)]

//! stratafs-storage: the zoned-block-device storage core.
//!
//! Exposes an append-oriented zoned block device as a flat file store for a
//! log-structured key-value engine. Zones are partitioned into op-log,
//! snapshot and data pools; data zones are handed to writers under the
//! device's active-zone budget with WAL-preferential allocation; files are
//! ordered extent lists with incremental metadata records; full zones are
//! reclaimed by relocating their live extents.

pub mod aligned;
pub mod backend;
#[cfg(target_os = "linux")]
pub mod blkzoned;
pub mod coding;
pub mod device;
pub mod error;
pub mod extent;
pub mod file;
pub mod gc;
pub mod hint;
pub mod metrics;
pub mod readable;
pub mod worker;
pub mod writable;
pub mod zone;

pub use aligned::AlignedBuf;
pub use backend::{
    AsyncZoneWriter, DeviceInfo, DeviceModel, MemBackend, MemBackendConfig, RawZone, ZoneBackend,
    ZoneCondition, ZoneType,
};
#[cfg(target_os = "linux")]
pub use blkzoned::BlkZonedBackend;
pub use device::{ZbdConfig, ZonedBlockDevice, MIN_ZONES, OP_LOG_ZONES, SNAPSHOT_ZONES};
pub use error::{ZbdError, ZbdResult};
pub use extent::{ZoneExtent, EXTENT_ENCODED_LEN};
pub use file::{FileTable, MetadataSync, MetadataWriter, ZoneFile};
pub use gc::GcWorker;
pub use hint::{lifetime_diff, WriteLifetimeHint};
pub use metrics::{MetricsSnapshot, ZbdMetrics};
pub use readable::{ZonedRandomAccessFile, ZonedSequentialFile};
pub use worker::{BackgroundWorker, WorkerState};
pub use writable::ZonedWritableFile;
pub use zone::{Zone, ZoneSnapshot};
