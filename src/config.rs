use std::time::Duration;

use crate::binlog::record::{MULTI_HEADER_SIZE, STORE_PART_WITH_TIME_SIZE};
use crate::error::{Error, Result};

/// Hard upper bound for a single stored value. `max_data_size` must stay
/// strictly below this so sizes always fit the 3-byte record field.
pub const DATA_SIZE_LIMIT: u32 = 10 * 1024 * 1024;

/// Hard upper bound for records bundled into one multi-record.
pub const BUNDLED_RECORDS_LIMIT: u32 = 256 * 1024;

/// Configuration for the cache store.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum size of a single value in bytes (default: 8MB).
    pub max_data_size: u32,

    /// Flush a pending remove/access bundle once it reaches this many keys
    /// (default: 16384).
    pub max_bundled_records: u32,

    /// Buffer size for streaming binlog reads (default: 8MB).
    pub read_block_size: usize,

    /// Track estimated access times: enables MultiAccess records and
    /// time-based pruning (default: true).
    pub track_estimated_time: bool,

    /// Entries unused for longer than this many seconds are pruned;
    /// 0 disables time-based pruning (default: 0).
    pub total_time_limit: u32,

    /// Total bytes of stored values before size-based pruning kicks in;
    /// 0 disables it, otherwise it must exceed `max_data_size` (default: 0).
    pub total_size_limit: i64,

    /// Delay between a prune trigger and the prune run (default: 5s).
    pub prune_timeout: Duration,

    /// Upper cap for the scheduled prune check (default: 1h).
    pub max_prune_check_timeout: Duration,

    /// Delay before lazily bundled removes/accesses hit the binlog; also the
    /// window within which write timestamps snap together (default: 15min).
    pub write_bundle_delay: Duration,

    /// Compact once the binlog carries at least this many superseded bytes;
    /// 0 disables compaction (default: 8MB).
    pub compact_after_excess: i64,

    /// When non-zero, additionally require
    /// excess / size >= compact_after_excess / compact_after_full_size
    /// before compacting (default: 0).
    pub compact_after_full_size: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_data_size: 8 * 1024 * 1024,
            max_bundled_records: 16 * 1024,
            read_block_size: 8 * 1024 * 1024,
            track_estimated_time: true,
            total_time_limit: 0,
            total_size_limit: 0,
            prune_timeout: Duration::from_secs(5),
            max_prune_check_timeout: Duration::from_secs(60 * 60),
            write_bundle_delay: Duration::from_secs(15 * 60),
            compact_after_excess: 8 * 1024 * 1024,
            compact_after_full_size: 0,
        }
    }
}

impl Settings {
    pub fn max_data_size(mut self, size: u32) -> Self {
        self.max_data_size = size;
        self
    }

    pub fn max_bundled_records(mut self, count: u32) -> Self {
        self.max_bundled_records = count;
        self
    }

    pub fn read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = size;
        self
    }

    pub fn track_estimated_time(mut self, track: bool) -> Self {
        self.track_estimated_time = track;
        self
    }

    pub fn total_time_limit(mut self, seconds: u32) -> Self {
        self.total_time_limit = seconds;
        self
    }

    pub fn total_size_limit(mut self, bytes: i64) -> Self {
        self.total_size_limit = bytes;
        self
    }

    pub fn prune_timeout(mut self, timeout: Duration) -> Self {
        self.prune_timeout = timeout;
        self
    }

    pub fn max_prune_check_timeout(mut self, timeout: Duration) -> Self {
        self.max_prune_check_timeout = timeout;
        self
    }

    pub fn write_bundle_delay(mut self, delay: Duration) -> Self {
        self.write_bundle_delay = delay;
        self
    }

    pub fn compact_after_excess(mut self, bytes: i64) -> Self {
        self.compact_after_excess = bytes;
        self
    }

    pub fn compact_after_full_size(mut self, bytes: i64) -> Self {
        self.compact_after_full_size = bytes;
        self
    }

    /// Checks the limits the rest of the store relies on.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_data_size == 0 || self.max_data_size >= DATA_SIZE_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_data_size must be in 1..{DATA_SIZE_LIMIT}"
            )));
        }
        if self.max_bundled_records == 0 || self.max_bundled_records >= BUNDLED_RECORDS_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_bundled_records must be in 1..{BUNDLED_RECORDS_LIMIT}"
            )));
        }
        let largest_record = MULTI_HEADER_SIZE
            + self.max_bundled_records as usize * STORE_PART_WITH_TIME_SIZE;
        if self.read_block_size < largest_record {
            return Err(Error::InvalidConfig(format!(
                "read_block_size must hold the largest bundled record ({largest_record} bytes)"
            )));
        }
        if self.total_size_limit != 0 && self.total_size_limit <= i64::from(self.max_data_size) {
            return Err(Error::InvalidConfig(
                "total_size_limit must be zero or exceed max_data_size".into(),
            ));
        }
        Ok(())
    }
}
