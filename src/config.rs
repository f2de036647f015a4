//! Tunable constants and the `WriterConfig` knob bundle.

use std::time::Duration;

/// Size of a single buffer pool block.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Maximum header size a single record can occupy (1 lead byte + 4 + 4 + 8).
pub const RECORD_MAX_HEADER_SIZE: usize = 17;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Size of a single buffer pool block, in bytes.
    pub block_size: usize,
    /// Maximum number of outgoing (filled, unflushed) blocks.
    pub max_outgoing: usize,
    /// Maximum number of blocks kept in the recycle (free) pool.
    pub max_free: usize,
    /// Minimum free disk space, in bytes, below which the flusher stops
    /// writing and latches `paused`.
    pub min_free_space: u64,
    /// How often (in flushes) the flusher re-samples available disk space.
    pub free_space_resample_every: u32,
    /// How many randomized filenames to try before giving up on opening
    /// the log file.
    pub filename_retries: u32,
    /// Flush period: how long the flusher waits between periodic flushes.
    pub period: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_outgoing: (1024 * 1024) / BLOCK_SIZE,
            max_free: (256 * 1024) / BLOCK_SIZE,
            min_free_space: 5 * 1024 * 1024,
            free_space_resample_every: 10,
            filename_retries: 5,
            period: Duration::from_millis(250),
        }
    }
}

impl WriterConfig {
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_max_outgoing(mut self, max_outgoing: usize) -> Self {
        self.max_outgoing = max_outgoing;
        self
    }

    #[must_use]
    pub fn with_max_free(mut self, max_free: usize) -> Self {
        self.max_free = max_free;
        self
    }

    #[must_use]
    pub fn with_min_free_space(mut self, min_free_space: u64) -> Self {
        self.min_free_space = min_free_space;
        self
    }
}
