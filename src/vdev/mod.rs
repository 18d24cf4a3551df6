//! This module provides the block I/O adapter both engines are built on:
//! raw block-granular reads and writes against a backing device, plus
//! per-device request statistics.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Internal block size (4KiB)
pub const BLOCK_SIZE: usize = 4096;

/// Provides statistics about (failed) requests performed by vdevs.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    /// The total number of blocks of issued read requests
    pub read: Block<u64>,
    /// The total number of blocks of issued write requests
    pub written: Block<u64>,
    /// The total number of blocks of failed read requests
    pub failed_reads: Block<u64>,
    /// The total number of blocks of failed write requests
    pub failed_writes: Block<u64>,
}

#[derive(Default)]
pub(crate) struct AtomicStatistics {
    pub(crate) read: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) failed_reads: AtomicU64,
    pub(crate) failed_writes: AtomicU64,
}

impl AtomicStatistics {
    pub(crate) fn as_stats(&self) -> Statistics {
        Statistics {
            read: Block(self.read.load(Ordering::Relaxed)),
            written: Block(self.written.load(Ordering::Relaxed)),
            failed_reads: Block(self.failed_reads.load(Ordering::Relaxed)),
            failed_writes: Block(self.failed_writes.load(Ordering::Relaxed)),
        }
    }
}

/// Trait for reading blocks of data.
#[async_trait]
pub trait VdevRead: Send + Sync {
    /// Reads `size` blocks at `offset`. The data is returned as-is; callers
    /// that carry checksum trailers verify them on their own layer.
    async fn read_raw(&self, size: Block<u32>, offset: Block<u64>) -> Result<Box<[u8]>, Error>;
}

/// Trait for writing blocks of data.
#[async_trait]
pub trait VdevWrite: Send + Sync {
    /// Writes the `data` at `offset`.
    ///
    /// Note: `data.as_ref().len()` must be a multiple of `BLOCK_SIZE`.
    async fn write_raw<W: AsRef<[u8]> + Send + 'static>(
        &self,
        data: W,
        offset: Block<u64>,
    ) -> Result<(), Error>;

    /// Flushes pending data (in caches) to disk.
    fn flush(&self) -> Result<(), Error>;
}

/// Trait for general information about a vdev.
pub trait Vdev: Send + Sync {
    /// Returns the total size of this vdev.
    fn size(&self) -> Block<u64>;

    /// Returns the (unique) ID of this vdev.
    fn id(&self) -> &str;

    /// Returns statistics about this vdev.
    fn stats(&self) -> Statistics;
}


mod block;
pub use self::block::Block;

mod errors;
pub use self::errors::{Error, ErrorKind};

mod file;
pub use self::file::File;
