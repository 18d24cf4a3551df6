use super::errors::*;
use super::{AtomicStatistics, Block, Statistics, Vdev, VdevRead, VdevWrite};
use async_trait::async_trait;
use libc::{c_ulong, ioctl};
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Leaf vdev that is backed by a file or a block device.
pub struct File {
    inner: Arc<Inner>,
}

struct Inner {
    file: fs::File,
    id: String,
    size: Block<u64>,
    stats: AtomicStatistics,
}

impl File {
    /// Creates a new `File`.
    pub fn new(file: fs::File, id: String) -> Result<Self, io::Error> {
        let file_type = file.metadata()?.file_type();
        let size = if file_type.is_file() {
            Block::from_bytes(file.metadata()?.len())
        } else if file_type.is_block_device() {
            get_block_device_size(&file)?
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Unsupported file type: {:?}", file_type),
            ));
        };
        Ok(File {
            inner: Arc::new(Inner {
                file,
                id,
                size,
                stats: Default::default(),
            }),
        })
    }

    fn check_bounds(&self, blocks: Block<u64>, offset: Block<u64>) -> Result<(), Error> {
        if offset + blocks > self.inner.size {
            bail!(ErrorKind::OutOfBounds(self.inner.id.clone()))
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn get_block_device_size(file: &fs::File) -> Result<Block<u64>, io::Error> {
    const BLKGETSIZE64: c_ulong = 2148012658;
    let mut size: u64 = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if result == 0 {
        Ok(Block::from_bytes(size))
    } else {
        Err(io::Error::last_os_error())
    }
}

#[async_trait]
impl VdevRead for File {
    async fn read_raw(&self, size: Block<u32>, offset: Block<u64>) -> Result<Box<[u8]>, Error> {
        self.check_bounds(size.into(), offset)?;
        self.inner
            .stats
            .read
            .fetch_add(size.as_u64(), Ordering::Relaxed);
        let mut buf = vec![0; size.to_bytes() as usize].into_boxed_slice();
        match self.inner.file.read_exact_at(&mut buf, offset.to_bytes()) {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.inner
                    .stats
                    .failed_reads
                    .fetch_add(size.as_u64(), Ordering::Relaxed);
                Err(Error::with_chain(
                    e,
                    ErrorKind::ReadError(self.inner.id.clone()),
                ))
            }
        }
    }
}

#[async_trait]
impl VdevWrite for File {
    async fn write_raw<W: AsRef<[u8]> + Send + 'static>(
        &self,
        data: W,
        offset: Block<u64>,
    ) -> Result<(), Error> {
        let block_cnt = Block::from_bytes(data.as_ref().len() as u64);
        self.check_bounds(block_cnt, offset)?;
        self.inner
            .stats
            .written
            .fetch_add(block_cnt.as_u64(), Ordering::Relaxed);
        match self
            .inner
            .file
            .write_all_at(data.as_ref(), offset.to_bytes())
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner
                    .stats
                    .failed_writes
                    .fetch_add(block_cnt.as_u64(), Ordering::Relaxed);
                Err(Error::with_chain(
                    e,
                    ErrorKind::WriteError(self.inner.id.clone()),
                ))
            }
        }
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(self.inner.file.sync_data()?)
    }
}

impl Vdev for File {
    fn size(&self) -> Block<u64> {
        self.inner.size
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn stats(&self) -> Statistics {
        self.inner.stats.as_stats()
    }
}
