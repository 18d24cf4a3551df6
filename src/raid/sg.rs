//! Buffer arena and scatter/gather lists.
//!
//! Buffer ownership is by arena page index, never by pointer. A cursor is a
//! plain value: snapshotting it and planting a second list from the snapshot
//! yields two lists over the identical page sequence, which is how the
//! parity position's pre-read and write share their buffers.

use super::errors::*;
use crate::vdev::{Block, BLOCK_SIZE};

/// Blocks per arena page.
pub const PAGE_BLOCKS: usize = 8;

/// A position inside the arena. Copy by value to snapshot it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgCursor {
    page: usize,
    offset: usize,
}

/// One contiguous piece of an I/O buffer: `len` bytes at `offset` within an
/// arena page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgSegment {
    /// Arena page index.
    pub page: usize,
    /// Byte offset within the page.
    pub offset: usize,
    /// Length in bytes; always a multiple of `BLOCK_SIZE`.
    pub len: usize,
}

/// An ordered sequence of segments forming one logical I/O buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList(pub Vec<SgSegment>);

impl SgList {
    /// Total number of blocks described by this list.
    pub fn block_count(&self) -> Block<u32> {
        Block::from_bytes(self.0.iter().map(|s| s.len).sum::<usize>() as u32)
    }

    /// Appends all segments of `other`.
    pub fn append(&mut self, mut other: SgList) {
        self.0.append(&mut other.0);
    }

    /// Returns the segments describing the last `blocks` blocks.
    pub fn tail_blocks(&self, blocks: Block<u32>) -> SgList {
        let mut wanted = blocks.to_bytes() as usize;
        let mut out = Vec::new();
        for seg in self.0.iter().rev() {
            if wanted == 0 {
                break;
            }
            let take = seg.len.min(wanted);
            out.push(SgSegment {
                page: seg.page,
                offset: seg.offset + seg.len - take,
                len: take,
            });
            wanted -= take;
        }
        assert_eq!(wanted, 0, "tail clip past the start of the list");
        out.reverse();
        SgList(out)
    }

    /// Returns the segments describing the first `blocks` blocks.
    pub fn head_blocks(&self, blocks: Block<u32>) -> SgList {
        let mut wanted = blocks.to_bytes() as usize;
        let mut out = Vec::new();
        for seg in &self.0 {
            if wanted == 0 {
                break;
            }
            let take = seg.len.min(wanted);
            out.push(SgSegment {
                page: seg.page,
                offset: seg.offset,
                len: take,
            });
            wanted -= take;
        }
        assert_eq!(wanted, 0, "head clip past the end of the list");
        SgList(out)
    }

    /// Locates block `idx` of the buffer, returning `(page, byte offset)`.
    pub fn locate(&self, idx: Block<u32>) -> Option<(usize, usize)> {
        let mut skip = idx.to_bytes() as usize;
        for seg in &self.0 {
            if skip < seg.len {
                return Some((seg.page, seg.offset + skip));
            }
            skip -= seg.len;
        }
        None
    }
}

/// Per-request buffer pool. Pages are allocated up front from the sizer's
/// budget; an optional caller-owned buffer is installed as an extra page for
/// inline writes.
pub struct BufferArena {
    pages: Vec<Box<[u8]>>,
    // Pages below this index are cursor-allocatable; pages at or above it
    // were installed by the caller.
    pool_pages: usize,
}

impl BufferArena {
    /// Allocates an arena holding `blocks` pool blocks.
    pub fn new(blocks: Block<u32>) -> Self {
        let page_cnt = (blocks.as_usize() + PAGE_BLOCKS - 1) / PAGE_BLOCKS;
        let pages = (0..page_cnt)
            .map(|_| vec![0; PAGE_BLOCKS * BLOCK_SIZE].into_boxed_slice())
            .collect::<Vec<_>>();
        BufferArena {
            pool_pages: pages.len(),
            pages,
        }
    }

    /// Installs a caller-owned buffer as a page outside the cursor pool.
    /// Returns its page index.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not block-aligned.
    pub fn install_user_page(&mut self, data: Box<[u8]>) -> usize {
        assert_eq!(data.len() % BLOCK_SIZE, 0);
        self.pages.push(data);
        self.pages.len() - 1
    }

    /// Returns a cursor at the start of the pool.
    pub fn start_cursor(&self) -> SgCursor {
        SgCursor { page: 0, offset: 0 }
    }

    /// Carves `blocks` blocks out of the pool starting at `cursor`,
    /// advancing it. Requesting more than the pool holds is a sizing bug.
    pub fn populate(&self, cursor: &mut SgCursor, blocks: Block<u32>) -> Result<SgList> {
        let mut wanted = blocks.to_bytes() as usize;
        let mut out = Vec::new();
        while wanted > 0 {
            if cursor.page >= self.pool_pages {
                bail!(ErrorKind::ContractViolation(
                    "buffer pool overrun; sizing and planting disagree".into()
                ));
            }
            let page_len = self.pages[cursor.page].len();
            let avail = page_len - cursor.offset;
            let take = avail.min(wanted);
            out.push(SgSegment {
                page: cursor.page,
                offset: cursor.offset,
                len: take,
            });
            wanted -= take;
            cursor.offset += take;
            if cursor.offset == page_len {
                cursor.page += 1;
                cursor.offset = 0;
            }
        }
        Ok(SgList(out))
    }

    /// Builds a list over `blocks` blocks of an installed user page.
    pub fn user_sg(&self, page: usize, offset: Block<u32>, blocks: Block<u32>) -> SgList {
        SgList(vec![SgSegment {
            page,
            offset: offset.to_bytes() as usize,
            len: blocks.to_bytes() as usize,
        }])
    }

    /// Immutable view of one block of the buffer described by `sg`.
    pub fn block(&self, sg: &SgList, idx: Block<u32>) -> &[u8] {
        let (page, offset) = sg.locate(idx).expect("block index within list");
        &self.pages[page][offset..offset + BLOCK_SIZE]
    }

    /// Mutable view of one block of the buffer described by `sg`.
    pub fn block_mut(&mut self, sg: &SgList, idx: Block<u32>) -> &mut [u8] {
        let (page, offset) = sg.locate(idx).expect("block index within list");
        &mut self.pages[page][offset..offset + BLOCK_SIZE]
    }

    /// Copies `data` into the buffer described by `sg`.
    pub fn fill(&mut self, sg: &SgList, data: &[u8]) {
        assert_eq!(data.len(), sg.block_count().to_bytes() as usize);
        let mut off = 0;
        for seg in &sg.0 {
            self.pages[seg.page][seg.offset..seg.offset + seg.len]
                .copy_from_slice(&data[off..off + seg.len]);
            off += seg.len;
        }
    }

    /// Copies the buffer described by `sg` into a contiguous vector.
    pub fn gather(&self, sg: &SgList) -> Box<[u8]> {
        let mut out = Vec::with_capacity(sg.block_count().to_bytes() as usize);
        for seg in &sg.0 {
            out.extend_from_slice(&self.pages[seg.page][seg.offset..seg.offset + seg.len]);
        }
        out.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_snapshot_shares_pages() {
        let arena = BufferArena::new(Block(20));
        let mut cursor = arena.start_cursor();
        arena.populate(&mut cursor, Block(3)).unwrap();

        let snapshot = cursor;
        let read = arena.populate(&mut cursor, Block(10)).unwrap();
        cursor = snapshot;
        let write = arena.populate(&mut cursor, Block(10)).unwrap();
        assert_eq!(read, write);
        assert_eq!(read.block_count(), Block(10));
    }

    #[test]
    fn populate_rejects_pool_overrun() {
        let arena = BufferArena::new(Block(4));
        let mut cursor = arena.start_cursor();
        // One page is allocated; asking for more than it holds must fail.
        assert!(arena.populate(&mut cursor, Block(PAGE_BLOCKS as u32 + 1)).is_err());
    }

    #[test]
    fn clipping_matches_block_math() {
        let arena = BufferArena::new(Block(24));
        let mut cursor = arena.start_cursor();
        let sg = arena.populate(&mut cursor, Block(13)).unwrap();
        assert_eq!(sg.tail_blocks(Block(4)).block_count(), Block(4));
        assert_eq!(sg.head_blocks(Block(5)).block_count(), Block(5));

        // The tail's last block is the list's last block.
        let tail = sg.tail_blocks(Block(4));
        assert_eq!(tail.locate(Block(3)), sg.locate(Block(12)));
    }

    #[test]
    fn fill_and_gather_round_trip() {
        let mut arena = BufferArena::new(Block(12));
        let mut cursor = arena.start_cursor();
        let sg = arena.populate(&mut cursor, Block(12)).unwrap();
        let data = (0..12 * BLOCK_SIZE).map(|x| x as u8).collect::<Vec<_>>();
        arena.fill(&sg, &data);
        assert_eq!(&arena.gather(&sg)[..], &data[..]);
    }
}
