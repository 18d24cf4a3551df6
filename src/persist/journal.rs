//! Journal staging, replay, and bitmap reconstruction.
//!
//! The commit pipeline is decomposed into staged operations so the engine
//! can await them strictly in order: journal write, header write, live
//! writes, header invalidation. Crash tests drive the same stages directly
//! and stop between them.

use super::bitmap::FreeSpaceBitmap;
use super::errors::*;
use super::header::PersistHeader;
use super::layout::{
    EntryAddress, Layout, SectorType, BLOCKS_PER_ENTRY, HEADER_LBA, JOURNAL_START_LBA,
    TRAN_ENTRY_MAX,
};
use super::transaction::{ElemHeader, ElemOp, TranElement};
use crate::checksum::{block_body, verify_block_trailer};
use crate::vdev::{Block, VdevRead, VdevWrite, BLOCK_SIZE};
use bincode::deserialize;
use itertools::Itertools;

const ENTRY_BYTES: usize = BLOCKS_PER_ENTRY as usize * BLOCK_SIZE;

/// Blocks zeroed per write while formatting.
const FORMAT_CHUNK: u64 = 256;

/// Writes the header block and flushes it.
pub(crate) async fn write_header<D: VdevWrite>(device: &D, header: &PersistHeader) -> Result<()> {
    device.write_raw(header.pack()?, HEADER_LBA).await?;
    device.flush()?;
    Ok(())
}

/// Reads and validates the header block.
pub(crate) async fn read_header<D: VdevRead>(device: &D) -> Result<PersistHeader> {
    let block = device.read_raw(Block(1), HEADER_LBA).await?;
    PersistHeader::unpack(&block)
}

/// Stages all element images into journal slot 0 and flushes.
pub(crate) async fn write_journal<D: VdevWrite>(
    device: &D,
    elements: &[TranElement],
) -> Result<()> {
    let mut bytes = Vec::with_capacity(elements.len() * ENTRY_BYTES);
    for element in elements {
        bytes.extend_from_slice(&element.to_blocks()?);
    }
    device.write_raw(bytes, JOURNAL_START_LBA).await?;
    device.flush()?;
    Ok(())
}

/// Reads `count` elements back out of journal slot 0.
pub(crate) async fn read_journal<D: VdevRead>(device: &D, count: u32) -> Result<Vec<TranElement>> {
    if count as usize > TRAN_ENTRY_MAX {
        bail!(ErrorKind::InvalidHeader);
    }
    let bytes = device
        .read_raw(Block(count * BLOCKS_PER_ENTRY), JOURNAL_START_LBA)
        .await?;
    bytes.chunks(ENTRY_BYTES).map(TranElement::from_blocks).collect()
}

/// Writes one element's image to its live location. A full overwrite of a
/// deterministic LBA, which is what makes journal replay idempotent.
pub(crate) async fn apply_element<D: VdevWrite>(
    device: &D,
    layout: &Layout,
    element: &TranElement,
) -> Result<()> {
    let addr = element.header.entry_id.decode()?;
    let lba = layout.entry_lba(addr)?;
    device.write_raw(element.to_blocks()?, lba).await?;
    Ok(())
}

/// Scans every entry region and marks the bitmap for each entry whose
/// header block carries a valid checksum, the valid flag, and a
/// non-delete operation tag.
pub(crate) async fn rebuild_bitmap<D: VdevRead>(
    device: &D,
    layout: &Layout,
) -> Result<FreeSpaceBitmap> {
    let mut bitmap = FreeSpaceBitmap::new(layout);
    for &sector in &SectorType::ALL {
        let start = layout.region_start_lba(sector);
        for chunk in &(0..layout.entry_count(sector)).chunks(64) {
            let offsets: Vec<u32> = chunk.collect();
            let lba = start + u64::from(offsets[0]) * u64::from(BLOCKS_PER_ENTRY);
            let bytes = device
                .read_raw(Block(offsets.len() as u32 * BLOCKS_PER_ENTRY), lba)
                .await?;
            for (i, &offset) in offsets.iter().enumerate() {
                let header_block = &bytes[i * ENTRY_BYTES..i * ENTRY_BYTES + BLOCK_SIZE];
                if verify_block_trailer(header_block).is_err() {
                    continue;
                }
                let header: ElemHeader = match deserialize(block_body(header_block)) {
                    Ok(header) => header,
                    Err(_) => continue,
                };
                if header.valid != 0 && header.op != ElemOp::Delete {
                    bitmap.set(EntryAddress { sector, offset })?;
                }
            }
        }
    }
    Ok(bitmap)
}

/// Initializes an empty store: clean header, zeroed journal and regions.
pub(crate) async fn format<D: VdevWrite>(device: &D, layout: &Layout) -> Result<()> {
    write_header(device, &PersistHeader::clean()).await?;
    let total = layout.required_lun_size();
    let mut lba = JOURNAL_START_LBA;
    while lba < total {
        let blocks = std::cmp::min(Block(FORMAT_CHUNK), total - lba);
        device
            .write_raw(vec![0u8; blocks.to_bytes() as usize], lba)
            .await?;
        lba += blocks;
    }
    device.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::layout::{CapacityProfile, EntryId};
    use crate::vdev::test::FailingLeafVdev;
    use futures::executor::block_on;

    fn device(layout: &Layout) -> FailingLeafVdev {
        let size = layout.required_lun_size();
        FailingLeafVdev::new(Block(size.as_u64() as u32), "persist".to_string())
    }

    fn element(offset: u32, op: ElemOp, byte: u8) -> TranElement {
        TranElement {
            header: ElemHeader {
                op,
                entry_id: EntryId::encode(EntryAddress {
                    sector: SectorType::Objects,
                    offset,
                }),
                data_length: 16,
                valid: 1,
            },
            payload: vec![byte; 16],
        }
    }

    #[test]
    fn journal_round_trips_elements() {
        let layout = Layout::new(CapacityProfile::Simulation);
        let dev = device(&layout);
        let elements = vec![element(0, ElemOp::Write, 0xaa), element(5, ElemOp::Modify, 0xbb)];
        block_on(write_journal(&dev, &elements)).unwrap();
        let back = block_on(read_journal(&dev, 2)).unwrap();
        assert_eq!(back, elements);
        assert!(block_on(read_journal(&dev, TRAN_ENTRY_MAX as u32 + 1)).is_err());
    }

    #[test]
    fn rebuild_sees_valid_entries_and_skips_deleted_ones() {
        let layout = Layout::new(CapacityProfile::Simulation);
        let dev = device(&layout);
        block_on(format(&dev, &layout)).unwrap();
        block_on(apply_element(&dev, &layout, &element(3, ElemOp::Write, 1))).unwrap();
        block_on(apply_element(&dev, &layout, &element(70, ElemOp::Write, 2))).unwrap();
        block_on(apply_element(&dev, &layout, &element(9, ElemOp::Delete, 0))).unwrap();

        let bitmap = block_on(rebuild_bitmap(&dev, &layout)).unwrap();
        let addr = |offset| EntryAddress {
            sector: SectorType::Objects,
            offset,
        };
        assert!(bitmap.exists(addr(3)).unwrap());
        assert!(bitmap.exists(addr(70)).unwrap());
        assert!(!bitmap.exists(addr(9)).unwrap());
        assert_eq!(bitmap.used(SectorType::Objects), 2);
        assert_eq!(bitmap.used(SectorType::Edges), 0);
    }

    #[test]
    fn header_round_trips_through_the_device() {
        let layout = Layout::new(CapacityProfile::Simulation);
        let dev = device(&layout);
        block_on(write_header(&dev, &PersistHeader::journaled(4))).unwrap();
        let header = block_on(read_header(&dev)).unwrap();
        assert!(header.journal_valid());
        assert_eq!(header.journal_size(), 4);
    }
}
