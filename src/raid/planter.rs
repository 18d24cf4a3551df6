//! Scatter/gather planting.
//!
//! Walks the descriptor chains in position order and carves each
//! descriptor's buffer out of the arena, wiring up the structural sharing
//! the engine depends on: the parity pre-read and parity write run over the
//! identical pages, and a data position's alignment gaps alias the tail and
//! head of its pre-read buffers so the gap blocks rewrite the old data.

use super::errors::*;
use super::fruts::FrutsChains;
use super::geometry::RaidGeometry;
use super::sg::{BufferArena, SgList};
use super::sizer::ResourcePlan;
use crate::vdev::Block;

/// Where the caller's data lives during planting.
#[derive(Clone, Copy)]
pub enum UserBuffer<'a> {
    /// The caller's buffer was installed in the arena as page `page`; write
    /// lists reference it in place.
    Inline {
        /// Arena page index returned by `BufferArena::install_user_page`.
        page: usize,
    },
    /// The caller's data is copied into pool pages.
    Buffered {
        /// The data, `count` blocks long.
        data: &'a [u8],
    },
}

/// Plants all scatter/gather lists onto the chains.
///
/// `lba` and `count` are the logical range the request was sized for. The
/// planting must come out exactly as sized; any disagreement surfaces as
/// `ContractViolation` or `InsufficientResources` rather than corrupting a
/// neighbour's buffer.
pub fn setup_sgs(
    arena: &mut BufferArena,
    chains: &mut FrutsChains,
    plan: &ResourcePlan,
    geo: &RaidGeometry,
    lba: Block<u64>,
    count: Block<u32>,
    user: UserBuffer<'_>,
) -> Result<()> {
    match (&user, plan.buffered) {
        (UserBuffer::Inline { .. }, true) | (UserBuffer::Buffered { .. }, false) => {
            bail!(ErrorKind::ContractViolation(
                "user buffer mode does not match the sized plan".into()
            ));
        }
        _ => {}
    }
    if let UserBuffer::Buffered { data } = user {
        if data.len() != count.to_bytes() as usize {
            bail!(ErrorKind::ContractViolation(format!(
                "user data is {} bytes for a {} block transfer",
                data.len(),
                count.as_u32()
            )));
        }
    }

    let mut cursor = arena.start_cursor();
    for (&position, pos_plan) in &plan.positions {
        if geo.is_parity(position) {
            // The parity pre-read and write share pages: plant the read,
            // then replant the identical range from a snapshot.
            let snapshot = cursor;
            let read_sg = arena.populate(&mut cursor, plan.parity.count)?;
            let mut write_sg = if plan.write_log {
                arena.populate(&mut cursor, Block(1))?
            } else {
                SgList::default()
            };
            let mut replay = snapshot;
            write_sg.append(arena.populate(&mut replay, plan.parity.count)?);

            let r = FrutsChains::find(&chains.read, position)
                .ok_or_else(|| ErrorKind::ContractViolation("parity read missing".into()))?;
            chains.read[r].sg = read_sg;
            let w = FrutsChains::find(&chains.write, position)
                .ok_or_else(|| ErrorKind::ContractViolation("parity write missing".into()))?;
            chains.write[w].sg = write_sg;
            continue;
        }

        let mut read_sg = SgList::default();
        let mut read2_sg = SgList::default();
        if pos_plan.read.is_some() {
            let r = FrutsChains::find(&chains.read, position)
                .ok_or_else(|| ErrorKind::ContractViolation("read descriptor missing".into()))?;
            read_sg = arena.populate(&mut cursor, chains.read[r].blocks)?;
            chains.read[r].sg = read_sg.clone();
        }
        if pos_plan.read2.is_some() {
            let r = FrutsChains::find(&chains.read2, position)
                .ok_or_else(|| ErrorKind::ContractViolation("read2 descriptor missing".into()))?;
            read2_sg = arena.populate(&mut cursor, chains.read2[r].blocks)?;
            chains.read2[r].sg = read2_sg.clone();
        }

        let write = match pos_plan.write {
            Some(w) => w,
            None => continue,
        };
        let mut sg = if plan.write_log {
            arena.populate(&mut cursor, Block(1))?
        } else {
            SgList::default()
        };
        // Leading alignment gap: the tail of the pre-read holds the old
        // data of exactly those blocks.
        if write.leading_gap().as_u32() > 0 {
            sg.append(read_sg.tail_blocks(write.leading_gap()));
        }
        match user {
            UserBuffer::Inline { page } => {
                for (offset, blocks) in geo.user_block_runs(lba, count, position) {
                    sg.append(arena.user_sg(page, offset, blocks));
                }
            }
            UserBuffer::Buffered { data } => {
                let runs = geo.user_block_runs(lba, count, position);
                let staged = arena.populate(&mut cursor, write.user_count)?;
                let mut bytes = Vec::with_capacity(write.user_count.to_bytes() as usize);
                for (offset, blocks) in runs {
                    let from = offset.to_bytes() as usize;
                    let to = from + blocks.to_bytes() as usize;
                    bytes.extend_from_slice(&data[from..to]);
                }
                arena.fill(&staged, &bytes);
                sg.append(staged);
            }
        }
        // Trailing alignment gap, aliasing the head of read2.
        if write.trailing_gap().as_u32() > 0 {
            sg.append(read2_sg.head_blocks(write.trailing_gap()));
        }

        let w = FrutsChains::find(&chains.write, position)
            .ok_or_else(|| ErrorKind::ContractViolation("write descriptor missing".into()))?;
        chains.write[w].sg = sg;
    }

    let segments: usize = chains
        .read
        .iter()
        .chain(&chains.read2)
        .chain(&chains.write)
        .map(|f| f.sg.0.len())
        .sum();
    if segments > plan.sg_budget {
        bail!(ErrorKind::InsufficientResources);
    }
    validate_sgs(geo, plan, chains, count)
}

/// Checks the planted chains for internal consistency.
///
/// Every descriptor's list must describe exactly its declared blocks (plus
/// the write-log header), the write chain must carry at least the transfer
/// plus one parity region per parity drive, and the combined read and write
/// traffic of an RCW can never drop below `width + 1` parity regions.
pub fn validate_sgs(
    geo: &RaidGeometry,
    plan: &ResourcePlan,
    chains: &FrutsChains,
    xfer: Block<u32>,
) -> Result<()> {
    for f in chains
        .read
        .iter()
        .chain(&chains.read2)
        .chain(&chains.write)
    {
        if f.sg.block_count() != f.blocks + f.header_blocks {
            bail!(ErrorKind::ContractViolation(format!(
                "position {} descriptor declares {} blocks but its list holds {}",
                f.position,
                (f.blocks + f.header_blocks).as_u32(),
                f.sg.block_count().as_u32()
            )));
        }
    }
    let write_total = chains.total_write_blocks();
    let floor = xfer + plan.parity.count * geo.parity_drives();
    if write_total < floor {
        bail!(ErrorKind::ContractViolation(format!(
            "write chain holds {} blocks, below the {} block floor",
            write_total.as_u32(),
            floor.as_u32()
        )));
    }
    let traffic = chains.total_read_blocks() + write_total;
    let rcw_floor = plan.parity.count * (geo.width() + 1);
    if traffic < rcw_floor {
        bail!(ErrorKind::ContractViolation(format!(
            "combined traffic of {} blocks, below the {} block rcw floor",
            traffic.as_u32(),
            rcw_floor.as_u32()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::fruts::setup_fruts;
    use super::super::sizer::calculate_memory_size;
    use crate::vdev::BLOCK_SIZE;

    fn plant(
        geo: &RaidGeometry,
        lba: Block<u64>,
        count: Block<u32>,
        buffered: bool,
        write_log: bool,
        data: &[u8],
    ) -> (BufferArena, FrutsChains, ResourcePlan) {
        let plan = calculate_memory_size(geo, lba, count, buffered, write_log).unwrap();
        let mut chains = setup_fruts(geo, &plan, None).unwrap();
        let mut arena = BufferArena::new(plan.arena_blocks);
        if buffered {
            setup_sgs(
                &mut arena,
                &mut chains,
                &plan,
                geo,
                lba,
                count,
                UserBuffer::Buffered { data },
            )
            .unwrap();
        } else {
            let page = arena.install_user_page(data.to_vec().into_boxed_slice());
            setup_sgs(
                &mut arena,
                &mut chains,
                &plan,
                geo,
                lba,
                count,
                UserBuffer::Inline { page },
            )
            .unwrap();
        }
        (arena, chains, plan)
    }

    fn geometry(width: u32, parity: &[u32], element: u32, align: Option<u32>) -> RaidGeometry {
        RaidGeometry::new(width, parity, Block(element), Block(1 << 20), align).unwrap()
    }

    #[test]
    fn parity_read_and_write_share_pages() {
        let g = geometry(3, &[2], 16, None);
        let data = vec![0xabu8; 8 * BLOCK_SIZE];
        let (_, chains, _) = plant(&g, Block(4), Block(8), false, false, &data);
        let r = FrutsChains::find(&chains.read, 2).unwrap();
        let w = FrutsChains::find(&chains.write, 2).unwrap();
        assert_eq!(chains.read[r].sg, chains.write[w].sg);
    }

    #[test]
    fn alignment_gaps_alias_the_preread_buffers() {
        let g = geometry(3, &[2], 16, Some(4));
        let data = vec![0x17u8; 6 * BLOCK_SIZE];
        // Logical [1, 7) on position 0; write widens to [0, 8) with one gap
        // block on each side.
        let (_, chains, _) = plant(&g, Block(1), Block(6), false, false, &data);
        let r = FrutsChains::find(&chains.read, 0).unwrap();
        let r2 = FrutsChains::find(&chains.read2, 0).unwrap();
        let w = FrutsChains::find(&chains.write, 0).unwrap();
        let write_sg = &chains.write[w].sg;
        assert_eq!(write_sg.block_count(), Block(8));
        assert_eq!(
            write_sg.locate(Block(0)),
            chains.read[r].sg.locate(Block(0))
        );
        assert_eq!(
            write_sg.locate(Block(7)),
            chains.read2[r2].sg.locate(Block(0))
        );
    }

    #[test]
    fn write_log_header_leads_every_write_list() {
        let g = geometry(3, &[2], 16, None);
        let data = vec![0u8; 8 * BLOCK_SIZE];
        let (_, chains, plan) = plant(&g, Block(4), Block(8), false, true, &data);
        for f in &chains.write {
            assert_eq!(f.header_blocks, Block(1));
            assert_eq!(f.sg.block_count(), f.blocks + Block(1));
            // The header is its own leading segment.
            assert_eq!(f.sg.0[0].len, BLOCK_SIZE);
        }
        validate_sgs(&g, &plan, &chains, Block(8)).unwrap();
    }

    #[test]
    fn buffered_mode_scatters_user_runs() {
        let g = geometry(3, &[2], 8, None);
        let data: Vec<u8> = (0..24 * BLOCK_SIZE).map(|x| (x / BLOCK_SIZE) as u8).collect();
        let (arena, chains, _) = plant(&g, Block(4), Block(24), true, false, &data);
        // Position 0 takes logical [4, 8) and [16, 24) onto phys [4, 16).
        let w = FrutsChains::find(&chains.write, 0).unwrap();
        let got = arena.gather(&chains.write[w].sg);
        let mut want = Vec::new();
        want.extend_from_slice(&data[..4 * BLOCK_SIZE]);
        want.extend_from_slice(&data[12 * BLOCK_SIZE..20 * BLOCK_SIZE]);
        assert_eq!(&got[..], &want[..]);
    }

    #[test]
    fn validate_rejects_a_short_list() {
        let g = geometry(3, &[2], 16, None);
        let data = vec![0u8; 8 * BLOCK_SIZE];
        let (_, mut chains, plan) = plant(&g, Block(4), Block(8), false, false, &data);
        validate_sgs(&g, &plan, &chains, Block(8)).unwrap();
        let w = FrutsChains::find(&chains.write, 0).unwrap();
        chains.write[w].sg.0.pop();
        assert!(validate_sgs(&g, &plan, &chains, Block(8)).is_err());
    }
}
