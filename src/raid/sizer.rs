//! Resource sizing for an RCW request.
//!
//! Converts the pre-read and write ranges into per-position I/O descriptors
//! and a buffer/scatter-gather budget, recorded on the request so the
//! planter can detect when planting and sizing disagree.

use super::errors::*;
use super::geometry::{ParityRange, RaidGeometry};
use super::sg::PAGE_BLOCKS;
use crate::vdev::Block;
use std::collections::BTreeMap;

/// Describes one I/O to one physical drive position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FruInfo {
    /// Drive position.
    pub position: u32,
    /// First physical block.
    pub lba: Block<u64>,
    /// Number of blocks.
    pub blocks: Block<u32>,
}

/// The write descriptor of one position: the (possibly alignment-widened)
/// range that goes to disk plus the sub-range carrying caller data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePlan {
    /// The full write range.
    pub fru: FruInfo,
    /// First physical block of the caller's data within the range.
    pub user_start: Block<u64>,
    /// Number of caller data blocks.
    pub user_count: Block<u32>,
}

impl WritePlan {
    /// Blocks between the write start and the caller data (alignment gap).
    pub fn leading_gap(&self) -> Block<u32> {
        Block((self.user_start.as_u64() - self.fru.lba.as_u64()) as u32)
    }

    /// Blocks between the caller data end and the write end (alignment gap).
    pub fn trailing_gap(&self) -> Block<u32> {
        let user_end = self.user_start.as_u64() + self.user_count.as_u64();
        let write_end = self.fru.lba.as_u64() + self.fru.blocks.as_u64();
        Block((write_end - user_end) as u32)
    }
}

/// All descriptors of one drive position.
#[derive(Debug, Clone, Default)]
pub struct PositionPlan {
    /// Pre-read before the write range.
    pub read: Option<FruInfo>,
    /// Pre-read after the write range.
    pub read2: Option<FruInfo>,
    /// The write itself.
    pub write: Option<WritePlan>,
}

/// Output of the sizing phase.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    /// Descriptor triple per drive position, in width order.
    pub positions: BTreeMap<u32, PositionPlan>,
    /// The parity region this request updates.
    pub parity: ParityRange,
    /// Pool blocks the planter may draw from the arena cursor.
    pub arena_blocks: Block<u32>,
    /// Upper bound on scatter/gather segments across all descriptors.
    pub sg_budget: usize,
    /// Whether caller data is copied into the pool (`true`) or referenced
    /// in place (`false`).
    pub buffered: bool,
    /// Whether every write descriptor carries a leading write-log header
    /// block.
    pub write_log: bool,
}

fn align_down(x: u64, a: u64) -> u64 {
    x / a * a
}

fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) / a * a
}

fn sg_bound(blocks: Block<u32>) -> usize {
    blocks.as_usize() / PAGE_BLOCKS + 2
}

/// Sizes all resources of an RCW request.
pub fn calculate_memory_size(
    geo: &RaidGeometry,
    lba: Block<u64>,
    count: Block<u32>,
    buffered: bool,
    write_log: bool,
) -> Result<ResourcePlan> {
    let extents = geo.map_write(lba, count)?;
    for ext in &extents {
        // Cannot happen with a sane mapping; reported rather than assumed.
        if geo.is_parity(ext.position) {
            bail!(ErrorKind::ContractViolation(format!(
                "data extent landed on parity position {}",
                ext.position
            )));
        }
    }
    let parity = geo.parity_range(&extents)?;
    let prereads = geo.calc_preread(parity, &extents)?;

    let mut positions: BTreeMap<u32, PositionPlan> = BTreeMap::new();
    let mut arena_blocks = 0u32;
    let mut sg_budget = 0usize;
    let align_slack = if geo.alignment().is_some() { 4 } else { 0 };

    for position in 0..geo.width() {
        let mut plan = PositionPlan::default();
        if geo.is_parity(position) {
            // Parity is pre-read and rewritten over the same buffer pages;
            // only one copy of the region is sized.
            plan.read = Some(FruInfo {
                position,
                lba: parity.start,
                blocks: parity.count,
            });
            plan.write = Some(WritePlan {
                fru: FruInfo {
                    position,
                    lba: parity.start,
                    blocks: parity.count,
                },
                user_start: parity.start,
                user_count: parity.count,
            });
            arena_blocks += parity.count.as_u32();
            sg_budget += 2 * sg_bound(parity.count);
        } else {
            let preread = &prereads[&position];
            if let Some((start, blocks)) = preread.read {
                plan.read = Some(FruInfo {
                    position,
                    lba: start,
                    blocks,
                });
                arena_blocks += blocks.as_u32();
                sg_budget += sg_bound(blocks);
            }
            if let Some((start, blocks)) = preread.read2 {
                plan.read2 = Some(FruInfo {
                    position,
                    lba: start,
                    blocks,
                });
                arena_blocks += blocks.as_u32();
                sg_budget += sg_bound(blocks);
            }
            if let Some(ext) = extents.iter().find(|x| x.position == position) {
                let user_end = ext.start.as_u64() + ext.count.as_u64();
                // The parity region is already widened to alignment
                // boundaries, so the aligned write range stays within it.
                let (write_start, write_end) = match geo.alignment() {
                    Some(a) => {
                        let a = u64::from(a);
                        (align_down(ext.start.as_u64(), a), align_up(user_end, a))
                    }
                    None => (ext.start.as_u64(), user_end),
                };
                plan.write = Some(WritePlan {
                    fru: FruInfo {
                        position,
                        lba: Block(write_start),
                        blocks: Block((write_end - write_start) as u32),
                    },
                    user_start: ext.start,
                    user_count: ext.count,
                });
                if buffered {
                    arena_blocks += ext.count.as_u32();
                }
                let runs = geo.user_block_runs(lba, count, position).len();
                sg_budget += sg_bound(ext.count) + runs + align_slack;
            }
        }
        if write_log && plan.write.is_some() {
            arena_blocks += 1;
            sg_budget += 1;
        }
        positions.insert(position, plan);
    }

    trace!(
        "sized rcw request: lba {} count {} -> {} arena blocks, {} sg slots",
        lba.as_u64(),
        count.as_u32(),
        arena_blocks,
        sg_budget
    );
    Ok(ResourcePlan {
        positions,
        parity,
        arena_blocks: Block(arena_blocks),
        sg_budget,
        buffered,
        write_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo(width: u32, parity: &[u32], element: u32, align: Option<u32>) -> RaidGeometry {
        RaidGeometry::new(width, parity, Block(element), Block(1 << 20), align).unwrap()
    }

    #[test]
    fn sizes_partial_row_write() {
        let g = geo(3, &[2], 16, None);
        let plan = calculate_memory_size(&g, Block(4), Block(8), false, false).unwrap();
        assert_eq!(plan.parity.start, Block(4));
        assert_eq!(plan.parity.count, Block(8));

        let p0 = &plan.positions[&0];
        let w = p0.write.unwrap();
        assert_eq!(w.fru.blocks, Block(8));
        assert_eq!(w.leading_gap(), Block(0));
        assert_eq!(w.trailing_gap(), Block(0));
        assert!(p0.read.is_none());

        // Untouched data position pre-reads the whole region; parity is
        // sized once for its shared read/write buffer.
        let p1 = &plan.positions[&1];
        assert_eq!(p1.read.unwrap().blocks, Block(8));
        assert_eq!(plan.arena_blocks, Block(8 + 8));
    }

    #[test]
    fn alignment_widens_the_write_and_keeps_user_range() {
        let g = geo(3, &[2], 16, Some(4));
        let plan = calculate_memory_size(&g, Block(1), Block(6), false, false).unwrap();
        // User writes phys [1, 7) on position 0; the parity region and the
        // write range widen to [0, 8).
        assert_eq!(plan.parity.start, Block(0));
        assert_eq!(plan.parity.count, Block(8));
        let p0 = &plan.positions[&0];
        let w = p0.write.unwrap();
        assert_eq!(w.user_start, Block(1));
        assert_eq!(w.user_count, Block(6));
        assert_eq!(w.fru.lba, Block(0));
        assert_eq!(w.fru.blocks, Block(8));
        assert_eq!(w.leading_gap(), Block(1));
        assert_eq!(w.trailing_gap(), Block(1));
        // The pre-reads run to the user edges, overlapping the gaps.
        assert_eq!(p0.read.unwrap().blocks, Block(1));
        assert_eq!(p0.read2.unwrap().blocks, Block(1));
    }

    #[test]
    fn write_log_reserves_one_block_per_write() {
        let g = geo(3, &[2], 16, None);
        let without = calculate_memory_size(&g, Block(4), Block(8), false, false).unwrap();
        let with = calculate_memory_size(&g, Block(4), Block(8), false, true).unwrap();
        // One data write and one parity write.
        assert_eq!(
            with.arena_blocks.as_u32(),
            without.arena_blocks.as_u32() + 2
        );
    }

    #[test]
    fn buffered_mode_materializes_user_blocks() {
        let g = geo(3, &[2], 16, None);
        let inline = calculate_memory_size(&g, Block(4), Block(8), false, false).unwrap();
        let buffered = calculate_memory_size(&g, Block(4), Block(8), true, false).unwrap();
        assert_eq!(
            buffered.arena_blocks.as_u32(),
            inline.arena_blocks.as_u32() + 8
        );
    }
}
