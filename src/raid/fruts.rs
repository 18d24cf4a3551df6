//! Live I/O descriptors ("fruts") and their chains.
//!
//! The sizer's plan is turned into descriptors linked onto read, read2, and
//! write chains, strictly in drive-position order. That order is load
//! bearing: the planter walks positions and chains in lock step.

use super::errors::*;
use super::geometry::RaidGeometry;
use super::sg::SgList;
use super::sizer::ResourcePlan;
use crate::vdev::Block;

/// A live descriptor for one I/O to one drive position.
#[derive(Debug, Clone)]
pub struct Fruts {
    /// Drive position.
    pub position: u32,
    /// First physical block.
    pub lba: Block<u64>,
    /// Number of data blocks.
    pub blocks: Block<u32>,
    /// Leading write-log header blocks (write chain only).
    pub header_blocks: Block<u32>,
    /// Scatter/gather list; empty until the planter runs.
    pub sg: SgList,
    /// Set when the position is dead; the I/O driver skips it.
    pub degraded: bool,
}

/// The three descriptor chains of one request, each in position order.
#[derive(Debug, Clone, Default)]
pub struct FrutsChains {
    /// Pre-reads before the write ranges.
    pub read: Vec<Fruts>,
    /// Pre-reads after the write ranges.
    pub read2: Vec<Fruts>,
    /// The writes, parity included.
    pub write: Vec<Fruts>,
}

impl FrutsChains {
    /// Finds a chain member by position.
    pub fn find(chain: &[Fruts], position: u32) -> Option<usize> {
        chain.iter().position(|f| f.position == position)
    }

    /// Total data blocks on the write chain.
    pub fn total_write_blocks(&self) -> Block<u32> {
        self.write.iter().map(|f| f.blocks).sum()
    }

    /// Total data blocks on both read chains.
    pub fn total_read_blocks(&self) -> Block<u32> {
        self.read
            .iter()
            .chain(&self.read2)
            .map(|f| f.blocks)
            .sum()
    }

    /// Marks every descriptor of `position` degraded. Returns the number of
    /// distinct degraded positions afterwards.
    pub fn mark_degraded(&mut self, position: u32) -> usize {
        for f in self
            .read
            .iter_mut()
            .chain(self.read2.iter_mut())
            .chain(self.write.iter_mut())
        {
            if f.position == position {
                f.degraded = true;
            }
        }
        self.degraded_count()
    }

    /// Number of distinct positions currently marked degraded.
    pub fn degraded_count(&self) -> usize {
        let mut positions: Vec<u32> = self
            .read
            .iter()
            .chain(&self.read2)
            .chain(&self.write)
            .filter(|f| f.degraded)
            .map(|f| f.position)
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions.len()
    }
}

/// Builds the descriptor chains from the sizer's plan.
///
/// Validates every descriptor against the member capacity; a range past the
/// end of a drive marks corrupt geometry input.
pub fn setup_fruts(
    geo: &RaidGeometry,
    plan: &ResourcePlan,
    dead_position: Option<u32>,
) -> Result<FrutsChains> {
    let mut chains = FrutsChains::default();
    let header_blocks = if plan.write_log { Block(1) } else { Block(0) };

    for (&position, pos_plan) in &plan.positions {
        let degraded = dead_position == Some(position);
        let push = |chain: &mut Vec<Fruts>,
                    lba: Block<u64>,
                    blocks: Block<u32>,
                    headers: Block<u32>|
         -> Result<()> {
            if blocks.as_u32() == 0 {
                bail!(ErrorKind::ContractViolation(format!(
                    "zero-length descriptor on position {}",
                    position
                )));
            }
            if lba + blocks.as_u64() > geo.drive_capacity() {
                bail!(ErrorKind::ContractViolation(format!(
                    "descriptor [{}, +{}) exceeds capacity {} on position {}",
                    lba.as_u64(),
                    blocks.as_u32(),
                    geo.drive_capacity().as_u64(),
                    position
                )));
            }
            chain.push(Fruts {
                position,
                lba,
                blocks,
                header_blocks: headers,
                sg: SgList::default(),
                degraded,
            });
            Ok(())
        };

        if let Some(read) = pos_plan.read {
            push(&mut chains.read, read.lba, read.blocks, Block(0))?;
        }
        if let Some(read2) = pos_plan.read2 {
            push(&mut chains.read2, read2.lba, read2.blocks, Block(0))?;
        }
        if let Some(write) = pos_plan.write {
            push(
                &mut chains.write,
                write.fru.lba,
                write.fru.blocks,
                header_blocks,
            )?;
        }
    }
    Ok(chains)
}

/// How a failed chain member should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorClass {
    /// Transient; the descriptor is re-issued.
    Retryable,
    /// The position is gone; reconstruct around it.
    Hard,
}

/// Disposition of a batch of per-position failures.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetryDecision {
    /// Positions to re-issue.
    pub retry: Vec<u32>,
    /// Positions to mark degraded.
    pub degrade: Vec<u32>,
}

/// Classifies per-position failures. Retryable errors re-issue; hard errors
/// degrade the position as long as the parity budget allows masking it.
pub fn handle_retry_error(
    geo: &RaidGeometry,
    already_degraded: usize,
    failures: &[(u32, IoErrorClass)],
) -> Result<RetryDecision> {
    let mut decision = RetryDecision::default();
    let mut dead = already_degraded;
    for &(position, class) in failures {
        match class {
            IoErrorClass::Retryable => decision.retry.push(position),
            IoErrorClass::Hard => {
                dead += 1;
                if dead > geo.parity_drives() as usize {
                    warn!(
                        "position {} dead with {} already degraded; request cannot continue",
                        position,
                        dead - 1
                    );
                    bail!(ErrorKind::TooManyDeadPositions(
                        dead,
                        geo.parity_drives() as usize
                    ));
                }
                decision.degrade.push(position);
            }
        }
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::sizer::calculate_memory_size;

    fn geo(width: u32, parity: &[u32], capacity: u64) -> RaidGeometry {
        RaidGeometry::new(width, parity, Block(16), Block(capacity), None).unwrap()
    }

    #[test]
    fn chains_follow_position_order() {
        let g = geo(5, &[4], 1 << 20);
        let plan = calculate_memory_size(&g, Block(20), Block(20), false, false).unwrap();
        let chains = setup_fruts(&g, &plan, None).unwrap();
        for chain in [&chains.read, &chains.read2, &chains.write] {
            let positions: Vec<u32> = chain.iter().map(|f| f.position).collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            assert_eq!(positions, sorted);
        }
        // Writes: positions 1 and 2 plus parity 4.
        let write_positions: Vec<u32> = chains.write.iter().map(|f| f.position).collect();
        assert_eq!(write_positions, vec![1, 2, 4]);
    }

    #[test]
    fn rejects_descriptor_past_drive_capacity() {
        let g = geo(3, &[2], 24);
        let plan = calculate_memory_size(&g, Block(4), Block(8), false, false).unwrap();
        // Shrunk capacity: phys range [4, 12) fits in 24, so build a plan
        // against a larger device and validate against a smaller one.
        let tiny = geo(3, &[2], 8);
        assert!(setup_fruts(&tiny, &plan, None).is_err());
        assert!(setup_fruts(&g, &plan, None).is_ok());
    }

    #[test]
    fn degraded_positions_keep_descriptors() {
        let g = geo(4, &[2, 3], 1 << 20);
        let plan = calculate_memory_size(&g, Block(0), Block(8), false, false).unwrap();
        let mut chains = setup_fruts(&g, &plan, Some(1)).unwrap();
        assert!(chains
            .read
            .iter()
            .chain(&chains.write)
            .filter(|f| f.position == 1)
            .all(|f| f.degraded));
        assert_eq!(chains.degraded_count(), 1);
        assert_eq!(chains.mark_degraded(0), 2);
    }

    #[test]
    fn hard_failures_degrade_until_parity_budget_is_spent() {
        let g = geo(4, &[2, 3], 1 << 20);
        let decision = handle_retry_error(
            &g,
            0,
            &[(0, IoErrorClass::Retryable), (1, IoErrorClass::Hard)],
        )
        .unwrap();
        assert_eq!(decision.retry, vec![0]);
        assert_eq!(decision.degrade, vec![1]);

        assert!(handle_retry_error(
            &g,
            2,
            &[(0, IoErrorClass::Hard)],
        )
        .is_err());
    }
}
