//! Parity computation over planted scatter/gather lists.
//!
//! The parity region is recomputed from the per-position contributions
//! already sitting in the arena: the write list where the position is
//! written (its alignment gaps alias the pre-read pages, so they carry the
//! old data), otherwise the pre-read lists. For a consistent stripe this is
//! exactly old parity xor old data xor new data.
//!
//! Block bodies are combined; the 8-byte trailer of each parity block is
//! stamped fresh afterwards. Single parity is plain xor. The second parity
//! of a dual-parity group weights each data position by `2^i` in
//! GF(2^8) with the 0x11d polynomial.

use super::errors::*;
use super::fruts::FrutsChains;
use super::geometry::RaidGeometry;
use super::sg::{BufferArena, SgList};
use super::sizer::ResourcePlan;
use crate::checksum::{block_body, stamp_block_trailer, verify_block_trailer, BLOCK_BODY_SIZE};
use crate::vdev::Block;

/// Checksum handling during the combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorOption {
    /// Verify the trailer of every pre-read block before combining. The
    /// default; requires a fully-populated stripe.
    ChkCrc,
    /// Accept unreadable contributions from degraded positions.
    AllowInvalids,
}

/// Outcome of the combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorStatus {
    /// All contributions verified and the parity region was written.
    NoError,
    /// A pre-read block failed trailer verification; parity was not
    /// touched.
    ChecksumError,
    /// Parity was computed from a stripe with degraded contributions and
    /// must not be trusted for reconstruction.
    InvalidSectors,
}

/// One contribution buffer and the parity-region range it covers.
#[derive(Debug, Clone)]
struct XorSource {
    sg: SgList,
    /// First covered block, relative to the parity region start.
    start: Block<u32>,
    count: Block<u32>,
}

impl XorSource {
    fn covers(&self, i: Block<u32>) -> bool {
        i >= self.start && i < self.start + self.count
    }
}

/// All contributions of one data position.
#[derive(Debug, Clone)]
struct XorPosition {
    position: u32,
    /// Index among the data positions; selects the GF weight.
    data_index: u32,
    degraded: bool,
    write: Option<XorSource>,
    read: Option<XorSource>,
    read2: Option<XorSource>,
}

impl XorPosition {
    /// Source buffer and buffer-relative block index for region offset `i`.
    /// The write list wins where it overlaps a pre-read; both alias the
    /// same pages there.
    fn source(&self, i: Block<u32>) -> Option<(&SgList, Block<u32>)> {
        for src in [&self.write, &self.read, &self.read2] {
            if let Some(src) = src {
                if src.covers(i) {
                    return Some((&src.sg, i - src.start));
                }
            }
        }
        None
    }
}

/// One parity position's shared pre-read/write buffer.
#[derive(Debug, Clone)]
struct XorParity {
    position: u32,
    degraded: bool,
    /// The write list, header stripped. Its pages alias the parity
    /// pre-read, so before the combine they still hold the old parity.
    sg: SgList,
}

/// The combine plan of one request.
#[derive(Debug, Clone)]
pub struct XorVectors {
    /// First physical block of the parity region.
    seed: Block<u64>,
    count: Block<u32>,
    positions: Vec<XorPosition>,
    parity: Vec<XorParity>,
    option: XorOption,
}

impl XorVectors {
    /// First physical block of the parity region.
    pub fn seed(&self) -> Block<u64> {
        self.seed
    }

    /// Blocks per position in the parity region.
    pub fn count(&self) -> Block<u32> {
        self.count
    }
}

/// Assembles the combine plan from the planted chains.
pub fn setup_xor_vectors(
    geo: &RaidGeometry,
    plan: &ResourcePlan,
    chains: &FrutsChains,
    option: XorOption,
) -> Result<XorVectors> {
    let rel = |start: Block<u64>| -> Block<u32> {
        Block((start.as_u64() - plan.parity.start.as_u64()) as u32)
    };

    let mut positions = Vec::new();
    for (di, position) in geo.data_positions().enumerate() {
        let pos_plan = &plan.positions[&position];
        let mut degraded = false;
        let source = |chain: &[super::fruts::Fruts],
                      start: Block<u64>,
                      degraded: &mut bool|
         -> Result<XorSource> {
            let idx = FrutsChains::find(chain, position).ok_or_else(|| {
                ErrorKind::ContractViolation("descriptor missing for combine".into())
            })?;
            let f = &chain[idx];
            *degraded |= f.degraded;
            Ok(XorSource {
                // Header blocks never participate in the combine.
                sg: f.sg.tail_blocks(f.blocks),
                start: rel(start),
                count: f.blocks,
            })
        };
        let read = match pos_plan.read {
            Some(r) => Some(source(&chains.read, r.lba, &mut degraded)?),
            None => None,
        };
        let read2 = match pos_plan.read2 {
            Some(r) => Some(source(&chains.read2, r.lba, &mut degraded)?),
            None => None,
        };
        let write = match pos_plan.write {
            Some(w) => Some(source(&chains.write, w.fru.lba, &mut degraded)?),
            None => None,
        };
        positions.push(XorPosition {
            position,
            data_index: di as u32,
            degraded,
            write,
            read,
            read2,
        });
    }

    let mut parity = Vec::new();
    for &p in geo.parity_positions() {
        let idx = FrutsChains::find(&chains.write, p)
            .ok_or_else(|| ErrorKind::ContractViolation("parity write missing".into()))?;
        let f = &chains.write[idx];
        parity.push(XorParity {
            position: p,
            degraded: f.degraded,
            sg: f.sg.tail_blocks(f.blocks),
        });
    }

    Ok(XorVectors {
        seed: plan.parity.start,
        count: plan.parity.count,
        positions,
        parity,
        option,
    })
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0;
    while b != 0 {
        if b & 1 != 0 {
            p ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1d;
        }
        b >>= 1;
    }
    p
}

fn gf_pow2(mut n: u32) -> u8 {
    let mut x = 1u8;
    while n > 0 {
        x = gf_mul(x, 2);
        n -= 1;
    }
    x
}

/// Runs the combine and stamps the parity region.
pub fn execute(arena: &mut BufferArena, vectors: &XorVectors) -> Result<XorStatus> {
    let degraded = vectors.positions.iter().any(|p| p.degraded)
        || vectors.parity.iter().any(|p| p.degraded);
    match vectors.option {
        XorOption::ChkCrc => {
            if degraded {
                bail!(ErrorKind::ContractViolation(
                    "degraded stripe combined without AllowInvalids".into()
                ));
            }
            for pos in &vectors.positions {
                for src in [&pos.read, &pos.read2].iter().filter_map(|s| s.as_ref()) {
                    for i in 0..src.count.as_u32() {
                        let block = arena.block(&src.sg, Block(i));
                        if verify_block_trailer(block).is_err() {
                            warn!(
                                "pre-read block {} of position {} failed trailer verification",
                                i, pos.position
                            );
                            return Ok(XorStatus::ChecksumError);
                        }
                    }
                }
            }
            // The old parity is pre-read data too; its pages are about to be
            // overwritten by the combine, so this is the last chance to
            // surface a media error under it.
            for par in &vectors.parity {
                for i in 0..vectors.count.as_u32() {
                    let block = arena.block(&par.sg, Block(i));
                    if verify_block_trailer(block).is_err() {
                        warn!(
                            "old parity block {} of position {} failed trailer verification",
                            i, par.position
                        );
                        return Ok(XorStatus::ChecksumError);
                    }
                }
            }
        }
        XorOption::AllowInvalids => {}
    }

    let mut body = vec![0u8; BLOCK_BODY_SIZE];
    for (pi, par) in vectors.parity.iter().enumerate() {
        for i in 0..vectors.count.as_u32() {
            for b in body.iter_mut() {
                *b = 0;
            }
            for pos in &vectors.positions {
                if pos.degraded {
                    continue;
                }
                let (sg, idx) = pos.source(Block(i)).ok_or_else(|| {
                    ErrorKind::ContractViolation(format!(
                        "region block {} uncovered on position {}",
                        i, pos.position
                    ))
                })?;
                let src = block_body(arena.block(sg, idx));
                if pi == 0 {
                    for (b, s) in body.iter_mut().zip(src) {
                        *b ^= s;
                    }
                } else {
                    let coeff = gf_pow2(pos.data_index);
                    for (b, s) in body.iter_mut().zip(src) {
                        *b ^= gf_mul(*s, coeff);
                    }
                }
            }
            let target = arena.block_mut(&par.sg, Block(i));
            target[..BLOCK_BODY_SIZE].copy_from_slice(&body);
            stamp_block_trailer(target);
        }
    }

    if degraded {
        Ok(XorStatus::InvalidSectors)
    } else {
        Ok(XorStatus::NoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::fruts::setup_fruts;
    use super::super::planter::{setup_sgs, UserBuffer};
    use super::super::sizer::calculate_memory_size;
    use crate::vdev::BLOCK_SIZE;

    fn geometry(width: u32, parity: &[u32], element: u32) -> RaidGeometry {
        RaidGeometry::new(width, parity, Block(element), Block(1 << 20), None).unwrap()
    }

    fn stamped(byte: u8, blocks: usize) -> Vec<u8> {
        let mut data = vec![byte; blocks * BLOCK_SIZE];
        for b in data.chunks_mut(BLOCK_SIZE) {
            stamp_block_trailer(b);
        }
        data
    }

    /// Seeds the shared parity buffers with verifiable old parity.
    fn fill_parity_reads(
        arena: &mut BufferArena,
        chains: &FrutsChains,
        positions: &[u32],
        blocks: usize,
    ) {
        for &p in positions {
            let idx = FrutsChains::find(&chains.read, p).unwrap();
            arena.fill(&chains.read[idx].sg, &stamped(0, blocks));
        }
    }

    fn build(
        geo: &RaidGeometry,
        lba: Block<u64>,
        count: Block<u32>,
        dead: Option<u32>,
        data: &[u8],
    ) -> (BufferArena, FrutsChains, ResourcePlan) {
        let plan = calculate_memory_size(geo, lba, count, false, false).unwrap();
        let mut chains = setup_fruts(geo, &plan, dead).unwrap();
        let mut arena = BufferArena::new(plan.arena_blocks);
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
        (arena, chains, plan)
    }

    #[test]
    fn gf_arithmetic_reduces_by_the_polynomial() {
        assert_eq!(gf_mul(0x80, 2), 0x1d);
        assert_eq!(gf_mul(2, 0x80), 0x1d);
        assert_eq!(gf_mul(1, 0x53), 0x53);
        assert_eq!(gf_pow2(0), 1);
        assert_eq!(gf_pow2(8), gf_mul(gf_pow2(4), gf_pow2(4)));
    }

    #[test]
    fn parity_is_the_xor_of_all_contributions() {
        let g = geometry(3, &[2], 16);
        // Position 0 gets new data over [4, 12); position 1 contributes its
        // pre-read over the same region.
        let user = stamped(0x0f, 8);
        let (mut arena, chains, plan) = build(&g, Block(4), Block(8), None, &user);
        let r1 = FrutsChains::find(&chains.read, 1).unwrap();
        let old = stamped(0x35, 8);
        arena.fill(&chains.read[r1].sg, &old);
        fill_parity_reads(&mut arena, &chains, &[2], 8);

        let vectors = setup_xor_vectors(&g, &plan, &chains, XorOption::ChkCrc).unwrap();
        assert_eq!(
            execute(&mut arena, &vectors).unwrap(),
            XorStatus::NoError
        );

        let pw = FrutsChains::find(&chains.write, 2).unwrap();
        for i in 0..8 {
            let block = arena.block(&chains.write[pw].sg, Block(i));
            assert!(verify_block_trailer(block).is_ok());
            assert!(block_body(block).iter().all(|&b| b == 0x0f ^ 0x35));
        }
    }

    #[test]
    fn unverifiable_preread_stops_the_combine() {
        let g = geometry(3, &[2], 16);
        let user = stamped(0x0f, 8);
        // The pre-read buffer of position 1 stays zeroed and cannot verify.
        let (mut arena, chains, plan) = build(&g, Block(4), Block(8), None, &user);
        let vectors = setup_xor_vectors(&g, &plan, &chains, XorOption::ChkCrc).unwrap();
        assert_eq!(
            execute(&mut arena, &vectors).unwrap(),
            XorStatus::ChecksumError
        );
    }

    #[test]
    fn unverifiable_old_parity_stops_the_combine() {
        let g = geometry(3, &[2], 16);
        let user = stamped(0x0f, 8);
        let (mut arena, chains, plan) = build(&g, Block(4), Block(8), None, &user);
        // The data pre-read verifies; the parity pre-read stays zeroed.
        let r1 = FrutsChains::find(&chains.read, 1).unwrap();
        arena.fill(&chains.read[r1].sg, &stamped(0x35, 8));
        let vectors = setup_xor_vectors(&g, &plan, &chains, XorOption::ChkCrc).unwrap();
        assert_eq!(
            execute(&mut arena, &vectors).unwrap(),
            XorStatus::ChecksumError
        );
    }

    #[test]
    fn degraded_combine_requires_allow_invalids() {
        let g = geometry(4, &[2, 3], 16);
        let user = stamped(0x42, 8);
        let (mut arena, chains, plan) = build(&g, Block(0), Block(8), Some(1), &user);
        let strict = setup_xor_vectors(&g, &plan, &chains, XorOption::ChkCrc).unwrap();
        assert!(execute(&mut arena, &strict).is_err());
        let lax = setup_xor_vectors(&g, &plan, &chains, XorOption::AllowInvalids).unwrap();
        assert_eq!(
            execute(&mut arena, &lax).unwrap(),
            XorStatus::InvalidSectors
        );
    }

    #[test]
    fn dual_parity_weights_positions_by_gf_powers() {
        let g = geometry(4, &[2, 3], 16);
        // Both data positions fully covered by new data: logical [0, 32).
        let user = stamped(0x21, 32);
        let (mut arena, chains, plan) = build(&g, Block(0), Block(32), None, &user);
        fill_parity_reads(&mut arena, &chains, &[2, 3], 16);
        let vectors = setup_xor_vectors(&g, &plan, &chains, XorOption::ChkCrc).unwrap();
        execute(&mut arena, &vectors).unwrap();

        // P = d0 ^ d1, Q = d0 ^ 2*d1 with d0 = d1 = 0x21.
        let p = FrutsChains::find(&chains.write, 2).unwrap();
        let q = FrutsChains::find(&chains.write, 3).unwrap();
        let p_block = arena.block(&chains.write[p].sg, Block(0));
        assert!(block_body(p_block).iter().all(|&b| b == 0));
        let q_block = arena.block(&chains.write[q].sg, Block(0));
        let want = 0x21 ^ gf_mul(0x21, 2);
        assert!(block_body(q_block).iter().all(|&b| b == want));
    }
}
