//! The read-construct-write parity engine.
//!
//! A partial-stripe write against a parity-protected group cannot just
//! overwrite its data blocks: the parity of the touched region has to be
//! reassembled from the blocks the write does not cover. This module drives
//! that as a strict three-phase protocol on [`RcwRequest`]:
//!
//! 1. [`RcwRequest::calculate_memory_size`] maps the logical range onto the
//!    stripe, computes the parity region and pre-reads, and sizes every
//!    buffer and scatter/gather list the request will need.
//! 2. [`RcwRequest::setup_resources`] builds the descriptor chains and
//!    plants all lists into one arena, with the parity read and write
//!    sharing pages and alignment gaps aliasing the pre-read buffers.
//! 3. [`RcwRequest::xor`] combines the contributions into fresh parity.
//!
//! [`RcwRequest::execute`] runs the whole request against a set of member
//! devices, including the pre-reads, retry and degradation handling, and
//! the final writes.

use crate::vdev::{Block, VdevRead, VdevWrite};

pub mod errors;
pub mod fruts;
pub mod geometry;
pub mod planter;
pub mod sg;
pub mod sizer;
pub mod xor;

pub use self::geometry::{ParityRange, PositionExtent, RaidGeometry};
pub use self::xor::{XorOption, XorStatus};

use self::errors::*;
use self::fruts::{handle_retry_error, setup_fruts, FrutsChains, IoErrorClass};
use self::planter::{setup_sgs, UserBuffer};
use self::sg::BufferArena;
use self::sizer::{calculate_memory_size, ResourcePlan};
use self::xor::XorVectors;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Sized,
    Planted,
    Combined,
}

/// One read-construct-write request.
///
/// The request is single-use and phase-ordered; calling an operation out of
/// order is a caller bug and fails with `ContractViolation`.
pub struct RcwRequest {
    geo: RaidGeometry,
    lba: Block<u64>,
    count: Block<u32>,
    buffered: bool,
    write_log: bool,
    dead: Option<u32>,
    phase: Phase,
    plan: Option<ResourcePlan>,
    chains: Option<FrutsChains>,
    arena: Option<BufferArena>,
    vectors: Option<XorVectors>,
    xor_status: Option<XorStatus>,
}

impl RcwRequest {
    /// Creates a request writing `count` logical blocks at `lba`.
    pub fn new(geo: RaidGeometry, lba: Block<u64>, count: Block<u32>) -> Self {
        RcwRequest {
            geo,
            lba,
            count,
            buffered: false,
            write_log: false,
            dead: None,
            phase: Phase::New,
            plan: None,
            chains: None,
            arena: None,
            vectors: None,
            xor_status: None,
        }
    }

    /// Copies the caller's data into pool pages instead of referencing it in
    /// place. Must be set before sizing.
    pub fn buffered(mut self, buffered: bool) -> Self {
        debug_assert_eq!(self.phase, Phase::New);
        self.buffered = buffered;
        self
    }

    /// Reserves a leading write-log header block on every write descriptor.
    /// Must be set before sizing.
    pub fn write_log(mut self, write_log: bool) -> Self {
        debug_assert_eq!(self.phase, Phase::New);
        self.write_log = write_log;
        self
    }

    /// Marks one member position dead before the request starts. Must be
    /// set before sizing.
    pub fn dead(mut self, position: Option<u32>) -> Self {
        debug_assert_eq!(self.phase, Phase::New);
        self.dead = position;
        self
    }

    /// The group geometry of this request.
    pub fn geometry(&self) -> &RaidGeometry {
        &self.geo
    }

    /// Phase 1: sizes all resources. Returns the number of pool blocks the
    /// request will allocate.
    pub fn calculate_memory_size(&mut self) -> Result<Block<u32>> {
        if self.phase != Phase::New {
            bail!(ErrorKind::ContractViolation(
                "calculate_memory_size on a sized request".into()
            ));
        }
        let plan = calculate_memory_size(
            &self.geo,
            self.lba,
            self.count,
            self.buffered,
            self.write_log,
        )?;
        let blocks = plan.arena_blocks;
        self.plan = Some(plan);
        self.phase = Phase::Sized;
        Ok(blocks)
    }

    /// Phase 2: allocates the arena, builds the descriptor chains, and
    /// plants every scatter/gather list. `data` carries the caller's
    /// `count` blocks of new data.
    pub fn setup_resources(&mut self, data: Box<[u8]>) -> Result<()> {
        if self.phase != Phase::Sized {
            bail!(ErrorKind::ContractViolation(
                "setup_resources without a sized plan".into()
            ));
        }
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ErrorKind::ContractViolation("plan missing".into()))?;
        let mut chains = setup_fruts(&self.geo, plan, self.dead)?;
        let mut arena = BufferArena::new(plan.arena_blocks);
        if plan.buffered {
            setup_sgs(
                &mut arena,
                &mut chains,
                plan,
                &self.geo,
                self.lba,
                self.count,
                UserBuffer::Buffered { data: &data },
            )?;
        } else {
            if data.len() != self.count.to_bytes() as usize {
                bail!(ErrorKind::ContractViolation(format!(
                    "user data is {} bytes for a {} block transfer",
                    data.len(),
                    self.count.as_u32()
                )));
            }
            let page = arena.install_user_page(data);
            setup_sgs(
                &mut arena,
                &mut chains,
                plan,
                &self.geo,
                self.lba,
                self.count,
                UserBuffer::Inline { page },
            )?;
        }
        self.chains = Some(chains);
        self.arena = Some(arena);
        self.phase = Phase::Planted;
        Ok(())
    }

    /// Phase 3: combines the planted contributions into fresh parity.
    pub fn xor(&mut self, option: XorOption) -> Result<XorStatus> {
        if self.phase != Phase::Planted {
            bail!(ErrorKind::ContractViolation(
                "xor without planted resources".into()
            ));
        }
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ErrorKind::ContractViolation("plan missing".into()))?;
        let chains = self
            .chains
            .as_ref()
            .ok_or_else(|| ErrorKind::ContractViolation("chains missing".into()))?;
        let arena = self
            .arena
            .as_mut()
            .ok_or_else(|| ErrorKind::ContractViolation("arena missing".into()))?;
        let vectors = xor::setup_xor_vectors(&self.geo, plan, chains, option)?;
        let status = xor::execute(arena, &vectors)?;
        self.vectors = Some(vectors);
        self.xor_status = Some(status);
        self.phase = Phase::Combined;
        Ok(status)
    }

    /// The combine outcome, once phase 3 has run.
    pub fn xor_status(&self) -> Option<XorStatus> {
        self.xor_status
    }

    /// The planted descriptor chains, once phase 2 has run.
    pub fn chains(&self) -> Option<&FrutsChains> {
        self.chains.as_ref()
    }

    /// The buffer arena, once phase 2 has run.
    pub fn arena(&self) -> Option<&BufferArena> {
        self.arena.as_ref()
    }

    /// The sized plan, once phase 1 has run.
    pub fn plan(&self) -> Option<&ResourcePlan> {
        self.plan.as_ref()
    }

    /// Runs the whole request against `members`, one device per position.
    ///
    /// Pre-reads are issued first; a failed pre-read is retried once and
    /// then degrades its position, as long as the parity budget can still
    /// mask it. The combine verifies checksums on a fully-populated stripe
    /// and stops before any write when verification fails. Writes to
    /// degraded positions are skipped.
    pub async fn execute<D>(&mut self, members: &[D]) -> Result<XorStatus>
    where
        D: VdevRead + VdevWrite,
    {
        if self.phase != Phase::Planted {
            bail!(ErrorKind::ContractViolation(
                "execute without planted resources".into()
            ));
        }
        if members.len() != self.geo.width() as usize {
            bail!(ErrorKind::ContractViolation(format!(
                "{} members for a width {} group",
                members.len(),
                self.geo.width()
            )));
        }

        // Pre-read phase with one retry pass.
        {
            let chains = self
                .chains
                .as_mut()
                .ok_or_else(|| ErrorKind::ContractViolation("chains missing".into()))?;
            let arena = self
                .arena
                .as_mut()
                .ok_or_else(|| ErrorKind::ContractViolation("arena missing".into()))?;

            let mut failed = Vec::new();
            for f in chains.read.iter().chain(&chains.read2) {
                if f.degraded {
                    continue;
                }
                match members[f.position as usize].read_raw(f.blocks, f.lba).await {
                    Ok(data) => arena.fill(&f.sg, &data),
                    Err(e) => {
                        warn!("pre-read failed on position {}: {}", f.position, e);
                        failed.push(f.position);
                    }
                }
            }
            failed.sort_unstable();
            failed.dedup();
            if !failed.is_empty() {
                let retryable: Vec<_> = failed
                    .iter()
                    .map(|&p| (p, IoErrorClass::Retryable))
                    .collect();
                let decision =
                    handle_retry_error(&self.geo, chains.degraded_count(), &retryable)?;
                let mut hard = Vec::new();
                for f in chains.read.iter().chain(&chains.read2) {
                    if f.degraded || !decision.retry.contains(&f.position) {
                        continue;
                    }
                    match members[f.position as usize].read_raw(f.blocks, f.lba).await {
                        Ok(data) => arena.fill(&f.sg, &data),
                        Err(e) => {
                            warn!("pre-read retry failed on position {}: {}", f.position, e);
                            hard.push((f.position, IoErrorClass::Hard));
                        }
                    }
                }
                hard.sort_unstable_by_key(|x| x.0);
                hard.dedup_by_key(|x| x.0);
                let decision = handle_retry_error(&self.geo, chains.degraded_count(), &hard)?;
                for position in decision.degrade {
                    chains.mark_degraded(position);
                }
            }
        }

        // Combine.
        let degraded = self
            .chains
            .as_ref()
            .map(|c| c.degraded_count())
            .unwrap_or(0);
        let option = if degraded > 0 {
            XorOption::AllowInvalids
        } else {
            XorOption::ChkCrc
        };
        let status = self.xor(option)?;
        if status == XorStatus::ChecksumError {
            return Ok(status);
        }

        // Write phase. The write-log header block stays with the journal
        // layer; only the data blocks go to the live ranges.
        {
            let chains = self
                .chains
                .as_mut()
                .ok_or_else(|| ErrorKind::ContractViolation("chains missing".into()))?;
            let arena = self
                .arena
                .as_ref()
                .ok_or_else(|| ErrorKind::ContractViolation("arena missing".into()))?;
            let mut hard = Vec::new();
            for f in &chains.write {
                if f.degraded {
                    continue;
                }
                let bytes = arena.gather(&f.sg.tail_blocks(f.blocks));
                if let Err(e) = members[f.position as usize].write_raw(bytes, f.lba).await {
                    warn!("write failed on position {}: {}", f.position, e);
                    hard.push((f.position, IoErrorClass::Hard));
                }
            }
            let decision = handle_retry_error(&self.geo, chains.degraded_count(), &hard)?;
            for position in decision.degrade {
                chains.mark_degraded(position);
            }
            for f in &chains.write {
                if !f.degraded {
                    members[f.position as usize].flush()?;
                }
            }
        }
        Ok(status)
    }
}
