//! Stripe geometry and the pre-read calculator.
//!
//! Maps logical write ranges onto per-position physical extents for a
//! fixed-parity striped group and computes, per data position, how many
//! blocks must be pre-read before and after the write so that the whole
//! parity-aligned stripe segment is covered.

use super::errors::*;
use crate::vdev::Block;
use std::collections::BTreeMap;

/// Immutable stripe geometry of one raid group.
#[derive(Debug, Clone)]
pub struct RaidGeometry {
    width: u32,
    parity_positions: Vec<u32>,
    element_size: Block<u32>,
    drive_capacity: Block<u64>,
    alignment: Option<u32>,
}

/// One drive position's contiguous physical extent of a logical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionExtent {
    /// Drive position the extent lives on.
    pub position: u32,
    /// First physical block.
    pub start: Block<u64>,
    /// Number of blocks.
    pub count: Block<u32>,
}

/// The physical parity region covering a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityRange {
    /// First physical block of the region.
    pub start: Block<u64>,
    /// Number of blocks per position.
    pub count: Block<u32>,
}

impl ParityRange {
    /// Physical end of the region (exclusive).
    pub fn end(&self) -> Block<u64> {
        self.start + self.count.as_u64()
    }
}

/// Pre-read requirements of one data position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preread {
    /// Pre-read covering the region before the write, `(start, count)`.
    pub read: Option<(Block<u64>, Block<u32>)>,
    /// Pre-read covering the region after the write, `(start, count)`.
    pub read2: Option<(Block<u64>, Block<u32>)>,
}

impl RaidGeometry {
    /// Creates a geometry description.
    ///
    /// `parity_positions` holds one entry for single parity and two for dual
    /// parity. `alignment`, if set, is the physical write granularity in
    /// blocks and must divide `element_size`.
    pub fn new(
        width: u32,
        parity_positions: &[u32],
        element_size: Block<u32>,
        drive_capacity: Block<u64>,
        alignment: Option<u32>,
    ) -> Result<Self> {
        if width == 0 {
            bail!(ErrorKind::ContractViolation("width is zero".into()));
        }
        if parity_positions.is_empty() || parity_positions.len() > 2 {
            bail!(ErrorKind::ContractViolation(format!(
                "{} parity positions",
                parity_positions.len()
            )));
        }
        if parity_positions.len() as u32 >= width {
            bail!(ErrorKind::ContractViolation(
                "no data positions left".into()
            ));
        }
        for (i, &p) in parity_positions.iter().enumerate() {
            if p >= width {
                bail!(ErrorKind::ContractViolation(format!(
                    "parity position {} outside width {}",
                    p, width
                )));
            }
            if parity_positions[..i].contains(&p) {
                bail!(ErrorKind::ContractViolation(
                    "duplicate parity position".into()
                ));
            }
        }
        if element_size.as_u32() == 0 {
            bail!(ErrorKind::ContractViolation("element size is zero".into()));
        }
        if let Some(a) = alignment {
            if a == 0 || element_size.as_u32() % a != 0 {
                bail!(ErrorKind::ContractViolation(format!(
                    "alignment {} does not divide element size {}",
                    a,
                    element_size.as_u32()
                )));
            }
        }
        Ok(RaidGeometry {
            width,
            parity_positions: parity_positions.to_vec(),
            element_size,
            drive_capacity,
            alignment,
        })
    }

    /// Total number of drive positions.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of parity positions (1 or 2).
    pub fn parity_drives(&self) -> u32 {
        self.parity_positions.len() as u32
    }

    /// The parity positions.
    pub fn parity_positions(&self) -> &[u32] {
        &self.parity_positions
    }

    /// Number of data positions.
    pub fn data_drives(&self) -> u32 {
        self.width - self.parity_drives()
    }

    /// Blocks per stripe element.
    pub fn element_size(&self) -> Block<u32> {
        self.element_size
    }

    /// Physical capacity of each member drive.
    pub fn drive_capacity(&self) -> Block<u64> {
        self.drive_capacity
    }

    /// Physical write granularity in blocks, if the members require one.
    pub fn alignment(&self) -> Option<u32> {
        self.alignment
    }

    /// Whether `position` carries parity.
    pub fn is_parity(&self, position: u32) -> bool {
        self.parity_positions.contains(&position)
    }

    /// Iterates the data positions in width order.
    pub fn data_positions(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.width).filter(move |p| !self.is_parity(*p))
    }

    /// Logical blocks per full stripe row.
    pub fn stripe_size(&self) -> u64 {
        u64::from(self.element_size.as_u32()) * u64::from(self.data_drives())
    }

    /// Maps a logical write range onto per-data-position physical extents.
    ///
    /// With fixed (non-rotating) parity, consecutive rows of one position are
    /// physically contiguous, so each touched position yields exactly one
    /// extent.
    pub fn map_write(&self, lba: Block<u64>, count: Block<u32>) -> Result<Vec<PositionExtent>> {
        if count.as_u32() == 0 {
            bail!(ErrorKind::ContractViolation("zero transfer count".into()));
        }
        let e = u64::from(self.element_size.as_u32());
        let stripe = self.stripe_size();
        let start = lba.as_u64();
        let end = start + count.as_u64();
        let r0 = start / stripe;
        let r1 = (end - 1) / stripe;

        let mut extents = Vec::new();
        for (di, position) in self.data_positions().enumerate() {
            let di = di as u64;
            let cover = |r: u64| -> Option<(u64, u64)> {
                let lane_start = r * stripe + di * e;
                let s = start.max(lane_start);
                let t = end.min(lane_start + e);
                if s < t {
                    Some((s, t))
                } else {
                    None
                }
            };
            // Only the edge rows can be partial; any middle row covers the
            // whole element.
            let first = cover(r0).map(|c| (r0, c)).or_else(|| {
                if r0 < r1 {
                    cover(r0 + 1).map(|c| (r0 + 1, c))
                } else {
                    None
                }
            });
            let (first_row, (s0, _)) = match first {
                Some(x) => x,
                None => continue,
            };
            let last = cover(r1)
                .map(|c| (r1, c))
                .or_else(|| {
                    if r1 > first_row {
                        cover(r1 - 1).map(|c| (r1 - 1, c))
                    } else {
                        None
                    }
                })
                .expect("a position covered in some row has a last covered row");
            let (last_row, (_, t1)) = last;

            let phys = |r: u64, logical: u64| -> u64 {
                r * e + (logical - r * stripe - di * e)
            };
            let phys_start = phys(first_row, s0);
            let phys_end = phys(last_row, t1 - 1) + 1;
            extents.push(PositionExtent {
                position,
                start: Block(phys_start),
                count: Block((phys_end - phys_start) as u32),
            });
        }
        Ok(extents)
    }

    /// Splits the logical range into the runs of user-buffer blocks that land
    /// on `position`, in physical order. Returns `(user_offset, blocks)`
    /// pairs, offsets counted in blocks from the start of the user buffer.
    pub fn user_block_runs(
        &self,
        lba: Block<u64>,
        count: Block<u32>,
        position: u32,
    ) -> Vec<(Block<u32>, Block<u32>)> {
        let di = match self.data_positions().position(|p| p == position) {
            Some(i) => i as u64,
            None => return Vec::new(),
        };
        let e = u64::from(self.element_size.as_u32());
        let stripe = self.stripe_size();
        let start = lba.as_u64();
        let end = start + count.as_u64();
        let mut runs = Vec::new();
        let mut r = start / stripe;
        while r * stripe + di * e < end {
            let lane_start = r * stripe + di * e;
            let s = start.max(lane_start);
            let t = end.min(lane_start + e);
            if s < t {
                runs.push((Block((s - start) as u32), Block((t - s) as u32)));
            }
            r += 1;
        }
        runs
    }

    /// The physical parity region covering the given extents. When the
    /// members require aligned writes the region is widened to alignment
    /// boundaries so that the pre-reads cover the alignment gaps.
    pub fn parity_range(&self, extents: &[PositionExtent]) -> Result<ParityRange> {
        let start = extents
            .iter()
            .map(|x| x.start)
            .min()
            .ok_or_else(|| ErrorKind::ContractViolation("write touches no position".into()))?;
        let end = extents
            .iter()
            .map(|x| x.start + x.count.as_u64())
            .max()
            .expect("non-empty extents");
        let (mut start, mut end) = (start.as_u64(), end.as_u64());
        if let Some(a) = self.alignment {
            let a = u64::from(a);
            start = start / a * a;
            end = (end + a - 1) / a * a;
        }
        Ok(ParityRange {
            start: Block(start),
            count: Block((end - start) as u32),
        })
    }

    /// Computes per-data-position pre-read ranges for the parity region.
    ///
    /// Positions the write does not touch are pre-read over the whole region.
    /// A computed pre-read that would leave the parity region marks corrupt
    /// geometry input and fails; it is never clamped.
    pub fn calc_preread(
        &self,
        parity: ParityRange,
        extents: &[PositionExtent],
    ) -> Result<BTreeMap<u32, Preread>> {
        let ps = parity.start;
        let pe = parity.end();
        let mut map = BTreeMap::new();
        for position in self.data_positions() {
            let ext = extents.iter().find(|x| x.position == position);
            let preread = match ext {
                None => Preread {
                    read: Some((ps, parity.count)),
                    read2: None,
                },
                Some(ext) => {
                    let we = ext.start + ext.count.as_u64();
                    if ext.start < ps || we > pe {
                        bail!(ErrorKind::ContractViolation(format!(
                            "write extent [{}, {}) leaves parity region [{}, {}) on position {}",
                            ext.start.as_u64(),
                            we.as_u64(),
                            ps.as_u64(),
                            pe.as_u64(),
                            position
                        )));
                    }
                    let before = (ext.start.as_u64() - ps.as_u64()) as u32;
                    let after = (pe.as_u64() - we.as_u64()) as u32;
                    Preread {
                        read: if before > 0 {
                            Some((ps, Block(before)))
                        } else {
                            None
                        },
                        read2: if after > 0 { Some((we, Block(after))) } else { None },
                    }
                }
            };
            map.insert(position, preread);
        }
        Ok(map)
    }
}
