//! The free-space bitmap: one bit per entry slot, grouped per sector.
//!
//! Allocation is an optimistic reservation: the bit is set the moment a
//! slot is handed out, before the owning transaction commits, so a
//! concurrent allocation can never pick the same slot. An aborted
//! transaction clears the bits of its fresh writes again.

use super::errors::*;
use super::layout::{EntryAddress, Layout, SectorType};
use std::collections::BTreeMap;

/// Per-slot used/free tracking over all sectors.
#[derive(Debug, Clone)]
pub struct FreeSpaceBitmap {
    words: BTreeMap<SectorType, Vec<u64>>,
}

impl FreeSpaceBitmap {
    /// Creates an all-free bitmap for `layout`.
    pub fn new(layout: &Layout) -> Self {
        let words = SectorType::ALL
            .iter()
            .map(|&s| (s, vec![0u64; layout.entry_count(s) as usize / 64]))
            .collect();
        FreeSpaceBitmap { words }
    }

    /// Resets every slot to free.
    pub fn reset(&mut self) {
        for words in self.words.values_mut() {
            for w in words.iter_mut() {
                *w = 0;
            }
        }
    }

    fn locate(&self, addr: EntryAddress) -> Result<(usize, u64)> {
        let words = &self.words[&addr.sector];
        let word = addr.offset as usize / 64;
        if word >= words.len() {
            bail!(ErrorKind::ContractViolation(format!(
                "offset {} outside sector {}",
                addr.offset, addr.sector
            )));
        }
        Ok((word, 1u64 << (addr.offset % 64)))
    }

    /// First-fit allocation of a free slot in `sector`. The bit is set
    /// before the address is returned.
    pub fn allocate(&mut self, sector: SectorType) -> Result<EntryAddress> {
        let words = self
            .words
            .get_mut(&sector)
            .ok_or_else(|| ErrorKind::ContractViolation("unknown sector".into()))?;
        for (i, word) in words.iter_mut().enumerate() {
            if *word != u64::max_value() {
                let bit = (!*word).trailing_zeros();
                *word |= 1u64 << bit;
                return Ok(EntryAddress {
                    sector,
                    offset: i as u32 * 64 + bit,
                });
            }
        }
        bail!(ErrorKind::InsufficientResources(sector.to_string()))
    }

    /// Whether the slot at `addr` is used.
    pub fn exists(&self, addr: EntryAddress) -> Result<bool> {
        let (word, mask) = self.locate(addr)?;
        Ok(self.words[&addr.sector][word] & mask != 0)
    }

    /// Marks the slot used, e.g. during bitmap rebuild.
    pub fn set(&mut self, addr: EntryAddress) -> Result<()> {
        let (word, mask) = self.locate(addr)?;
        self.words.get_mut(&addr.sector).map(|w| w[word] |= mask);
        Ok(())
    }

    /// Marks the slot free again.
    pub fn clear(&mut self, addr: EntryAddress) -> Result<()> {
        let (word, mask) = self.locate(addr)?;
        self.words.get_mut(&addr.sector).map(|w| w[word] &= !mask);
        Ok(())
    }

    /// Number of used slots in `sector`.
    pub fn used(&self, sector: SectorType) -> u32 {
        self.words[&sector].iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::layout::CapacityProfile;

    fn bitmap() -> FreeSpaceBitmap {
        FreeSpaceBitmap::new(&Layout::new(CapacityProfile::Simulation))
    }

    #[test]
    fn allocation_is_first_fit_and_never_repeats() {
        let mut b = bitmap();
        let a0 = b.allocate(SectorType::Objects).unwrap();
        let a1 = b.allocate(SectorType::Objects).unwrap();
        assert_eq!(a0.offset, 0);
        assert_eq!(a1.offset, 1);
        assert!(b.exists(a0).unwrap());

        b.clear(a0).unwrap();
        assert!(!b.exists(a0).unwrap());
        // The freed slot is the first fit again.
        assert_eq!(b.allocate(SectorType::Objects).unwrap(), a0);
    }

    #[test]
    fn exhausted_sector_reports_insufficient_resources() {
        let mut b = bitmap();
        for _ in 0..64 {
            b.allocate(SectorType::SystemGlobal).unwrap();
        }
        assert!(b.allocate(SectorType::SystemGlobal).is_err());
        // Other sectors are unaffected.
        assert!(b.allocate(SectorType::UserData).is_ok());
    }

    #[test]
    fn allocation_crosses_word_boundaries() {
        let mut b = bitmap();
        for i in 0..65 {
            assert_eq!(b.allocate(SectorType::Edges).unwrap().offset, i);
        }
        assert_eq!(b.used(SectorType::Edges), 65);
    }

    #[test]
    fn out_of_range_offsets_are_contract_violations() {
        let mut b = bitmap();
        let bad = EntryAddress {
            sector: SectorType::UserData,
            offset: 64,
        };
        assert!(b.set(bad).is_err());
        assert!(b.exists(bad).is_err());
    }
}
