//! The fixed on-disk layout.
//!
//! Block 0 holds the header. The journal region follows, sized for the
//! maximum transaction in each of its four slots (only slot 0 is used at
//! runtime; the rest are reserved). After the journal comes one contiguous
//! region per [`SectorType`], in table order, each `entry_count * 3` blocks.
//!
//! An entry occupies three blocks: one header block carrying the operation
//! tag, entry id, data length and valid flag, then two payload blocks. All
//! blocks end in an 8-byte checksum trailer.

use super::errors::*;
use crate::checksum::BLOCK_BODY_SIZE;
use crate::vdev::Block;
use std::fmt;

/// Payload blocks per entry.
pub const DATA_BLOCKS_PER_ENTRY: u32 = 2;

/// Total blocks per entry, header block included.
pub const BLOCKS_PER_ENTRY: u32 = 1 + DATA_BLOCKS_PER_ENTRY;

/// Maximum payload bytes of one entry.
pub const DATA_BYTES_PER_ENTRY: usize = DATA_BLOCKS_PER_ENTRY as usize * BLOCK_BODY_SIZE;

/// Maximum number of elements in one transaction.
pub const TRAN_ENTRY_MAX: usize = 32;

/// Journal slots in the journal region. Only slot 0 is written.
pub const JOURNAL_SLOTS: u32 = 4;

/// LBA of the header block.
pub const HEADER_LBA: Block<u64> = Block(0);

/// First LBA of the journal region.
pub const JOURNAL_START_LBA: Block<u64> = Block(1);

/// Blocks in the journal region.
pub const JOURNAL_BLOCKS: u32 = BLOCKS_PER_ENTRY * TRAN_ENTRY_MAX as u32 * JOURNAL_SLOTS;

/// First LBA of the entry regions.
pub const DATA_START_LBA: Block<u64> = Block(1 + JOURNAL_BLOCKS as u64);

/// A logical category of persisted record with its own fixed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SectorType {
    /// Object records.
    Objects,
    /// Edge records.
    Edges,
    /// System-wide configuration records.
    SystemGlobal,
    /// Free-form user records.
    UserData,
}

impl SectorType {
    /// All sector types in on-disk region order.
    pub const ALL: [SectorType; 4] = [
        SectorType::Objects,
        SectorType::Edges,
        SectorType::SystemGlobal,
        SectorType::UserData,
    ];

    fn code(self) -> u32 {
        match self {
            SectorType::Objects => 1,
            SectorType::Edges => 2,
            SectorType::SystemGlobal => 3,
            SectorType::UserData => 4,
        }
    }

    fn from_code(code: u32) -> Option<SectorType> {
        match code {
            1 => Some(SectorType::Objects),
            2 => Some(SectorType::Edges),
            3 => Some(SectorType::SystemGlobal),
            4 => Some(SectorType::UserData),
            _ => None,
        }
    }
}

impl fmt::Display for SectorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which entry-count budget the layout uses. Chosen at deploy time, never
/// at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityProfile {
    /// Full-size budgets for production arrays.
    Production,
    /// Shrunk budgets for simulated backing stores.
    Simulation,
}

impl CapacityProfile {
    /// Entry budget of `sector`. Every budget is a multiple of 64, the
    /// bitmap word size.
    pub fn entry_count(self, sector: SectorType) -> u32 {
        match (self, sector) {
            (CapacityProfile::Production, SectorType::Objects) => 2048,
            (CapacityProfile::Production, SectorType::Edges) => 4096,
            (CapacityProfile::Production, SectorType::SystemGlobal) => 256,
            (CapacityProfile::Production, SectorType::UserData) => 512,
            (CapacityProfile::Simulation, SectorType::Objects) => 256,
            (CapacityProfile::Simulation, SectorType::Edges) => 512,
            (CapacityProfile::Simulation, SectorType::SystemGlobal) => 64,
            (CapacityProfile::Simulation, SectorType::UserData) => 64,
        }
    }
}

/// The decoded form of an entry id, used for all in-memory logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryAddress {
    /// The region the entry lives in.
    pub sector: SectorType,
    /// The entry slot within the region.
    pub offset: u32,
}

/// The packed wire form of an entry id: sector code in the high 32 bits,
/// slot offset in the low 32. Kept bit-exact for on-disk compatibility;
/// decode with [`EntryId::decode`] at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Packs an address into the wire form.
    pub fn encode(addr: EntryAddress) -> EntryId {
        EntryId(u64::from(addr.sector.code()) << 32 | u64::from(addr.offset))
    }

    /// Unpacks the wire form. Fails on an unknown sector code.
    pub fn decode(self) -> Result<EntryAddress> {
        let sector = SectorType::from_code((self.0 >> 32) as u32)
            .ok_or_else(|| ErrorKind::ContractViolation(format!("bad entry id {:#x}", self.0)))?;
        Ok(EntryAddress {
            sector,
            offset: self.0 as u32,
        })
    }

    /// The raw packed value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Wraps a raw packed value without validation.
    pub fn from_raw(raw: u64) -> EntryId {
        EntryId(raw)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address arithmetic over one capacity profile.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    profile: CapacityProfile,
}

impl Layout {
    /// Creates the layout of `profile`.
    pub fn new(profile: CapacityProfile) -> Self {
        for &sector in &SectorType::ALL {
            debug_assert_eq!(profile.entry_count(sector) % 64, 0);
        }
        Layout { profile }
    }

    /// The capacity profile in use.
    pub fn profile(&self) -> CapacityProfile {
        self.profile
    }

    /// Entry budget of `sector`.
    pub fn entry_count(&self, sector: SectorType) -> u32 {
        self.profile.entry_count(sector)
    }

    /// Number of entries in the regions preceding `sector`.
    pub fn entries_before(&self, sector: SectorType) -> u64 {
        SectorType::ALL
            .iter()
            .take_while(|&&s| s != sector)
            .map(|&s| u64::from(self.entry_count(s)))
            .sum()
    }

    /// Total entry budget across all sectors.
    pub fn max_total_entries(&self) -> u64 {
        SectorType::ALL
            .iter()
            .map(|&s| u64::from(self.entry_count(s)))
            .sum()
    }

    /// First LBA of the region of `sector`.
    pub fn region_start_lba(&self, sector: SectorType) -> Block<u64> {
        DATA_START_LBA + self.entries_before(sector) * u64::from(BLOCKS_PER_ENTRY)
    }

    /// Absolute LBA of the entry at `addr`.
    pub fn entry_lba(&self, addr: EntryAddress) -> Result<Block<u64>> {
        if addr.offset >= self.entry_count(addr.sector) {
            bail!(ErrorKind::ContractViolation(format!(
                "offset {} outside sector {} with {} entries",
                addr.offset,
                addr.sector,
                self.entry_count(addr.sector)
            )));
        }
        Ok(self.region_start_lba(addr.sector)
            + u64::from(addr.offset) * u64::from(BLOCKS_PER_ENTRY))
    }

    /// Total LUN size the layout requires, used by provisioning callers.
    pub fn required_lun_size(&self) -> Block<u64> {
        DATA_START_LBA + self.max_total_entries() * u64::from(BLOCKS_PER_ENTRY)
    }
}
