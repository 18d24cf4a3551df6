//! The header block, the crash-recovery anchor.
//!
//! One block at LBA 0. `journal_state` carries the valid marker while a
//! journal waits to be replayed; `journal_size` then records how many
//! elements the journal holds. A header without the marker means a clean
//! store.

use super::errors::*;
use crate::checksum::{stamp_block_trailer, verify_block_trailer, BLOCK_BODY_SIZE};
use crate::vdev::BLOCK_SIZE;
use bincode::{deserialize, serialize_into};

static MAGIC: &[u8] = b"SSPERS1\0\n";

const VERSION: u32 = 1;

/// Marker stored in `journal_state` while the journal is valid.
pub const JOURNAL_VALID: u64 = 0x6a72_6e6c_2076_3100;

/// The decoded header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistHeader {
    magic: [u8; 9],
    version: u32,
    journal_state: u64,
    journal_size: u32,
}

impl PersistHeader {
    /// A header describing a clean store.
    pub fn clean() -> Self {
        let mut magic = [0; 9];
        magic.copy_from_slice(MAGIC);
        PersistHeader {
            magic,
            version: VERSION,
            journal_state: 0,
            journal_size: 0,
        }
    }

    /// A header describing a journal of `elements` elements awaiting
    /// replay.
    pub fn journaled(elements: u32) -> Self {
        let mut header = PersistHeader::clean();
        header.journal_state = JOURNAL_VALID;
        header.journal_size = elements;
        header
    }

    /// Whether the journal-valid marker is present.
    pub fn journal_valid(&self) -> bool {
        self.journal_state == JOURNAL_VALID
    }

    /// Number of journaled elements, meaningful only when
    /// [`journal_valid`](Self::journal_valid) holds.
    pub fn journal_size(&self) -> u32 {
        self.journal_size
    }

    /// Serializes the header into one checksummed block.
    pub fn pack(&self) -> Result<Box<[u8]>> {
        let mut data = Vec::with_capacity(BLOCK_SIZE);
        serialize_into(&mut data, self)?;
        data.resize(BLOCK_SIZE, 0);
        stamp_block_trailer(&mut data);
        Ok(data.into_boxed_slice())
    }

    /// Deserializes and validates a header block.
    pub fn unpack(block: &[u8]) -> Result<PersistHeader> {
        if block.len() != BLOCK_SIZE {
            bail!(ErrorKind::InvalidHeader);
        }
        verify_block_trailer(block)?;
        let this: PersistHeader = deserialize(&block[..BLOCK_BODY_SIZE])?;
        if this.magic != MAGIC || this.version != VERSION {
            bail!(ErrorKind::InvalidHeader);
        }
        Ok(this)
    }
}
