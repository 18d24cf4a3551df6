//! The transaction buffer and its state machine.
//!
//! One global transaction exists at a time. Elements are staged in a
//! fixed-capacity buffer; each element serializes to one entry image of
//! [`BLOCKS_PER_ENTRY`] checksummed blocks, which is both what the journal
//! stages and what the commit writes to the entry's live location.

use super::errors::*;
use super::layout::{EntryId, BLOCKS_PER_ENTRY, DATA_BYTES_PER_ENTRY, TRAN_ENTRY_MAX};
use crate::checksum::{block_body, stamp_block_trailer, verify_block_trailer, BLOCK_BODY_SIZE};
use crate::vdev::BLOCK_SIZE;
use bincode::{deserialize, serialize_into};

/// The transaction (and recovery) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranState {
    /// No transaction open.
    Invalid,
    /// Open and accepting elements.
    Pending,
    /// Commit started; journal being written.
    Journal,
    /// Journal durable; header being marked valid.
    WriteHeader,
    /// Elements being written to their live locations.
    Commit,
    /// Header being rewritten without the valid marker.
    InvalidateJournal,
    /// Startup: header being read.
    ReadHeader,
    /// Startup: a valid journal being replayed.
    ReplayJournal,
    /// Startup: bitmap being rebuilt from live entries.
    RebuildBitmap,
}

/// Operation tag of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElemOp {
    /// A fresh entry; its slot was allocated by this transaction.
    Write,
    /// An overwrite of an existing entry.
    Modify,
    /// Deletion; the live entry becomes all zero.
    Delete,
}

/// The header block of one entry image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElemHeader {
    /// Operation tag.
    pub op: ElemOp,
    /// The entry this element targets.
    pub entry_id: EntryId,
    /// Payload bytes in the data blocks.
    pub data_length: u32,
    /// Nonzero for a live entry; a zeroed header block never validates its
    /// checksum, so region scans treat it as free.
    pub valid: u32,
}

/// One staged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranElement {
    /// The element header, as serialized into the image's header block.
    pub header: ElemHeader,
    /// The payload, `data_length` bytes.
    pub payload: Vec<u8>,
}

impl TranElement {
    /// Serializes the element into its entry image of `BLOCKS_PER_ENTRY`
    /// checksummed blocks.
    pub fn to_blocks(&self) -> Result<Box<[u8]>> {
        let mut image = vec![0u8; BLOCKS_PER_ENTRY as usize * BLOCK_SIZE];
        {
            let (header_block, data_blocks) = image.split_at_mut(BLOCK_SIZE);
            let mut cursor = &mut header_block[..BLOCK_BODY_SIZE];
            serialize_into(&mut cursor, &self.header)?;
            data_blocks
                .chunks_mut(BLOCK_SIZE)
                .zip(self.payload.chunks(BLOCK_BODY_SIZE))
                .for_each(|(block, chunk)| block[..chunk.len()].copy_from_slice(chunk));
        }
        for block in image.chunks_mut(BLOCK_SIZE) {
            stamp_block_trailer(block);
        }
        Ok(image.into_boxed_slice())
    }

    /// Parses an entry image back into an element, verifying every block
    /// trailer.
    pub fn from_blocks(image: &[u8]) -> Result<TranElement> {
        if image.len() != BLOCKS_PER_ENTRY as usize * BLOCK_SIZE {
            bail!(ErrorKind::ContractViolation("short entry image".into()));
        }
        for block in image.chunks(BLOCK_SIZE) {
            verify_block_trailer(block)?;
        }
        let header: ElemHeader = deserialize(block_body(&image[..BLOCK_SIZE]))?;
        if header.data_length as usize > DATA_BYTES_PER_ENTRY {
            bail!(ErrorKind::ContractViolation("oversized element".into()));
        }
        let mut payload = Vec::with_capacity(header.data_length as usize);
        let mut remaining = header.data_length as usize;
        for block in image[BLOCK_SIZE..].chunks(BLOCK_SIZE) {
            let take = remaining.min(BLOCK_BODY_SIZE);
            payload.extend_from_slice(&block_body(block)[..take]);
            remaining -= take;
        }
        Ok(TranElement { header, payload })
    }
}

/// The single global transaction slot.
#[derive(Debug)]
pub struct Transaction {
    handle: u64,
    state: TranState,
    elements: Vec<TranElement>,
    committed: usize,
}

impl Transaction {
    /// Creates the slot in the `Invalid` state.
    pub fn new() -> Self {
        Transaction {
            handle: 0,
            state: TranState::Invalid,
            elements: Vec::with_capacity(TRAN_ENTRY_MAX),
            committed: 0,
        }
    }

    /// The current state.
    pub fn state(&self) -> TranState {
        self.state
    }

    /// Moves the state machine; the engine drives legal transitions only.
    pub fn set_state(&mut self, state: TranState) {
        trace!("transaction {:#x}: {:?} -> {:?}", self.handle, self.state, state);
        self.state = state;
    }

    /// The open transaction's handle, zero when none is open.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// The staged elements.
    pub fn elements(&self) -> &[TranElement] {
        &self.elements
    }

    /// Elements already written to their live locations during commit.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Records one more element as durable at its live location.
    pub fn advance_committed(&mut self) {
        self.committed += 1;
    }

    /// Opens the transaction. Fails with `Busy` when one is already open.
    pub fn start(&mut self, handle: u64) -> Result<()> {
        if self.state != TranState::Invalid {
            bail!(ErrorKind::Busy);
        }
        debug_assert_ne!(handle, 0);
        self.handle = handle;
        self.state = TranState::Pending;
        self.elements.clear();
        self.committed = 0;
        Ok(())
    }

    /// Validates that `handle` names the open, still-pending transaction.
    pub fn check_pending(&self, handle: u64) -> Result<()> {
        if self.state != TranState::Pending {
            bail!(ErrorKind::InvalidState(format!(
                "expected a pending transaction, found {:?}",
                self.state
            )));
        }
        if self.handle != handle {
            bail!(ErrorKind::WrongTransaction);
        }
        Ok(())
    }

    /// Stages one element.
    pub fn push(&mut self, op: ElemOp, entry_id: EntryId, payload: Vec<u8>) -> Result<()> {
        if self.state != TranState::Pending {
            bail!(ErrorKind::InvalidState(
                "element staged outside a pending transaction".into()
            ));
        }
        if self.elements.len() >= TRAN_ENTRY_MAX {
            bail!(ErrorKind::TransactionFull);
        }
        if payload.len() > DATA_BYTES_PER_ENTRY {
            bail!(ErrorKind::ContractViolation(format!(
                "{} byte payload exceeds the {} byte entry",
                payload.len(),
                DATA_BYTES_PER_ENTRY
            )));
        }
        self.elements.push(TranElement {
            header: ElemHeader {
                op,
                entry_id,
                data_length: payload.len() as u32,
                valid: 1,
            },
            payload,
        });
        Ok(())
    }

    /// Loads replayed journal elements into the slot for a resumed commit.
    pub fn load_for_replay(&mut self, handle: u64, elements: Vec<TranElement>) {
        self.handle = handle;
        self.elements = elements;
        self.committed = 0;
        self.state = TranState::Journal;
    }

    /// Resets the slot to `Invalid`, dropping all staged elements.
    pub fn reset(&mut self) {
        self.handle = 0;
        self.state = TranState::Invalid;
        self.elements.clear();
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::layout::{EntryAddress, SectorType};

    fn id(offset: u32) -> EntryId {
        EntryId::encode(EntryAddress {
            sector: SectorType::Objects,
            offset,
        })
    }

    #[test]
    fn element_image_round_trips() {
        let payload: Vec<u8> = (0..5000).map(|x| x as u8).collect();
        let elem = TranElement {
            header: ElemHeader {
                op: ElemOp::Modify,
                entry_id: id(3),
                data_length: 5000,
                valid: 1,
            },
            payload: payload.clone(),
        };
        let image = elem.to_blocks().unwrap();
        assert_eq!(image.len(), BLOCKS_PER_ENTRY as usize * BLOCK_SIZE);
        let back = TranElement::from_blocks(&image).unwrap();
        assert_eq!(back, elem);
    }

    #[test]
    fn zeroed_image_does_not_parse() {
        let image = vec![0u8; BLOCKS_PER_ENTRY as usize * BLOCK_SIZE];
        assert!(TranElement::from_blocks(&image).is_err());
    }

    #[test]
    fn capacity_and_state_are_enforced() {
        let mut tran = Transaction::new();
        assert!(tran.push(ElemOp::Write, id(0), vec![1]).is_err());
        tran.start(1).unwrap();
        assert!(tran.start(2).is_err());
        for i in 0..TRAN_ENTRY_MAX {
            tran.push(ElemOp::Write, id(i as u32), vec![i as u8]).unwrap();
        }
        assert!(tran.push(ElemOp::Write, id(99), vec![0]).is_err());
        assert!(tran
            .push(ElemOp::Write, id(99), vec![0; DATA_BYTES_PER_ENTRY + 1])
            .is_err());
        tran.reset();
        assert_eq!(tran.state(), TranState::Invalid);
        assert!(tran.elements().is_empty());
    }
}
