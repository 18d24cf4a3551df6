//! The transactional record store.
//!
//! A write-ahead-journaled key/value persistence engine over a fixed
//! on-disk layout. All mutations go through the single global transaction:
//! elements are staged in memory, journaled in one batch, and only then
//! written to their live locations, so a crash at any point either replays
//! the whole transaction or none of it.
//!
//! The engine is an owned value: construct it with [`PersistenceEngine::new`],
//! attach a backing device with [`PersistenceEngine::set_lun`], and either
//! [`format`](PersistenceEngine::format) a fresh store or
//! [`recover`](PersistenceEngine::recover) an existing one. Admission is
//! deliberately narrow: one open transaction and one in-flight sector read
//! globally; a second caller gets `Busy` and retries.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::vdev::{Block, Vdev, VdevRead, VdevWrite};

pub mod bitmap;
pub mod errors;
pub mod header;
pub mod layout;
pub mod transaction;

mod journal;

pub use self::layout::{CapacityProfile, EntryAddress, EntryId, SectorType};

use self::bitmap::FreeSpaceBitmap;
use self::errors::*;
use self::header::PersistHeader;
use self::layout::{Layout, BLOCKS_PER_ENTRY, DATA_BYTES_PER_ENTRY};
use self::transaction::{ElemOp, TranState, Transaction};

/// Token naming the open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle(u64);

struct Core {
    tran: Transaction,
    bitmap: FreeSpaceBitmap,
    read_in_flight: bool,
    next_handle: u64,
}

/// The persistence engine over one backing device.
pub struct PersistenceEngine<D> {
    layout: Layout,
    device: Option<D>,
    core: Mutex<Core>,
}

impl<D> PersistenceEngine<D> {
    /// Creates an engine without a backing device.
    pub fn new(profile: CapacityProfile) -> Self {
        let layout = Layout::new(profile);
        PersistenceEngine {
            layout,
            device: None,
            core: Mutex::new(Core {
                tran: Transaction::new(),
                bitmap: FreeSpaceBitmap::new(&layout),
                read_in_flight: false,
                next_handle: 1,
            }),
        }
    }

    /// The layout in use.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// First LBA of the region of `sector`.
    pub fn region_start(&self, sector: SectorType) -> Block<u64> {
        self.layout.region_start_lba(sector)
    }

    /// Total LUN size the engine requires from a provisioning caller.
    pub fn required_lun_size(&self) -> Block<u64> {
        self.layout.required_lun_size()
    }

    /// Detaches and returns the backing device. Fails with `Busy` while a
    /// transaction or read is still in flight; the engine never drops a
    /// device an asynchronous operation may still reference.
    pub fn unset_lun(&mut self) -> Result<D> {
        {
            let core = self.core.lock();
            if core.tran.state() != TranState::Invalid || core.read_in_flight {
                bail!(ErrorKind::Busy);
            }
        }
        self.device.take().ok_or_else(|| ErrorKind::NotInitialized.into())
    }

    fn device(&self) -> Result<&D> {
        self.device.as_ref().ok_or_else(|| ErrorKind::NotInitialized.into())
    }

    fn set_tran_state(&self, state: TranState) {
        self.core.lock().tran.set_state(state);
    }
}

impl<D: VdevRead + VdevWrite> PersistenceEngine<D> {
    /// Attaches the backing device. Fails when it is smaller than
    /// [`required_lun_size`](Self::required_lun_size).
    pub fn set_lun(&mut self, device: D) -> Result<()>
    where
        D: Vdev,
    {
        if device.size() < self.layout.required_lun_size() {
            bail!(ErrorKind::ContractViolation(format!(
                "device {} holds {} blocks, layout requires {}",
                device.id(),
                device.size().as_u64(),
                self.layout.required_lun_size().as_u64()
            )));
        }
        self.device = Some(device);
        Ok(())
    }

    /// Initializes an empty store on the device.
    pub async fn format(&self) -> Result<()> {
        let device = self.device()?;
        {
            let core = self.core.lock();
            if core.tran.state() != TranState::Invalid || core.read_in_flight {
                bail!(ErrorKind::Busy);
            }
        }
        journal::format(device, &self.layout).await?;
        self.core.lock().bitmap.reset();
        Ok(())
    }

    /// Brings an existing store online: replays a valid journal if one is
    /// present, then rebuilds the free-space bitmap from the live entries.
    pub async fn recover(&self) -> Result<()> {
        let device = self.device()?;
        {
            let mut core = self.core.lock();
            if core.tran.state() != TranState::Invalid || core.read_in_flight {
                bail!(ErrorKind::Busy);
            }
            core.tran.set_state(TranState::ReadHeader);
        }
        let result = self.recover_inner(device).await;
        if result.is_err() {
            self.core.lock().tran.reset();
        }
        result
    }

    async fn recover_inner(&self, device: &D) -> Result<()> {
        let header = journal::read_header(device).await?;
        if header.journal_valid() {
            info!(
                "replaying a journal of {} elements",
                header.journal_size()
            );
            let elements = journal::read_journal(device, header.journal_size()).await?;
            {
                let mut core = self.core.lock();
                let handle = core.next_handle;
                core.next_handle += 1;
                core.tran.load_for_replay(handle, elements);
            }
            let elements = {
                let core = self.core.lock();
                core.tran.elements().to_vec()
            };
            self.set_tran_state(TranState::ReplayJournal);
            for element in &elements {
                journal::apply_element(device, &self.layout, element).await?;
                self.core.lock().tran.advance_committed();
            }
            self.set_tran_state(TranState::InvalidateJournal);
            journal::write_header(device, &PersistHeader::clean()).await?;
        }
        self.set_tran_state(TranState::RebuildBitmap);
        let bitmap = journal::rebuild_bitmap(device, &self.layout).await?;
        let mut core = self.core.lock();
        core.bitmap = bitmap;
        core.tran.reset();
        Ok(())
    }

    /// Opens the global transaction. A second open attempt gets `Busy`.
    pub fn start(&self) -> Result<TransactionHandle> {
        self.device()?;
        let mut core = self.core.lock();
        let handle = core.next_handle;
        core.tran.start(handle)?;
        core.next_handle = core.next_handle.wrapping_add(1).max(1);
        Ok(TransactionHandle(handle))
    }

    /// Stages a fresh entry in `sector` and returns its id. The slot is
    /// reserved immediately; an abort releases it again. With
    /// `auto_insert_id` the id is stamped into the first eight payload
    /// bytes, little endian.
    pub fn write_entry(
        &self,
        handle: TransactionHandle,
        sector: SectorType,
        mut data: Vec<u8>,
        auto_insert_id: bool,
    ) -> Result<EntryId> {
        let mut core = self.core.lock();
        core.tran.check_pending(handle.0)?;
        let addr = core.bitmap.allocate(sector)?;
        let id = EntryId::encode(addr);
        let staged = (|| {
            if auto_insert_id {
                if data.len() < 8 {
                    bail!(ErrorKind::ContractViolation(
                        "auto-insert requires at least eight payload bytes".into()
                    ));
                }
                LittleEndian::write_u64(&mut data[..8], id.raw());
            }
            core.tran.push(ElemOp::Write, id, data)
        })();
        match staged {
            Ok(()) => Ok(id),
            Err(e) => {
                // Release the optimistic reservation.
                let _ = core.bitmap.clear(addr);
                Err(e)
            }
        }
    }

    /// Stages an overwrite of the existing entry `id`.
    pub fn modify_entry(
        &self,
        handle: TransactionHandle,
        id: EntryId,
        data: Vec<u8>,
    ) -> Result<()> {
        let addr = id.decode()?;
        let mut core = self.core.lock();
        core.tran.check_pending(handle.0)?;
        if !core.bitmap.exists(addr)? {
            bail!(ErrorKind::DoesNotExist(id.raw()));
        }
        core.tran.push(ElemOp::Modify, id, data)
    }

    /// Stages deletion of the existing entry `id`. The live entry becomes
    /// all zero; its slot is freed only once the commit is fully durable.
    pub fn delete_entry(&self, handle: TransactionHandle, id: EntryId) -> Result<()> {
        let addr = id.decode()?;
        let mut core = self.core.lock();
        core.tran.check_pending(handle.0)?;
        if !core.bitmap.exists(addr)? {
            bail!(ErrorKind::DoesNotExist(id.raw()));
        }
        core.tran.push(ElemOp::Delete, id, vec![0; DATA_BYTES_PER_ENTRY])
    }

    /// Aborts the pending transaction, releasing the slots its fresh
    /// writes reserved. Slots touched by staged modifies and deletes stay
    /// reserved; those entries are still live.
    pub fn abort(&self, handle: TransactionHandle) -> Result<()> {
        let mut core = self.core.lock();
        core.tran.check_pending(handle.0)?;
        let released: Vec<_> = core
            .tran
            .elements()
            .iter()
            .filter(|e| e.header.op == ElemOp::Write)
            .map(|e| e.header.entry_id)
            .collect();
        for id in released {
            core.bitmap.clear(id.decode()?)?;
        }
        core.tran.reset();
        Ok(())
    }

    /// Commits the pending transaction: journal, header, live writes,
    /// header invalidation, strictly in that order. Any I/O failure
    /// invalidates the transaction and surfaces the error; the caller
    /// re-drives the whole transaction.
    pub async fn commit(&self, handle: TransactionHandle) -> Result<()> {
        let device = self.device()?;
        let elements = {
            let mut core = self.core.lock();
            core.tran.check_pending(handle.0)?;
            if core.tran.elements().is_empty() {
                core.tran.reset();
                return Ok(());
            }
            core.tran.set_state(TranState::Journal);
            core.tran.elements().to_vec()
        };

        let result = async {
            journal::write_journal(device, &elements).await?;
            self.set_tran_state(TranState::WriteHeader);
            journal::write_header(device, &PersistHeader::journaled(elements.len() as u32))
                .await?;
            self.set_tran_state(TranState::Commit);
            for element in &elements {
                journal::apply_element(device, &self.layout, element).await?;
                self.core.lock().tran.advance_committed();
            }
            self.set_tran_state(TranState::InvalidateJournal);
            journal::write_header(device, &PersistHeader::clean()).await
        }
        .await;

        let mut core = self.core.lock();
        match result {
            Ok(()) => {
                for element in &elements {
                    if element.header.op == ElemOp::Delete {
                        core.bitmap.clear(element.header.entry_id.decode()?)?;
                    }
                }
                core.tran.reset();
                Ok(())
            }
            Err(e) => {
                error!("commit of transaction {:#x} failed: {}", handle.0, e);
                core.tran.reset();
                Err(e)
            }
        }
    }

    /// Single-shot write: start, stage, commit.
    pub async fn write(
        &self,
        sector: SectorType,
        data: Vec<u8>,
        auto_insert_id: bool,
    ) -> Result<EntryId> {
        let handle = self.start()?;
        match self.write_entry(handle, sector, data, auto_insert_id) {
            Ok(id) => {
                self.commit(handle).await?;
                Ok(id)
            }
            Err(e) => {
                self.abort(handle)?;
                Err(e)
            }
        }
    }

    /// Single-shot modify.
    pub async fn modify(&self, id: EntryId, data: Vec<u8>) -> Result<()> {
        let handle = self.start()?;
        match self.modify_entry(handle, id, data) {
            Ok(()) => self.commit(handle).await,
            Err(e) => {
                self.abort(handle)?;
                Err(e)
            }
        }
    }

    /// Single-shot delete.
    pub async fn delete(&self, id: EntryId) -> Result<()> {
        let handle = self.start()?;
        match self.delete_entry(handle, id) {
            Ok(()) => self.commit(handle).await,
            Err(e) => {
                self.abort(handle)?;
                Err(e)
            }
        }
    }

    /// Whether `id` currently names a live (or reserved) entry.
    pub fn entry_exists(&self, id: EntryId) -> Result<bool> {
        let addr = id.decode()?;
        self.core.lock().bitmap.exists(addr)
    }

    fn admit_read(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.read_in_flight {
            bail!(ErrorKind::Busy);
        }
        core.read_in_flight = true;
        Ok(())
    }

    fn finish_read(&self) {
        self.core.lock().read_in_flight = false;
    }

    /// Reads the payload of entry `id`.
    pub async fn read_entry(&self, id: EntryId) -> Result<Vec<u8>> {
        self.admit_read()?;
        let result = self.read_entry_inner(id).await;
        self.finish_read();
        result
    }

    async fn read_entry_inner(&self, id: EntryId) -> Result<Vec<u8>> {
        let device = self.device()?;
        let addr = id.decode()?;
        if !self.core.lock().bitmap.exists(addr)? {
            bail!(ErrorKind::DoesNotExist(id.raw()));
        }
        self.read_live_entry(device, id).await
    }

    async fn read_live_entry(&self, device: &D, id: EntryId) -> Result<Vec<u8>> {
        let lba = self.layout.entry_lba(id.decode()?)?;
        let bytes = device.read_raw(Block(BLOCKS_PER_ENTRY), lba).await?;
        let element = transaction::TranElement::from_blocks(&bytes)?;
        if element.header.valid == 0
            || element.header.op == ElemOp::Delete
            || element.header.entry_id != id
        {
            bail!(ErrorKind::DoesNotExist(id.raw()));
        }
        Ok(element.payload)
    }

    /// Reads up to `max_entries` live entries of `sector`, starting at the
    /// continuation token `start` (or the start of the sector). Returns
    /// the entries and the token to continue with, or `None` when the
    /// sector is exhausted.
    pub async fn read_sector(
        &self,
        sector: SectorType,
        start: Option<EntryId>,
        max_entries: usize,
    ) -> Result<(Vec<(EntryId, Vec<u8>)>, Option<EntryId>)> {
        self.admit_read()?;
        let result = self.read_sector_inner(sector, start, max_entries).await;
        self.finish_read();
        result
    }

    async fn read_sector_inner(
        &self,
        sector: SectorType,
        start: Option<EntryId>,
        max_entries: usize,
    ) -> Result<(Vec<(EntryId, Vec<u8>)>, Option<EntryId>)> {
        let device = self.device()?;
        let first = match start {
            Some(id) => {
                let addr = id.decode()?;
                if addr.sector != sector {
                    bail!(ErrorKind::ContractViolation(
                        "continuation token names another sector".into()
                    ));
                }
                addr.offset
            }
            None => 0,
        };
        let mut entries = Vec::new();
        for offset in first..self.layout.entry_count(sector) {
            let addr = EntryAddress { sector, offset };
            if entries.len() == max_entries {
                return Ok((entries, Some(EntryId::encode(addr))));
            }
            if !self.core.lock().bitmap.exists(addr)? {
                continue;
            }
            let id = EntryId::encode(addr);
            let payload = self.read_live_entry(device, id).await?;
            entries.push((id, payload));
        }
        Ok((entries, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::journal;
    use super::transaction::{ElemHeader, TranElement};
    use crate::vdev::test::{FailingLeafVdev, FailureMode};
    use futures::executor::block_on;

    fn backing() -> FailingLeafVdev {
        let size = Layout::new(CapacityProfile::Simulation).required_lun_size();
        FailingLeafVdev::new(Block(size.as_u64() as u32), "lun".to_string())
    }

    fn engine() -> (PersistenceEngine<FailingLeafVdev>, FailingLeafVdev) {
        let dev = backing();
        let mut engine = PersistenceEngine::new(CapacityProfile::Simulation);
        engine.set_lun(dev.clone()).unwrap();
        block_on(engine.format()).unwrap();
        (engine, dev)
    }

    #[test]
    fn written_entries_read_back_verbatim() {
        let (engine, _) = engine();
        let payload: Vec<u8> = (0..6000).map(|x| x as u8).collect();
        let id = block_on(engine.write(SectorType::Objects, payload.clone(), false)).unwrap();
        assert_eq!(block_on(engine.read_entry(id)).unwrap(), payload);
        assert!(engine.entry_exists(id).unwrap());
    }

    #[test]
    fn auto_insert_stamps_the_id_into_the_payload() {
        let (engine, _) = engine();
        let id = block_on(engine.write(SectorType::Edges, vec![0u8; 64], true)).unwrap();
        let payload = block_on(engine.read_entry(id)).unwrap();
        let mut expected = [0u8; 8];
        LittleEndian::write_u64(&mut expected, id.raw());
        assert_eq!(&payload[..8], &expected);
    }

    #[test]
    fn a_second_transaction_is_turned_away_busy() {
        let (engine, _) = engine();
        let handle = engine.start().unwrap();
        match engine.start() {
            Err(Error(ErrorKind::Busy, _)) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
        // The open transaction is unharmed.
        engine
            .write_entry(handle, SectorType::Objects, vec![1, 2, 3], false)
            .unwrap();
        block_on(engine.commit(handle)).unwrap();
    }

    #[test]
    fn abort_releases_fresh_slots_but_keeps_live_ones() {
        let (engine, _) = engine();
        let live = block_on(engine.write(SectorType::Objects, vec![7; 32], false)).unwrap();

        let handle = engine.start().unwrap();
        let fresh = engine
            .write_entry(handle, SectorType::Objects, vec![8; 32], false)
            .unwrap();
        engine.delete_entry(handle, live).unwrap();
        assert!(engine.entry_exists(fresh).unwrap());
        engine.abort(handle).unwrap();

        assert!(!engine.entry_exists(fresh).unwrap());
        // The staged delete never committed; the live entry survives.
        assert!(engine.entry_exists(live).unwrap());
        assert_eq!(block_on(engine.read_entry(live)).unwrap(), vec![7; 32]);
    }

    #[test]
    fn empty_commit_succeeds_without_io() {
        let (engine, dev) = engine();
        let before = dev.snapshot();
        let handle = engine.start().unwrap();
        block_on(engine.commit(handle)).unwrap();
        assert_eq!(&dev.snapshot()[..], &before[..]);
        // The slot is free again.
        engine.start().unwrap();
    }

    #[test]
    fn deleted_entries_stop_existing_after_commit() {
        let (engine, _) = engine();
        let id = block_on(engine.write(SectorType::UserData, vec![9; 100], false)).unwrap();
        block_on(engine.delete(id)).unwrap();
        assert!(!engine.entry_exists(id).unwrap());
        assert!(block_on(engine.read_entry(id)).is_err());
        // First fit hands the freed slot out again.
        let next = block_on(engine.write(SectorType::UserData, vec![1], false)).unwrap();
        assert_eq!(next, id);
    }

    #[test]
    fn failed_commit_invalidates_the_transaction() {
        let (engine, dev) = engine();
        let handle = engine.start().unwrap();
        engine
            .write_entry(handle, SectorType::Objects, vec![3; 16], false)
            .unwrap();
        dev.fail_writes(FailureMode::FailOperation);
        assert!(block_on(engine.commit(handle)).is_err());
        dev.fail_writes(FailureMode::NoFail);
        // The slot is free for the caller to re-drive the transaction.
        engine.start().unwrap();
    }

    #[test]
    fn transaction_capacity_is_a_hard_limit() {
        let (engine, _) = engine();
        let handle = engine.start().unwrap();
        for _ in 0..layout::TRAN_ENTRY_MAX {
            engine
                .write_entry(handle, SectorType::Edges, vec![0; 8], false)
                .unwrap();
        }
        match engine.write_entry(handle, SectorType::Edges, vec![0; 8], false) {
            Err(Error(ErrorKind::TransactionFull, _)) => {}
            other => panic!("expected TransactionFull, got {:?}", other),
        }
        engine.abort(handle).unwrap();
        // Every optimistic reservation was released.
        assert_eq!(
            engine.core.lock().bitmap.used(SectorType::Edges),
            0
        );
    }

    #[test]
    fn sector_reads_paginate_with_a_continuation_token() {
        let (engine, _) = engine();
        let mut ids = Vec::new();
        for i in 0..5u8 {
            ids.push(
                block_on(engine.write(SectorType::UserData, vec![i; 10], false)).unwrap(),
            );
        }
        let mut collected = Vec::new();
        let mut token = None;
        loop {
            let (batch, next) =
                block_on(engine.read_sector(SectorType::UserData, token, 2)).unwrap();
            assert!(batch.len() <= 2);
            collected.extend(batch);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(collected.len(), 5);
        assert_eq!(collected.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        assert_eq!(collected[3].1, vec![3; 10]);
    }

    #[test]
    fn operations_without_a_lun_report_not_initialized() {
        let engine: PersistenceEngine<FailingLeafVdev> =
            PersistenceEngine::new(CapacityProfile::Simulation);
        match engine.start() {
            Err(Error(ErrorKind::NotInitialized, _)) => {}
            other => panic!("expected NotInitialized, got {:?}", other.map(|_| ())),
        }
    }

    /// A crash after the journal became durable but before all live writes
    /// finished must be completed by recovery.
    #[test]
    fn interrupted_commit_is_completed_on_recovery() {
        let layout = Layout::new(CapacityProfile::Simulation);
        let dev = backing();
        block_on(journal::format(&dev, &layout)).unwrap();

        let id_a = EntryId::encode(EntryAddress {
            sector: SectorType::Objects,
            offset: 0,
        });
        let id_b = EntryId::encode(EntryAddress {
            sector: SectorType::Objects,
            offset: 1,
        });
        let elem = |id, op, byte: u8| TranElement {
            header: ElemHeader {
                op,
                entry_id: id,
                data_length: 24,
                valid: 1,
            },
            payload: vec![byte; 24],
        };
        // B is already live with its old payload.
        block_on(journal::apply_element(&dev, &layout, &elem(id_b, ElemOp::Write, 0x10)))
            .unwrap();

        // The crash: journal and header are durable, only A's live write
        // happened.
        let elements = vec![elem(id_a, ElemOp::Write, 0x20), elem(id_b, ElemOp::Modify, 0x30)];
        block_on(journal::write_journal(&dev, &elements)).unwrap();
        block_on(journal::write_header(&dev, &PersistHeader::journaled(2))).unwrap();
        block_on(journal::apply_element(&dev, &layout, &elements[0])).unwrap();
        let crash_image = dev.snapshot();

        let mut engine = PersistenceEngine::new(CapacityProfile::Simulation);
        engine.set_lun(dev.clone()).unwrap();
        block_on(engine.recover()).unwrap();

        assert_eq!(block_on(engine.read_entry(id_a)).unwrap(), vec![0x20; 24]);
        assert_eq!(block_on(engine.read_entry(id_b)).unwrap(), vec![0x30; 24]);
        assert!(engine.entry_exists(id_a).unwrap());

        // Replay is idempotent: recovering the crash image again yields the
        // identical on-disk state.
        let recovered_image = dev.snapshot();
        let dev = engine.unset_lun().unwrap();
        dev.restore(&crash_image);
        let mut engine = PersistenceEngine::new(CapacityProfile::Simulation);
        engine.set_lun(dev.clone()).unwrap();
        block_on(engine.recover()).unwrap();
        assert_eq!(&dev.snapshot()[..], &recovered_image[..]);
    }

    #[test]
    fn clean_recovery_rebuilds_the_bitmap_from_live_entries() {
        let (engine, dev) = engine();
        let id = block_on(engine.write(SectorType::SystemGlobal, vec![5; 40], false)).unwrap();
        drop(engine);

        let mut engine = PersistenceEngine::new(CapacityProfile::Simulation);
        engine.set_lun(dev).unwrap();
        block_on(engine.recover()).unwrap();
        assert!(engine.entry_exists(id).unwrap());
        assert_eq!(block_on(engine.read_entry(id)).unwrap(), vec![5; 40]);
        // Allocation never hands out a slot that already exists.
        let fresh = block_on(engine.write(SectorType::SystemGlobal, vec![6], false)).unwrap();
        assert_ne!(fresh, id);
    }
}
