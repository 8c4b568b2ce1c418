//! Decided chain state: blocks, the block/epoch state singletons, and the
//! per-epoch history ring the LLR path reads from.
//!
//! The singletons follow a single-writer/many-reader pattern: the processor
//! replaces whole immutable snapshots; readers get value copies. `set_*`
//! updates only the in-memory snapshot, `flush_*` persists it, and
//! `commit` (see the flush module) calls both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Timestamp;
use crate::event::{BlockIdx, Epoch, EventId};
use crate::validators::{ValidatorId, ValidatorProfile, ValidatorSet};
use crate::Hash;

use super::{decode_u64, Store, StoreError};

const BLOCK_STATE_KEY: &[u8] = b"b";
const EPOCH_STATE_KEY: &[u8] = b"e";
const LLR_STATE_KEY: &[u8] = b"l";
const GENESIS_KEY: &[u8] = b"g";

/// A sealed block record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub time: Timestamp,
    pub atropos: EventId,
    pub txs: Vec<Hash>,
    pub internal_txs: Vec<Hash>,
    pub skipped_txs: Vec<u32>,
    pub gas_used: u64,
    pub root: Hash,
}

/// Per-validator bookkeeping inside [`BlockState`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBlockState {
    pub last_event: Option<EventId>,
    pub uptime: Timestamp,
    pub last_gas_power_left: [u64; 2],
}

/// Per-validator bookkeeping inside [`EpochState`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorEpochState {
    /// The validator's last event of the previous epoch.
    pub prev_epoch_event: Option<EventId>,
    /// Gas refunded at the epoch seal, granted with the first event.
    pub gas_refund: u64,
}

/// State advanced by every sealed block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub last_block: BlockIdx,
    pub epoch_blocks: u64,
    /// Root of the finalized execution state; recovery requires the trie
    /// behind it to be materialized.
    pub finalized_state_root: Hash,
    pub validator_states: Vec<ValidatorBlockState>,
    pub next_validator_profiles: BTreeMap<ValidatorId, ValidatorProfile>,
}

/// State fixed for the duration of one epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochState {
    pub epoch: Epoch,
    pub epoch_start: Timestamp,
    pub prev_epoch_start: Timestamp,
    pub validators: ValidatorSet,
    pub validator_states: Vec<ValidatorEpochState>,
    pub validator_profiles: BTreeMap<ValidatorId, ValidatorProfile>,
}

impl EpochState {
    /// Hash of the epoch state, referenced by events as `prev_epoch_hash`
    /// and voted on by LLR epoch votes.
    pub fn hash(&self) -> Hash {
        let encoded = crate::serialize(self).expect("epoch state is serializable");
        crate::hash_domain(b"aphelion.epoch_state", &encoded)
    }
}

impl Store {
    // ── block records ──

    pub fn set_block(&self, idx: BlockIdx, block: &Block) -> Result<(), StoreError> {
        self.tables
            .blocks
            .insert(idx.to_be_bytes(), crate::serialize(block)?)?;
        self.caches
            .blocks
            .lock()
            .expect("poisoned")
            .put(idx, block.clone());
        self.bump_dirty();
        Ok(())
    }

    pub fn get_block(&self, idx: BlockIdx) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.caches.blocks.lock().expect("poisoned").get(&idx) {
            return Ok(Some(block.clone()));
        }
        let Some(bytes) = self.tables.blocks.get(idx.to_be_bytes())? else {
            return Ok(None);
        };
        let block: Block = crate::deserialize(&bytes)?;
        self.caches
            .blocks
            .lock()
            .expect("poisoned")
            .put(idx, block.clone());
        Ok(Some(block))
    }

    pub fn has_block(&self, idx: BlockIdx) -> Result<bool, StoreError> {
        if self.caches.blocks.lock().expect("poisoned").contains(&idx) {
            return Ok(true);
        }
        Ok(self.tables.blocks.contains_key(idx.to_be_bytes())?)
    }

    /// Index a block by its atropos event id.
    pub fn set_block_index(&self, atropos: &EventId, idx: BlockIdx) -> Result<(), StoreError> {
        self.tables
            .block_index
            .insert(atropos.as_bytes(), &idx.to_be_bytes()[..])?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_block_index(&self, atropos: &EventId) -> Result<Option<BlockIdx>, StoreError> {
        Ok(self
            .tables
            .block_index
            .get(atropos.as_bytes())?
            .map(|bytes| decode_u64(&bytes)))
    }

    // ── singletons ──

    pub fn set_block_state(&self, state: BlockState) {
        *self.caches.block_state.write() = Some(state);
    }

    pub fn get_block_state(&self) -> Result<BlockState, StoreError> {
        if let Some(state) = self.caches.block_state.read().as_ref() {
            return Ok(state.clone());
        }
        let bytes = self
            .tables
            .block_state
            .get(BLOCK_STATE_KEY)?
            .ok_or(StoreError::GenesisNotApplied)?;
        let state: BlockState = crate::deserialize(&bytes)?;
        *self.caches.block_state.write() = Some(state.clone());
        Ok(state)
    }

    pub fn flush_block_state(&self) -> Result<(), StoreError> {
        let state = self.get_block_state()?;
        self.tables
            .block_state
            .insert(BLOCK_STATE_KEY, crate::serialize(&state)?)?;
        Ok(())
    }

    pub fn set_epoch_state(&self, state: EpochState) {
        *self.caches.epoch_state.write() = Some(state);
    }

    pub fn get_epoch_state(&self) -> Result<EpochState, StoreError> {
        if let Some(state) = self.caches.epoch_state.read().as_ref() {
            return Ok(state.clone());
        }
        let bytes = self
            .tables
            .epoch_state
            .get(EPOCH_STATE_KEY)?
            .ok_or(StoreError::GenesisNotApplied)?;
        let mut state: EpochState = crate::deserialize(&bytes)?;
        state.validators.rebuild_indices();
        *self.caches.epoch_state.write() = Some(state.clone());
        Ok(state)
    }

    pub fn flush_epoch_state(&self) -> Result<(), StoreError> {
        let state = self.get_epoch_state()?;
        self.tables
            .epoch_state
            .insert(EPOCH_STATE_KEY, crate::serialize(&state)?)?;
        Ok(())
    }

    /// Replace both singletons at once (recovery and record fill).
    pub fn set_block_epoch_state(&self, block_state: BlockState, epoch_state: EpochState) {
        self.set_block_state(block_state);
        self.set_epoch_state(epoch_state);
    }

    pub fn get_epoch(&self) -> Result<Epoch, StoreError> {
        Ok(self.get_epoch_state()?.epoch)
    }

    pub fn get_validators(&self) -> Result<ValidatorSet, StoreError> {
        Ok(self.get_epoch_state()?.validators)
    }

    pub fn get_latest_block_index(&self) -> Result<BlockIdx, StoreError> {
        Ok(self.get_block_state()?.last_block)
    }

    // ── history ring ──

    /// Record the `(block_state, epoch_state)` pair that closed `epoch`.
    pub fn set_history_states(
        &self,
        epoch: Epoch,
        block_state: &BlockState,
        epoch_state: &EpochState,
    ) -> Result<(), StoreError> {
        self.tables.history_states.insert(
            epoch.to_be_bytes(),
            crate::serialize(&(block_state, epoch_state))?,
        )?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_history_states(
        &self,
        epoch: Epoch,
    ) -> Result<Option<(BlockState, EpochState)>, StoreError> {
        let Some(bytes) = self.tables.history_states.get(epoch.to_be_bytes())? else {
            return Ok(None);
        };
        let (block_state, mut epoch_state): (BlockState, EpochState) =
            crate::deserialize(&bytes)?;
        epoch_state.validators.rebuild_indices();
        Ok(Some((block_state, epoch_state)))
    }

    pub fn has_history_states(&self, epoch: Epoch) -> Result<bool, StoreError> {
        Ok(self.tables.history_states.contains_key(epoch.to_be_bytes())?)
    }

    /// Only the epoch state of the history pair, used to resolve vote
    /// weights for past epochs.
    pub fn get_history_epoch_state(&self, epoch: Epoch) -> Result<Option<EpochState>, StoreError> {
        Ok(self.get_history_states(epoch)?.map(|(_, es)| es))
    }

    /// Map the first block of an epoch to that epoch.
    pub fn set_epoch_block(&self, block: BlockIdx, epoch: Epoch) -> Result<(), StoreError> {
        self.tables
            .epoch_blocks
            .insert(block.to_be_bytes(), &epoch.to_be_bytes()[..])?;
        self.bump_dirty();
        Ok(())
    }

    // ── genesis marker ──

    pub fn set_genesis_atropos(&self, atropos: &EventId) -> Result<(), StoreError> {
        self.tables.genesis.insert(GENESIS_KEY, atropos.as_bytes().as_slice())?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_genesis_atropos(&self) -> Result<Option<EventId>, StoreError> {
        Ok(self
            .tables
            .genesis
            .get(GENESIS_KEY)?
            .map(|bytes| EventId(bytes.as_ref().try_into().unwrap_or([0u8; 32]))))
    }

    // ── llr state singleton ──

    pub fn set_llr_state(&self, state: crate::llr::LlrState) {
        *self.caches.llr_state.write() = Some(state);
    }

    pub fn get_llr_state(&self) -> Result<crate::llr::LlrState, StoreError> {
        if let Some(state) = self.caches.llr_state.read().as_ref() {
            return Ok(*state);
        }
        let bytes = self
            .tables
            .llr_state
            .get(LLR_STATE_KEY)?
            .ok_or(StoreError::GenesisNotApplied)?;
        let state: crate::llr::LlrState = crate::deserialize(&bytes)?;
        *self.caches.llr_state.write() = Some(state);
        Ok(state)
    }

    pub fn flush_llr_state(&self) -> Result<(), StoreError> {
        let state = self.get_llr_state()?;
        self.tables
            .llr_state
            .insert(LLR_STATE_KEY, crate::serialize(&state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llr::LlrState;

    fn sample_states() -> (BlockState, EpochState) {
        let validators = ValidatorSet::from_weights([(ValidatorId(1), 10), (ValidatorId(2), 20)]);
        (
            BlockState {
                last_block: 7,
                epoch_blocks: 3,
                finalized_state_root: [1u8; 32],
                validator_states: vec![ValidatorBlockState::default(); 2],
                next_validator_profiles: BTreeMap::new(),
            },
            EpochState {
                epoch: 4,
                epoch_start: 1000,
                prev_epoch_start: 500,
                validators,
                validator_states: vec![ValidatorEpochState::default(); 2],
                validator_profiles: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn unapplied_genesis_is_an_error() {
        let store = Store::open_temporary().unwrap();
        assert!(matches!(
            store.get_block_state(),
            Err(StoreError::GenesisNotApplied)
        ));
    }

    #[test]
    fn singletons_survive_flush_and_reopen_cache_drop() {
        let store = Store::open_temporary().unwrap();
        let (bs, es) = sample_states();
        store.set_block_epoch_state(bs.clone(), es.clone());
        store.flush_block_state().unwrap();
        store.flush_epoch_state().unwrap();

        // drop the caches, forcing a db read
        *store.caches.block_state.write() = None;
        *store.caches.epoch_state.write() = None;
        assert_eq!(store.get_block_state().unwrap(), bs);
        let loaded = store.get_epoch_state().unwrap();
        assert_eq!(loaded.epoch, es.epoch);
        assert_eq!(loaded.validators.idx_of(ValidatorId(2)), Some(0));
        assert_eq!(store.get_epoch().unwrap(), 4);
    }

    #[test]
    fn history_ring_roundtrip() {
        let store = Store::open_temporary().unwrap();
        let (bs, es) = sample_states();
        store.set_history_states(4, &bs, &es).unwrap();
        assert!(store.has_history_states(4).unwrap());
        assert!(!store.has_history_states(5).unwrap());
        let (loaded_bs, loaded_es) = store.get_history_states(4).unwrap().unwrap();
        assert_eq!(loaded_bs.last_block, bs.last_block);
        assert_eq!(loaded_es.validators.total_weight(), 30);
    }

    #[test]
    fn blocks_roundtrip() {
        let store = Store::open_temporary().unwrap();
        let block = Block {
            time: 9,
            atropos: EventId([3u8; 32]),
            txs: vec![[4u8; 32]],
            internal_txs: vec![],
            skipped_txs: vec![],
            gas_used: 21_000,
            root: [5u8; 32],
        };
        store.set_block(12, &block).unwrap();
        store.set_block_index(&block.atropos, 12).unwrap();
        assert_eq!(store.get_block(12).unwrap().unwrap(), block);
        assert!(store.has_block(12).unwrap());
        assert_eq!(store.get_block_index(&block.atropos).unwrap(), Some(12));
    }

    #[test]
    fn llr_state_roundtrip() {
        let store = Store::open_temporary().unwrap();
        store.set_llr_state(LlrState::new(1, 2));
        store.flush_llr_state().unwrap();
        *store.caches.llr_state.write() = None;
        assert_eq!(store.get_llr_state().unwrap(), LlrState::new(1, 2));
    }
}
