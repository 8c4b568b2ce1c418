//! LLR vote bookkeeping tables: weight accumulators, decided winners,
//! duplicate-delivery markers, and per-validator vote highwaters.

use serde::{Deserialize, Serialize};

use crate::event::{BlockIdx, Epoch, EventId};
use crate::validators::{ValidatorId, ValidatorIdx, Weight};
use crate::Hash;

use super::{Store, StoreError};

/// Accumulated weight for one `(index, vote hash)` pair, with a voter
/// bitset so re-delivered votes never double-count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WeightAcc {
    weight: Weight,
    voters: Vec<u8>,
}

impl WeightAcc {
    fn add(&mut self, voter: ValidatorIdx, total_voters: usize, weight: Weight) -> Weight {
        if self.voters.len() < total_voters.div_ceil(8) {
            self.voters.resize(total_voters.div_ceil(8), 0);
        }
        let byte = voter as usize / 8;
        let bit = 1u8 << (voter % 8);
        if self.voters[byte] & bit == 0 {
            self.voters[byte] |= bit;
            self.weight += weight;
        }
        self.weight
    }
}

fn block_vote_key(block: BlockIdx, epoch: Epoch, vote: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(44);
    key.extend_from_slice(&block.to_be_bytes());
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(vote);
    key
}

fn epoch_vote_key(epoch: Epoch, vote: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(vote);
    key
}

impl Store {
    /// Add `weight` for `(block, epoch, vote)` unless this voter already
    /// counted. Returns the accumulated weight.
    pub fn add_llr_block_vote_weight(
        &self,
        block: BlockIdx,
        epoch: Epoch,
        vote: &Hash,
        voter: ValidatorIdx,
        total_voters: usize,
        weight: Weight,
    ) -> Result<Weight, StoreError> {
        let key = block_vote_key(block, epoch, vote);
        let mut acc: WeightAcc = match self.tables.llr_block_votes.get(&key)? {
            Some(bytes) => crate::deserialize(&bytes)?,
            None => WeightAcc::default(),
        };
        let new_weight = acc.add(voter, total_voters, weight);
        self.tables
            .llr_block_votes
            .insert(key, crate::serialize(&acc)?)?;
        self.bump_dirty();
        Ok(new_weight)
    }

    /// Same accumulation for epoch votes.
    pub fn add_llr_epoch_vote_weight(
        &self,
        epoch: Epoch,
        vote: &Hash,
        voter: ValidatorIdx,
        total_voters: usize,
        weight: Weight,
    ) -> Result<Weight, StoreError> {
        let key = epoch_vote_key(epoch, vote);
        let mut acc: WeightAcc = match self.tables.llr_epoch_votes.get(&key)? {
            Some(bytes) => crate::deserialize(&bytes)?,
            None => WeightAcc::default(),
        };
        let new_weight = acc.add(voter, total_voters, weight);
        self.tables
            .llr_epoch_votes
            .insert(key, crate::serialize(&acc)?)?;
        self.bump_dirty();
        Ok(new_weight)
    }

    // ── decided winners ──

    pub fn set_llr_block_result(&self, block: BlockIdx, vote: &Hash) -> Result<(), StoreError> {
        self.tables
            .llr_block_results
            .insert(block.to_be_bytes(), vote.as_slice())?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_llr_block_result(&self, block: BlockIdx) -> Result<Option<Hash>, StoreError> {
        Ok(self
            .tables
            .llr_block_results
            .get(block.to_be_bytes())?
            .map(|bytes| bytes.as_ref().try_into().unwrap_or([0u8; 32])))
    }

    pub fn set_llr_epoch_result(&self, epoch: Epoch, vote: &Hash) -> Result<(), StoreError> {
        self.tables
            .llr_epoch_results
            .insert(epoch.to_be_bytes(), vote.as_slice())?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_llr_epoch_result(&self, epoch: Epoch) -> Result<Option<Hash>, StoreError> {
        Ok(self
            .tables
            .llr_epoch_results
            .get(epoch.to_be_bytes())?
            .map(|bytes| bytes.as_ref().try_into().unwrap_or([0u8; 32])))
    }

    // ── duplicate-delivery markers ──

    pub fn set_block_votes_seen(
        &self,
        epoch: Epoch,
        last_block: BlockIdx,
        locator_id: &EventId,
    ) -> Result<(), StoreError> {
        let mut key = Vec::with_capacity(44);
        key.extend_from_slice(&epoch.to_be_bytes());
        key.extend_from_slice(&last_block.to_be_bytes());
        key.extend_from_slice(locator_id.as_bytes());
        self.tables.llr_seen_bvs.insert(key, vec![])?;
        self.bump_dirty();
        Ok(())
    }

    pub fn has_block_votes(
        &self,
        epoch: Epoch,
        last_block: BlockIdx,
        locator_id: &EventId,
    ) -> Result<bool, StoreError> {
        let mut key = Vec::with_capacity(44);
        key.extend_from_slice(&epoch.to_be_bytes());
        key.extend_from_slice(&last_block.to_be_bytes());
        key.extend_from_slice(locator_id.as_bytes());
        Ok(self.tables.llr_seen_bvs.contains_key(key)?)
    }

    pub fn set_epoch_vote_seen(
        &self,
        epoch: Epoch,
        locator_id: &EventId,
    ) -> Result<(), StoreError> {
        self.tables
            .llr_seen_evs
            .insert(super::epoch_id_key(epoch, locator_id), vec![])?;
        self.bump_dirty();
        Ok(())
    }

    pub fn has_epoch_vote(&self, epoch: Epoch, locator_id: &EventId) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .llr_seen_evs
            .contains_key(super::epoch_id_key(epoch, locator_id))?)
    }

    // ── per-validator vote highwaters ──

    /// Raise the highest block `validator` has voted on, if higher.
    /// Returns whether it moved. The map mutex guards the read-modify-write.
    pub fn raise_last_bv(
        &self,
        validator: ValidatorId,
        block: BlockIdx,
    ) -> Result<bool, StoreError> {
        let mut map = self.caches.last_bvs.lock().expect("poisoned");
        let current = map.get(&validator).copied().unwrap_or(0);
        if block <= current {
            return Ok(false);
        }
        map.insert(validator, block);
        self.tables
            .last_bvs
            .insert(validator.0.to_be_bytes(), &block.to_be_bytes()[..])?;
        self.bump_dirty();
        Ok(true)
    }

    pub fn get_last_bv(&self, validator: ValidatorId) -> Option<BlockIdx> {
        self.caches
            .last_bvs
            .lock()
            .expect("poisoned")
            .get(&validator)
            .copied()
    }

    /// Raise the highest epoch `validator` has voted on, if higher.
    pub fn raise_last_ev(&self, validator: ValidatorId, epoch: Epoch) -> Result<bool, StoreError> {
        let mut map = self.caches.last_evs.lock().expect("poisoned");
        let current = map.get(&validator).copied().unwrap_or(0);
        if epoch <= current {
            return Ok(false);
        }
        map.insert(validator, epoch);
        self.tables
            .last_evs
            .insert(validator.0.to_be_bytes(), &(epoch as u64).to_be_bytes()[..])?;
        self.bump_dirty();
        Ok(true)
    }

    pub fn get_last_ev(&self, validator: ValidatorId) -> Option<Epoch> {
        self.caches
            .last_evs
            .lock()
            .expect("poisoned")
            .get(&validator)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_accumulates_without_double_count() {
        let store = Store::open_temporary().unwrap();
        let vote = [7u8; 32];
        let w1 = store
            .add_llr_block_vote_weight(100, 1, &vote, 0, 4, 10)
            .unwrap();
        assert_eq!(w1, 10);
        // same voter again: no change
        let w2 = store
            .add_llr_block_vote_weight(100, 1, &vote, 0, 4, 10)
            .unwrap();
        assert_eq!(w2, 10);
        let w3 = store
            .add_llr_block_vote_weight(100, 1, &vote, 3, 4, 5)
            .unwrap();
        assert_eq!(w3, 15);
        // a different vote hash accumulates separately
        let other = store
            .add_llr_block_vote_weight(100, 1, &[8u8; 32], 1, 4, 2)
            .unwrap();
        assert_eq!(other, 2);
    }

    #[test]
    fn results_roundtrip() {
        let store = Store::open_temporary().unwrap();
        assert_eq!(store.get_llr_block_result(5).unwrap(), None);
        store.set_llr_block_result(5, &[1u8; 32]).unwrap();
        assert_eq!(store.get_llr_block_result(5).unwrap(), Some([1u8; 32]));

        store.set_llr_epoch_result(2, &[2u8; 32]).unwrap();
        assert_eq!(store.get_llr_epoch_result(2).unwrap(), Some([2u8; 32]));
    }

    #[test]
    fn seen_markers() {
        let store = Store::open_temporary().unwrap();
        let id = EventId([9u8; 32]);
        assert!(!store.has_block_votes(1, 10, &id).unwrap());
        store.set_block_votes_seen(1, 10, &id).unwrap();
        assert!(store.has_block_votes(1, 10, &id).unwrap());

        assert!(!store.has_epoch_vote(2, &id).unwrap());
        store.set_epoch_vote_seen(2, &id).unwrap();
        assert!(store.has_epoch_vote(2, &id).unwrap());
    }

    #[test]
    fn highwaters_only_rise() {
        let store = Store::open_temporary().unwrap();
        let v = ValidatorId(3);
        assert!(store.raise_last_bv(v, 10).unwrap());
        assert!(!store.raise_last_bv(v, 9).unwrap());
        assert!(store.raise_last_bv(v, 11).unwrap());
        assert_eq!(store.get_last_bv(v), Some(11));

        assert!(store.raise_last_ev(v, 2).unwrap());
        assert!(!store.raise_last_ev(v, 2).unwrap());
        assert_eq!(store.get_last_ev(v), Some(2));
    }
}
