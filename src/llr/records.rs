//! Full record delivery: filling decided block and epoch indexes.
//!
//! A record may only be applied once its index is decided and its hash
//! matches the winner. The record itself carries no signatures; the
//! aggregated votes are its authentication.

use serde::{Deserialize, Serialize};

use crate::config::Timestamp;
use crate::event::{BlockIdx, Epoch, EventId, Transaction};
use crate::store::decided::{Block, BlockState, EpochState};
use crate::store::Store;
use crate::Hash;

use super::{actualize_lowest_index, LlrError, LlrImportError};

/// Everything needed to reconstruct one block without replaying consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBlockRecord {
    pub idx: BlockIdx,
    pub time: Timestamp,
    pub atropos: EventId,
    pub txs: Vec<Transaction>,
    pub gas_used: u64,
    pub root: Hash,
}

impl FullBlockRecord {
    /// The hash block votes commit to.
    pub fn hash(&self) -> Hash {
        let encoded = crate::serialize(self).expect("block record is serializable");
        crate::hash_domain(b"aphelion.llr.block_record", &encoded)
    }
}

/// The `(block_state, epoch_state)` pair that sealed one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullEpochRecord {
    pub epoch: Epoch,
    pub block_state: BlockState,
    pub epoch_state: EpochState,
}

impl FullEpochRecord {
    /// The hash epoch votes commit to.
    pub fn hash(&self) -> Hash {
        let encoded = crate::serialize(self).expect("epoch record is serializable");
        crate::hash_domain(b"aphelion.llr.epoch_record", &encoded)
    }
}

/// Persist a block record: the block itself and its atropos index.
/// Transactions are split the way block processing splits them, so a
/// record-filled block is indistinguishable from a locally-processed one.
pub fn write_full_block_record(store: &Store, record: &FullBlockRecord) -> Result<(), LlrImportError> {
    let mut txs = Vec::new();
    let mut internal_txs = Vec::new();
    for tx in &record.txs {
        if tx.is_internal() {
            internal_txs.push(tx.hash());
        } else {
            txs.push(tx.hash());
        }
    }
    store.set_block(
        record.idx,
        &Block {
            time: record.time,
            atropos: record.atropos,
            txs,
            internal_txs,
            skipped_txs: Vec::new(),
            gas_used: record.gas_used,
            root: record.root,
        },
    )?;
    store.set_block_index(&record.atropos, record.idx)?;
    Ok(())
}

/// Apply a decided block record.
pub fn process_full_block_record(
    store: &Store,
    record: &FullBlockRecord,
) -> Result<(), LlrImportError> {
    if store.has_block(record.idx)? {
        return Err(LlrError::AlreadyProcessedBr(record.idx).into());
    }
    let winner = store
        .get_llr_block_result(record.idx)?
        .ok_or(LlrError::UndecidedBr(record.idx))?;
    if record.hash() != winner {
        return Err(LlrError::BlockRecordHashMismatch(record.idx).into());
    }
    write_full_block_record(store, record)?;

    let mut llr_state = store.get_llr_state()?;
    llr_state.lowest_block_to_fill =
        actualize_lowest_index(llr_state.lowest_block_to_fill, record.idx, |idx| {
            Ok::<_, LlrImportError>(store.has_block(idx)?)
        })?;
    store.set_llr_state(llr_state);
    Ok(())
}

/// Apply a decided epoch record.
pub fn process_full_epoch_record(
    store: &Store,
    record: &FullEpochRecord,
) -> Result<(), LlrImportError> {
    if store.has_history_states(record.epoch)? {
        return Err(LlrError::AlreadyProcessedEr(record.epoch).into());
    }
    let winner = store
        .get_llr_epoch_result(record.epoch)?
        .ok_or(LlrError::UndecidedEr(record.epoch))?;
    if record.hash() != winner {
        return Err(LlrError::EpochRecordHashMismatch(record.epoch).into());
    }
    store.set_history_states(record.epoch, &record.block_state, &record.epoch_state)?;
    store.set_epoch_block(record.block_state.last_block + 1, record.epoch)?;

    let mut llr_state = store.get_llr_state()?;
    let advanced = actualize_lowest_index(
        llr_state.lowest_epoch_to_fill as u64,
        record.epoch as u64,
        |idx| Ok::<_, LlrImportError>(store.has_history_states(idx as Epoch)?),
    )?;
    llr_state.lowest_epoch_to_fill = advanced as Epoch;
    store.set_llr_state(llr_state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llr::LlrState;

    fn sample_record(idx: BlockIdx) -> FullBlockRecord {
        FullBlockRecord {
            idx,
            time: 1000,
            atropos: EventId([idx as u8; 32]),
            txs: vec![
                Transaction {
                    gas_price: 0,
                    gas_limit: 0,
                    payload: b"internal".to_vec(),
                },
                Transaction {
                    gas_price: 10,
                    gas_limit: 21_000,
                    payload: b"user".to_vec(),
                },
            ],
            gas_used: 21_000,
            root: [9u8; 32],
        }
    }

    #[test]
    fn undecided_record_deferred() {
        let store = Store::open_temporary().unwrap();
        store.set_llr_state(LlrState::new(100, 1));
        assert!(matches!(
            process_full_block_record(&store, &sample_record(100)),
            Err(LlrImportError::Llr(LlrError::UndecidedBr(100)))
        ));
    }

    #[test]
    fn wrong_hash_rejected_matching_hash_fills() {
        let store = Store::open_temporary().unwrap();
        store.set_llr_state(LlrState::new(100, 1));
        let record = sample_record(100);

        store.set_llr_block_result(100, &[0u8; 32]).unwrap();
        assert!(matches!(
            process_full_block_record(&store, &record),
            Err(LlrImportError::Llr(LlrError::BlockRecordHashMismatch(100)))
        ));

        store.set_llr_block_result(100, &record.hash()).unwrap();
        process_full_block_record(&store, &record).unwrap();

        let block = store.get_block(100).unwrap().unwrap();
        assert_eq!(block.atropos, record.atropos);
        assert_eq!(block.txs.len(), 1);
        assert_eq!(block.internal_txs.len(), 1);
        assert_eq!(store.get_block_index(&record.atropos).unwrap(), Some(100));
        assert_eq!(store.get_llr_state().unwrap().lowest_block_to_fill, 101);

        // a second delivery is a duplicate
        assert!(matches!(
            process_full_block_record(&store, &record),
            Err(LlrImportError::Llr(LlrError::AlreadyProcessedBr(100)))
        ));
    }

    #[test]
    fn epoch_record_fill() {
        let store = Store::open_temporary().unwrap();
        store.set_llr_state(LlrState::new(1, 2));
        let record = FullEpochRecord {
            epoch: 2,
            block_state: BlockState {
                last_block: 50,
                ..Default::default()
            },
            epoch_state: EpochState {
                epoch: 2,
                ..Default::default()
            },
        };
        store.set_llr_epoch_result(2, &record.hash()).unwrap();
        process_full_epoch_record(&store, &record).unwrap();
        assert!(store.has_history_states(2).unwrap());
        assert_eq!(store.get_llr_state().unwrap().lowest_epoch_to_fill, 3);
        assert!(matches!(
            process_full_epoch_record(&store, &record),
            Err(LlrImportError::Llr(LlrError::AlreadyProcessedEr(2)))
        ));
    }
}
