//! Genesis: deterministic reconstruction of state at block 0 and the
//! epoch-1 boundary.
//!
//! Application runs in two stages. The epoch-0 stage applies the EVM
//! genesis image (delegated to the block-processing collaborator) and
//! persists any pre-ordained blocks. The epoch-1 stage executes the three
//! internal-transaction batches (genesis-internal, pre-internal,
//! post-internal), sealing the first epoch between pre and post, then
//! synthesizes the block-0 record around a deterministically derived
//! atropos id.
//!
//! Re-applying over a non-empty store performs no writes: the stored
//! atropos is compared against a recomputation, and a divergence is fatal.

pub mod file;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Rules, Timestamp};
use crate::event::builder::EventBuilder;
use crate::event::{BlockIdx, Epoch, EventId, Transaction};
use crate::llr::LlrState;
use crate::store::decided::{
    Block, BlockState, EpochState, ValidatorEpochState,
};
use crate::store::{Store, StoreError};
use crate::validators::{ValidatorId, ValidatorProfile, ValidatorSet};
use crate::Hash;

/// Transaction rewrites baked into exported genesis files: two historical
/// blocks carry a transaction whose recovered sender must be replaced with
/// a fixed address (fork-proofing artifacts). These are data-migration
/// constants for the genesis exporter only; the normal validation path
/// never consults them.
pub const FORK_PROOF_TX_FIXES: [ForkProofTxFix; 2] = [
    ForkProofTxFix {
        block: 4_738_821,
        tx_offset: 2,
        sender: [
            0x1a, 0x78, 0x2e, 0xf3, 0x9c, 0x50, 0x43, 0xf9, 0x71, 0x4e, 0xa2, 0x5c, 0x5a, 0x49,
            0x12, 0x5a, 0x3f, 0x60, 0x8d, 0x21,
        ],
    },
    ForkProofTxFix {
        block: 4_801_307,
        tx_offset: 1,
        sender: [
            0x1a, 0x78, 0x2e, 0xf3, 0x9c, 0x50, 0x43, 0xf9, 0x71, 0x4e, 0xa2, 0x5c, 0x5a, 0x49,
            0x12, 0x5a, 0x3f, 0x60, 0x8d, 0x21,
        ],
    },
];

/// One fork-proof sender rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkProofTxFix {
    pub block: BlockIdx,
    pub tx_offset: u32,
    pub sender: [u8; 20],
}

/// The fixed sender for a transaction position, if it has one.
pub fn fork_proof_sender(block: BlockIdx, tx_offset: u32) -> Option<[u8; 20]> {
    FORK_PROOF_TX_FIXES
        .iter()
        .find(|fix| fix.block == block && fix.tx_offset == tx_offset)
        .map(|fix| fix.sender)
}

/// Identity of a genesis image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisHeader {
    pub id: Hash,
    pub network_id: u64,
    pub network_name: String,
}

/// A pre-ordained block shipped inside a genesis image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisBlock {
    pub idx: BlockIdx,
    pub time: Timestamp,
    pub atropos: EventId,
    pub txs: Vec<Transaction>,
    pub gas_used: u64,
    pub root: Hash,
}

/// The mutable-state portion of a genesis image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    pub first_epoch: Epoch,
    pub time: Timestamp,
    pub extra_data: Vec<u8>,
    pub validators: BTreeMap<ValidatorId, ValidatorProfile>,
    pub blocks: Vec<GenesisBlock>,
    /// Opaque EVM genesis image, forwarded to the collaborator.
    pub evm_items: Vec<u8>,
}

/// A complete genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub header: GenesisHeader,
    pub rules: Rules,
    pub state: GenesisState,
}

/// Genesis failures. All fatal.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("database contains incompatible genesis (have {stored}, new {new})")]
    Mismatch { stored: EventId, new: EventId },
    #[error("genesis failure: {0}")]
    Failure(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An execution receipt from the block-processing collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    pub gas_used: u64,
}

/// The three internal-transaction batches of the epoch-1 stage, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalTxStage {
    GenesisInternal,
    PreInternal,
    PostInternal,
}

/// Block-processing collaborator driven by the genesis applier. Must be
/// deterministic: re-application recomputes the atropos through the same
/// hooks and compares.
pub trait BlockProc {
    /// Apply the EVM genesis image; returns the state root.
    fn apply_evm_genesis(&mut self, state: &GenesisState) -> Result<Hash, GenesisError>;

    /// Internal transactions for a stage, given the current states.
    fn internal_txs(
        &mut self,
        stage: InternalTxStage,
        block_state: &BlockState,
        epoch_state: &EpochState,
    ) -> Vec<Transaction>;

    /// Execute transactions; returns per-transaction receipts and the
    /// offsets of skipped transactions.
    fn execute(&mut self, txs: &[Transaction]) -> (Vec<Receipt>, Vec<u32>);

    /// Seal the first epoch, producing the epoch-1 states.
    fn seal_epoch(
        &mut self,
        block_state: BlockState,
        epoch_state: EpochState,
    ) -> (BlockState, EpochState);

    /// The state root after everything executed.
    fn finalize(&mut self) -> Hash;
}

/// Apply a genesis to the store. Returns the genesis atropos and whether
/// anything was written (`false` means the store already matched).
pub fn apply_genesis(
    store: &Store,
    genesis: &Genesis,
    block_proc: &mut dyn BlockProc,
) -> Result<(EventId, bool), GenesisError> {
    if let Some(stored) = store.get_genesis_atropos()? {
        let recomputed = calc_genesis_atropos(genesis, block_proc)?;
        if stored != recomputed {
            return Err(GenesisError::Mismatch {
                stored,
                new: recomputed,
            });
        }
        return Ok((stored, false));
    }
    let atropos = apply_epoch1_genesis(store, genesis, block_proc)?;
    store.commit()?;
    Ok((atropos, true))
}

/// Recompute the genesis atropos without touching the live store, by
/// replaying the full application against a throwaway store.
fn calc_genesis_atropos(
    genesis: &Genesis,
    block_proc: &mut dyn BlockProc,
) -> Result<EventId, GenesisError> {
    let scratch = Store::open_temporary()?;
    apply_epoch1_genesis(&scratch, genesis, block_proc)
}

fn apply_epoch0_genesis(store: &Store, genesis: &Genesis) -> Result<(), GenesisError> {
    let mut highest_block = 0;
    for block in &genesis.state.blocks {
        store.set_block(
            block.idx,
            &Block {
                time: block.time,
                atropos: block.atropos,
                txs: block.txs.iter().filter(|tx| !tx.is_internal()).map(Transaction::hash).collect(),
                internal_txs: block
                    .txs
                    .iter()
                    .filter(|tx| tx.is_internal())
                    .map(Transaction::hash)
                    .collect(),
                skipped_txs: Vec::new(),
                gas_used: block.gas_used,
                root: block.root,
            },
        )?;
        store.set_block_index(&block.atropos, block.idx)?;
        highest_block = highest_block.max(block.idx);
    }

    store.set_block_state(BlockState {
        last_block: highest_block,
        epoch_blocks: 0,
        finalized_state_root: [0u8; 32],
        validator_states: Vec::new(),
        next_validator_profiles: genesis.state.validators.clone(),
    });
    store.set_epoch_state(EpochState {
        epoch: genesis.state.first_epoch - 1,
        epoch_start: genesis.state.time - 1,
        prev_epoch_start: genesis.state.time.saturating_sub(2),
        validators: ValidatorSet::default(),
        validator_states: Vec::new(),
        validator_profiles: BTreeMap::new(),
    });
    Ok(())
}

fn apply_epoch1_genesis(
    store: &Store,
    genesis: &Genesis,
    block_proc: &mut dyn BlockProc,
) -> Result<EventId, GenesisError> {
    apply_epoch0_genesis(store, genesis)?;
    block_proc.apply_evm_genesis(&genesis.state)?;

    let mut block_state = store.get_block_state()?;
    let mut epoch_state = store.get_epoch_state()?;
    let block_idx = block_state.last_block;
    let mut all_internal = Vec::new();
    let mut gas_used = 0u64;

    let mut run_stage = |stage: InternalTxStage,
                         block_state: &BlockState,
                         epoch_state: &EpochState,
                         block_proc: &mut dyn BlockProc|
     -> Result<Vec<Transaction>, GenesisError> {
        let txs = block_proc.internal_txs(stage, block_state, epoch_state);
        let (receipts, skipped) = block_proc.execute(&txs);
        if !skipped.is_empty() {
            return Err(GenesisError::Failure("genesis transaction is skipped".into()));
        }
        for receipt in &receipts {
            if !receipt.success {
                return Err(GenesisError::Failure("genesis transaction reverted".into()));
            }
            gas_used += receipt.gas_used;
        }
        Ok(txs)
    };

    all_internal.extend(run_stage(
        InternalTxStage::GenesisInternal,
        &block_state,
        &epoch_state,
        block_proc,
    )?);
    all_internal.extend(run_stage(
        InternalTxStage::PreInternal,
        &block_state,
        &epoch_state,
        block_proc,
    )?);

    // seal the first epoch between the pre and post batches
    let (sealed_block_state, sealed_epoch_state) =
        block_proc.seal_epoch(block_state, epoch_state);
    block_state = sealed_block_state;
    epoch_state = sealed_epoch_state;
    store.set_epoch_state(epoch_state.clone());
    store.set_history_states(epoch_state.epoch, &block_state, &epoch_state)?;

    all_internal.extend(run_stage(
        InternalTxStage::PostInternal,
        &block_state,
        &epoch_state,
        block_proc,
    )?);

    let root = block_proc.finalize();
    let atropos = genesis_atropos(&root, genesis);

    store.set_block(
        block_idx,
        &Block {
            time: genesis.state.time,
            atropos,
            txs: Vec::new(),
            internal_txs: all_internal.iter().map(Transaction::hash).collect(),
            skipped_txs: Vec::new(),
            gas_used,
            root,
        },
    )?;
    store.set_block_index(&atropos, block_idx)?;

    block_state.finalized_state_root = root;
    store.set_block_state(block_state.clone());
    store.set_llr_state(LlrState::new(
        block_state.last_block + 1,
        epoch_state.epoch + 1,
    ));
    store.set_genesis_atropos(&atropos)?;
    Ok(atropos)
}

/// The deterministic genesis atropos id: an unsigned synthetic event at
/// epoch 0 whose extra data commits to the final state root.
fn genesis_atropos(root: &Hash, genesis: &Genesis) -> EventId {
    let mut extra = Vec::with_capacity(32 + genesis.state.extra_data.len());
    extra.extend_from_slice(root);
    extra.extend_from_slice(&genesis.state.extra_data);
    EventBuilder::new()
        .epoch(0)
        .lamport(genesis.rules.dag.max_epoch_blocks as u32)
        .creation_time(genesis.state.time)
        .extra(extra)
        .build()
        .id()
}

/// A deterministic block-processing implementation for fakenet and tests:
/// no internal transactions, sealing installs the genesis validators with
/// an epoch starting at the genesis time.
pub struct FakeBlockProc {
    state_seed: Hash,
}

impl FakeBlockProc {
    pub fn new() -> Self {
        FakeBlockProc {
            state_seed: [0u8; 32],
        }
    }
}

impl Default for FakeBlockProc {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockProc for FakeBlockProc {
    fn apply_evm_genesis(&mut self, state: &GenesisState) -> Result<Hash, GenesisError> {
        self.state_seed = crate::hash_domain(b"aphelion.fake_evm", &state.evm_items);
        Ok(self.state_seed)
    }

    fn internal_txs(
        &mut self,
        _stage: InternalTxStage,
        _block_state: &BlockState,
        _epoch_state: &EpochState,
    ) -> Vec<Transaction> {
        Vec::new()
    }

    fn execute(&mut self, txs: &[Transaction]) -> (Vec<Receipt>, Vec<u32>) {
        (
            txs.iter()
                .map(|tx| Receipt {
                    success: true,
                    gas_used: tx.gas_limit,
                })
                .collect(),
            Vec::new(),
        )
    }

    fn seal_epoch(
        &mut self,
        mut block_state: BlockState,
        epoch_state: EpochState,
    ) -> (BlockState, EpochState) {
        let profiles = std::mem::take(&mut block_state.next_validator_profiles);
        let validators = ValidatorSet::from_weights(
            profiles.iter().map(|(id, profile)| (*id, profile.stake)),
        );
        block_state.validator_states = vec![Default::default(); validators.len()];
        let sealed = EpochState {
            epoch: epoch_state.epoch + 1,
            epoch_start: epoch_state.epoch_start + 1,
            prev_epoch_start: epoch_state.epoch_start,
            validator_states: vec![ValidatorEpochState::default(); validators.len()],
            validators,
            validator_profiles: profiles,
        };
        (block_state, sealed)
    }

    fn finalize(&mut self) -> Hash {
        crate::hash_domain(b"aphelion.fake_evm.final", &self.state_seed)
    }
}

/// A ready-to-use fakenet genesis for `validator_count` equally staked
/// validators with deterministic keys.
pub fn fake_genesis(validator_count: u32, rules: Rules) -> (Genesis, Vec<crate::crypto::SigningKeypair>) {
    let mut validators = BTreeMap::new();
    let mut keypairs = Vec::with_capacity(validator_count as usize);
    for i in 1..=validator_count {
        let mut seed = [0u8; 32];
        seed[0..4].copy_from_slice(&i.to_be_bytes());
        let keypair = crate::crypto::SigningKeypair::from_seed(seed);
        validators.insert(
            ValidatorId(i),
            ValidatorProfile {
                pubkey: keypair.public(),
                stake: 1_000_000,
            },
        );
        keypairs.push(keypair);
    }
    let state = GenesisState {
        first_epoch: 1,
        time: 1_000_000_000,
        extra_data: b"fake".to_vec(),
        validators,
        blocks: Vec::new(),
        evm_items: Vec::new(),
    };
    let genesis = Genesis {
        header: GenesisHeader {
            id: crate::hash_domain(b"aphelion.genesis.id", &crate::serialize(&state).expect("serializable")),
            network_id: rules.network_id,
            network_name: rules.name.clone(),
        },
        rules,
        state,
    };
    (genesis, keypairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_and_reapply() {
        let store = Store::open_temporary().unwrap();
        let (genesis, _) = fake_genesis(3, Rules::fakenet());

        let (atropos, new) = apply_genesis(&store, &genesis, &mut FakeBlockProc::new()).unwrap();
        assert!(new);
        // atropos id carries the synthetic epoch-0 coordinates
        assert_eq!(atropos.epoch(), 0);
        assert_eq!(
            atropos.lamport(),
            Rules::fakenet().dag.max_epoch_blocks as u32
        );

        let epoch_state = store.get_epoch_state().unwrap();
        assert_eq!(epoch_state.epoch, 1);
        assert_eq!(epoch_state.validators.len(), 3);
        assert!(store.get_block(0).unwrap().is_some());
        assert!(store.has_history_states(1).unwrap());
        assert_eq!(store.get_llr_state().unwrap().lowest_block_to_decide, 1);

        // re-application recomputes, compares, and writes nothing
        let (again, new) = apply_genesis(&store, &genesis, &mut FakeBlockProc::new()).unwrap();
        assert!(!new);
        assert_eq!(again, atropos);
    }

    #[test]
    fn mismatched_genesis_rejected() {
        let store = Store::open_temporary().unwrap();
        let (genesis, _) = fake_genesis(3, Rules::fakenet());
        apply_genesis(&store, &genesis, &mut FakeBlockProc::new()).unwrap();

        let (mut other, _) = fake_genesis(3, Rules::fakenet());
        other.state.extra_data = b"different".to_vec();
        assert!(matches!(
            apply_genesis(&store, &other, &mut FakeBlockProc::new()),
            Err(GenesisError::Mismatch { .. })
        ));
    }

    #[test]
    fn failed_internal_tx_aborts() {
        struct RevertingProc(FakeBlockProc);
        impl BlockProc for RevertingProc {
            fn apply_evm_genesis(&mut self, state: &GenesisState) -> Result<Hash, GenesisError> {
                self.0.apply_evm_genesis(state)
            }
            fn internal_txs(
                &mut self,
                stage: InternalTxStage,
                _bs: &BlockState,
                _es: &EpochState,
            ) -> Vec<Transaction> {
                match stage {
                    InternalTxStage::PreInternal => vec![Transaction::default()],
                    _ => Vec::new(),
                }
            }
            fn execute(&mut self, txs: &[Transaction]) -> (Vec<Receipt>, Vec<u32>) {
                (
                    txs.iter()
                        .map(|_| Receipt {
                            success: false,
                            gas_used: 0,
                        })
                        .collect(),
                    Vec::new(),
                )
            }
            fn seal_epoch(
                &mut self,
                bs: BlockState,
                es: EpochState,
            ) -> (BlockState, EpochState) {
                self.0.seal_epoch(bs, es)
            }
            fn finalize(&mut self) -> Hash {
                self.0.finalize()
            }
        }

        let store = Store::open_temporary().unwrap();
        let (genesis, _) = fake_genesis(1, Rules::fakenet());
        assert!(matches!(
            apply_genesis(&store, &genesis, &mut RevertingProc(FakeBlockProc::new())),
            Err(GenesisError::Failure(_))
        ));
    }

    #[test]
    fn fork_proof_fixes_stay_out_of_validation() {
        assert_eq!(
            fork_proof_sender(4_738_821, 2),
            Some(FORK_PROOF_TX_FIXES[0].sender)
        );
        assert_eq!(fork_proof_sender(4_738_821, 0), None);
        assert_eq!(fork_proof_sender(1, 1), None);
    }
}
