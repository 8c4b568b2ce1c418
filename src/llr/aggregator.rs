//! Stake-weighted vote aggregation.
//!
//! Votes are resolved against the *historical* epoch state of the epoch
//! they were cast in, so late votes keep their original weight even after
//! the validator set changed. A decision needs ≥ ⅓+1 of that epoch's total
//! stake, enough to guarantee at least one honest vote under the usual
//! < ⅓ Byzantine assumption. A second winning hash for an already-decided
//! index is a doublesign: logged loudly, never fatal.

use crate::event::{BlockIdx, Epoch};
use crate::store::Store;
use crate::validators::ValidatorSet;
use crate::Hash;

use super::{
    actualize_lowest_index, LlrError, LlrImportError, LlrState, SignedBlockVotes, SignedEpochVote,
};

/// Ingest one event's run of block votes. The caller holds the engine lock.
pub fn process_block_votes(store: &Store, bvs: &SignedBlockVotes) -> Result<(), LlrImportError> {
    if bvs.votes.is_empty() {
        return Ok(());
    }
    let locator_id = bvs.signed.locator.id();
    let epoch = bvs.votes.epoch;
    if store.has_block_votes(epoch, bvs.votes.last_block(), &locator_id)? {
        return Err(LlrError::AlreadyProcessedBvs.into());
    }
    let epoch_state = store
        .get_history_epoch_state(epoch)?
        .ok_or(LlrError::UnknownEpochBvs(epoch))?;
    let creator = bvs.signed.locator.creator;
    let voter_idx = epoch_state
        .validators
        .idx_of(creator)
        .ok_or(LlrError::VoteFromNonValidator)?;

    let mut llr_state = store.get_llr_state()?;
    let mut block = bvs.votes.start;
    for vote in &bvs.votes.votes {
        process_block_vote(
            store,
            block,
            epoch,
            vote,
            voter_idx,
            &epoch_state.validators,
            &mut llr_state,
        )?;
        block += 1;
    }
    store.set_llr_state(llr_state);
    store.set_block_votes_seen(epoch, bvs.votes.last_block(), &locator_id)?;
    store.raise_last_bv(creator, bvs.votes.last_block())?;
    Ok(())
}

fn process_block_vote(
    store: &Store,
    block: BlockIdx,
    epoch: Epoch,
    vote: &Hash,
    voter_idx: u32,
    validators: &ValidatorSet,
    llr_state: &mut LlrState,
) -> Result<(), LlrImportError> {
    let new_weight = store.add_llr_block_vote_weight(
        block,
        epoch,
        vote,
        voter_idx,
        validators.len(),
        validators.weight_at(voter_idx),
    )?;
    if new_weight < validators.total_weight() / 3 + 1 {
        return Ok(());
    }
    match store.get_llr_block_result(block)? {
        None => {
            store.set_llr_block_result(block, vote)?;
            llr_state.lowest_block_to_decide = actualize_lowest_index(
                llr_state.lowest_block_to_decide,
                block,
                |idx| Ok::<_, LlrImportError>(store.get_llr_block_result(idx)?.is_some()),
            )?;
        }
        Some(winner) if winner != *vote => {
            tracing::error!(block, "LLR voting doublesign");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Ingest one event's epoch vote. The caller holds the engine lock.
pub fn process_epoch_vote(store: &Store, ev: &SignedEpochVote) -> Result<(), LlrImportError> {
    if ev.vote.epoch == 0 {
        return Ok(());
    }
    let locator_id = ev.signed.locator.id();
    let epoch = ev.vote.epoch;
    if store.has_epoch_vote(epoch, &locator_id)? {
        return Err(LlrError::AlreadyProcessedEv.into());
    }
    // an epoch's record is voted on by the previous epoch's validators
    let epoch_state = store
        .get_history_epoch_state(epoch - 1)?
        .ok_or(LlrError::UnknownEpochEv(epoch))?;
    let creator = ev.signed.locator.creator;
    let voter_idx = epoch_state
        .validators
        .idx_of(creator)
        .ok_or(LlrError::VoteFromNonValidator)?;

    let mut llr_state = store.get_llr_state()?;
    let new_weight = store.add_llr_epoch_vote_weight(
        epoch,
        &ev.vote.vote,
        voter_idx,
        epoch_state.validators.len(),
        epoch_state.validators.weight_at(voter_idx),
    )?;
    if new_weight >= epoch_state.validators.total_weight() / 3 + 1 {
        match store.get_llr_epoch_result(epoch)? {
            None => {
                store.set_llr_epoch_result(epoch, &ev.vote.vote)?;
                let advanced = actualize_lowest_index(
                    llr_state.lowest_epoch_to_decide as u64,
                    epoch as u64,
                    |idx| {
                        Ok::<_, LlrImportError>(
                            store.get_llr_epoch_result(idx as Epoch)?.is_some(),
                        )
                    },
                )?;
                llr_state.lowest_epoch_to_decide = advanced as Epoch;
            }
            Some(winner) if winner != ev.vote.vote => {
                tracing::error!(epoch, "LLR voting doublesign");
            }
            Some(_) => {}
        }
    }
    store.set_llr_state(llr_state);
    store.set_epoch_vote_seen(epoch, &locator_id)?;
    store.raise_last_ev(creator, epoch)?;
    Ok(())
}
