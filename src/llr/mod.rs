//! Low-latency reliability (LLR): out-of-band stake-weighted voting on
//! block and epoch records.
//!
//! Validators embed votes in their events. Once votes for an index
//! accumulate ≥ ⅓+1 of the epoch's total stake, the voted hash is *decided*
//! and recorded as the winner; a matching full record delivered later
//! *fills* the index. Four monotone cursors track the lowest undecided and
//! unfilled block/epoch so syncing nodes know exactly what to fetch next.

pub mod aggregator;
pub mod records;

use serde::{Deserialize, Serialize};

use crate::event::{BlockIdx, BlockVotes, Epoch, EpochVote, SignedLocator};

/// The four monotone cursors. Each points at the lowest index that is not
/// yet decided/filled; they advance past decided indexes and never regress,
/// no matter how far out of order votes arrive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlrState {
    pub lowest_block_to_decide: BlockIdx,
    pub lowest_block_to_fill: BlockIdx,
    pub lowest_epoch_to_decide: Epoch,
    pub lowest_epoch_to_fill: Epoch,
}

impl LlrState {
    /// Initial cursors right after genesis: the first undecided block is
    /// `last_block + 1`, the first undecided epoch is `epoch + 1`.
    pub fn new(first_block: BlockIdx, first_epoch: Epoch) -> Self {
        LlrState {
            lowest_block_to_decide: first_block,
            lowest_block_to_fill: first_block,
            lowest_epoch_to_decide: first_epoch,
            lowest_epoch_to_fill: first_epoch,
        }
    }
}

/// A run of block votes with the signed locator of the carrying event, so
/// the votes stay attributable on their own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlockVotes {
    pub signed: SignedLocator,
    pub votes: BlockVotes,
}

/// An epoch vote with the signed locator of the carrying event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEpochVote {
    pub signed: SignedLocator,
    pub vote: EpochVote,
}

/// LLR processing failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LlrError {
    #[error("block votes already processed")]
    AlreadyProcessedBvs,
    #[error("epoch vote already processed")]
    AlreadyProcessedEv,
    #[error("block record {0} already processed")]
    AlreadyProcessedBr(BlockIdx),
    #[error("epoch record {0} already processed")]
    AlreadyProcessedEr(Epoch),
    #[error("no historical epoch state for epoch {0} of block votes")]
    UnknownEpochBvs(Epoch),
    #[error("no historical epoch state for epoch {0} of epoch vote")]
    UnknownEpochEv(Epoch),
    #[error("vote from non-validator of its epoch")]
    VoteFromNonValidator,
    #[error("block record {0} is not decided yet")]
    UndecidedBr(BlockIdx),
    #[error("epoch record {0} is not decided yet")]
    UndecidedEr(Epoch),
    #[error("block record hash mismatch for block {0}")]
    BlockRecordHashMismatch(BlockIdx),
    #[error("epoch record hash mismatch for epoch {0}")]
    EpochRecordHashMismatch(Epoch),
}

/// Errors crossing the LLR import path: protocol-level rejections plus
/// storage failures (which are fatal for the node).
#[derive(Debug, thiserror::Error)]
pub enum LlrImportError {
    #[error(transparent)]
    Llr(#[from] LlrError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Advance a lowest-undone cursor past `updated` and then past every
/// consecutive done index. Strictly monotone: untouched unless the cursor
/// itself was just done. `exists` may hit storage, hence fallible.
pub fn actualize_lowest_index<E, F>(current: u64, updated: u64, mut exists: F) -> Result<u64, E>
where
    F: FnMut(u64) -> Result<bool, E>,
{
    let mut current = current;
    if current == updated {
        current += 1;
        while exists(current)? {
            current += 1;
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: u64) -> Result<bool, ()> {
        Ok(false)
    }

    #[test]
    fn cursor_advances_only_at_the_frontier() {
        // deciding ahead of the cursor does not move it
        assert_eq!(actualize_lowest_index(5, 9, never), Ok(5));
        // deciding the frontier moves past it
        assert_eq!(actualize_lowest_index(5, 5, never), Ok(6));
    }

    #[test]
    fn cursor_skips_consecutive_done_indexes() {
        let done = [6u64, 7, 9];
        let next: Result<u64, ()> = actualize_lowest_index(5, 5, |i| Ok(done.contains(&i)));
        assert_eq!(next, Ok(8));
    }

    #[test]
    fn out_of_order_votes_never_regress_cursor() {
        let mut cursor = 10u64;
        for updated in [3u64, 7, 2, 9] {
            cursor = actualize_lowest_index::<(), _>(cursor, updated, never).unwrap();
        }
        assert_eq!(cursor, 10);
    }
}
