//! LLR flows: quorum decisions, record filling, and votes carried in
//! event payloads.

mod common;

use aphelion::crypto::Signature;
use aphelion::event::{BlockVotes, EpochVote, EventId, Locator, SignedLocator, Transaction};
use aphelion::llr::records::{process_full_block_record, FullBlockRecord, FullEpochRecord};
use aphelion::llr::{LlrError, LlrImportError, LlrState, SignedBlockVotes};
use aphelion::validators::ValidatorId;

use common::{fakenet_node, sealing_node};

fn votes_from(creator: u32, block: u64, vote: [u8; 32]) -> SignedBlockVotes {
    SignedBlockVotes {
        signed: SignedLocator {
            locator: Locator {
                base_hash: [creator as u8; 32],
                epoch: 1,
                seq: 1,
                lamport: 1,
                creator: ValidatorId(creator),
                payload_hash: [0u8; 32],
            },
            sig: Signature::zero(),
        },
        votes: BlockVotes {
            epoch: 1,
            start: block,
            votes: vec![vote],
        },
    }
}

#[test]
fn four_validators_decide_block_and_fill_record() {
    let node = fakenet_node(4);
    node.store.set_llr_state(LlrState::new(100, 2));

    let record = FullBlockRecord {
        idx: 100,
        time: 7_000_000_000,
        atropos: EventId([0xa7; 32]),
        txs: vec![Transaction {
            gas_price: 3,
            gas_limit: 21_000,
            payload: b"transfer".to_vec(),
        }],
        gas_used: 21_000,
        root: [0x11; 32],
    };
    let hash_a = record.hash();
    let hash_b = [0xbb; 32];

    // three of four equal stakes vote A, one votes B; threshold is
    // total/3 + 1, reached by the A camp
    node.processor
        .process_block_votes(&votes_from(1, 100, hash_a))
        .unwrap();
    node.processor
        .process_block_votes(&votes_from(2, 100, hash_b))
        .unwrap();
    assert_eq!(node.store.get_llr_block_result(100).unwrap(), None);
    node.processor
        .process_block_votes(&votes_from(3, 100, hash_a))
        .unwrap();
    node.processor
        .process_block_votes(&votes_from(4, 100, hash_a))
        .unwrap();

    assert_eq!(node.store.get_llr_block_result(100).unwrap(), Some(hash_a));
    assert_eq!(node.store.get_llr_state().unwrap().lowest_block_to_decide, 101);

    // a record hashing to the losing vote is rejected
    let mut loser = record.clone();
    loser.root = [0x22; 32];
    assert!(matches!(
        node.processor.process_full_block_record(&loser),
        Err(LlrImportError::Llr(LlrError::BlockRecordHashMismatch(100)))
    ));

    // the winning record fills the block
    node.processor.process_full_block_record(&record).unwrap();
    let block = node.store.get_block(100).unwrap().unwrap();
    assert_eq!(block.atropos, record.atropos);
    assert_eq!(node.store.get_llr_state().unwrap().lowest_block_to_fill, 101);
}

#[test]
fn decide_cursor_is_monotone_under_out_of_order_votes() {
    let node = fakenet_node(4);
    node.store.set_llr_state(LlrState::new(1, 2));

    let vote = [0x33; 32];
    let mut last_cursor = 0;
    for block in [3u64, 1, 2, 5, 4] {
        for creator in 1..=2u32 {
            let _ = node
                .processor
                .process_block_votes(&votes_from(creator, block, vote));
        }
        let cursor = node.store.get_llr_state().unwrap().lowest_block_to_decide;
        assert!(cursor >= last_cursor, "cursor regressed at block {block}");
        last_cursor = cursor;
    }
    // blocks 1..=5 all decided; the cursor cleared the whole run
    assert_eq!(last_cursor, 6);
}

#[test]
fn epoch_record_decided_by_votes_in_events() {
    // seal epoch 1 → 2 so epoch 2 exists and history for epoch 1 and 2 is
    // recorded
    let node = sealing_node(3, 3);
    for creator in 1..=3u32 {
        node.emit(ValidatorId(creator)).unwrap();
    }
    assert_eq!(node.processor.current_epoch(), 2);

    let record = FullEpochRecord {
        epoch: 2,
        block_state: node.store.get_block_state().unwrap(),
        epoch_state: node.store.get_history_states(2).unwrap().unwrap().1,
    };
    let record_hash = record.hash();

    // two of three validators carry an epoch vote in their events
    for creator in 1..=2u32 {
        node.emit_with(ValidatorId(creator), Vec::new(), |builder| {
            builder.epoch_vote(EpochVote {
                epoch: 2,
                vote: record_hash,
            })
        })
        .unwrap();
    }

    assert_eq!(
        node.store.get_llr_epoch_result(2).unwrap(),
        Some(record_hash)
    );
    // votes also maintain the per-validator highwater
    assert_eq!(node.store.get_last_ev(ValidatorId(1)), Some(2));
    assert_eq!(node.store.get_last_ev(ValidatorId(3)), None);
}

#[test]
fn block_votes_in_events_update_highwater() {
    let node = sealing_node(2, 2);
    // seal once so history exists for votes on epoch 1
    node.emit(ValidatorId(1)).unwrap();
    node.emit(ValidatorId(2)).unwrap();
    assert_eq!(node.processor.current_epoch(), 2);

    node.emit_with(ValidatorId(1), Vec::new(), |builder| {
        builder.block_votes(BlockVotes {
            epoch: 1,
            start: 1,
            votes: vec![[0x44; 32], [0x45; 32]],
        })
    })
    .unwrap();

    assert_eq!(node.store.get_last_bv(ValidatorId(1)), Some(2));
    assert_eq!(node.store.get_last_bv(ValidatorId(2)), None);
}

#[test]
fn duplicate_vote_runs_do_not_double_count() {
    let node = fakenet_node(4);
    node.store.set_llr_state(LlrState::new(10, 2));
    let vote = [0x55; 32];

    node.processor
        .process_block_votes(&votes_from(1, 10, vote))
        .unwrap();
    // identical delivery is refused outright
    assert!(matches!(
        node.processor.process_block_votes(&votes_from(1, 10, vote)),
        Err(LlrImportError::Llr(LlrError::AlreadyProcessedBvs))
    ));
    // still undecided: one distinct voter is below threshold
    assert_eq!(node.store.get_llr_block_result(10).unwrap(), None);
}

#[test]
fn undecided_record_is_deferred() {
    let node = fakenet_node(4);
    node.store.set_llr_state(LlrState::new(100, 2));
    let record = FullBlockRecord {
        idx: 100,
        time: 1,
        atropos: EventId([1u8; 32]),
        txs: Vec::new(),
        gas_used: 0,
        root: [0u8; 32],
    };
    assert!(matches!(
        process_full_block_record(&node.store, &record),
        Err(LlrImportError::Llr(LlrError::UndecidedBr(100)))
    ));
}
