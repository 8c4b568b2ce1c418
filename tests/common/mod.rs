//! Shared scaffolding for integration tests: a fakenet node in a box.
#![allow(dead_code)] // each test binary uses a different subset

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aphelion::config::Rules;
use aphelion::crypto::SigningKeypair;
use aphelion::engine::{Engine, EngineError, NullEngine};
use aphelion::event::builder::EventBuilder;
use aphelion::event::{EventId, EventPayload, Transaction};
use aphelion::genesis::{apply_genesis, fake_genesis, FakeBlockProc};
use aphelion::processor::{NullEmitter, ProcessError, Processor};
use aphelion::store::decided::EpochState;
use aphelion::store::{Store, StoreConfig};
use aphelion::validators::ValidatorId;

pub const SEC: u64 = 1_000_000_000;

pub struct TestNode {
    pub store: Arc<Store>,
    pub processor: Processor,
    pub keypairs: Vec<SigningKeypair>,
    pub rules: Rules,
    clock: AtomicU64,
}

/// A fakenet node with `validators` equally staked validators, in-memory.
pub fn fakenet_node(validators: u32) -> TestNode {
    node_with_engine(validators, Store::open_temporary().unwrap(), |_| {
        Box::new(NullEngine)
    })
}

/// Same, but on disk (for restart/recovery flows).
pub fn fakenet_node_at(path: &Path, validators: u32) -> TestNode {
    let store = Store::open(path, StoreConfig::default()).unwrap();
    node_with_engine(validators, store, |_| Box::new(NullEngine))
}

/// A node whose engine seals an epoch every `every` processed events.
pub fn sealing_node(validators: u32, every: u64) -> TestNode {
    node_with_engine(validators, Store::open_temporary().unwrap(), |store| {
        Box::new(SealingEngine {
            store,
            every,
            processed: 0,
        })
    })
}

/// A sealing node persisted at `path` (for restart/recovery flows).
pub fn sealing_node_at(path: &Path, validators: u32, every: u64) -> TestNode {
    let store = Store::open(path, StoreConfig::default()).unwrap();
    node_with_engine(validators, store, |store| {
        Box::new(SealingEngine {
            store,
            every,
            processed: 0,
        })
    })
}

pub fn node_with_engine(
    validators: u32,
    store: Store,
    make_engine: impl FnOnce(Arc<Store>) -> Box<dyn Engine>,
) -> TestNode {
    let rules = Rules::fakenet();
    let (genesis, keypairs) = fake_genesis(validators, rules.clone());
    apply_genesis(&store, &genesis, &mut FakeBlockProc::new()).unwrap();
    let genesis_time = genesis.state.time;
    let store = Arc::new(store);
    let processor = Processor::new(
        store.clone(),
        make_engine(store.clone()),
        rules.clone(),
        Arc::new(NullEmitter),
    )
    .unwrap();
    TestNode {
        store,
        processor,
        keypairs,
        rules,
        clock: AtomicU64::new(genesis_time + SEC),
    }
}

impl TestNode {
    /// Monotonic test clock, one second per call.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(SEC, Ordering::Relaxed) + SEC
    }

    /// Build, sign, and process the next event of `creator`, self-parenting
    /// its previous event and referencing the current heads.
    pub fn emit(&self, creator: ValidatorId) -> Result<EventPayload, ProcessError> {
        self.emit_with(creator, Vec::new(), |builder| builder)
    }

    pub fn emit_txs(
        &self,
        creator: ValidatorId,
        txs: Vec<Transaction>,
    ) -> Result<EventPayload, ProcessError> {
        self.emit_with(creator, txs, |builder| builder)
    }

    /// Full control over the builder before completion; the closure runs
    /// before median-time/gas derivation.
    pub fn emit_with(
        &self,
        creator: ValidatorId,
        txs: Vec<Transaction>,
        tweak: impl FnOnce(EventBuilder) -> EventBuilder,
    ) -> Result<EventPayload, ProcessError> {
        let unsigned = self.unsigned_builder(creator, txs)?;
        let unsigned = tweak(unsigned);
        let completed = self.processor.build_event(unsigned)?;
        let event = self.sign(creator, completed);
        self.processor.process_event(event.clone())?;
        Ok(event)
    }

    /// The builder for `creator`'s next event, without gas/median filled.
    pub fn unsigned_builder(
        &self,
        creator: ValidatorId,
        txs: Vec<Transaction>,
    ) -> Result<EventBuilder, ProcessError> {
        let epoch = self.processor.current_epoch();
        let self_parent = self.store.get_last_event(epoch, creator)?;
        let seq = match &self_parent {
            Some(id) => self.store.get_event(id)?.unwrap().event().seq() + 1,
            None => 1,
        };

        let mut parents: Vec<EventId> = Vec::new();
        if let Some(own) = self_parent {
            parents.push(own);
        }
        for head in self.store.get_heads(epoch)? {
            if !parents.contains(&head) {
                parents.push(head);
            }
        }
        let mut parent_lamports = Vec::with_capacity(parents.len());
        for id in &parents {
            parent_lamports.push(self.store.get_event(id)?.unwrap().event().lamport());
        }

        Ok(EventBuilder::new()
            .epoch(epoch)
            .creator(creator)
            .seq(seq)
            .parents(parents)
            .lamport_from_parents(&parent_lamports)
            .creation_time(self.tick())
            .prev_epoch_hash(Some(self.store.get_epoch_state()?.hash()))
            .txs(txs))
    }

    /// Sign a completed builder with `creator`'s key.
    pub fn sign(&self, creator: ValidatorId, builder: EventBuilder) -> EventPayload {
        let keypair = &self.keypairs[(creator.0 - 1) as usize];
        let sig = keypair.sign(&builder.hash_to_sign());
        builder.sig(sig).build()
    }
}

/// Seals an epoch after every `every` processed events: installs the next
/// epoch state (same validator set), records the history pair, and carries
/// each validator's last event across the boundary.
pub struct SealingEngine {
    pub store: Arc<Store>,
    pub every: u64,
    pub processed: u64,
}

impl Engine for SealingEngine {
    fn process(&mut self, event: &EventPayload) -> Result<(), EngineError> {
        self.processed += 1;
        if self.processed % self.every != 0 {
            return Ok(());
        }
        let fail = |err: aphelion::store::StoreError| EngineError::Rejected(err.to_string());
        let old = self.store.get_epoch_state().map_err(fail)?;
        let block_state = self.store.get_block_state().map_err(fail)?;

        let mut validator_states = Vec::with_capacity(old.validators.len());
        for (_, id, _) in old.validators.iter() {
            let last = if id == event.event().creator() {
                Some(event.id())
            } else {
                self.store.get_last_event(old.epoch, id).map_err(fail)?
            };
            validator_states.push(aphelion::store::decided::ValidatorEpochState {
                prev_epoch_event: last,
                gas_refund: 0,
            });
        }
        let sealed = EpochState {
            epoch: old.epoch + 1,
            epoch_start: event.event().creation_time(),
            prev_epoch_start: old.epoch_start,
            validators: old.validators.clone(),
            validator_states,
            validator_profiles: old.validator_profiles.clone(),
        };
        self.store
            .set_history_states(sealed.epoch, &block_state, &sealed)
            .map_err(fail)?;
        self.store.set_epoch_state(sealed);
        Ok(())
    }
}
