//! Single-writer event processor.
//!
//! `process_event` is the only path that persists events and advances the
//! consensus engine. It holds the engine lock exclusively for the whole
//! admission: no two calls interleave their persistence and head-set
//! updates. `validate_event` takes the shared side of the same lock, so
//! gossip-time validation never observes a half-finished epoch transition.
//!
//! Epoch-transition side effects (DAG-index reset, gas-power context swap,
//! pubkey-table swap, emitter notification) all happen under the lock,
//! after the transition event is fully connected, so readers see either the
//! old epoch or the new one, never a mixture.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::checkers::epoch::{EpochChecker, EpochSnapshot};
use crate::checkers::heavy::{EpochPubkeys, HeavyChecker};
use crate::checkers::{basic::BasicChecker, parents, Checkers, EventCheckError, Slot};
use crate::config::Rules;
use crate::dag::{DagError, DagIndex};
use crate::engine::{Engine, EngineError};
use crate::event::builder::EventBuilder;
use crate::event::{Epoch, EventPayload};
use crate::gaspower::{
    calc_gas_power_used, GasPowerContext, GasPowerError, PrevEventRef, ValidatorGasState,
};
use crate::llr::{self, LlrImportError, SignedBlockVotes, SignedEpochVote};
use crate::store::{Store, StoreError};
use crate::validators::ValidatorSet;

/// Processor failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("processor is stopped")]
    Stopped,
    #[error("event is already connected")]
    AlreadyConnected,
    #[error("event median time differs from the DAG-derived value")]
    WrongMedianTime,
    #[error(transparent)]
    Check(#[from] EventCheckError),
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GasPowerError> for ProcessError {
    fn from(err: GasPowerError) -> Self {
        ProcessError::Check(EventCheckError::Gas(err))
    }
}

/// Hooks observed by the surrounding node (emitter, RPC feeds).
pub trait Emitter: Send + Sync {
    fn on_event_connected(&self, _event: &EventPayload) {}
    fn on_new_epoch(&self, _validators: &ValidatorSet, _epoch: Epoch) {}
}

/// No-op emitter.
pub struct NullEmitter;

impl Emitter for NullEmitter {}

struct Inner {
    engine: Box<dyn Engine>,
    dag_index: DagIndex,
    stopped: bool,
}

/// The event processor of one node.
pub struct Processor {
    store: Arc<Store>,
    rules: Rules,
    inner: RwLock<Inner>,
    checkers: Checkers,
    epoch_snapshot: Arc<Slot<EpochSnapshot>>,
    pubkeys: Arc<Slot<EpochPubkeys>>,
    gas_ctx: Arc<Slot<GasPowerContext>>,
    emitter: Arc<dyn Emitter>,
    new_epoch_feed: broadcast::Sender<Epoch>,
}

impl Processor {
    /// Wire a processor over a store with genesis applied.
    pub fn new(
        store: Arc<Store>,
        engine: Box<dyn Engine>,
        rules: Rules,
        emitter: Arc<dyn Emitter>,
    ) -> Result<Self, ProcessError> {
        let epoch_state = store.get_epoch_state()?;
        let epoch = epoch_state.epoch;

        let epoch_snapshot = Arc::new(Slot::new(EpochSnapshot {
            epoch,
            validators: epoch_state.validators.clone(),
        }));
        let pubkeys = Arc::new(Slot::new(new_epoch_pubkeys(&store)?));
        let gas_ctx = Arc::new(Slot::new(new_gas_power_context(&store, &rules)?));

        let checkers = Checkers {
            basic: BasicChecker::new(rules.clone()),
            epoch: EpochChecker::new(epoch_snapshot.clone()),
            heavy: HeavyChecker::new(pubkeys.clone(), num_cpus()),
            gas_ctx: gas_ctx.clone(),
        };

        let mut dag_index = DagIndex::new(epoch_state.validators, epoch);
        let epoch_events = store.epoch_events(epoch)?;
        dag_index.rehydrate(epoch_events.iter())?;

        let (new_epoch_feed, _) = broadcast::channel(16);
        Ok(Processor {
            store,
            rules,
            inner: RwLock::new(Inner {
                engine,
                dag_index,
                stopped: false,
            }),
            checkers,
            epoch_snapshot,
            pubkeys,
            gas_ctx,
            emitter,
            new_epoch_feed,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    /// Receive new-epoch notifications.
    pub fn subscribe_new_epoch(&self) -> broadcast::Receiver<Epoch> {
        self.new_epoch_feed.subscribe()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.checkers.epoch.current_epoch()
    }

    /// Whether the DAG index has seen this validator fork (two events with
    /// the same seq) in the current epoch.
    pub fn is_cheater(&self, id: crate::validators::ValidatorId) -> bool {
        self.inner.read().dag_index.is_cheater(id)
    }

    /// Refuse all further events. Cooperative: an in-flight call finishes.
    pub fn stop(&self) {
        self.inner.write().stopped = true;
    }

    /// Read-only full validation: every checker, parents resolved from the
    /// store. Used pre-admission and during gossip.
    pub fn validate_event(&self, event: &EventPayload) -> Result<(), ProcessError> {
        let _shared = self.inner.read();
        if self.store.has_event(&event.id())? {
            return Err(ProcessError::AlreadyConnected);
        }
        let parents = self.resolve_parents(event)?;
        self.checkers.validate(event, &parents)?;
        Ok(())
    }

    /// Admit one event: validate under the exclusive lock, persist, index,
    /// advance the engine, maintain heads and per-validator last events,
    /// route LLR votes, and run the epoch-transition hook when the engine
    /// sealed the epoch.
    ///
    /// Event order matters: parents first, enforced by the parent checks.
    pub fn process_event(&self, event: EventPayload) -> Result<(), ProcessError> {
        let mut inner = self.inner.write();
        if inner.stopped {
            return Err(ProcessError::Stopped);
        }
        if self.store.has_event(&event.id())? {
            return Err(ProcessError::AlreadyConnected);
        }
        // repeat the checks that depend on volatile data under the lock
        self.checkers.epoch.validate(&event)?;
        let parents = self.resolve_parents(&event)?;
        parents::validate(&event, &parents)?;
        self.checkers.heavy.validate(&event)?;

        let old_epoch = self.store.get_epoch()?;
        let epoch_start = self.store.get_epoch_state()?.epoch_start;

        self.store.set_event(&event)?;
        if let Err(err) = Self::connect(&self.store, &mut inner, &event, epoch_start) {
            inner.dag_index.drop_not_flushed();
            self.store.del_event(&event.id())?;
            return Err(err);
        }
        inner.dag_index.flush();

        let new_epoch = self.store.get_epoch()?;

        // heads: the new event replaces the parents it covers
        for parent in event.event().parents() {
            self.store.del_head(old_epoch, parent)?;
        }
        self.store.add_head(old_epoch, &event.id())?;
        self.store
            .set_last_event(old_epoch, event.event().creator(), &event.id())?;

        self.ingest_payload_votes(&event)?;
        self.emitter.on_event_connected(&event);

        if new_epoch != old_epoch {
            self.on_epoch_transition(&mut inner, new_epoch)?;
        }

        if self.store.is_commit_needed(new_epoch != old_epoch) {
            self.store.commit()?;
        }
        Ok(())
    }

    fn connect(
        store: &Store,
        inner: &mut Inner,
        event: &EventPayload,
        epoch_start: u64,
    ) -> Result<(), ProcessError> {
        inner.dag_index.add(event)?;
        let computed = inner.dag_index.median_time(&event.id(), epoch_start)?;
        if event.event().median_time() != computed {
            return Err(ProcessError::WrongMedianTime);
        }
        inner.engine.process(event)?;
        Ok(())
    }

    /// Route votes carried in a connected event's payload into the LLR
    /// aggregator. Protocol-level rejections (duplicates, missing history)
    /// are expected during sync and never fail the event; store failures
    /// propagate.
    fn ingest_payload_votes(&self, event: &EventPayload) -> Result<(), ProcessError> {
        if event.any_block_votes() {
            let bvs = SignedBlockVotes {
                signed: event.signed_locator(),
                votes: event.block_votes().clone(),
            };
            match llr::aggregator::process_block_votes(&self.store, &bvs) {
                Ok(()) => {}
                Err(LlrImportError::Llr(err)) => {
                    tracing::debug!(error = %err, "Skipped block votes")
                }
                Err(LlrImportError::Store(err)) => return Err(err.into()),
            }
        }
        if event.any_epoch_vote() {
            let ev = SignedEpochVote {
                signed: event.signed_locator(),
                vote: *event.epoch_vote(),
            };
            match llr::aggregator::process_epoch_vote(&self.store, &ev) {
                Ok(()) => {}
                Err(LlrImportError::Llr(err)) => {
                    tracing::debug!(error = %err, "Skipped epoch vote")
                }
                Err(LlrImportError::Store(err)) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn on_epoch_transition(&self, inner: &mut Inner, new_epoch: Epoch) -> Result<(), ProcessError> {
        self.store.reset_epoch_store(new_epoch)?;
        let epoch_state = self.store.get_epoch_state()?;
        inner
            .dag_index
            .reset(epoch_state.validators.clone(), new_epoch);
        self.gas_ctx
            .store(new_gas_power_context(&self.store, &self.rules)?);
        self.pubkeys.store(new_epoch_pubkeys(&self.store)?);
        self.epoch_snapshot.store(EpochSnapshot {
            epoch: new_epoch,
            validators: epoch_state.validators.clone(),
        });
        self.emitter.on_new_epoch(&epoch_state.validators, new_epoch);
        let _ = self.new_epoch_feed.send(new_epoch);
        tracing::info!(epoch = new_epoch, "Epoch sealed");
        Ok(())
    }

    /// Build-side completion of an event: derive its median time and gas
    /// power from the current DAG, then let the engine adjust it. The
    /// caller signs the result and submits it through `process_event`.
    pub fn build_event(&self, builder: EventBuilder) -> Result<EventBuilder, ProcessError> {
        let mut inner = self.inner.write();
        if inner.stopped {
            return Err(ProcessError::Stopped);
        }
        let epoch_start = self.store.get_epoch_state()?.epoch_start;

        // index the draft without saving to learn its median time
        let probe = builder.clone().build();
        let median = (|| -> Result<u64, ProcessError> {
            inner.dag_index.add(&probe)?;
            Ok(inner.dag_index.median_time(&probe.id(), epoch_start)?)
        })();
        inner.dag_index.drop_not_flushed();
        let builder = builder.median_time(median?);

        // gas fields are fixed-width, so this size is final
        let draft = builder.clone().build();
        let used = calc_gas_power_used(&draft, &self.rules);
        let self_parent = match draft.event().self_parent() {
            Some(id) => self.store.get_event(id)?,
            None => None,
        };
        let available = self
            .gas_ctx
            .load()
            .calc_gas_power(draft.event(), self_parent.as_ref().map(|p| p.event()))?;
        if used > available.min() {
            return Err(GasPowerError::NotEnoughGasPower.into());
        }
        let builder = builder
            .gas_power_used(used)
            .gas_power_left(available.sub(used));

        Ok(inner.engine.build(builder)?)
    }

    // ── LLR entry points for out-of-band (sync) delivery ──

    pub fn process_block_votes(&self, bvs: &SignedBlockVotes) -> Result<(), LlrImportError> {
        let _exclusive = self.inner.write();
        llr::aggregator::process_block_votes(&self.store, bvs)
    }

    pub fn process_epoch_vote(&self, ev: &SignedEpochVote) -> Result<(), LlrImportError> {
        let _exclusive = self.inner.write();
        llr::aggregator::process_epoch_vote(&self.store, ev)
    }

    pub fn process_full_block_record(
        &self,
        record: &llr::records::FullBlockRecord,
    ) -> Result<(), LlrImportError> {
        let _exclusive = self.inner.write();
        llr::records::process_full_block_record(&self.store, record)
    }

    pub fn process_full_epoch_record(
        &self,
        record: &llr::records::FullEpochRecord,
    ) -> Result<(), LlrImportError> {
        let _exclusive = self.inner.write();
        llr::records::process_full_epoch_record(&self.store, record)
    }

    fn resolve_parents(&self, event: &EventPayload) -> Result<Vec<EventPayload>, ProcessError> {
        let mut parents = Vec::with_capacity(event.event().parents().len());
        for id in event.event().parents() {
            let parent = self
                .store
                .get_event(id)?
                .ok_or(EventCheckError::MissingParent(*id))?;
            parents.push(parent);
        }
        Ok(parents)
    }
}

/// Worker threads for the heavy checker: leave a couple of cores for the
/// rest of the node.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2).max(1))
        .unwrap_or(1)
}

/// Build the gas-power validation context from the store's current epoch
/// state. Called at start-up and on every epoch transition, under the
/// engine lock.
pub fn new_gas_power_context(store: &Store, rules: &Rules) -> Result<GasPowerContext, StoreError> {
    let epoch_state = store.get_epoch_state()?;
    let mut states = Vec::with_capacity(epoch_state.validators.len());
    for (idx, _, _) in epoch_state.validators.iter() {
        let validator_state = epoch_state
            .validator_states
            .get(idx as usize)
            .cloned()
            .unwrap_or_default();
        let prev_epoch_event = match validator_state.prev_epoch_event {
            Some(id) => store.get_event(&id)?.map(|event| PrevEventRef {
                creation_time: event.event().creation_time(),
                gas_power_left: event.event().gas_power_left(),
            }),
            None => None,
        };
        states.push(ValidatorGasState {
            prev_epoch_event,
            gas_refund: validator_state.gas_refund,
        });
    }
    Ok(GasPowerContext::new(
        epoch_state.epoch,
        epoch_state.validators,
        epoch_state.epoch_start,
        states,
        &rules.economy,
    ))
}

/// Build the signature-check pubkey table from the store's current epoch
/// state.
pub fn new_epoch_pubkeys(store: &Store) -> Result<EpochPubkeys, StoreError> {
    let epoch_state = store.get_epoch_state()?;
    Ok(EpochPubkeys {
        epoch: epoch_state.epoch,
        keys: epoch_state
            .validator_profiles
            .iter()
            .map(|(id, profile)| (*id, profile.pubkey))
            .collect(),
    })
}
