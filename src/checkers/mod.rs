//! Event validation pipeline.
//!
//! Checks run in a fixed order and short-circuit on the first failure:
//! basic (shape) → epoch (relevance) → parents (graph consistency) →
//! gas-power → heavy (signature). The first three are cheap and always
//! precede signature verification, which dominates cost and can be batched
//! across worker threads.
//!
//! The epoch, gas-power, and heavy checkers read epoch-scoped snapshots
//! through [`Slot`]s: single-writer atomic pointer slots the processor
//! swaps on epoch transition. Readers never block the writer for longer
//! than a pointer clone.

pub mod basic;
pub mod epoch;
pub mod heavy;
pub mod parents;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::{Epoch, EventId, EventPayload};
use crate::gaspower::{GasPowerContext, GasPowerError};
use crate::validators::ValidatorId;

/// A distinct tag per validation failure. The processor propagates these
/// verbatim; peers producing them get penalized by the caller according to
/// the tag.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventCheckError {
    // ── basic ──
    #[error("unsupported event version {0}")]
    UnsupportedVersion(u8),
    #[error("event seq must be ≥ 1")]
    ZeroSeq,
    #[error("lamport clock inconsistent with seq/parents")]
    WrongLamport,
    #[error("event carries no parents but seq > 1")]
    NoParents,
    #[error("too many parents: {got} > {limit}")]
    TooManyParents { got: usize, limit: usize },
    #[error("duplicate parent reference")]
    DoubleParent,
    #[error("extra data {got} bytes exceeds limit {limit}")]
    ExtraTooLarge { got: usize, limit: usize },
    #[error("creation time is zero")]
    ZeroTime,
    #[error("claimed gas_power_used below the event's intrinsic cost")]
    WrongGasUsed,

    // ── epoch ──
    #[error("event epoch {event} is not the current epoch {current}")]
    NotRelevantEpoch { event: Epoch, current: Epoch },
    #[error("creator {0} is not a validator of the current epoch")]
    NotValidator(ValidatorId),

    // ── parents ──
    #[error("parent {0} is unknown")]
    MissingParent(EventId),
    #[error("parent {parent} belongs to epoch {parent_epoch}, event to {event_epoch}")]
    ParentEpochMismatch {
        parent: EventId,
        parent_epoch: Epoch,
        event_epoch: Epoch,
    },
    #[error("first parent is not the creator's previous event")]
    WrongSelfParent,

    // ── gas power ──
    #[error(transparent)]
    Gas(#[from] GasPowerError),

    // ── heavy ──
    #[error("payload hash does not match the payload")]
    WrongPayloadHash,
    #[error("signature verification failed")]
    BadSignature,
}

/// Single-writer / many-reader snapshot slot. The stored value is an
/// immutable `Arc`; `store` swaps the pointer, `load` clones it.
pub struct Slot<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Slot {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

/// The full pipeline, bundling every checker with its snapshot slots.
pub struct Checkers {
    pub basic: basic::BasicChecker,
    pub epoch: epoch::EpochChecker,
    pub heavy: heavy::HeavyChecker,
    pub gas_ctx: Arc<Slot<GasPowerContext>>,
}

impl Checkers {
    /// Run every check on a single event. `parents` must resolve
    /// `event.parents()` in order; the self-parent, when the event has one,
    /// is `parents[0]`.
    pub fn validate(
        &self,
        event: &EventPayload,
        parents: &[EventPayload],
    ) -> Result<(), EventCheckError> {
        self.basic.validate(event)?;
        self.epoch.validate(event)?;
        parents::validate(event, parents)?;
        let self_parent = event
            .event()
            .self_parent()
            .and_then(|_| parents.first().map(|p| p.event()));
        self.gas_ctx.load().validate(event.event(), self_parent)?;
        self.heavy.validate(event)?;
        Ok(())
    }
}
