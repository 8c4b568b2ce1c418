//! DAG index: causal-history summaries and median-time computation.
//!
//! For every indexed event the index keeps a compact summary of its causal
//! past: per validator, the highest `(seq, lamport)` observed and that
//! event's claimed creation time. Summaries reference events by id only;
//! the DAG is acyclic by construction (lamport strictly increases), and the
//! arena-with-id indirection keeps it free of pointer cycles.
//!
//! `median_time` turns a summary into the stake-weighted median of the
//! claimed times, clamped to the epoch start and quantized to
//! `MIN_EVENT_TIME` so the event builder and every verifier derive the
//! identical value.
//!
//! Writes are staged: `add` stages, `flush` persists, `drop_not_flushed`
//! discards. The processor drops staged entries on every failure path so a
//! rejected event leaves no residue.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Timestamp;
use crate::constants::MIN_EVENT_TIME;
use crate::event::{Epoch, EventId, EventPayload, Lamport, Seq};
use crate::validators::{ValidatorId, ValidatorSet};

/// Index failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DagError {
    #[error("parent event not indexed: {0}")]
    MissingParent(EventId),
    #[error("event not indexed: {0}")]
    MissingEvent(EventId),
    #[error("creator {0} is not a validator of this epoch")]
    UnknownCreator(ValidatorId),
    #[error("event {0} already indexed")]
    AlreadyIndexed(EventId),
}

/// Highest observation of one validator inside an event's causal past.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seen {
    pub seq: Seq,
    pub lamport: Lamport,
    pub claimed_time: Timestamp,
    /// The observed validator is a known forker.
    pub forked: bool,
}

/// Per-event causal summary: one slot per validator index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalSummary {
    seen: Vec<Option<Seen>>,
}

impl CausalSummary {
    fn empty(len: usize) -> Self {
        CausalSummary {
            seen: vec![None; len],
        }
    }

    fn merge(&mut self, other: &CausalSummary) {
        for (slot, incoming) in self.seen.iter_mut().zip(other.seen.iter()) {
            match (&slot, incoming) {
                (_, None) => {}
                (None, Some(_)) => *slot = *incoming,
                (Some(current), Some(candidate)) => {
                    let mut merged = if candidate.lamport > current.lamport {
                        *candidate
                    } else {
                        *current
                    };
                    merged.forked = current.forked || candidate.forked;
                    *slot = Some(merged);
                }
            }
        }
    }
}

/// The DAG index of one epoch.
pub struct DagIndex {
    validators: ValidatorSet,
    epoch: Epoch,
    entries: HashMap<EventId, CausalSummary>,
    staged: HashMap<EventId, CausalSummary>,
    /// `(creator idx, seq)` → first id seen; a second id is a fork.
    slots: HashMap<(u32, Seq), EventId>,
    staged_slots: HashMap<(u32, Seq), EventId>,
    cheaters: Vec<bool>,
    staged_cheaters: Vec<bool>,
}

impl DagIndex {
    pub fn new(validators: ValidatorSet, epoch: Epoch) -> Self {
        let n = validators.len();
        DagIndex {
            validators,
            epoch,
            entries: HashMap::new(),
            staged: HashMap::new(),
            slots: HashMap::new(),
            staged_slots: HashMap::new(),
            cheaters: vec![false; n],
            staged_cheaters: vec![false; n],
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Stage an event. All parents must already be indexed (staged or
    /// flushed).
    pub fn add(&mut self, event: &EventPayload) -> Result<(), DagError> {
        let header = event.event();
        let id = header.id();
        if self.lookup(&id).is_some() {
            return Err(DagError::AlreadyIndexed(id));
        }
        let creator_idx = self
            .validators
            .idx_of(header.creator())
            .ok_or(DagError::UnknownCreator(header.creator()))?;

        let mut summary = CausalSummary::empty(self.validators.len());
        for parent in header.parents() {
            let parent_summary = self
                .lookup(parent)
                .ok_or(DagError::MissingParent(*parent))?;
            summary.merge(parent_summary);
        }

        // fork detection: a second id in the same (creator, seq) slot
        let slot = (creator_idx, header.seq());
        let forked = match self.lookup_slot(&slot) {
            Some(existing) if *existing != id => {
                self.staged_cheaters[creator_idx as usize] = true;
                true
            }
            Some(_) => self.is_cheater_idx(creator_idx),
            None => {
                self.staged_slots.insert(slot, id);
                self.is_cheater_idx(creator_idx)
            }
        };

        // the event observes itself
        let own = Seen {
            seq: header.seq(),
            lamport: header.lamport(),
            claimed_time: header.creation_time(),
            forked,
        };
        let slot_ref = &mut summary.seen[creator_idx as usize];
        match slot_ref {
            Some(current) if current.lamport >= own.lamport => {
                current.forked |= forked;
            }
            _ => *slot_ref = Some(own),
        }

        self.staged.insert(id, summary);
        Ok(())
    }

    /// Stake-weighted median of the claimed creation times in `id`'s causal
    /// past. Validators the subgraph does not observe (and known forkers)
    /// contribute no weight; if observed weight never reaches half the
    /// total, the epoch start wins. The result is quantized to
    /// `MIN_EVENT_TIME` and clamped to `epoch_start`.
    pub fn median_time(
        &self,
        id: &EventId,
        epoch_start: Timestamp,
    ) -> Result<Timestamp, DagError> {
        let summary = self.lookup(id).ok_or(DagError::MissingEvent(*id))?;

        let mut observed: Vec<(Timestamp, u64)> = Vec::with_capacity(self.validators.len());
        for (idx, _, weight) in self.validators.iter() {
            match summary.seen[idx as usize] {
                Some(seen) if !seen.forked => observed.push((seen.claimed_time, weight)),
                _ => {}
            }
        }
        // heaviest-time first; ties broken by weight for determinism
        observed.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let half = self.validators.total_weight() / 2;
        let mut accumulated = 0u64;
        let mut median = epoch_start;
        for (time, weight) in observed {
            accumulated += weight;
            if accumulated >= half {
                median = time;
                break;
            }
        }

        let quantized = median - median % MIN_EVENT_TIME;
        Ok(quantized.max(epoch_start))
    }

    /// Whether the validator has produced two events with the same seq.
    pub fn is_cheater(&self, id: ValidatorId) -> bool {
        self.validators
            .idx_of(id)
            .map(|idx| self.is_cheater_idx(idx))
            .unwrap_or(false)
    }

    fn is_cheater_idx(&self, idx: u32) -> bool {
        self.cheaters[idx as usize] || self.staged_cheaters[idx as usize]
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.lookup(id).is_some()
    }

    /// Persist everything staged since the last flush.
    pub fn flush(&mut self) {
        self.entries.extend(self.staged.drain());
        self.slots.extend(self.staged_slots.drain());
        for (flushed, staged) in self.cheaters.iter_mut().zip(self.staged_cheaters.iter()) {
            *flushed |= *staged;
        }
    }

    /// Discard everything staged since the last flush.
    pub fn drop_not_flushed(&mut self) {
        self.staged.clear();
        self.staged_slots.clear();
        self.staged_cheaters = vec![false; self.validators.len()];
    }

    /// Throw away all state and adopt a new epoch's validator set.
    pub fn reset(&mut self, validators: ValidatorSet, epoch: Epoch) {
        *self = DagIndex::new(validators, epoch);
    }

    /// Rebuild from stored events, in id order (parents come first because
    /// ids sort by lamport). Used after a restart or an epoch reset.
    pub fn rehydrate<'a, I>(&mut self, events: I) -> Result<(), DagError>
    where
        I: Iterator<Item = &'a EventPayload>,
    {
        for event in events {
            self.add(event)?;
        }
        self.flush();
        Ok(())
    }

    fn lookup(&self, id: &EventId) -> Option<&CausalSummary> {
        self.staged.get(id).or_else(|| self.entries.get(id))
    }

    fn lookup_slot(&self, slot: &(u32, Seq)) -> Option<&EventId> {
        self.staged_slots
            .get(slot)
            .or_else(|| self.slots.get(slot))
    }
}
