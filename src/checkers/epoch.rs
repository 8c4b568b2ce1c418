//! Epoch relevance: the event must belong to the node's current epoch and
//! its creator must be in that epoch's validator set.

use std::sync::Arc;

use crate::event::{Epoch, EventPayload};
use crate::validators::ValidatorSet;

use super::{EventCheckError, Slot};

/// The epoch-scoped data this check reads, swapped on epoch transition.
#[derive(Clone, Debug)]
pub struct EpochSnapshot {
    pub epoch: Epoch,
    pub validators: ValidatorSet,
}

pub struct EpochChecker {
    snapshot: Arc<Slot<EpochSnapshot>>,
}

impl EpochChecker {
    pub fn new(snapshot: Arc<Slot<EpochSnapshot>>) -> Self {
        EpochChecker { snapshot }
    }

    pub fn validate(&self, event: &EventPayload) -> Result<(), EventCheckError> {
        let snapshot = self.snapshot.load();
        let header = event.event();
        if header.epoch() != snapshot.epoch {
            return Err(EventCheckError::NotRelevantEpoch {
                event: header.epoch(),
                current: snapshot.epoch,
            });
        }
        if !snapshot.validators.contains(header.creator()) {
            return Err(EventCheckError::NotValidator(header.creator()));
        }
        Ok(())
    }

    /// The epoch the checker currently accepts.
    pub fn current_epoch(&self) -> Epoch {
        self.snapshot.load().epoch
    }
}
