//! The consensus-engine collaborator interface.
//!
//! Atropos selection and block/epoch sealing live in the consensus engine,
//! outside this crate's scope. The processor drives it through this trait:
//! `build` lets the engine adjust an event under construction, `process`
//! feeds it a connected event. Sealing an epoch is observable to the
//! processor as a change of the store's epoch state during `process`.

use crate::event::builder::EventBuilder;
use crate::event::EventPayload;

/// Engine failures. The processor deletes the event and propagates.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine rejected event: {0}")]
    Rejected(String),
}

pub trait Engine: Send {
    /// Give the engine a chance to adjust an event under construction.
    fn build(&mut self, builder: EventBuilder) -> Result<EventBuilder, EngineError> {
        Ok(builder)
    }

    /// Feed a fully validated, persisted event into consensus ordering.
    fn process(&mut self, event: &EventPayload) -> Result<(), EngineError>;
}

/// An engine that orders nothing and never seals. Used by import replays
/// (where sealing is driven by the imported records) and tests.
pub struct NullEngine;

impl Engine for NullEngine {
    fn process(&mut self, _event: &EventPayload) -> Result<(), EngineError> {
        Ok(())
    }
}
