//! DAG streaming sync: a session-oriented pull protocol.
//!
//! A *leecher* opens a session against a peer's *seeder* covering a
//! contiguous selector range of the event-id space (ids order by
//! `(epoch, lamport)`, so an epoch is exactly one range). The seeder walks
//! its store from the session cursor and answers bounded chunks of either
//! full events or bare ids; the leecher requests chunk after chunk until
//! the seeder reports the range exhausted.

pub mod leecher;
pub mod seeder;

use serde::{Deserialize, Serialize};

use crate::event::EventId;

/// Session identifier, chosen by the leecher.
pub type SessionId = u32;

/// What the leecher wants back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Bare ids; the leecher resolves unknown ones afterwards.
    Ids,
    /// Full encoded events.
    Events,
}

/// A selector range agreed for one session. Selectors are byte prefixes of
/// event ids (at most id length); `start` is pinned for the session's
/// lifetime, `stop` is the exclusive upper bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub start: Vec<u8>,
    pub stop: Vec<u8>,
}

/// Chunk limits: whichever of the two is reached first ends the chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub num: u32,
    pub size: u64,
}

/// A pull request from leecher to seeder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub session: Session,
    pub limit: Metric,
    pub kind: RequestKind,
}

/// One chunk from seeder to leecher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub session_id: SessionId,
    /// The whole `[start, stop)` range has been delivered.
    pub done: bool,
    pub ids: Vec<EventId>,
    /// Encoded events (`RequestKind::Events` only).
    pub events: Vec<Vec<u8>>,
}

/// Peer protocol violations, surfaced through the misbehaviour callback;
/// they penalize the peer but never crash the node. Distinct from I/O
/// errors at the type level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("wrong event selector length")]
    WrongSelectorLen,
    /// Raised by the wire layer when a request carries an unknown kind tag.
    #[error("wrong request type")]
    WrongType,
    #[error("session selector mismatch")]
    SelectorMismatch,
}
