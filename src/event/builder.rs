//! Event builder: the only path that computes event hashes.
//!
//! Usage:
//! ```ignore
//! let unsigned = EventBuilder::new()
//!     .epoch(epoch)
//!     .seq(seq)
//!     .creator(id)
//!     .parents(parents)
//!     .txs(txs);
//! let sig = keypair.sign(&unsigned.hash_to_sign());
//! let event = unsigned.sig(sig).build();
//! ```
//!
//! `build` freezes the event: hashes, id, and encoded size are computed once
//! and cached on the immutable result.

use crate::crypto::Signature;
use crate::validators::ValidatorId;
use crate::Hash;

use super::{
    calc_locator_hash, calc_payload_hash, codec, pack_id, BlockVotes, EpochVote, Event, EventId,
    EventPayload, GasPowerLeft, MisbehaviourProof, Payload, SignedEvent, Transaction,
};

/// Mutable event under construction.
#[derive(Clone, Debug, Default)]
pub struct EventBuilder {
    version: u8,
    epoch: u32,
    seq: u32,
    creator: ValidatorId,
    lamport: u32,
    parents: Vec<EventId>,
    creation_time: u64,
    median_time: u64,
    prev_epoch_hash: Option<Hash>,
    gas_power_used: u64,
    gas_power_left: GasPowerLeft,
    extra: Vec<u8>,
    sig: Signature,
    payload: Payload,
}

impl EventBuilder {
    pub fn new() -> Self {
        EventBuilder {
            version: 1,
            sig: Signature::zero(),
            ..Default::default()
        }
    }

    pub fn version(mut self, v: u8) -> Self {
        self.version = v;
        self
    }

    pub fn epoch(mut self, v: u32) -> Self {
        self.epoch = v;
        self
    }

    pub fn seq(mut self, v: u32) -> Self {
        self.seq = v;
        self
    }

    pub fn creator(mut self, v: ValidatorId) -> Self {
        self.creator = v;
        self
    }

    pub fn lamport(mut self, v: u32) -> Self {
        self.lamport = v;
        self
    }

    /// Parent ids; the first must be the self-parent when `seq > 1`.
    pub fn parents(mut self, v: Vec<EventId>) -> Self {
        self.parents = v;
        self
    }

    pub fn creation_time(mut self, v: u64) -> Self {
        self.creation_time = v;
        self
    }

    pub fn median_time(mut self, v: u64) -> Self {
        self.median_time = v;
        self
    }

    pub fn prev_epoch_hash(mut self, v: Option<Hash>) -> Self {
        self.prev_epoch_hash = v;
        self
    }

    pub fn gas_power_used(mut self, v: u64) -> Self {
        self.gas_power_used = v;
        self
    }

    pub fn gas_power_left(mut self, v: GasPowerLeft) -> Self {
        self.gas_power_left = v;
        self
    }

    pub fn extra(mut self, v: Vec<u8>) -> Self {
        self.extra = v;
        self
    }

    pub fn sig(mut self, v: Signature) -> Self {
        self.sig = v;
        self
    }

    pub fn txs(mut self, v: Vec<Transaction>) -> Self {
        self.payload.txs = v;
        self
    }

    pub fn misbehaviour_proofs(mut self, v: Vec<MisbehaviourProof>) -> Self {
        self.payload.misbehaviour_proofs = v;
        self
    }

    pub fn block_votes(mut self, v: BlockVotes) -> Self {
        self.payload.block_votes = v;
        self
    }

    pub fn epoch_vote(mut self, v: EpochVote) -> Self {
        self.payload.epoch_vote = v;
        self
    }

    /// Number of parents set so far (used by gas accounting at build time).
    pub fn parent_count(&self) -> usize {
        self.parents.len()
    }

    /// Lamport value a correct event must carry given `parents`:
    /// one past the highest parent lamport, or 1 with no parents.
    pub fn lamport_from_parents(self, parent_lamports: &[u32]) -> Self {
        let max = parent_lamports.iter().copied().max().unwrap_or(0);
        self.lamport(max + 1)
    }

    /// The hash the creator must sign. Stable across calls as long as no
    /// field changes; signing then mutating is a caller bug.
    pub fn hash_to_sign(&self) -> Hash {
        self.assemble().locator_hash
    }

    /// Encoded size the built event will have. Needed by gas accounting
    /// before the event is frozen.
    pub fn encoded_size(&self) -> usize {
        codec::encode(&EventPayload {
            signed: SignedEvent {
                event: self.assemble(),
                sig: self.sig,
            },
            payload: self.payload.clone(),
            size: 0,
        })
        .len()
    }

    /// Freeze the event: compute hashes, id, and size.
    pub fn build(self) -> EventPayload {
        let event = self.assemble();
        let mut built = EventPayload {
            signed: SignedEvent {
                event,
                sig: self.sig,
            },
            payload: self.payload,
            size: 0,
        };
        built.size = codec::encode(&built).len();
        built
    }

    /// Compute the header with fresh hash caches from the current fields.
    fn assemble(&self) -> Event {
        let payload_hash = calc_payload_hash(&self.payload, self.version);
        let mut event = Event {
            version: self.version,
            epoch: self.epoch,
            seq: self.seq,
            creator: self.creator,
            lamport: self.lamport,
            parents: self.parents.clone(),
            creation_time: self.creation_time,
            median_time: self.median_time,
            prev_epoch_hash: self.prev_epoch_hash,
            gas_power_used: self.gas_power_used,
            gas_power_left: self.gas_power_left,
            extra: self.extra.clone(),
            payload_hash,
            base_hash: [0u8; 32],
            locator_hash: [0u8; 32],
            id: EventId::ZERO,
        };
        let header = codec::encode_header(&event);
        event.base_hash = crate::hash_domain(b"aphelion.event.base", &header);
        event.locator_hash = if self.version == 0 {
            event.base_hash
        } else {
            calc_locator_hash(
                &event.base_hash,
                event.epoch,
                event.seq,
                event.lamport,
                event.creator,
                &event.payload_hash,
            )
        };
        event.id = pack_id(event.locator_hash, event.epoch, event.lamport);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;

    #[test]
    fn build_caches_hashes_and_id() {
        let event = EventBuilder::new()
            .epoch(3)
            .seq(1)
            .creator(ValidatorId(1))
            .lamport(1)
            .creation_time(5_000_000)
            .build();
        assert_eq!(event.id().epoch(), 3);
        assert_eq!(event.id().lamport(), 1);
        assert_eq!(event.event().payload_hash(), &super::super::empty_payload_hash(1));
        assert!(event.size() > 0);
    }

    #[test]
    fn sign_then_build_verifies() {
        let keypair = SigningKeypair::generate();
        let unsigned = EventBuilder::new()
            .epoch(1)
            .seq(1)
            .creator(ValidatorId(7))
            .lamport(1);
        let sig = keypair.sign(&unsigned.hash_to_sign());
        let event = unsigned.sig(sig).build();
        assert!(keypair
            .public()
            .verify(event.event().hash_to_sign(), event.sig()));
    }

    #[test]
    fn any_field_changes_the_id() {
        let base = EventBuilder::new().epoch(1).seq(1).creator(ValidatorId(1)).lamport(1);
        let a = base.clone().build();
        let b = base.clone().creation_time(1).build();
        let c = base.extra(b"x".to_vec()).build();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(b.id(), c.id());
    }

    #[test]
    fn lamport_from_parents_rule() {
        let builder = EventBuilder::new().lamport_from_parents(&[3, 9, 4]);
        assert_eq!(builder.lamport, 10);
        let builder = EventBuilder::new().lamport_from_parents(&[]);
        assert_eq!(builder.lamport, 1);
    }

    #[test]
    fn version_zero_signs_base_hash() {
        let event = EventBuilder::new()
            .version(0)
            .epoch(1)
            .seq(1)
            .creator(ValidatorId(1))
            .lamport(1)
            .build();
        // legacy events sign the base hash directly
        assert_eq!(event.event().hash_to_sign(), &event.event().base_hash);
    }
}
