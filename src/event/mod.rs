//! Event model: the signed unit of the DAG.
//!
//! Every validator continuously emits events. An event references parent
//! events, carries a payload (transactions, misbehaviour proofs, LLR votes),
//! and is signed over its *locator hash*. The 32-byte event id is the
//! locator hash with the first 4 bytes overwritten by the epoch and the
//! next 4 by the lamport clock (both big-endian), so lexicographic id order
//! equals `(epoch, lamport)` order; the streaming sync protocol depends on
//! this.
//!
//! Events are immutable once built; [`builder::EventBuilder`] is the only
//! path that computes hashes.

pub mod builder;
pub mod codec;

use serde::{Deserialize, Serialize};

use crate::config::Timestamp;
use crate::crypto::{PublicKey, Signature};
use crate::validators::ValidatorId;
use crate::{hash_concat, hash_domain, Hash};

/// Epoch number.
pub type Epoch = u32;
/// Per-creator sequence number inside an epoch.
pub type Seq = u32;
/// Lamport causal clock.
pub type Lamport = u32;
/// Block number.
pub type BlockIdx = u64;

/// Short-window index into [`GasPowerLeft`].
pub const SHORT_TERM_GAS: usize = 0;
/// Long-window index into [`GasPowerLeft`].
pub const LONG_TERM_GAS: usize = 1;
/// Number of gas-power windows.
pub const GAS_POWER_WINDOWS: usize = 2;

/// Remaining gas-power budgets, one per window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPowerLeft(pub [u64; GAS_POWER_WINDOWS]);

impl GasPowerLeft {
    /// The tighter of the two windows.
    pub fn min(&self) -> u64 {
        self.0[SHORT_TERM_GAS].min(self.0[LONG_TERM_GAS])
    }

    /// Subtract `gas` from both windows, saturating at zero. Callers
    /// check availability before spending.
    pub fn sub(&self, gas: u64) -> GasPowerLeft {
        GasPowerLeft([
            self.0[SHORT_TERM_GAS].saturating_sub(gas),
            self.0[LONG_TERM_GAS].saturating_sub(gas),
        ])
    }
}

/// 32-byte event identifier; sorts by `(epoch, lamport, locator suffix)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Hash);

impl EventId {
    pub const ZERO: EventId = EventId([0u8; 32]);

    /// Epoch packed into bytes 0..4.
    pub fn epoch(&self) -> Epoch {
        u32::from_be_bytes(self.0[0..4].try_into().unwrap())
    }

    /// Lamport packed into bytes 4..8.
    pub fn lamport(&self) -> Lamport {
        u32::from_be_bytes(self.0[4..8].try_into().unwrap())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowest id of an epoch: the inclusive start of its id range.
    pub fn epoch_floor(epoch: Epoch) -> EventId {
        let mut bytes = [0u8; 32];
        bytes[0..4].copy_from_slice(&epoch.to_be_bytes());
        EventId(bytes)
    }

    /// The next id in lexicographic order (big-endian increment).
    /// Saturates at the all-ones id.
    pub fn next(&self) -> EventId {
        let mut bytes = self.0;
        for byte in bytes.iter_mut().rev() {
            let (incremented, overflow) = byte.overflowing_add(1);
            *byte = incremented;
            if !overflow {
                return EventId(bytes);
            }
        }
        EventId([0xff; 32])
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.epoch(),
            self.lamport(),
            hex::encode(&self.0[8..12])
        )
    }
}

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// The fields an event is signed over (and addressed by), without the
/// payload body. LLR votes travel with a signed locator so they are
/// attributable without shipping the whole event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub base_hash: Hash,
    pub epoch: Epoch,
    pub seq: Seq,
    pub lamport: Lamport,
    pub creator: ValidatorId,
    pub payload_hash: Hash,
}

impl Locator {
    /// The hash that gets signed. Version-0 events sign the base hash
    /// directly; this form is only produced for multi-payload events.
    pub fn hash_to_sign(&self) -> Hash {
        calc_locator_hash(
            &self.base_hash,
            self.epoch,
            self.seq,
            self.lamport,
            self.creator,
            &self.payload_hash,
        )
    }

    /// Event id: locator hash with epoch and lamport packed into the
    /// first 8 bytes.
    pub fn id(&self) -> EventId {
        pack_id(self.hash_to_sign(), self.epoch, self.lamport)
    }
}

/// A locator plus the creator's signature over its hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLocator {
    pub locator: Locator,
    pub sig: Signature,
}

impl SignedLocator {
    /// Verify the signature against the claimed creator's key.
    pub fn verify(&self, pubkey: &PublicKey) -> bool {
        pubkey.verify(&self.locator.hash_to_sign(), &self.sig)
    }
}

pub(crate) fn calc_locator_hash(
    base_hash: &Hash,
    epoch: Epoch,
    seq: Seq,
    lamport: Lamport,
    creator: ValidatorId,
    payload_hash: &Hash,
) -> Hash {
    hash_concat(&[
        base_hash,
        &epoch.to_be_bytes(),
        &seq.to_be_bytes(),
        &lamport.to_be_bytes(),
        &creator.0.to_be_bytes(),
        payload_hash,
    ])
}

pub(crate) fn pack_id(mut hash: Hash, epoch: Epoch, lamport: Lamport) -> EventId {
    hash[0..4].copy_from_slice(&epoch.to_be_bytes());
    hash[4..8].copy_from_slice(&lamport.to_be_bytes());
    EventId(hash)
}

// ── Payload parts ──

/// A transaction carried by an event. Execution is the EVM collaborator's
/// concern; the consensus layer only orders and hashes them. Internal
/// (system) transactions are recognized by a zero gas price.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub gas_price: u64,
    pub gas_limit: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        hash_domain(
            b"aphelion.tx",
            &crate::hash_concat(&[
                &self.gas_price.to_le_bytes(),
                &self.gas_limit.to_le_bytes(),
                &self.payload,
            ]),
        )
    }

    pub fn is_internal(&self) -> bool {
        self.gas_price == 0
    }
}

/// Proof of validator misbehaviour, carried in event payloads so every
/// node learns of cheaters even if it missed the offending events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisbehaviourProof {
    /// Two signed locators with the same `(creator, epoch, seq)` but
    /// different ids: an event fork.
    EventsDoublesign { pair: [SignedLocator; 2] },
    /// Two signed block-vote locators disagreeing on the same block.
    BlockVoteDoublesign { pair: [SignedLocator; 2], block: BlockIdx },
}

impl MisbehaviourProof {
    pub fn hash(&self) -> Hash {
        let encoded = crate::serialize(self).expect("misbehaviour proof is serializable");
        hash_domain(b"aphelion.misbehaviour", &encoded)
    }
}

/// A contiguous run of LLR block votes: `votes[i]` is the vote for block
/// `start + i` in `epoch`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVotes {
    pub epoch: Epoch,
    pub start: BlockIdx,
    pub votes: Vec<Hash>,
}

impl BlockVotes {
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Highest block this run votes on. Meaningless when empty.
    pub fn last_block(&self) -> BlockIdx {
        self.start + self.votes.len() as BlockIdx - 1
    }

    pub fn hash(&self) -> Hash {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.votes.len() + 2);
        let epoch_bytes = self.epoch.to_be_bytes();
        let start_bytes = self.start.to_be_bytes();
        parts.push(&epoch_bytes);
        parts.push(&start_bytes);
        for vote in &self.votes {
            parts.push(vote);
        }
        hash_domain(b"aphelion.llr.block_votes", &hash_concat(&parts))
    }
}

/// An LLR epoch vote. `epoch == 0` means "no vote".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochVote {
    pub epoch: Epoch,
    pub vote: Hash,
}

impl EpochVote {
    pub fn is_empty(&self) -> bool {
        self.epoch == 0 && self.vote == [0u8; 32]
    }

    pub fn hash(&self) -> Hash {
        hash_domain(
            b"aphelion.llr.epoch_vote",
            &hash_concat(&[&self.epoch.to_be_bytes(), &self.vote]),
        )
    }
}

/// Everything an event carries besides its header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub txs: Vec<Transaction>,
    pub misbehaviour_proofs: Vec<MisbehaviourProof>,
    pub block_votes: BlockVotes,
    pub epoch_vote: EpochVote,
}

pub(crate) fn calc_txs_hash(txs: &[Transaction]) -> Hash {
    let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_slice()).collect();
    hash_domain(b"aphelion.txs", &hash_concat(&parts))
}

pub(crate) fn calc_misbehaviour_proofs_hash(proofs: &[MisbehaviourProof]) -> Hash {
    let hashes: Vec<Hash> = proofs.iter().map(MisbehaviourProof::hash).collect();
    let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_slice()).collect();
    hash_domain(b"aphelion.misbehaviours", &hash_concat(&parts))
}

/// Combined payload hash by the rule of the event's version.
///
/// Version 0 commits to the transactions only; version ≥1 commits to all
/// four payload parts in a fixed two-level tree.
pub fn calc_payload_hash(payload: &Payload, version: u8) -> Hash {
    let txs_hash = calc_txs_hash(&payload.txs);
    if version == 0 {
        return txs_hash;
    }
    let left = hash_concat(&[
        &txs_hash,
        &calc_misbehaviour_proofs_hash(&payload.misbehaviour_proofs),
    ]);
    let right = hash_concat(&[&payload.epoch_vote.hash(), &payload.block_votes.hash()]);
    hash_concat(&[&left, &right])
}

/// Canonical hash of an empty payload for the given version.
pub fn empty_payload_hash(version: u8) -> Hash {
    calc_payload_hash(&Payload::default(), version)
}

// ── The event itself ──

/// An immutable event header with cached hashes. Constructed only by
/// [`builder::EventBuilder::build`] or the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub(crate) version: u8,
    pub(crate) epoch: Epoch,
    pub(crate) seq: Seq,
    pub(crate) creator: ValidatorId,
    pub(crate) lamport: Lamport,
    pub(crate) parents: Vec<EventId>,
    pub(crate) creation_time: Timestamp,
    pub(crate) median_time: Timestamp,
    pub(crate) prev_epoch_hash: Option<Hash>,
    pub(crate) gas_power_used: u64,
    pub(crate) gas_power_left: GasPowerLeft,
    pub(crate) extra: Vec<u8>,
    pub(crate) payload_hash: Hash,

    // caches, filled at build/decode time
    pub(crate) base_hash: Hash,
    pub(crate) locator_hash: Hash,
    pub(crate) id: EventId,
}

impl Event {
    pub fn version(&self) -> u8 {
        self.version
    }
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
    pub fn seq(&self) -> Seq {
        self.seq
    }
    pub fn creator(&self) -> ValidatorId {
        self.creator
    }
    pub fn lamport(&self) -> Lamport {
        self.lamport
    }
    pub fn parents(&self) -> &[EventId] {
        &self.parents
    }
    pub fn creation_time(&self) -> Timestamp {
        self.creation_time
    }
    pub fn median_time(&self) -> Timestamp {
        self.median_time
    }
    pub fn prev_epoch_hash(&self) -> Option<&Hash> {
        self.prev_epoch_hash.as_ref()
    }
    pub fn gas_power_used(&self) -> u64 {
        self.gas_power_used
    }
    pub fn gas_power_left(&self) -> GasPowerLeft {
        self.gas_power_left
    }
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }
    pub fn payload_hash(&self) -> &Hash {
        &self.payload_hash
    }

    /// The hash the creator signed.
    pub fn hash_to_sign(&self) -> &Hash {
        &self.locator_hash
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// First parent, by convention the creator's own previous event
    /// (when `seq > 1`).
    pub fn self_parent(&self) -> Option<&EventId> {
        if self.seq > 1 {
            self.parents.first()
        } else {
            None
        }
    }

    pub fn locator(&self) -> Locator {
        Locator {
            base_hash: self.base_hash,
            epoch: self.epoch,
            seq: self.seq,
            lamport: self.lamport,
            creator: self.creator,
            payload_hash: self.payload_hash,
        }
    }
}

/// An event plus its creator's signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEvent {
    pub event: Event,
    pub sig: Signature,
}

impl SignedEvent {
    pub fn signed_locator(&self) -> SignedLocator {
        SignedLocator {
            locator: self.event.locator(),
            sig: self.sig,
        }
    }
}

/// A signed event with its full payload: the unit that travels the wire
/// and the store. Field access goes through the header (`.event()`) or the
/// payload parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventPayload {
    pub(crate) signed: SignedEvent,
    pub(crate) payload: Payload,
    /// Encoded size, cached at build/decode time.
    pub(crate) size: usize,
}

impl EventPayload {
    pub fn event(&self) -> &Event {
        &self.signed.event
    }

    pub fn sig(&self) -> &Signature {
        &self.signed.sig
    }

    pub fn signed_locator(&self) -> SignedLocator {
        self.signed.signed_locator()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.payload.txs
    }

    pub fn misbehaviour_proofs(&self) -> &[MisbehaviourProof] {
        &self.payload.misbehaviour_proofs
    }

    pub fn block_votes(&self) -> &BlockVotes {
        &self.payload.block_votes
    }

    pub fn epoch_vote(&self) -> &EpochVote {
        &self.payload.epoch_vote
    }

    pub fn id(&self) -> EventId {
        self.signed.event.id
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn any_txs(&self) -> bool {
        !self.payload.txs.is_empty()
    }

    pub fn any_misbehaviour_proofs(&self) -> bool {
        !self.payload.misbehaviour_proofs.is_empty()
    }

    pub fn any_block_votes(&self) -> bool {
        !self.payload.block_votes.is_empty()
    }

    pub fn any_epoch_vote(&self) -> bool {
        !self.payload.epoch_vote.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packs_epoch_and_lamport() {
        let id = pack_id([0xee; 32], 7, 900);
        assert_eq!(id.epoch(), 7);
        assert_eq!(id.lamport(), 900);
        assert_eq!(&id.0[8..], &[0xee; 24]);
    }

    #[test]
    fn id_order_follows_epoch_then_lamport() {
        let a = pack_id([0xff; 32], 1, 500);
        let b = pack_id([0x00; 32], 2, 1);
        let c = pack_id([0x00; 32], 2, 2);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn id_next_increments_big_endian() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0xff;
        assert_eq!(EventId(bytes).next().0[30], 1);
        assert_eq!(EventId(bytes).next().0[31], 0);
    }

    #[test]
    fn empty_payload_hashes_differ_by_version() {
        assert_ne!(empty_payload_hash(0), empty_payload_hash(1));
        // but each version is stable
        assert_eq!(empty_payload_hash(1), empty_payload_hash(1));
    }

    #[test]
    fn block_votes_last_block() {
        let bvs = BlockVotes {
            epoch: 3,
            start: 100,
            votes: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
        };
        assert_eq!(bvs.last_block(), 102);
    }
}
