//! Deterministic wire codec for events.
//!
//! Length-prefixed, fixed field order, little-endian integers. The header
//! section doubles as the hashing preimage: the base hash is computed over
//! exactly the bytes `encode_header` produces, so encoding and hashing can
//! never drift apart. `decode(encode(e)) == e` including the cached hashes
//! and id.

use crate::constants;
use crate::crypto::{Signature, SIGNATURE_BYTES};
use crate::validators::ValidatorId;
use crate::Hash;

use super::{
    calc_locator_hash, pack_id, BlockVotes, EpochVote, Event, EventId, EventPayload, GasPowerLeft,
    Locator, MisbehaviourProof, Payload, SignedEvent, SignedLocator, Transaction,
};

/// Codec failures. Decoding is driven by untrusted peer input; every length
/// is bounds-checked before allocation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("encoded event exceeds {0} bytes")]
    TooLarge(usize),
    #[error("{what} length {got} exceeds limit {limit}")]
    LengthLimit {
        what: &'static str,
        got: usize,
        limit: usize,
    },
    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },
    #[error("{0} trailing bytes after event")]
    TrailingBytes(usize),
}

/// Encode the header section (everything that is hashed into the base hash).
pub fn encode_header(event: &Event) -> Vec<u8> {
    let mut w = Writer::with_capacity(128 + 32 * event.parents.len() + event.extra.len());
    w.put_u8(event.version);
    w.put_u32(event.epoch);
    w.put_u32(event.seq);
    w.put_u32(event.creator.0);
    w.put_u32(event.lamport);
    w.put_u8(event.parents.len() as u8);
    for parent in &event.parents {
        w.put_hash(&parent.0);
    }
    w.put_u64(event.creation_time);
    w.put_u64(event.median_time);
    match &event.prev_epoch_hash {
        Some(hash) => {
            w.put_u8(1);
            w.put_hash(hash);
        }
        None => w.put_u8(0),
    }
    w.put_u64(event.gas_power_used);
    w.put_u64(event.gas_power_left.0[0]);
    w.put_u64(event.gas_power_left.0[1]);
    w.put_u32(event.extra.len() as u32);
    w.put_bytes(&event.extra);
    w.put_hash(&event.payload_hash);
    w.into_inner()
}

/// Encode a full event payload for the wire and the store.
pub fn encode(event: &EventPayload) -> Vec<u8> {
    let mut w = Writer::with_capacity(event.size.max(256));
    w.put_bytes(&encode_header(event.event()));
    w.put_bytes(event.sig().as_bytes());

    let payload = event.payload();
    w.put_u32(payload.txs.len() as u32);
    for tx in &payload.txs {
        w.put_u64(tx.gas_price);
        w.put_u64(tx.gas_limit);
        w.put_u32(tx.payload.len() as u32);
        w.put_bytes(&tx.payload);
    }
    w.put_u32(payload.misbehaviour_proofs.len() as u32);
    for proof in &payload.misbehaviour_proofs {
        encode_misbehaviour(&mut w, proof);
    }
    w.put_u32(payload.block_votes.epoch);
    w.put_u64(payload.block_votes.start);
    w.put_u32(payload.block_votes.votes.len() as u32);
    for vote in &payload.block_votes.votes {
        w.put_hash(vote);
    }
    w.put_u32(payload.epoch_vote.epoch);
    w.put_hash(&payload.epoch_vote.vote);
    w.into_inner()
}

/// Decode an event, restoring the cached hashes, id, and size.
pub fn decode(input: &[u8]) -> Result<EventPayload, CodecError> {
    if input.len() > constants::MAX_EVENT_BYTES {
        return Err(CodecError::TooLarge(constants::MAX_EVENT_BYTES));
    }
    let mut r = Reader::new(input);

    let header_start = r.pos;
    let version = r.u8()?;
    let epoch = r.u32()?;
    let seq = r.u32()?;
    let creator = ValidatorId(r.u32()?);
    let lamport = r.u32()?;
    let parent_count = r.u8()? as usize;
    if parent_count > constants::MAX_PARENTS {
        return Err(CodecError::LengthLimit {
            what: "parents",
            got: parent_count,
            limit: constants::MAX_PARENTS,
        });
    }
    let mut parents = Vec::with_capacity(parent_count);
    for _ in 0..parent_count {
        parents.push(EventId(r.hash()?));
    }
    let creation_time = r.u64()?;
    let median_time = r.u64()?;
    let prev_epoch_hash = match r.u8()? {
        0 => None,
        _ => Some(r.hash()?),
    };
    let gas_power_used = r.u64()?;
    let gas_power_left = GasPowerLeft([r.u64()?, r.u64()?]);
    let extra_len = r.u32()? as usize;
    if extra_len > constants::MAX_EXTRA_DATA {
        return Err(CodecError::LengthLimit {
            what: "extra",
            got: extra_len,
            limit: constants::MAX_EXTRA_DATA,
        });
    }
    let extra = r.bytes(extra_len)?.to_vec();
    let payload_hash = r.hash()?;
    let header_bytes = &input[header_start..r.pos];

    let sig_bytes: [u8; SIGNATURE_BYTES] = r
        .bytes(SIGNATURE_BYTES)?
        .try_into()
        .expect("fixed-size read");
    let sig = Signature::from_bytes(sig_bytes);

    let tx_count = r.u32()? as usize;
    r.check_remaining(tx_count, 20, "transactions")?;
    let mut txs = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        let gas_price = r.u64()?;
        let gas_limit = r.u64()?;
        let payload_len = r.u32()? as usize;
        let payload = r.bytes(payload_len)?.to_vec();
        txs.push(Transaction {
            gas_price,
            gas_limit,
            payload,
        });
    }
    let mp_count = r.u32()? as usize;
    // smallest proof variant: 1 tag byte + two 144-byte signed locators
    r.check_remaining(mp_count, 289, "misbehaviour proofs")?;
    let mut misbehaviour_proofs = Vec::with_capacity(mp_count);
    for _ in 0..mp_count {
        misbehaviour_proofs.push(decode_misbehaviour(&mut r)?);
    }
    let bv_epoch = r.u32()?;
    let bv_start = r.u64()?;
    let bv_count = r.u32()? as usize;
    r.check_remaining(bv_count, 32, "block votes")?;
    let mut votes = Vec::with_capacity(bv_count);
    for _ in 0..bv_count {
        votes.push(r.hash()?);
    }
    let epoch_vote = EpochVote {
        epoch: r.u32()?,
        vote: r.hash()?,
    };

    if r.pos != input.len() {
        return Err(CodecError::TrailingBytes(input.len() - r.pos));
    }

    let base_hash = crate::hash_domain(b"aphelion.event.base", header_bytes);
    let locator_hash = if version == 0 {
        base_hash
    } else {
        calc_locator_hash(&base_hash, epoch, seq, lamport, creator, &payload_hash)
    };
    let id = pack_id(locator_hash, epoch, lamport);

    Ok(EventPayload {
        signed: SignedEvent {
            event: Event {
                version,
                epoch,
                seq,
                creator,
                lamport,
                parents,
                creation_time,
                median_time,
                prev_epoch_hash,
                gas_power_used,
                gas_power_left,
                extra,
                payload_hash,
                base_hash,
                locator_hash,
                id,
            },
            sig,
        },
        payload: Payload {
            txs,
            misbehaviour_proofs,
            block_votes: BlockVotes {
                epoch: bv_epoch,
                start: bv_start,
                votes,
            },
            epoch_vote,
        },
        size: input.len(),
    })
}

fn encode_misbehaviour(w: &mut Writer, proof: &MisbehaviourProof) {
    match proof {
        MisbehaviourProof::EventsDoublesign { pair } => {
            w.put_u8(0);
            for locator in pair {
                encode_signed_locator(w, locator);
            }
        }
        MisbehaviourProof::BlockVoteDoublesign { pair, block } => {
            w.put_u8(1);
            for locator in pair {
                encode_signed_locator(w, locator);
            }
            w.put_u64(*block);
        }
    }
}

fn decode_misbehaviour(r: &mut Reader) -> Result<MisbehaviourProof, CodecError> {
    match r.u8()? {
        0 => Ok(MisbehaviourProof::EventsDoublesign {
            pair: [decode_signed_locator(r)?, decode_signed_locator(r)?],
        }),
        1 => Ok(MisbehaviourProof::BlockVoteDoublesign {
            pair: [decode_signed_locator(r)?, decode_signed_locator(r)?],
            block: r.u64()?,
        }),
        tag => Err(CodecError::UnknownTag {
            what: "misbehaviour proof",
            tag,
        }),
    }
}

fn encode_signed_locator(w: &mut Writer, signed: &SignedLocator) {
    w.put_hash(&signed.locator.base_hash);
    w.put_u32(signed.locator.epoch);
    w.put_u32(signed.locator.seq);
    w.put_u32(signed.locator.lamport);
    w.put_u32(signed.locator.creator.0);
    w.put_hash(&signed.locator.payload_hash);
    w.put_bytes(signed.sig.as_bytes());
}

fn decode_signed_locator(r: &mut Reader) -> Result<SignedLocator, CodecError> {
    let base_hash = r.hash()?;
    let epoch = r.u32()?;
    let seq = r.u32()?;
    let lamport = r.u32()?;
    let creator = ValidatorId(r.u32()?);
    let payload_hash = r.hash()?;
    let sig_bytes: [u8; SIGNATURE_BYTES] = r
        .bytes(SIGNATURE_BYTES)?
        .try_into()
        .expect("fixed-size read");
    Ok(SignedLocator {
        locator: Locator {
            base_hash,
            epoch,
            seq,
            lamport,
            creator,
            payload_hash,
        },
        sig: Signature::from_bytes(sig_bytes),
    })
}

struct Writer(Vec<u8>);

impl Writer {
    fn with_capacity(cap: usize) -> Self {
        Writer(Vec::with_capacity(cap))
    }
    fn put_u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn put_u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn put_hash(&mut self, h: &Hash) {
        self.0.extend_from_slice(h);
    }
    fn put_bytes(&mut self, b: &[u8]) {
        self.0.extend_from_slice(b);
    }
    fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Reader { input, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.input.len() - self.pos < n {
            return Err(CodecError::UnexpectedEof);
        }
        let out = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<Hash, CodecError> {
        Ok(self.bytes(32)?.try_into().unwrap())
    }

    /// Reject a claimed element count that cannot fit in the remaining
    /// input, before allocating for it.
    fn check_remaining(
        &self,
        count: usize,
        min_elem_size: usize,
        what: &'static str,
    ) -> Result<(), CodecError> {
        let remaining = self.input.len() - self.pos;
        if count.saturating_mul(min_elem_size) > remaining {
            return Err(CodecError::LengthLimit {
                what,
                got: count,
                limit: remaining / min_elem_size.max(1),
            });
        }
        Ok(())
    }
}
