//! # Aphelion
//!
//! The event-processing core of a leaderless asynchronous BFT node backed by
//! a DAG ledger:
//! - **Signed events**: every validator continuously emits events referencing
//!   parent events; ids are ordered by (epoch, lamport) by construction
//! - **Gas-power accounting**: dual-window rate limiting bounds each
//!   validator's event production
//! - **LLR voting**: out-of-band stake-weighted votes decide block and epoch
//!   records at ≥⅓+1 stake, ahead of full record delivery
//! - **Streaming sync**: session-oriented pull protocol downloading missing
//!   events (or their ids) in bounded chunks

pub mod checkers;
pub mod config;
pub mod crypto;
pub mod dag;
pub mod engine;
pub mod event;
pub mod export;
pub mod gaspower;
pub mod genesis;
pub mod llr;
pub mod processor;
pub mod recovery;
pub mod store;
pub mod stream;
pub mod validators;

/// Protocol constants
pub mod constants {
    /// Maximum number of parent references per event
    pub const MAX_PARENTS: usize = 10;
    /// Maximum number of parents that carry no gas cost
    pub const MAX_FREE_PARENTS: usize = 3;
    /// Maximum size of the opaque extra-data field in bytes
    pub const MAX_EXTRA_DATA: usize = 128;
    /// Event-time granularity in nanoseconds; creation and median times are
    /// quantized to this unit so builder and verifier agree bit-for-bit
    pub const MIN_EVENT_TIME: u64 = 1_000_000;
    /// Gas charged per event, before per-parent and per-byte surcharges
    pub const EVENT_GAS: u64 = 28_000;
    /// Gas charged per parent beyond the free allowance
    pub const PARENT_GAS: u64 = 2_400;
    /// Gas charged per byte of the encoded event
    pub const EXTRA_DATA_GAS: u64 = 25;
    /// Maximum decoded size of a single event in bytes
    pub const MAX_EVENT_BYTES: usize = 1024 * 1024;
    /// Maximum total byte size of a store or wire value we will deserialize
    pub const MAX_VALUE_BYTES: u64 = 16 * 1024 * 1024;
    /// Default number of seeder sender tasks
    pub const SENDER_THREADS: usize = 8;
    /// Default number of events per streaming chunk
    pub const CHUNK_NUM_LIMIT: u32 = 500;
    /// Default byte budget per streaming chunk
    pub const CHUNK_SIZE_LIMIT: u64 = 512 * 1024;
    /// Magic prefix of genesis and events-export files
    pub const FILE_HEADER: &[u8; 4] = b"Aphe";
    /// Version bytes of genesis and events-export files
    pub const FILE_VERSION: &[u8; 2] = &[1, 0];
    /// Size of one hash-file piece inside a genesis section
    pub const FILES_HASH_PIECE_SIZE: usize = 64 * 1024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Hash `data` under a named domain.
///
/// The domain is absorbed as a big-endian-length-framed prefix of the
/// input, so a digest from one domain can never be reproduced in another:
/// equality requires both the domain and the data to match exactly.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(domain.len() as u32).to_be_bytes());
    hasher.update(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash an ordered list of byte strings without concatenation ambiguity.
///
/// Each part is reduced to its own digest first; the outer hash absorbs
/// those digests in order plus the part count. Moving bytes across a part
/// boundary (`["AB","C"]` vs `["A","BC"]`) or splitting a part in two
/// changes the inner digests, so the result changes too.
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(blake3::hash(part).as_bytes());
    }
    hasher.update(&(parts.len() as u32).to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// Serialize a value with the crate-wide bincode configuration.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_limit(constants::MAX_VALUE_BYTES)
        .serialize(value)
}

/// Deserialize a value with the crate-wide bincode configuration.
///
/// The size limit bounds allocations driven by untrusted length prefixes.
pub fn deserialize<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_limit(constants::MAX_VALUE_BYTES)
        .deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_concat_is_unambiguous() {
        let a = hash_concat(&[b"AB", b"C"]);
        let b = hash_concat(&[b"A", b"BC"]);
        assert_ne!(a, b);
        // part count is committed as well
        assert_ne!(hash_concat(&[]), hash_concat(&[b""]));
        assert_ne!(hash_concat(&[b"AB"]), hash_concat(&[b"AB", b""]));
    }

    #[test]
    fn hash_domain_separates() {
        let a = hash_domain(b"aphelion.test.a", b"payload");
        let b = hash_domain(b"aphelion.test.b", b"payload");
        assert_ne!(a, b);
        // domain/data boundary cannot be shifted
        assert_ne!(
            hash_domain(b"aphelion.x", b"ypayload"),
            hash_domain(b"aphelion.xy", b"payload")
        );
    }
}
