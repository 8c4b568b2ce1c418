//! Heavy checks: payload-hash recomputation and signature verification.
//!
//! Signature verification dominates validation cost, so it runs last and
//! offers a batch entry point that fans events out across scoped worker
//! threads. The pubkey table is an epoch-scoped snapshot the processor
//! swaps on epoch transition.

use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::PublicKey;
use crate::event::{calc_payload_hash, Epoch, EventPayload};
use crate::validators::ValidatorId;

use super::{EventCheckError, Slot};

/// The pubkey table of one epoch.
#[derive(Clone, Debug, Default)]
pub struct EpochPubkeys {
    pub epoch: Epoch,
    pub keys: HashMap<ValidatorId, PublicKey>,
}

pub struct HeavyChecker {
    pubkeys: Arc<Slot<EpochPubkeys>>,
    /// Worker threads used by `validate_batch`.
    threads: usize,
}

impl HeavyChecker {
    pub fn new(pubkeys: Arc<Slot<EpochPubkeys>>, threads: usize) -> Self {
        HeavyChecker {
            pubkeys,
            threads: threads.max(1),
        }
    }

    pub fn validate(&self, event: &EventPayload) -> Result<(), EventCheckError> {
        let header = event.event();
        if calc_payload_hash(event.payload(), header.version()) != *header.payload_hash() {
            return Err(EventCheckError::WrongPayloadHash);
        }
        let table = self.pubkeys.load();
        let key = table
            .keys
            .get(&header.creator())
            .ok_or(EventCheckError::NotValidator(header.creator()))?;
        if !key.verify(header.hash_to_sign(), event.sig()) {
            return Err(EventCheckError::BadSignature);
        }
        Ok(())
    }

    /// Validate a batch in parallel, preserving input order in the results.
    pub fn validate_batch(&self, events: &[EventPayload]) -> Vec<Result<(), EventCheckError>> {
        if events.len() <= 1 {
            return events.iter().map(|e| self.validate(e)).collect();
        }
        let chunk = events.len().div_ceil(self.threads);
        let mut results: Vec<Result<(), EventCheckError>> = Vec::with_capacity(events.len());
        std::thread::scope(|scope| {
            let handles: Vec<_> = events
                .chunks(chunk)
                .map(|part| scope.spawn(move || part.iter().map(|e| self.validate(e)).collect::<Vec<_>>()))
                .collect();
            for handle in handles {
                results.extend(handle.join().expect("heavy-check worker panicked"));
            }
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;
    use crate::event::builder::EventBuilder;

    fn signed_event(keypair: &SigningKeypair, creator: u32, seq: u32) -> EventPayload {
        let unsigned = EventBuilder::new()
            .epoch(1)
            .creator(ValidatorId(creator))
            .seq(seq)
            .lamport(seq)
            .creation_time(seq as u64);
        let sig = keypair.sign(&unsigned.hash_to_sign());
        unsigned.sig(sig).build()
    }

    fn checker_for(keys: &[(u32, PublicKey)]) -> HeavyChecker {
        let table = EpochPubkeys {
            epoch: 1,
            keys: keys.iter().map(|&(id, key)| (ValidatorId(id), key)).collect(),
        };
        HeavyChecker::new(Arc::new(Slot::new(table)), 4)
    }

    #[test]
    fn accepts_valid_signature() {
        let keypair = SigningKeypair::generate();
        let checker = checker_for(&[(1, keypair.public())]);
        checker.validate(&signed_event(&keypair, 1, 1)).unwrap();
    }

    #[test]
    fn rejects_foreign_signature() {
        let keypair = SigningKeypair::generate();
        let imposter = SigningKeypair::generate();
        let checker = checker_for(&[(1, keypair.public())]);
        assert_eq!(
            checker.validate(&signed_event(&imposter, 1, 1)),
            Err(EventCheckError::BadSignature)
        );
    }

    #[test]
    fn rejects_unknown_creator() {
        let keypair = SigningKeypair::generate();
        let checker = checker_for(&[]);
        assert_eq!(
            checker.validate(&signed_event(&keypair, 1, 1)),
            Err(EventCheckError::NotValidator(ValidatorId(1)))
        );
    }

    #[test]
    fn batch_preserves_order() {
        let keypair = SigningKeypair::generate();
        let imposter = SigningKeypair::generate();
        let checker = checker_for(&[(1, keypair.public())]);
        let events: Vec<EventPayload> = (1..=8)
            .map(|seq| {
                let signer = if seq == 5 { &imposter } else { &keypair };
                signed_event(signer, 1, seq)
            })
            .collect();
        let results = checker.validate_batch(&events);
        for (i, result) in results.iter().enumerate() {
            if i == 4 {
                assert_eq!(result, &Err(EventCheckError::BadSignature));
            } else {
                assert!(result.is_ok());
            }
        }
    }
}
