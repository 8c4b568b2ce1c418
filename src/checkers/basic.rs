//! Shape checks: field bounds and internal consistency that need no state
//! beyond the network rules.

use crate::config::Rules;
use crate::event::EventPayload;
use crate::gaspower::calc_gas_power_used;

use super::EventCheckError;

/// Highest event format version this node understands.
pub const MAX_SUPPORTED_VERSION: u8 = 1;

pub struct BasicChecker {
    rules: Rules,
}

impl BasicChecker {
    pub fn new(rules: Rules) -> Self {
        BasicChecker { rules }
    }

    pub fn validate(&self, event: &EventPayload) -> Result<(), EventCheckError> {
        let header = event.event();

        if header.version() > MAX_SUPPORTED_VERSION {
            return Err(EventCheckError::UnsupportedVersion(header.version()));
        }
        if header.seq() == 0 {
            return Err(EventCheckError::ZeroSeq);
        }
        if header.creation_time() == 0 {
            return Err(EventCheckError::ZeroTime);
        }
        if header.seq() > 1 && header.parents().is_empty() {
            return Err(EventCheckError::NoParents);
        }
        if header.parents().len() > self.rules.dag.max_parents {
            return Err(EventCheckError::TooManyParents {
                got: header.parents().len(),
                limit: self.rules.dag.max_parents,
            });
        }
        for (i, parent) in header.parents().iter().enumerate() {
            if header.parents()[..i].contains(parent) {
                return Err(EventCheckError::DoubleParent);
            }
        }
        if header.extra().len() > self.rules.dag.max_extra_data {
            return Err(EventCheckError::ExtraTooLarge {
                got: header.extra().len(),
                limit: self.rules.dag.max_extra_data,
            });
        }
        // a self-chain advances lamport at least as fast as seq, and
        // an empty-parents event sits at lamport 1
        if header.lamport() < header.seq() {
            return Err(EventCheckError::WrongLamport);
        }
        if header.parents().is_empty() && header.lamport() != 1 {
            return Err(EventCheckError::WrongLamport);
        }
        if header.gas_power_used() < calc_gas_power_used(event, &self.rules) {
            return Err(EventCheckError::WrongGasUsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::builder::EventBuilder;
    use crate::event::EventId;
    use crate::validators::ValidatorId;

    fn checker() -> BasicChecker {
        BasicChecker::new(Rules::fakenet())
    }

    fn valid_builder() -> EventBuilder {
        let builder = EventBuilder::new()
            .epoch(1)
            .seq(1)
            .creator(ValidatorId(1))
            .lamport(1)
            .creation_time(1_000_000);
        let probe = builder.clone().build();
        builder.gas_power_used(calc_gas_power_used(&probe, &Rules::fakenet()) + 64)
    }

    #[test]
    fn accepts_well_formed_event() {
        checker().validate(&valid_builder().build()).unwrap();
    }

    #[test]
    fn rejects_zero_seq() {
        let event = valid_builder().seq(0).build();
        assert_eq!(
            checker().validate(&event),
            Err(EventCheckError::ZeroSeq)
        );
    }

    #[test]
    fn rejects_seq_two_without_parents() {
        let event = valid_builder().seq(2).lamport(2).build();
        assert_eq!(checker().validate(&event), Err(EventCheckError::NoParents));
    }

    #[test]
    fn rejects_oversized_extra() {
        let event = valid_builder()
            .extra(vec![0u8; Rules::fakenet().dag.max_extra_data + 1])
            .build();
        assert!(matches!(
            checker().validate(&event),
            Err(EventCheckError::ExtraTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_parent() {
        let parent = EventId::epoch_floor(1);
        let event = valid_builder()
            .seq(2)
            .lamport(2)
            .parents(vec![parent, parent])
            .build();
        assert_eq!(
            checker().validate(&event),
            Err(EventCheckError::DoubleParent)
        );
    }

    #[test]
    fn rejects_lamport_below_seq() {
        let parent = EventId::epoch_floor(1);
        let event = valid_builder()
            .seq(3)
            .lamport(2)
            .parents(vec![parent])
            .build();
        assert_eq!(
            checker().validate(&event),
            Err(EventCheckError::WrongLamport)
        );
    }

    #[test]
    fn rejects_understated_gas_used() {
        let event = valid_builder().gas_power_used(0).build();
        assert_eq!(
            checker().validate(&event),
            Err(EventCheckError::WrongGasUsed)
        );
    }
}
