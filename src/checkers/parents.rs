//! Graph consistency against resolved parent events: same epoch, lamport
//! rule, and the self-parent convention.

use crate::event::EventPayload;

use super::EventCheckError;

/// Validate `event` against its resolved parents. `parents[i]` must be the
/// event with id `event.parents()[i]`; the caller resolves them (and maps a
/// failed lookup to [`EventCheckError::MissingParent`]).
pub fn validate(event: &EventPayload, parents: &[EventPayload]) -> Result<(), EventCheckError> {
    let header = event.event();
    debug_assert_eq!(header.parents().len(), parents.len());

    for parent in parents {
        let parent_header = parent.event();
        if parent_header.epoch() != header.epoch() {
            return Err(EventCheckError::ParentEpochMismatch {
                parent: parent_header.id(),
                parent_epoch: parent_header.epoch(),
                event_epoch: header.epoch(),
            });
        }
    }

    // lamport(e) = 1 + max(lamport(p)); empty parents → 1
    let max_parent_lamport = parents
        .iter()
        .map(|p| p.event().lamport())
        .max()
        .unwrap_or(0);
    if header.lamport() != max_parent_lamport + 1 {
        return Err(EventCheckError::WrongLamport);
    }

    if header.seq() > 1 {
        let self_parent = parents.first().ok_or(EventCheckError::NoParents)?.event();
        if self_parent.creator() != header.creator() || self_parent.seq() + 1 != header.seq() {
            return Err(EventCheckError::WrongSelfParent);
        }
        // the remaining parents must come from other validators
        if parents[1..]
            .iter()
            .any(|p| p.event().creator() == header.creator())
        {
            return Err(EventCheckError::WrongSelfParent);
        }
    } else if parents
        .iter()
        .any(|p| p.event().creator() == header.creator())
    {
        // a first event has no earlier own event to reference
        return Err(EventCheckError::WrongSelfParent);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::builder::EventBuilder;
    use crate::event::EventId;
    use crate::validators::ValidatorId;

    fn event(creator: u32, epoch: u32, seq: u32, lamport: u32, parents: Vec<EventId>) -> EventPayload {
        EventBuilder::new()
            .epoch(epoch)
            .creator(ValidatorId(creator))
            .seq(seq)
            .lamport(lamport)
            .creation_time(1)
            .parents(parents)
            .build()
    }

    #[test]
    fn accepts_valid_self_chain() {
        let e1 = event(1, 1, 1, 1, vec![]);
        let e2 = event(1, 1, 2, 2, vec![e1.id()]);
        validate(&e2, &[e1]).unwrap();
    }

    #[test]
    fn rejects_parent_from_other_epoch() {
        let parent = event(2, 1, 1, 1, vec![]);
        let child = event(1, 2, 2, 2, vec![parent.id()]);
        assert!(matches!(
            validate(&child, &[parent]),
            Err(EventCheckError::ParentEpochMismatch { .. })
        ));
    }

    #[test]
    fn rejects_wrong_lamport() {
        let parent = event(2, 1, 1, 5, vec![]);
        let child = event(1, 1, 1, 5, vec![parent.id()]);
        assert_eq!(
            validate(&child, &[parent]),
            Err(EventCheckError::WrongLamport)
        );
    }

    #[test]
    fn rejects_self_parent_with_gapped_seq() {
        let e1 = event(1, 1, 1, 1, vec![]);
        let e3 = event(1, 1, 3, 2, vec![e1.id()]);
        assert_eq!(
            validate(&e3, &[e1]),
            Err(EventCheckError::WrongSelfParent)
        );
    }

    #[test]
    fn rejects_foreign_first_parent_for_seq_above_one() {
        let other = event(2, 1, 1, 1, vec![]);
        let child = event(1, 1, 2, 2, vec![other.id()]);
        assert_eq!(
            validate(&child, &[other]),
            Err(EventCheckError::WrongSelfParent)
        );
    }

    #[test]
    fn rejects_own_parent_on_first_event() {
        let e1 = event(1, 1, 1, 1, vec![]);
        let wrong = event(1, 1, 1, 2, vec![e1.id()]);
        assert_eq!(
            validate(&wrong, &[e1]),
            Err(EventCheckError::WrongSelfParent)
        );
    }
}
