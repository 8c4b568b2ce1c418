//! Stake-weighted validator sets.
//!
//! A `ValidatorSet` is the immutable roster of one epoch: validator ids
//! mapped to dense indices (heaviest first) with their stake weights. Dense
//! indices let per-validator state live in plain vectors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;

/// Validator identifier, assigned at registration and stable across epochs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ValidatorId(pub u32);

impl std::fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense per-epoch validator index (0..len), ordered heaviest first.
pub type ValidatorIdx = u32;

/// Stake weight.
pub type Weight = u64;

/// A validator's registration profile carried in epoch state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorProfile {
    pub pubkey: PublicKey,
    pub stake: Weight,
}

/// Immutable stake-weighted set of one epoch's validators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    ids: Vec<ValidatorId>,
    weights: Vec<Weight>,
    #[serde(skip)]
    indices: HashMap<ValidatorId, ValidatorIdx>,
    total: Weight,
}

impl ValidatorSet {
    /// Build a set from `(id, weight)` pairs. Zero-weight entries are
    /// dropped; duplicates keep the last weight. Members are ordered by
    /// descending weight, ties broken by ascending id, so indices are
    /// deterministic.
    pub fn from_weights<I: IntoIterator<Item = (ValidatorId, Weight)>>(pairs: I) -> Self {
        let mut dedup: HashMap<ValidatorId, Weight> = HashMap::new();
        for (id, weight) in pairs {
            dedup.insert(id, weight);
        }
        let mut members: Vec<(ValidatorId, Weight)> =
            dedup.into_iter().filter(|(_, w)| *w > 0).collect();
        members.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut set = ValidatorSet {
            ids: members.iter().map(|(id, _)| *id).collect(),
            weights: members.iter().map(|(_, w)| *w).collect(),
            indices: HashMap::new(),
            total: members.iter().map(|(_, w)| w).sum(),
        };
        set.rebuild_indices();
        set
    }

    /// Restore the id→index map after deserialization (it is not persisted).
    pub fn rebuild_indices(&mut self) {
        self.indices = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as ValidatorIdx))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.indices.contains_key(&id)
    }

    /// Dense index of a member, if present.
    pub fn idx_of(&self, id: ValidatorId) -> Option<ValidatorIdx> {
        self.indices.get(&id).copied()
    }

    /// Id at a dense index. Panics if out of range.
    pub fn id_at(&self, idx: ValidatorIdx) -> ValidatorId {
        self.ids[idx as usize]
    }

    pub fn weight_of(&self, id: ValidatorId) -> Option<Weight> {
        self.idx_of(id).map(|i| self.weights[i as usize])
    }

    pub fn weight_at(&self, idx: ValidatorIdx) -> Weight {
        self.weights[idx as usize]
    }

    pub fn total_weight(&self) -> Weight {
        self.total
    }

    /// Byzantine quorum: more than ⅔ of total stake.
    pub fn quorum(&self) -> Weight {
        self.total * 2 / 3 + 1
    }

    /// Iterate `(idx, id, weight)` heaviest first.
    pub fn iter(&self) -> impl Iterator<Item = (ValidatorIdx, ValidatorId, Weight)> + '_ {
        self.ids
            .iter()
            .zip(self.weights.iter())
            .enumerate()
            .map(|(i, (id, w))| (i as ValidatorIdx, *id, *w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(pairs: &[(u32, u64)]) -> ValidatorSet {
        ValidatorSet::from_weights(pairs.iter().map(|&(id, w)| (ValidatorId(id), w)))
    }

    #[test]
    fn ordering_is_heaviest_first() {
        let set = set_of(&[(1, 10), (2, 30), (3, 20)]);
        assert_eq!(set.id_at(0), ValidatorId(2));
        assert_eq!(set.id_at(1), ValidatorId(3));
        assert_eq!(set.id_at(2), ValidatorId(1));
        assert_eq!(set.total_weight(), 60);
    }

    #[test]
    fn ties_break_by_id() {
        let set = set_of(&[(5, 10), (3, 10), (4, 10)]);
        assert_eq!(set.id_at(0), ValidatorId(3));
        assert_eq!(set.id_at(1), ValidatorId(4));
        assert_eq!(set.id_at(2), ValidatorId(5));
    }

    #[test]
    fn zero_weight_dropped() {
        let set = set_of(&[(1, 0), (2, 5)]);
        assert_eq!(set.len(), 1);
        assert!(!set.contains(ValidatorId(1)));
    }

    #[test]
    fn quorum_thresholds() {
        let set = set_of(&[(1, 1), (2, 1), (3, 1), (4, 1)]);
        assert_eq!(set.quorum(), 3);
    }

    #[test]
    fn indices_survive_roundtrip() {
        let set = set_of(&[(1, 10), (2, 20)]);
        let bytes = crate::serialize(&set).unwrap();
        let mut restored: ValidatorSet = crate::deserialize(&bytes).unwrap();
        restored.rebuild_indices();
        assert_eq!(restored.idx_of(ValidatorId(2)), Some(0));
        assert_eq!(restored.total_weight(), 30);
    }
}
