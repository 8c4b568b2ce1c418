//! Dirty-database recovery.
//!
//! A node that crashed mid-flush leaves dirty flush markers behind. This
//! side-door routine rolls the node back to the last closed epoch: the
//! historical `(block_state, epoch_state)` pair becomes the live state,
//! the aborted epoch's events and the consensus databases are dropped, a
//! fresh consensus database is seeded from the epoch state, and every
//! marker is rewritten clean. Not part of normal operation.
//!
//! Layout convention: every direct subdirectory of the data directory is
//! one sled database. The gossip store is `gossip`, the consensus engine's
//! main database `consensus`, per-epoch databases `gossip-<n>` /
//! `consensus-<n>`, and `gossip-async` is persistent across recoveries.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::event::{Epoch, EventId};
use crate::store::flush::{new_marker_id, read_marker, write_marker};
use crate::store::{Store, StoreConfig, StoreError};
use crate::validators::ValidatorSet;
use crate::Hash;

/// Name of the gossip store database.
pub const GOSSIP_DB: &str = "gossip";
/// Name of the consensus engine's main database.
pub const CONSENSUS_DB: &str = "consensus";
/// The one epoch-independent gossip database recovery must keep.
pub const ASYNC_DB: &str = "gossip-async";

/// Recovery failures. Fatal: the operator gets a reason and a non-zero
/// exit, never a half-recovered node.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("irrecoverable dirty DB: {0}")]
    Irrecoverable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("corrupt state: {0}")]
    Serialization(#[from] bincode::Error),
}

/// What the consensus engine needs to rebuild its database from scratch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusGenesis {
    pub epoch: Epoch,
    pub validators: ValidatorSet,
}

/// Key under which [`ConsensusGenesis`] is stored in the consensus db.
pub const CONSENSUS_GENESIS_KEY: &[u8] = b"genesis";

/// List databases under `data_dir` whose flush marker is dirty.
pub fn scan_dirty(data_dir: &Path) -> Result<Vec<String>, RecoveryError> {
    let mut dirty = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let db = sled::open(entry.path())?;
        if let Some(marker) = read_marker(&db)? {
            if !marker.clean {
                dirty.push(name);
            }
        }
        drop(db);
    }
    dirty.sort();
    Ok(dirty)
}

/// Roll the node back to the last closed epoch. `evm_has_state` asks the
/// EVM collaborator whether the state trie behind a root is materialized.
/// Returns the epoch the node was reset to.
pub fn fix_dirty(
    data_dir: &Path,
    evm_has_state: &dyn Fn(&Hash) -> bool,
) -> Result<Epoch, RecoveryError> {
    tracing::info!(dir = %data_dir.display(), "Opening databases");
    let store = Store::open(&data_dir.join(GOSSIP_DB), StoreConfig::default())?;

    tracing::info!("Finding last closed epoch");
    let current = store.get_epoch()?;
    let target = current
        .checked_sub(1)
        .ok_or_else(|| RecoveryError::Irrecoverable("no closed epoch to revert to".into()))?;
    let (block_state, epoch_state) = store
        .get_history_states(target)?
        .ok_or_else(|| RecoveryError::Irrecoverable(format!("epoch {target} is not available")))?;
    if !evm_has_state(&block_state.finalized_state_root) {
        return Err(RecoveryError::Irrecoverable(format!(
            "state for epoch {target} is not available"
        )));
    }

    tracing::info!(epoch = target, "Setting block and epoch state");
    let restored_epoch = epoch_state.epoch;
    store.set_block_epoch_state(block_state, epoch_state);

    // drop all per-epoch data from the restored epoch on: the DAG of the
    // restored epoch restarts empty and is re-downloaded from peers
    let floor = EventId::epoch_floor(restored_epoch);
    let mut stale = Vec::new();
    store.for_each_event_from(floor.as_bytes(), |id, _| {
        stale.push(id);
        true
    })?;
    for id in &stale {
        store.del_event(id)?;
    }
    store.reset_epoch_store(restored_epoch + 1)?;
    store.commit()?;
    drop(store);

    tracing::info!("Removing epoch and consensus databases");
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_epoch_db = (name.starts_with("gossip-") || name.starts_with("consensus-"))
            && name != ASYNC_DB;
        if is_epoch_db || name == CONSENSUS_DB {
            tracing::info!(name = %name, "Dropping database");
            std::fs::remove_dir_all(entry.path())?;
        }
    }

    tracing::info!("Recreating consensus database");
    let consensus_db = sled::open(data_dir.join(CONSENSUS_DB))?;
    let genesis = ConsensusGenesis {
        epoch: restored_epoch,
        validators: store_validators(data_dir)?,
    };
    consensus_db.insert(CONSENSUS_GENESIS_KEY, crate::serialize(&genesis)?)?;
    consensus_db.flush()?;
    drop(consensus_db);

    tracing::info!("Clearing dirty flags");
    let id = new_marker_id();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let db = sled::open(entry.path())?;
        if let Some(marker) = read_marker(&db)? {
            if !marker.clean {
                tracing::info!(name = %entry.file_name().to_string_lossy().as_ref(), "Found dirty marker, fixing");
            }
        }
        write_marker(&db, true, id)?;
        db.flush()?;
        drop(db);
    }

    tracing::info!(epoch = restored_epoch, "Recovery done");
    Ok(restored_epoch)
}

fn store_validators(data_dir: &Path) -> Result<ValidatorSet, RecoveryError> {
    let store = Store::open(&data_dir.join(GOSSIP_DB), StoreConfig::default())?;
    Ok(store.get_epoch_state()?.validators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::decided::{BlockState, EpochState};
    use crate::validators::ValidatorId;

    fn seeded_data_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(GOSSIP_DB), StoreConfig::default()).unwrap();
        let validators = ValidatorSet::from_weights([(ValidatorId(1), 10)]);
        let history_epoch_state = EpochState {
            epoch: 4,
            validators: validators.clone(),
            ..Default::default()
        };
        let history_block_state = BlockState {
            last_block: 40,
            ..Default::default()
        };
        store
            .set_history_states(4, &history_block_state, &history_epoch_state)
            .unwrap();
        store.set_block_epoch_state(
            BlockState {
                last_block: 50,
                ..Default::default()
            },
            EpochState {
                epoch: 5,
                validators,
                ..Default::default()
            },
        );
        store.commit().unwrap();
        // simulate a crash mid-flush
        write_marker(&store.db, false, 1).unwrap();
        store.db.flush().unwrap();
        drop(store);
        dir
    }

    #[test]
    fn fix_dirty_reverts_to_last_closed_epoch() {
        let dir = seeded_data_dir();
        assert_eq!(scan_dirty(dir.path()).unwrap(), vec![GOSSIP_DB.to_string()]);

        let restored = fix_dirty(dir.path(), &|_| true).unwrap();
        assert_eq!(restored, 4);

        assert!(scan_dirty(dir.path()).unwrap().is_empty());
        let store = Store::open(&dir.path().join(GOSSIP_DB), StoreConfig::default()).unwrap();
        assert_eq!(store.get_epoch().unwrap(), 4);
        assert_eq!(store.get_latest_block_index().unwrap(), 40);
        drop(store);

        let consensus = sled::open(dir.path().join(CONSENSUS_DB)).unwrap();
        let genesis: ConsensusGenesis =
            crate::deserialize(&consensus.get(CONSENSUS_GENESIS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(genesis.epoch, 4);
        assert_eq!(genesis.validators.total_weight(), 10);
    }

    #[test]
    fn missing_history_is_irrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(GOSSIP_DB), StoreConfig::default()).unwrap();
        store.set_block_epoch_state(
            Default::default(),
            EpochState {
                epoch: 5,
                ..Default::default()
            },
        );
        store.commit().unwrap();
        drop(store);
        assert!(matches!(
            fix_dirty(dir.path(), &|_| true),
            Err(RecoveryError::Irrecoverable(_))
        ));
    }

    #[test]
    fn missing_evm_state_is_irrecoverable() {
        let dir = seeded_data_dir();
        assert!(matches!(
            fix_dirty(dir.path(), &|_| false),
            Err(RecoveryError::Irrecoverable(_))
        ));
    }
}
