//! Commit discipline: the dirty/clean flush marker and the commit cycle.
//!
//! Before flushing, the database is marked *dirty* (`0x00` + a monotonic
//! nanosecond id); after a successful flush the marker is rewritten *clean*
//! (`0x01` + the same id). A node that crashes mid-flush therefore comes
//! back up with a dirty marker, which routes start-up into the recovery
//! path instead of normal operation. The id doubles as a cross-database
//! consistency check: databases flushed together carry the same id.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Store, StoreError};

/// Key of the flush marker, present in every database.
pub const FLUSH_ID_KEY: &[u8] = b"flush_id";
/// Marker prefix: flush in progress (or torn).
pub const DIRTY_PREFIX: u8 = 0x00;
/// Marker prefix: last flush completed.
pub const CLEAN_PREFIX: u8 = 0x01;

/// Decoded flush marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushMarker {
    pub clean: bool,
    pub id: u64,
}

/// Read the flush marker of an arbitrary sled database.
pub fn read_marker(db: &sled::Db) -> Result<Option<FlushMarker>, sled::Error> {
    let Some(bytes) = db.get(FLUSH_ID_KEY)? else {
        return Ok(None);
    };
    if bytes.len() != 9 {
        return Ok(None);
    }
    Ok(Some(FlushMarker {
        clean: bytes[0] == CLEAN_PREFIX,
        id: u64::from_be_bytes(bytes[1..9].try_into().unwrap_or([0u8; 8])),
    }))
}

/// Write a flush marker into an arbitrary sled database.
pub fn write_marker(db: &sled::Db, clean: bool, id: u64) -> Result<(), sled::Error> {
    let mut value = [0u8; 9];
    value[0] = if clean { CLEAN_PREFIX } else { DIRTY_PREFIX };
    value[1..9].copy_from_slice(&id.to_be_bytes());
    db.insert(FLUSH_ID_KEY, &value[..])?;
    Ok(())
}

/// Monotonic marker id: nanoseconds since the epoch.
pub fn new_marker_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Store {
    /// Whether start-up found a dirty marker (crash mid-flush).
    pub fn is_dirty(&self) -> Result<bool, StoreError> {
        Ok(read_marker(&self.db)?.map(|m| !m.clean).unwrap_or(false))
    }

    /// Whether the next `commit` should run now. Epoch seals always
    /// commit; otherwise commit once enough writes accumulated.
    pub fn is_commit_needed(&self, epoch_sealed: bool) -> bool {
        if epoch_sealed {
            return true;
        }
        self.dirty_ops.load(Ordering::Relaxed) >= self.config.commit_ops_threshold
    }

    /// Flush every dirty table under a dirty→clean marker cycle.
    pub fn commit(&self) -> Result<(), StoreError> {
        let id = new_marker_id();
        write_marker(&self.db, false, id)?;
        self.db.flush()?;

        // a store that never saw genesis has no singletons to flush
        for flush in [
            Self::flush_block_state,
            Self::flush_epoch_state,
            Self::flush_llr_state,
        ] {
            match flush(self) {
                Ok(()) | Err(StoreError::GenesisNotApplied) => {}
                Err(other) => return Err(other),
            }
        }
        for tree in [
            &self.tables.events,
            &self.tables.heads,
            &self.tables.last_events,
            &self.tables.blocks,
            &self.tables.block_index,
            &self.tables.block_state,
            &self.tables.epoch_state,
            &self.tables.history_states,
            &self.tables.epoch_blocks,
            &self.tables.llr_state,
            &self.tables.llr_block_votes,
            &self.tables.llr_epoch_votes,
            &self.tables.llr_block_results,
            &self.tables.llr_epoch_results,
            &self.tables.llr_seen_bvs,
            &self.tables.llr_seen_evs,
            &self.tables.last_bvs,
            &self.tables.last_evs,
            &self.tables.genesis,
        ] {
            tree.flush()?;
        }

        write_marker(&self.db, true, id)?;
        self.db.flush()?;
        self.dirty_ops.store(0, Ordering::Relaxed);
        Ok(())
    }
}
