//! Persistent store: sled-backed tables with typed accessors and bounded
//! caches.
//!
//! The store exclusively owns every persisted table and its in-memory
//! cache. Events are immutable once written; lookups return decoded
//! copies. Block/epoch state singletons are value-copied across component
//! boundaries; nothing hands out a reference into the store's mutable
//! internals.
//!
//! The event-id key layout does double duty: ids order by
//! `(epoch, lamport)`, so a plain range scan over the events tree is
//! exactly the iteration order the streaming seeder and the export need.

pub mod decided;
pub mod flush;
pub mod votes;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::event::{codec, Epoch, EventId, EventPayload};
use crate::validators::ValidatorId;

/// Store failures. Storage I/O errors are fatal for the node: the caller
/// aborts after a best-effort flush rather than continuing on a torn state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] sled::Error),
    #[error("stored event is corrupt: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("stored value is corrupt: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("genesis not applied")]
    GenesisNotApplied,
}

/// Cache bounds and commit cadence.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub events_cache: usize,
    pub blocks_cache: usize,
    /// Writes since the last commit that force the next commit.
    pub commit_ops_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            events_cache: 4096,
            blocks_cache: 1024,
            commit_ops_threshold: 2048,
        }
    }
}

pub(crate) struct Tables {
    pub events: sled::Tree,
    pub heads: sled::Tree,
    pub last_events: sled::Tree,
    pub blocks: sled::Tree,
    pub block_index: sled::Tree,
    pub block_state: sled::Tree,
    pub epoch_state: sled::Tree,
    pub history_states: sled::Tree,
    pub epoch_blocks: sled::Tree,
    pub llr_state: sled::Tree,
    pub llr_block_votes: sled::Tree,
    pub llr_epoch_votes: sled::Tree,
    pub llr_block_results: sled::Tree,
    pub llr_epoch_results: sled::Tree,
    pub llr_seen_bvs: sled::Tree,
    pub llr_seen_evs: sled::Tree,
    pub last_bvs: sled::Tree,
    pub last_evs: sled::Tree,
    pub genesis: sled::Tree,
}

pub(crate) struct Caches {
    pub events: Mutex<LruCache<EventId, EventPayload>>,
    pub blocks: Mutex<LruCache<u64, decided::Block>>,
    pub block_state: parking_lot::RwLock<Option<decided::BlockState>>,
    pub epoch_state: parking_lot::RwLock<Option<decided::EpochState>>,
    pub llr_state: parking_lot::RwLock<Option<crate::llr::LlrState>>,
    pub last_bvs: Mutex<std::collections::HashMap<ValidatorId, u64>>,
    pub last_evs: Mutex<std::collections::HashMap<ValidatorId, Epoch>>,
}

/// The gossip store of one node.
pub struct Store {
    pub(crate) db: sled::Db,
    pub(crate) tables: Tables,
    pub(crate) caches: Caches,
    pub(crate) config: StoreConfig,
    /// Writes since the last successful commit.
    pub(crate) dirty_ops: AtomicU64,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, config)
    }

    /// In-memory store for tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, StoreConfig::default())
    }

    pub(crate) fn from_db(db: sled::Db, config: StoreConfig) -> Result<Self, StoreError> {
        let tables = Tables {
            events: db.open_tree("events")?,
            heads: db.open_tree("heads")?,
            last_events: db.open_tree("last-events")?,
            blocks: db.open_tree("blocks")?,
            block_index: db.open_tree("block-index")?,
            block_state: db.open_tree("block-state")?,
            epoch_state: db.open_tree("epoch-state")?,
            history_states: db.open_tree("history-states")?,
            epoch_blocks: db.open_tree("epoch-blocks")?,
            llr_state: db.open_tree("llr-state")?,
            llr_block_votes: db.open_tree("llr-block-votes")?,
            llr_epoch_votes: db.open_tree("llr-epoch-votes")?,
            llr_block_results: db.open_tree("llr-block-results")?,
            llr_epoch_results: db.open_tree("llr-epoch-results")?,
            llr_seen_bvs: db.open_tree("llr-seen-bvs")?,
            llr_seen_evs: db.open_tree("llr-seen-evs")?,
            last_bvs: db.open_tree("last-bvs")?,
            last_evs: db.open_tree("last-evs")?,
            genesis: db.open_tree("genesis")?,
        };
        let caches = Caches {
            events: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.events_cache.max(1)).unwrap(),
            )),
            blocks: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.blocks_cache.max(1)).unwrap(),
            )),
            block_state: parking_lot::RwLock::new(None),
            epoch_state: parking_lot::RwLock::new(None),
            llr_state: parking_lot::RwLock::new(None),
            last_bvs: Mutex::new(std::collections::HashMap::new()),
            last_evs: Mutex::new(std::collections::HashMap::new()),
        };
        let store = Store {
            db,
            tables,
            caches,
            config,
            dirty_ops: AtomicU64::new(0),
        };
        store.load_vote_highwaters()?;
        Ok(store)
    }

    fn load_vote_highwaters(&self) -> Result<(), StoreError> {
        let mut bvs = self.caches.last_bvs.lock().expect("poisoned");
        for entry in self.tables.last_bvs.iter() {
            let (key, value) = entry?;
            bvs.insert(decode_validator_key(&key), decode_u64(&value));
        }
        drop(bvs);
        let mut evs = self.caches.last_evs.lock().expect("poisoned");
        for entry in self.tables.last_evs.iter() {
            let (key, value) = entry?;
            evs.insert(decode_validator_key(&key), decode_u64(&value) as Epoch);
        }
        Ok(())
    }

    pub(crate) fn bump_dirty(&self) {
        self.dirty_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw database handle, for recovery tooling and crash-simulation in
    /// tests. Everything else goes through the typed accessors.
    pub fn db_handle(&self) -> &sled::Db {
        &self.db
    }

    // ── events ──

    pub fn set_event(&self, event: &EventPayload) -> Result<(), StoreError> {
        let bytes = codec::encode(event);
        self.tables.events.insert(event.id().as_bytes(), bytes)?;
        self.caches
            .events
            .lock()
            .expect("poisoned")
            .put(event.id(), event.clone());
        self.bump_dirty();
        Ok(())
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<EventPayload>, StoreError> {
        if let Some(event) = self.caches.events.lock().expect("poisoned").get(id) {
            return Ok(Some(event.clone()));
        }
        let Some(bytes) = self.tables.events.get(id.as_bytes())? else {
            return Ok(None);
        };
        let event = codec::decode(&bytes)?;
        self.caches
            .events
            .lock()
            .expect("poisoned")
            .put(*id, event.clone());
        Ok(Some(event))
    }

    pub fn has_event(&self, id: &EventId) -> Result<bool, StoreError> {
        if self.caches.events.lock().expect("poisoned").contains(id) {
            return Ok(true);
        }
        Ok(self.tables.events.contains_key(id.as_bytes())?)
    }

    pub fn del_event(&self, id: &EventId) -> Result<(), StoreError> {
        self.tables.events.remove(id.as_bytes())?;
        self.caches.events.lock().expect("poisoned").pop(id);
        self.bump_dirty();
        Ok(())
    }

    /// Iterate stored events with id ≥ `start`, in id order, until the
    /// callback returns `false`. The callback receives `(id, encoded size,
    /// decode)` so id-only consumers skip decoding.
    pub fn for_each_event_from<F>(&self, start: &[u8], mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(EventId, &[u8]) -> bool,
    {
        for entry in self.tables.events.range(start.to_vec()..) {
            let (key, value) = entry?;
            let id = EventId(key.as_ref().try_into().unwrap_or([0u8; 32]));
            if !f(id, value.as_ref()) {
                break;
            }
        }
        Ok(())
    }

    /// All events of an epoch, in id (= lamport) order.
    pub fn epoch_events(&self, epoch: Epoch) -> Result<Vec<EventPayload>, StoreError> {
        let start = EventId::epoch_floor(epoch);
        let stop = EventId::epoch_floor(epoch + 1);
        let mut out = Vec::new();
        for entry in self
            .tables
            .events
            .range(start.as_bytes().to_vec()..stop.as_bytes().to_vec())
        {
            let (_, value) = entry?;
            out.push(codec::decode(&value)?);
        }
        Ok(out)
    }

    // ── heads ──

    pub fn add_head(&self, epoch: Epoch, id: &EventId) -> Result<(), StoreError> {
        self.tables.heads.insert(epoch_id_key(epoch, id), vec![])?;
        self.bump_dirty();
        Ok(())
    }

    pub fn del_head(&self, epoch: Epoch, id: &EventId) -> Result<(), StoreError> {
        self.tables.heads.remove(epoch_id_key(epoch, id))?;
        self.bump_dirty();
        Ok(())
    }

    /// The current tips of an epoch's DAG.
    pub fn get_heads(&self, epoch: Epoch) -> Result<Vec<EventId>, StoreError> {
        let prefix = epoch.to_be_bytes();
        let mut out = Vec::new();
        for entry in self.tables.heads.scan_prefix(prefix) {
            let (key, _) = entry?;
            out.push(EventId(key[4..].try_into().unwrap_or([0u8; 32])));
        }
        Ok(out)
    }

    // ── validator-last-event index ──

    pub fn set_last_event(
        &self,
        epoch: Epoch,
        creator: ValidatorId,
        id: &EventId,
    ) -> Result<(), StoreError> {
        self.tables
            .last_events
            .insert(epoch_validator_key(epoch, creator), id.as_bytes().as_slice())?;
        self.bump_dirty();
        Ok(())
    }

    pub fn get_last_event(
        &self,
        epoch: Epoch,
        creator: ValidatorId,
    ) -> Result<Option<EventId>, StoreError> {
        Ok(self
            .tables
            .last_events
            .get(epoch_validator_key(epoch, creator))?
            .map(|bytes| EventId(bytes.as_ref().try_into().unwrap_or([0u8; 32]))))
    }

    /// Drop per-epoch indexes of epochs before `keep_from`. Called on epoch
    /// transition so stale heads and last-event entries don't accumulate.
    pub fn reset_epoch_store(&self, keep_from: Epoch) -> Result<(), StoreError> {
        let bound = keep_from.to_be_bytes().to_vec();
        for table in [&self.tables.heads, &self.tables.last_events] {
            let stale: Vec<sled::IVec> = table
                .range(..bound.clone())
                .keys()
                .collect::<Result<_, _>>()?;
            for key in stale {
                table.remove(key)?;
            }
        }
        self.bump_dirty();
        Ok(())
    }
}

pub(crate) fn epoch_id_key(epoch: Epoch, id: &EventId) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn epoch_validator_key(epoch: Epoch, validator: ValidatorId) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&epoch.to_be_bytes());
    key[4..].copy_from_slice(&validator.0.to_be_bytes());
    key
}

pub(crate) fn decode_validator_key(key: &[u8]) -> ValidatorId {
    ValidatorId(u32::from_be_bytes(key.try_into().unwrap_or([0u8; 4])))
}

pub(crate) fn decode_u64(value: &[u8]) -> u64 {
    u64::from_be_bytes(value.try_into().unwrap_or([0u8; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::builder::EventBuilder;

    fn event(epoch: Epoch, creator: u32, seq: u32, lamport: u32) -> EventPayload {
        EventBuilder::new()
            .epoch(epoch)
            .creator(ValidatorId(creator))
            .seq(seq)
            .lamport(lamport)
            .creation_time(lamport as u64)
            .build()
    }

    #[test]
    fn event_roundtrip_through_store() {
        let store = Store::open_temporary().unwrap();
        let e = event(1, 1, 1, 1);
        store.set_event(&e).unwrap();
        assert!(store.has_event(&e.id()).unwrap());
        assert_eq!(store.get_event(&e.id()).unwrap().unwrap(), e);

        store.del_event(&e.id()).unwrap();
        assert!(!store.has_event(&e.id()).unwrap());
        assert!(store.get_event(&e.id()).unwrap().is_none());
    }

    #[test]
    fn events_iterate_in_epoch_lamport_order() {
        let store = Store::open_temporary().unwrap();
        let events = [
            event(2, 1, 1, 1),
            event(1, 1, 2, 5),
            event(1, 1, 1, 1),
            event(2, 1, 2, 3),
        ];
        for e in &events {
            store.set_event(e).unwrap();
        }
        let mut seen = Vec::new();
        store
            .for_each_event_from(&[0u8; 32], |id, _| {
                seen.push((id.epoch(), id.lamport()));
                true
            })
            .unwrap();
        assert_eq!(seen, vec![(1, 1), (1, 5), (2, 1), (2, 3)]);
    }

    #[test]
    fn epoch_events_respects_bounds() {
        let store = Store::open_temporary().unwrap();
        store.set_event(&event(1, 1, 1, 1)).unwrap();
        store.set_event(&event(2, 1, 1, 1)).unwrap();
        store.set_event(&event(3, 1, 1, 1)).unwrap();
        let epoch2 = store.epoch_events(2).unwrap();
        assert_eq!(epoch2.len(), 1);
        assert_eq!(epoch2[0].event().epoch(), 2);
    }

    #[test]
    fn heads_and_last_events() {
        let store = Store::open_temporary().unwrap();
        let a = event(1, 1, 1, 1);
        let b = event(1, 2, 1, 1);
        store.add_head(1, &a.id()).unwrap();
        store.add_head(1, &b.id()).unwrap();
        store.del_head(1, &a.id()).unwrap();
        assert_eq!(store.get_heads(1).unwrap(), vec![b.id()]);

        store.set_last_event(1, ValidatorId(1), &a.id()).unwrap();
        assert_eq!(
            store.get_last_event(1, ValidatorId(1)).unwrap(),
            Some(a.id())
        );
        assert_eq!(store.get_last_event(1, ValidatorId(2)).unwrap(), None);
    }

    #[test]
    fn reset_epoch_store_drops_stale_epochs() {
        let store = Store::open_temporary().unwrap();
        let old = event(1, 1, 1, 1);
        let new = event(2, 1, 1, 1);
        store.add_head(1, &old.id()).unwrap();
        store.add_head(2, &new.id()).unwrap();
        store.set_last_event(1, ValidatorId(1), &old.id()).unwrap();
        store.reset_epoch_store(2).unwrap();
        assert!(store.get_heads(1).unwrap().is_empty());
        assert_eq!(store.get_heads(2).unwrap(), vec![new.id()]);
        assert_eq!(store.get_last_event(1, ValidatorId(1)).unwrap(), None);
    }
}
