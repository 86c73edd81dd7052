//! Durable store of time ranges and their chunks.

use crate::encoding::{crc32, write_u32, write_u64};
use crate::error::{Result, TimelineError};
use crate::persistence::write_atomic;
use crate::telemetry::{noop_event_listener, TimelineEvent, TimelineEventListener};
use crate::types::{
    AccumulatorKey, ChunkSet, EncodedChunk, HostId, SampleKindId, TimeRange, TimeRangeId,
    Timestamp,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const CATALOG_MAGIC: &[u8; 8] = b"TLCATL01";
const CATALOG_VERSION: u32 = 1;
const CATALOG_FILE: &str = "catalog.bin";

/// Lock-free allocator of time-range ids, shared between the store and every accumulator.
#[derive(Debug, Clone)]
pub struct TimeRangeIdSequence(Arc<AtomicU64>);

impl TimeRangeIdSequence {
    pub fn starting_at(first: TimeRangeId) -> Self {
        TimeRangeIdSequence(Arc::new(AtomicU64::new(first)))
    }

    pub fn next_id(&self) -> TimeRangeId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// The durable store the writer and aggregator work against.
pub trait TimelineStore: std::fmt::Debug + Send + Sync + 'static {
    /// Shared id sequence; cloning it is cheap and allocation never blocks.
    fn time_range_ids(&self) -> TimeRangeIdSequence;

    fn next_time_range_id(&self) -> TimeRangeId {
        self.time_range_ids().next_id()
    }

    /// Bulk insert of valid ranges with their chunks.
    ///
    /// Idempotent: a range id or `(range id, kind)` already present is overwritten with the same
    /// content, so a partially applied insert can be retried.
    fn insert_batches(&self, sets: &[ChunkSet]) -> Result<()>;

    /// Inserts a range and its chunks, invisible to readers until [`Self::swap_validity`].
    fn insert_invalid_range(&self, set: ChunkSet) -> Result<()>;

    /// Valid ranges at `level`, with chunks, ordered by host, category and start time.
    fn aggregation_candidates(&self, level: u8) -> Result<Vec<ChunkSet>>;

    /// In one transaction marks `new_id` valid and every range in `old_ids` invalid.
    fn swap_validity(&self, new_id: TimeRangeId, old_ids: &[TimeRangeId]) -> Result<()>;

    /// Physically removes ranges and their chunks.
    fn delete_ranges(&self, ids: &[TimeRangeId]) -> Result<()>;

    /// Valid ranges of `host_id` overlapping `[start, end]`, with chunks, ordered by start time.
    fn ranges_for_host(
        &self,
        host_id: HostId,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<ChunkSet>>;

    /// Fast-shutdown replay watermarks.
    fn last_start_times(&self) -> Result<BTreeMap<AccumulatorKey, Timestamp>>;

    fn set_last_start_times(&self, times: &BTreeMap<AccumulatorKey, Timestamp>) -> Result<()>;

    fn delete_last_start_times(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Catalog {
    ranges: BTreeMap<TimeRangeId, TimeRange>,
    chunks: BTreeMap<(TimeRangeId, SampleKindId), EncodedChunk>,
    last_start_times: BTreeMap<AccumulatorKey, Timestamp>,
}

impl Catalog {
    fn insert_set(&mut self, set: &ChunkSet, valid: bool) {
        let mut range = set.time_range.clone();
        range.valid = valid;
        for chunk in &set.chunks {
            self.chunks
                .insert((range.id, chunk.sample_kind_id), chunk.clone());
        }
        self.ranges.insert(range.id, range);
    }

    fn chunk_set(&self, range: &TimeRange) -> ChunkSet {
        ChunkSet {
            time_range: range.clone(),
            chunks: self
                .chunks
                .range((range.id, SampleKindId::MIN)..=(range.id, SampleKindId::MAX))
                .map(|(_, c)| c.clone())
                .collect(),
        }
    }

    fn remove_range(&mut self, id: TimeRangeId) -> bool {
        let kinds: Vec<SampleKindId> = self
            .chunks
            .range((id, SampleKindId::MIN)..=(id, SampleKindId::MAX))
            .map(|((_, kind), _)| *kind)
            .collect();
        for kind in kinds {
            self.chunks.remove(&(id, kind));
        }
        self.ranges.remove(&id).is_some()
    }

    fn max_range_id(&self) -> Option<TimeRangeId> {
        self.ranges.keys().next_back().copied()
    }
}

/// [`TimelineStore`] holding the catalog in memory, optionally persisted to `catalog.bin`.
///
/// Every mutation runs under one write lock. With a backing file the mutation is applied to a
/// copy, the copy is installed atomically on disk, and only then replaces the live catalog, so a
/// failed persist leaves readers on the previous state.
#[derive(Debug)]
pub struct CatalogStore {
    catalog: RwLock<Catalog>,
    path: Option<PathBuf>,
    ids: TimeRangeIdSequence,
    events: Arc<dyn TimelineEventListener>,
}

impl CatalogStore {
    pub fn in_memory() -> Self {
        CatalogStore {
            catalog: RwLock::new(Catalog::default()),
            path: None,
            ids: TimeRangeIdSequence::starting_at(1),
            events: noop_event_listener(),
        }
    }

    /// Opens (or creates) a persisted catalog under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(CATALOG_FILE);
        let catalog = if path.exists() {
            load_catalog(&path)?
        } else {
            Catalog::default()
        };
        let first_id = catalog.max_range_id().map_or(1, |max| max + 1);
        Ok(CatalogStore {
            catalog: RwLock::new(catalog),
            path: Some(path),
            ids: TimeRangeIdSequence::starting_at(first_id),
            events: noop_event_listener(),
        })
    }

    pub fn with_event_listener(mut self, events: Arc<dyn TimelineEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All ranges, valid or not, ordered by id.
    pub fn ranges(&self) -> Result<Vec<TimeRange>> {
        Ok(self.catalog.read()?.ranges.values().cloned().collect())
    }

    pub fn chunk_count(&self) -> Result<usize> {
        Ok(self.catalog.read()?.chunks.len())
    }

    /// Deletes invalid ranges that no valid range of a higher level covers.
    ///
    /// These are leftovers of aggregation units that failed between insert and swap. Invalid
    /// sources of a live aggregate are kept.
    pub fn purge_orphans(&self) -> Result<usize> {
        let count = self.mutate(|catalog| {
            let valid: Vec<&TimeRange> = catalog.ranges.values().filter(|r| r.valid).collect();
            let orphans: Vec<TimeRangeId> = catalog
                .ranges
                .values()
                .filter(|r| !r.valid)
                .filter(|r| {
                    !valid.iter().any(|v| {
                        v.host_id == r.host_id
                            && v.category_id == r.category_id
                            && v.aggregation_level > r.aggregation_level
                            && v.start_time <= r.start_time
                            && v.end_time >= r.end_time
                    })
                })
                .map(|r| r.id)
                .collect();
            for id in &orphans {
                catalog.remove_range(*id);
            }
            Ok(orphans.len())
        })?;
        if count > 0 {
            self.events
                .on_event(TimelineEvent::OrphanRangesPurged { count });
        }
        Ok(count)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Catalog) -> Result<R>) -> Result<R> {
        let mut catalog = self.catalog.write()?;
        let Some(path) = &self.path else {
            return f(&mut *catalog);
        };

        let mut next = catalog.clone();
        let out = f(&mut next)?;
        if let Err(e) = persist_catalog(path, &next) {
            self.events.on_event(TimelineEvent::CatalogPersistFailed {
                path: path.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }
        *catalog = next;
        Ok(out)
    }
}

impl TimelineStore for CatalogStore {
    fn time_range_ids(&self) -> TimeRangeIdSequence {
        self.ids.clone()
    }

    fn insert_batches(&self, sets: &[ChunkSet]) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        self.mutate(|catalog| {
            for set in sets {
                catalog.insert_set(set, true);
            }
            Ok(())
        })
    }

    fn insert_invalid_range(&self, set: ChunkSet) -> Result<()> {
        self.mutate(|catalog| {
            catalog.insert_set(&set, false);
            Ok(())
        })
    }

    fn aggregation_candidates(&self, level: u8) -> Result<Vec<ChunkSet>> {
        let catalog = self.catalog.read()?;
        let mut ranges: Vec<&TimeRange> = catalog
            .ranges
            .values()
            .filter(|r| r.valid && r.aggregation_level == level)
            .collect();
        ranges.sort_by_key(|r| (r.host_id, r.category_id, r.start_time, r.id));
        Ok(ranges.into_iter().map(|r| catalog.chunk_set(r)).collect())
    }

    fn swap_validity(&self, new_id: TimeRangeId, old_ids: &[TimeRangeId]) -> Result<()> {
        self.mutate(|catalog| {
            for id in std::iter::once(&new_id).chain(old_ids) {
                if !catalog.ranges.contains_key(id) {
                    return Err(TimelineError::Store(format!(
                        "cannot swap validity: time range {} does not exist",
                        id
                    )));
                }
            }
            for id in old_ids {
                if let Some(r) = catalog.ranges.get_mut(id) {
                    r.valid = false;
                }
            }
            if let Some(r) = catalog.ranges.get_mut(&new_id) {
                r.valid = true;
            }
            Ok(())
        })
    }

    fn delete_ranges(&self, ids: &[TimeRangeId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: HashSet<TimeRangeId> = ids.iter().copied().collect();
        self.mutate(|catalog| {
            for id in ids {
                catalog.remove_range(id);
            }
            Ok(())
        })
    }

    fn ranges_for_host(
        &self,
        host_id: HostId,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<ChunkSet>> {
        let catalog = self.catalog.read()?;
        let mut ranges: Vec<&TimeRange> = catalog
            .ranges
            .values()
            .filter(|r| r.valid && r.host_id == host_id && r.overlaps(start, end))
            .collect();
        ranges.sort_by_key(|r| (r.start_time, r.category_id, r.id));
        Ok(ranges.into_iter().map(|r| catalog.chunk_set(r)).collect())
    }

    fn last_start_times(&self) -> Result<BTreeMap<AccumulatorKey, Timestamp>> {
        Ok(self.catalog.read()?.last_start_times.clone())
    }

    fn set_last_start_times(&self, times: &BTreeMap<AccumulatorKey, Timestamp>) -> Result<()> {
        self.mutate(|catalog| {
            catalog.last_start_times = times.clone();
            Ok(())
        })
    }

    fn delete_last_start_times(&self) -> Result<()> {
        self.mutate(|catalog| {
            catalog.last_start_times.clear();
            Ok(())
        })
    }
}

fn persist_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    let payload = bincode::serialize(catalog)?;

    let mut bytes = Vec::with_capacity(payload.len() + 24);
    bytes.extend_from_slice(CATALOG_MAGIC);
    write_u32(&mut bytes, CATALOG_VERSION);
    write_u64(&mut bytes, payload.len() as u64);
    write_u32(&mut bytes, crc32(&payload));
    bytes.extend_from_slice(&payload);
    write_atomic(path, &bytes)
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let bytes = fs::read(path)?;
    let corruption = |details: String, offset: u64| TimelineError::Corruption {
        details,
        path: Some(path.to_path_buf()),
        offset: Some(offset),
    };

    if bytes.len() < 24 || &bytes[..8] != CATALOG_MAGIC {
        return Err(corruption(format!("{:?} is not a catalog file", path), 0));
    }
    let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if version != CATALOG_VERSION {
        return Err(corruption(
            format!("unsupported catalog version {} in {:?}", version, path),
            8,
        ));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[12..20]);
    let len = u64::from_le_bytes(len) as usize;
    let expected_crc = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    let payload = bytes
        .get(24..24 + len)
        .ok_or_else(|| corruption(format!("catalog {:?} is truncated", path), 24))?;

    if crc32(payload) != expected_crc {
        return Err(corruption(format!("catalog CRC mismatch in {:?}", path), 24));
    }
    bincode::deserialize(payload)
        .map_err(|e| corruption(format!("catalog decode failed in {:?}: {}", path, e), 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::times::encode_times;
    use tempfile::tempdir;

    fn set(id: TimeRangeId, host_id: HostId, times: &[Timestamp], level: u8) -> ChunkSet {
        ChunkSet {
            time_range: TimeRange {
                id,
                host_id,
                category_id: 1,
                start_time: times[0],
                end_time: *times.last().unwrap(),
                encoded_times: encode_times(times).unwrap(),
                sample_count: times.len() as u32,
                aggregation_level: level,
                valid: true,
            },
            chunks: vec![EncodedChunk {
                host_id,
                sample_kind_id: 7,
                time_range_id: id,
                encoded_samples: vec![0x08],
                sample_count: times.len() as u32,
            }],
        }
    }

    #[test]
    fn test_insert_batches_is_idempotent() {
        let store = CatalogStore::in_memory();
        let batch = [set(1, 1, &[0, 10], 0), set(2, 1, &[20, 30], 0)];
        store.insert_batches(&batch).unwrap();
        store.insert_batches(&batch).unwrap();
        assert_eq!(store.ranges().unwrap().len(), 2);
        assert_eq!(store.chunk_count().unwrap(), 2);
        assert_eq!(store.ranges_for_host(1, None, None).unwrap().len(), 2);
        assert_eq!(store.ranges_for_host(1, Some(15), None).unwrap().len(), 1);
        assert!(store.ranges_for_host(2, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_swap_validity_switches_visibility() {
        let store = CatalogStore::in_memory();
        store
            .insert_batches(&[set(1, 1, &[0, 10], 0), set(2, 1, &[20, 30], 0)])
            .unwrap();
        store.insert_invalid_range(set(3, 1, &[0, 10, 20, 30], 1)).unwrap();
        assert_eq!(store.ranges_for_host(1, None, None).unwrap().len(), 2);

        store.swap_validity(3, &[1, 2]).unwrap();
        let visible = store.ranges_for_host(1, None, None).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].time_range.id, 3);
        assert_eq!(visible[0].chunks.len(), 1);

        let err = store.swap_validity(4, &[3]);
        assert!(matches!(err, Err(TimelineError::Store(_))));
        assert_eq!(store.ranges_for_host(1, None, None).unwrap()[0].time_range.id, 3);
    }

    #[test]
    fn test_aggregation_candidates_are_ordered() {
        let store = CatalogStore::in_memory();
        store
            .insert_batches(&[
                set(5, 2, &[0], 0),
                set(4, 1, &[50], 0),
                set(3, 1, &[10], 0),
                set(6, 1, &[100], 1),
            ])
            .unwrap();
        let ids: Vec<TimeRangeId> = store
            .aggregation_candidates(0)
            .unwrap()
            .iter()
            .map(|s| s.time_range.id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_purge_orphans_keeps_superseded_sources() {
        let store = CatalogStore::in_memory();
        store
            .insert_batches(&[set(1, 1, &[0, 10], 0), set(2, 1, &[20, 30], 0)])
            .unwrap();
        store.insert_invalid_range(set(3, 1, &[0, 10, 20, 30], 1)).unwrap();
        assert_eq!(store.purge_orphans().unwrap(), 1, "unswapped aggregate is an orphan");

        store.insert_invalid_range(set(4, 1, &[0, 10, 20, 30], 1)).unwrap();
        store.swap_validity(4, &[1, 2]).unwrap();
        assert_eq!(store.purge_orphans().unwrap(), 0, "sources of a live aggregate stay");
        assert_eq!(store.ranges().unwrap().len(), 3);
    }

    #[test]
    fn test_persisted_catalog_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = CatalogStore::open(dir.path()).unwrap();
            store.insert_batches(&[set(7, 1, &[0, 10], 0)]).unwrap();
            store
                .set_last_start_times(&[((1, 1), 10)].into_iter().collect())
                .unwrap();
        }
        let store = CatalogStore::open(dir.path()).unwrap();
        assert_eq!(store.ranges().unwrap().len(), 1);
        assert_eq!(store.last_start_times().unwrap().get(&(1, 1)), Some(&10));
        assert_eq!(store.next_time_range_id(), 8, "ids continue after the persisted maximum");

        store.delete_last_start_times().unwrap();
        assert!(store.last_start_times().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_catalog_is_detected() {
        let dir = tempdir().unwrap();
        {
            let store = CatalogStore::open(dir.path()).unwrap();
            store.insert_batches(&[set(1, 1, &[0], 0)]).unwrap();
        }
        let path = dir.path().join(CATALOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            CatalogStore::open(dir.path()),
            Err(TimelineError::Corruption { .. })
        ));
    }

    #[test]
    fn test_failed_persist_leaves_catalog_unchanged() {
        let dir = tempdir().unwrap();
        let store = CatalogStore::open(dir.path().join("catalog")).unwrap();
        store.insert_batches(&[set(1, 1, &[0], 0)]).unwrap();

        // Removing the directory makes the next atomic install fail.
        fs::remove_dir_all(dir.path().join("catalog")).unwrap();
        assert!(store.insert_batches(&[set(2, 1, &[10], 0)]).is_err());
        assert_eq!(store.ranges().unwrap().len(), 1);
    }
}
