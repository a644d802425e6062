use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use memtrace_types::{AllocationEvent, Dump, Timestamp};
use serde::Serialize;

use crate::error::StoreError;

/// File name of the dump written below the configured data directory.
pub const DUMP_FILE_NAME: &str = "allocations.json";

/// Stable identifier of a committed event. Ids grow monotonically and are
/// never reused, so index entries cannot dangle across eviction.
pub type EventId = u64;

/// Result of a store query.
///
/// `peak_usage` is the largest single size among the returned events, not a
/// time-integrated high-water mark.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub events: Vec<AllocationEvent>,
    pub total_count: usize,
    pub total_size: u64,
    pub peak_usage: u64,
}

impl QueryResult {
    fn finalize(events: Vec<AllocationEvent>, total_size: u64) -> Self {
        QueryResult {
            total_count: events.len(),
            total_size,
            peak_usage: events.iter().map(|event| event.size).max().unwrap_or(0),
            events,
        }
    }
}

/// One bucket of the allocation timeline: bytes still live whose allocation
/// fell into the bucket starting at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    pub timestamp: Timestamp,
    pub memory_usage: u64,
}

/// Per-function rollup inside [`StoreSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSummary {
    pub count: usize,
    pub total_size: u64,
}

/// Rollup of the store contents.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub total_allocations: usize,
    pub unique_functions: usize,
    pub data_dir: String,
    pub by_function: BTreeMap<String, FunctionSummary>,
}

/// Owner of the committed event log.
///
/// The log is an append-only sequence addressed by [`EventId`]; the id of the
/// front element is `base_id`, so `id - base_id` is the position and eviction
/// just pops the front and advances the base. Secondary indexes store ids and
/// are pruned of evicted entries lazily, before each query.
pub struct Store {
    events: VecDeque<AllocationEvent>,
    base_id: EventId,
    by_function: HashMap<String, Vec<EventId>>,
    by_file: HashMap<String, Vec<EventId>>,
    by_time: Vec<(Timestamp, EventId)>,
    active: HashMap<u64, EventId>,
    event_cap: usize,
    evicted: u64,
    pruned_base: EventId,
    data_dir: PathBuf,
}

impl Store {
    pub fn new(event_cap: usize, data_dir: PathBuf) -> Self {
        Store {
            events: VecDeque::new(),
            base_id: 0,
            by_function: HashMap::new(),
            by_file: HashMap::new(),
            by_time: Vec::new(),
            active: HashMap::new(),
            event_cap,
            evicted: 0,
            pruned_base: 0,
            data_dir,
        }
    }

    /// Create the data directory. Failure is logged and not fatal; a later
    /// dump will report its own error.
    pub fn initialize(&self) {
        if let Err(err) = fs::create_dir_all(&self.data_dir) {
            log::warn!(
                "could not create data directory {}: {}",
                self.data_dir.display(),
                err
            );
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.data_dir, fs::Permissions::from_mode(0o755));
        }
        log::info!("store initialized, data directory: {}", self.data_dir.display());
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events discarded so far because of the cap.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub(crate) fn get(&self, id: EventId) -> Option<&AllocationEvent> {
        let offset = id.checked_sub(self.base_id)? as usize;
        self.events.get(offset)
    }

    fn get_mut(&mut self, id: EventId) -> Option<&mut AllocationEvent> {
        let offset = id.checked_sub(self.base_id)? as usize;
        self.events.get_mut(offset)
    }

    /// Append an event, evicting the oldest one first when the cap is
    /// reached. Returns the id of the committed event.
    pub fn insert(&mut self, event: AllocationEvent) -> EventId {
        if self.event_cap > 0 {
            while self.events.len() >= self.event_cap {
                self.evict_front();
            }
        }

        let id = self.base_id + self.events.len() as EventId;
        self.by_function
            .entry(event.function.clone())
            .or_default()
            .push(id);
        self.by_file.entry(event.file.clone()).or_default().push(id);
        let position = self
            .by_time
            .partition_point(|(timestamp, _)| *timestamp <= event.timestamp);
        self.by_time.insert(position, (event.timestamp, id));
        if event.is_live() {
            self.active.insert(event.address, id);
        }
        self.events.push_back(event);
        id
    }

    fn evict_front(&mut self) {
        if let Some(event) = self.events.pop_front() {
            if event.is_live() {
                self.active.remove(&event.address);
            }
            self.base_id += 1;
            self.evicted += 1;
        }
    }

    /// Live → released transition for the event owning `address`. Unknown
    /// addresses are ignored.
    pub fn mark_released(&mut self, address: u64) -> bool {
        let Some(id) = self.active.remove(&address) else {
            return false;
        };
        if let Some(event) = self.get_mut(id) {
            event.release();
        }
        true
    }

    /// Drop index entries referring to evicted events. Amortized: a no-op
    /// until the base has moved since the last prune.
    fn prune_stale(&mut self) {
        if self.pruned_base == self.base_id {
            return;
        }
        let base = self.base_id;
        self.by_time.retain(|(_, id)| *id >= base);
        self.by_function.retain(|_, ids| {
            ids.retain(|id| *id >= base);
            !ids.is_empty()
        });
        self.by_file.retain(|_, ids| {
            ids.retain(|id| *id >= base);
            !ids.is_empty()
        });
        self.pruned_base = base;
    }

    fn collect_live(&self, ids: &[EventId]) -> QueryResult {
        let mut events = Vec::new();
        let mut total_size = 0;
        for id in ids {
            if let Some(event) = self.get(*id) {
                if event.is_live() {
                    total_size += event.size;
                    events.push(event.clone());
                }
            }
        }
        QueryResult::finalize(events, total_size)
    }

    /// Live events whose call-site function equals `name`.
    pub fn query_by_function(&mut self, name: &str) -> QueryResult {
        self.prune_stale();
        match self.by_function.get(name) {
            Some(ids) => {
                let ids = ids.clone();
                self.collect_live(&ids)
            }
            None => QueryResult::default(),
        }
    }

    /// Live events whose source file equals `path`.
    pub fn query_by_file(&mut self, path: &str) -> QueryResult {
        self.prune_stale();
        match self.by_file.get(path) {
            Some(ids) => {
                let ids = ids.clone();
                self.collect_live(&ids)
            }
            None => QueryResult::default(),
        }
    }

    /// Live events with `min_size <= size <= max_size`.
    pub fn query_by_size_range(&mut self, min_size: u64, max_size: u64) -> QueryResult {
        let mut events = Vec::new();
        let mut total_size = 0;
        for event in &self.events {
            if event.is_live() && event.size >= min_size && event.size <= max_size {
                total_size += event.size;
                events.push(event.clone());
            }
        }
        QueryResult::finalize(events, total_size)
    }

    /// Events, live or released, with `start <= timestamp <= end`. Released
    /// events contribute to the count but not to `total_size`.
    pub fn query_by_time_range(&mut self, start: Timestamp, end: Timestamp) -> QueryResult {
        self.prune_stale();
        let lower = self.by_time.partition_point(|(timestamp, _)| *timestamp < start);
        let upper = self.by_time.partition_point(|(timestamp, _)| *timestamp <= end);
        let mut events = Vec::new();
        let mut total_size = 0;
        for (_, id) in &self.by_time[lower..upper] {
            if let Some(event) = self.get(*id) {
                if event.is_live() {
                    total_size += event.size;
                }
                events.push(event.clone());
            }
        }
        QueryResult::finalize(events, total_size)
    }

    /// Every event still live at call time.
    pub fn leaks(&self) -> Vec<AllocationEvent> {
        self.events
            .iter()
            .filter(|event| event.is_live())
            .cloned()
            .collect()
    }

    /// Live bytes summed into buckets of `bucket_ns`, aligned to the oldest
    /// retained timestamp.
    pub fn allocation_timeline(&self, bucket_ns: u64) -> Vec<TimelinePoint> {
        if self.events.is_empty() {
            return Vec::new();
        }
        let bucket_ns = bucket_ns.max(1);
        let min_time = self
            .events
            .iter()
            .map(|event| event.timestamp)
            .min()
            .unwrap_or(0);

        let mut timeline: BTreeMap<Timestamp, u64> = BTreeMap::new();
        for event in &self.events {
            if event.is_live() {
                let bucket = (event.timestamp - min_time) / bucket_ns * bucket_ns + min_time;
                *timeline.entry(bucket).or_default() += event.size;
            }
        }

        timeline
            .into_iter()
            .map(|(timestamp, memory_usage)| TimelinePoint {
                timestamp,
                memory_usage,
            })
            .collect()
    }

    /// Rollup over every retained event, live or released.
    pub fn summary(&mut self) -> StoreSummary {
        self.prune_stale();
        let mut by_function = BTreeMap::new();
        for (function, ids) in &self.by_function {
            let mut count = 0;
            let mut total_size = 0;
            for id in ids {
                if let Some(event) = self.get(*id) {
                    count += 1;
                    total_size += event.size;
                }
            }
            by_function.insert(function.clone(), FunctionSummary { count, total_size });
        }
        StoreSummary {
            total_allocations: self.events.len(),
            unique_functions: self.by_function.len(),
            data_dir: self.data_dir.display().to_string(),
            by_function,
        }
    }

    /// Snapshot of the full event log in append order.
    pub fn snapshot(&self) -> Vec<AllocationEvent> {
        self.events.iter().cloned().collect()
    }

    /// Write the full event log to `path` in the stable dump format.
    pub fn export_json(&self, path: &Path) -> Result<(), StoreError> {
        let dump = Dump {
            allocations: self.snapshot(),
        };
        let file = fs::File::create(path).map_err(|source| StoreError::DumpIo {
            path: path.to_owned(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &dump).map_err(|source| {
            StoreError::DumpIo {
                path: path.to_owned(),
                source: source.into(),
            }
        })?;
        log::info!(
            "exported {} allocations to {}",
            dump.allocations.len(),
            path.display()
        );
        Ok(())
    }

    /// Lower the cap, discarding oldest events beyond it.
    pub fn set_event_cap(&mut self, event_cap: usize) {
        self.event_cap = event_cap;
        if event_cap > 0 {
            while self.events.len() > event_cap {
                self.evict_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.by_function.clear();
        self.by_file.clear();
        self.by_time.clear();
        self.active.clear();
        self.base_id = 0;
        self.pruned_base = 0;
        self.evicted = 0;
    }
}

/// Parse a dump file back into events. Addresses are restored to their
/// original values, which will not in general be valid pointers here.
pub(crate) fn read_dump(path: &Path) -> Result<Vec<AllocationEvent>, StoreError> {
    let contents = fs::read_to_string(path).map_err(|source| StoreError::ImportIo {
        path: path.to_owned(),
        source,
    })?;
    let dump: Dump = serde_json::from_str(&contents).map_err(|source| StoreError::ImportParse {
        path: path.to_owned(),
        source,
    })?;
    Ok(dump.allocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace_types::AllocationKind;

    fn event(timestamp: Timestamp, address: u64, size: u64, function: &str, file: &str) -> AllocationEvent {
        AllocationEvent {
            timestamp,
            address,
            size,
            kind: AllocationKind::Allocate,
            function: function.to_owned(),
            file: file.to_owned(),
            line: 0,
            thread_id: 1,
            stack_trace: vec![],
        }
    }

    fn store() -> Store {
        Store::new(1_000_000, PathBuf::from("./data"))
    }

    #[test]
    fn query_by_function_returns_live_events_only() {
        let mut store = store();
        store.insert(event(1, 0x10, 128, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 64, "allocate", "a.rs"));
        store.insert(event(3, 0x30, 32, "reallocate", "b.rs"));
        store.mark_released(0x20);

        let result = store.query_by_function("allocate");
        assert_eq!(result.total_count, 1);
        assert_eq!(result.total_size, 128);
        assert_eq!(result.peak_usage, 128);
        assert_eq!(result.events[0].address, 0x10);

        assert_eq!(store.query_by_function("reallocate").total_count, 1);
        assert_eq!(store.query_by_function("missing").total_count, 0);
    }

    #[test]
    fn query_by_file_groups_by_source_path() {
        let mut store = store();
        store.insert(event(1, 0x10, 10, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 20, "allocate", "b.rs"));
        store.insert(event(3, 0x30, 30, "allocate", "a.rs"));

        let result = store.query_by_file("a.rs");
        assert_eq!(result.total_count, 2);
        assert_eq!(result.total_size, 40);
    }

    #[test]
    fn query_by_size_range_is_inclusive_on_both_ends() {
        let mut store = store();
        store.insert(event(1, 0x10, 15, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 16, "allocate", "a.rs"));
        store.insert(event(3, 0x30, 32, "allocate", "a.rs"));
        store.insert(event(4, 0x40, 33, "allocate", "a.rs"));

        let result = store.query_by_size_range(16, 32);
        assert_eq!(result.total_count, 2);
        assert_eq!(result.total_size, 48);
        assert_eq!(result.peak_usage, 32);
    }

    #[test]
    fn query_by_time_range_includes_released_but_sizes_live_only() {
        let mut store = store();
        store.insert(event(100, 0x10, 7, "allocate", "a.rs"));
        store.insert(event(200, 0x20, 11, "allocate", "a.rs"));
        store.insert(event(300, 0x30, 13, "allocate", "a.rs"));
        store.mark_released(0x20);

        let result = store.query_by_time_range(100, 200);
        assert_eq!(result.total_count, 2);
        assert_eq!(result.total_size, 7);
        // Released events still count toward the per-event maximum.
        assert_eq!(result.peak_usage, 11);
    }

    #[test]
    fn eviction_keeps_the_newest_events_and_indexes_resolve() {
        let mut store = Store::new(3, PathBuf::from("./data"));
        for (i, size) in [1u64, 2, 3, 4, 5].iter().enumerate() {
            store.insert(event(i as u64, 0x100 + i as u64, *size, "allocate", "a.rs"));
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.evicted(), 2);
        let sizes: Vec<u64> = store.snapshot().iter().map(|e| e.size).collect();
        assert_eq!(sizes, vec![3, 4, 5]);

        let result = store.query_by_function("allocate");
        assert_eq!(result.total_count, 3);
        assert_eq!(result.total_size, 12);
        assert_eq!(store.query_by_file("a.rs").total_count, 3);
        assert_eq!(store.query_by_time_range(0, u64::MAX).total_count, 3);
    }

    #[test]
    fn mark_released_is_one_way_and_ignores_unknown_addresses() {
        let mut store = store();
        store.insert(event(1, 0x10, 128, "allocate", "a.rs"));

        assert!(store.mark_released(0x10));
        assert!(!store.mark_released(0x10));
        assert!(!store.mark_released(0xdead));
        assert!(!store.snapshot()[0].is_live());
    }

    #[test]
    fn leaks_are_the_live_events() {
        let mut store = store();
        store.insert(event(1, 0x10, 128, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 64, "allocate", "a.rs"));
        store.mark_released(0x10);

        let leaks = store.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, 0x20);
    }

    #[test]
    fn timeline_buckets_align_to_the_oldest_timestamp() {
        let mut store = store();
        store.insert(event(1_000, 0x10, 10, "allocate", "a.rs"));
        store.insert(event(1_400, 0x20, 20, "allocate", "a.rs"));
        store.insert(event(2_100, 0x30, 30, "allocate", "a.rs"));
        store.insert(event(2_200, 0x40, 40, "allocate", "a.rs"));
        store.mark_released(0x40);

        let timeline = store.allocation_timeline(1_000);
        assert_eq!(
            timeline,
            vec![
                TimelinePoint { timestamp: 1_000, memory_usage: 30 },
                TimelinePoint { timestamp: 2_000, memory_usage: 30 },
            ]
        );
    }

    #[test]
    fn timeline_of_an_empty_store_is_empty() {
        let store = store();
        assert!(store.allocation_timeline(1_000).is_empty());
    }

    #[test]
    fn export_and_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DUMP_FILE_NAME);

        let mut store = store();
        store.insert(event(1, 0x10, 64, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 128, "allocate", "b.rs"));
        store.mark_released(0x20);
        store.export_json(&path).unwrap();

        let events = read_dump(&path).unwrap();
        assert_eq!(events.len(), 2);
        // Live addresses survive verbatim, released ones are dumped as zero.
        assert_eq!(events[0].address, 0x10);
        assert_eq!(events[1].address, 0);
        assert_eq!(events[0].kind, AllocationKind::External);

        let mut imported = Store::new(1_000_000, dir.path().to_owned());
        for event in events {
            imported.insert(event);
        }
        let leaks = imported.leaks();
        assert_eq!(leaks.len(), store.leaks().len());
        assert_eq!(leaks[0].size, 64);
    }

    #[test]
    fn import_of_garbage_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            read_dump(&path),
            Err(StoreError::ImportParse { .. })
        ));
        assert!(matches!(
            read_dump(&dir.path().join("missing.json")),
            Err(StoreError::ImportIo { .. })
        ));
    }

    #[test]
    fn lowering_the_cap_trims_oldest_first() {
        let mut store = store();
        for i in 0..5u64 {
            store.insert(event(i, 0x10 + i, i + 1, "allocate", "a.rs"));
        }
        store.set_event_cap(2);
        let sizes: Vec<u64> = store.snapshot().iter().map(|e| e.size).collect();
        assert_eq!(sizes, vec![4, 5]);
    }

    #[test]
    fn summary_counts_released_events_too() {
        let mut store = store();
        store.insert(event(1, 0x10, 10, "allocate", "a.rs"));
        store.insert(event(2, 0x20, 20, "allocate", "a.rs"));
        store.insert(event(3, 0x30, 30, "reallocate", "a.rs"));
        store.mark_released(0x10);

        let summary = store.summary();
        assert_eq!(summary.total_allocations, 3);
        assert_eq!(summary.unique_functions, 2);
        let allocate = &summary.by_function["allocate"];
        assert_eq!(allocate.count, 2);
        assert_eq!(allocate.total_size, 30);
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = Store::new(2, PathBuf::from("./data"));
        for i in 0..4u64 {
            store.insert(event(i, 0x10 + i, 1, "allocate", "a.rs"));
        }
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.evicted(), 0);
        assert_eq!(store.query_by_function("allocate").total_count, 0);
        assert!(store.leaks().is_empty());
    }
}
