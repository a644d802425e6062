use std::collections::BTreeMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use memtrace_types::{AllocationEvent, AllocationKind, Timestamp, RELEASED_ADDRESS};

use crate::error::StoreError;
use crate::guard::ReentrancyGuard;
use crate::recorder;
use crate::stats::{FileStats, FunctionStats, SizeBucket, Stats, TrackedAllocation};
use crate::store::{self, QueryResult, Store, StoreSummary, TimelinePoint, DUMP_FILE_NAME};

/// Invoked with a reference to each just-committed allocation event, inside
/// the commit critical section. Allocations performed by the callback are
/// suppressed by the reentrancy guard already held by the thread.
pub type AllocationCallback = fn(&AllocationEvent);

/// Recognized tracer options.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Maximum retained events; oldest are discarded beyond the cap.
    pub event_cap: usize,
    /// Frames captured per event.
    pub stack_depth: usize,
    /// Default bucket width of the allocation timeline, in nanoseconds.
    pub timeline_bucket_ns: u64,
    /// Directory for the shutdown dump.
    pub data_dir: PathBuf,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            event_cap: 1_000_000,
            stack_depth: 32,
            timeline_bucket_ns: 1_000_000_000,
            data_dir: PathBuf::from("./data"),
        }
    }
}

struct TracerInner {
    store: Store,
    stats: Stats,
    callback: Option<AllocationCallback>,
}

static GLOBAL: AtomicPtr<Tracer> = AtomicPtr::new(std::ptr::null_mut());

/// The tracer aggregate: capturing gate, commit lock, store and stats.
///
/// Hooks reach the installed instance through [`Tracer::global`]; everything
/// else holds an ordinary reference. One mutex protects the event log, the
/// live-address maps, the store indexes and the stats tables; stack capture
/// and symbolication happen outside of it.
pub struct Tracer {
    config: TracerConfig,
    capturing: AtomicBool,
    terminated: AtomicBool,
    inner: Mutex<TracerInner>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        recorder::pin_start();
        let store = Store::new(config.event_cap, config.data_dir.clone());
        Tracer {
            config,
            capturing: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            inner: Mutex::new(TracerInner {
                store,
                stats: Stats::new(),
                callback: None,
            }),
        }
    }

    /// Publish this tracer as the process-wide instance read by the hooks.
    /// The first install wins; later calls return the already-installed
    /// tracer.
    pub fn install(self) -> &'static Tracer {
        let candidate = Box::leak(Box::new(self));
        match GLOBAL.compare_exchange(
            std::ptr::null_mut(),
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => candidate,
            Err(existing) => {
                // Someone beat us to it; discard the candidate.
                drop(unsafe { Box::from_raw(candidate) });
                unsafe { &*existing }
            }
        }
    }

    /// The installed tracer, if any.
    pub fn global() -> Option<&'static Tracer> {
        let tracer = GLOBAL.load(Ordering::SeqCst);
        if tracer.is_null() {
            None
        } else {
            Some(unsafe { &*tracer })
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, TracerInner> {
        // A panic under the lock must not take the traced program down with
        // it on the next hook.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare for capture: create the data directory and, with the `hooks`
    /// feature, resolve the underlying allocation primitives. Idempotent.
    pub fn initialize(&self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        #[cfg(feature = "hooks")]
        if let Err(err) = crate::hooks::initialize() {
            log::error!("{}; tracer runs in pass-through mode", err);
        }
        self.inner().store.initialize();
        log::info!("memory tracer initialized");
    }

    /// Terminal: stop capture, drain in-flight commits, write the dump and
    /// clear all state. Every later operation is a no-op.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capturing.store(false, Ordering::SeqCst);
        let _guard = ReentrancyGuard::enter();
        let mut inner = self.inner();
        let dump_path = inner.store.data_dir().join(DUMP_FILE_NAME);
        if let Err(err) = inner.store.export_json(&dump_path) {
            log::error!("shutdown dump failed: {}", err);
        }
        inner.store.clear();
        inner.stats.reset();
        inner.callback = None;
        log::info!("memory tracer shut down");
    }

    pub fn start_capture(&self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        self.capturing.store(true, Ordering::SeqCst);
        log::info!("memory capture started");
    }

    pub fn stop_capture(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        if !self.terminated.load(Ordering::SeqCst) {
            log::info!("memory capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Forget every committed event and every rollup.
    pub fn clear(&self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        let mut inner = self.inner();
        inner.store.clear();
        inner.stats.reset();
    }

    pub fn set_event_cap(&self, event_cap: usize) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        self.inner().store.set_event_cap(event_cap);
    }

    pub fn set_callback(&self, callback: Option<AllocationCallback>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        self.inner().callback = callback;
    }

    /// Record an allocation observed by an interception hook. Subject to the
    /// capturing gate and the per-thread reentrancy guard.
    pub fn record_allocation(&self, address: u64, size: u64, kind: AllocationKind, function: &str) {
        self.record_allocation_from(address, size, kind, function, std::ptr::null_mut());
    }

    pub(crate) fn record_allocation_from(
        &self,
        address: u64,
        size: u64,
        kind: AllocationKind,
        function: &str,
        stop: *mut c_void,
    ) {
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        let event = recorder::build_event(address, size, kind, function, stop, self.config.stack_depth);
        let mut guard = self.inner();
        let inner = &mut *guard;
        inner.stats.record(&event);
        let id = inner.store.insert(event);
        if let Some(callback) = inner.callback {
            if let Some(event) = inner.store.get(id) {
                callback(event);
            }
        }
    }

    /// Record a free observed by an interception hook: live → released in
    /// the store, live-counter decrement in the stats. Unknown addresses
    /// produce no event.
    pub fn record_deallocation(&self, address: u64) {
        if address == RELEASED_ADDRESS || !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        let mut guard = self.inner();
        let inner = &mut *guard;
        inner.store.mark_released(address);
        inner.stats.record_free(address);
    }

    /// Submit a fully-formed event from outside the interceptor.
    pub fn add_event(&self, event: AllocationEvent) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        let mut guard = self.inner();
        let inner = &mut *guard;
        inner.stats.record(&event);
        inner.store.insert(event);
    }

    pub fn add_events(&self, events: Vec<AllocationEvent>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        let mut guard = self.inner();
        let inner = &mut *guard;
        for event in events {
            inner.stats.record(&event);
            inner.store.insert(event);
        }
    }

    /// Snapshot of the full event log in append order.
    pub fn allocations(&self) -> Vec<AllocationEvent> {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.snapshot()
    }

    pub fn query_by_function(&self, name: &str) -> QueryResult {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.query_by_function(name)
    }

    pub fn query_by_file(&self, path: &str) -> QueryResult {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.query_by_file(path)
    }

    pub fn query_by_size_range(&self, min_size: u64, max_size: u64) -> QueryResult {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.query_by_size_range(min_size, max_size)
    }

    pub fn query_by_time_range(&self, start: Timestamp, end: Timestamp) -> QueryResult {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.query_by_time_range(start, end)
    }

    /// Every event still live at call time.
    pub fn leaks(&self) -> Vec<AllocationEvent> {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.leaks()
    }

    pub fn summary(&self) -> StoreSummary {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.summary()
    }

    pub fn allocation_timeline(&self, bucket_ns: u64) -> Vec<TimelinePoint> {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.allocation_timeline(bucket_ns)
    }

    /// Events discarded so far because of the cap.
    pub fn evicted_events(&self) -> u64 {
        self.inner().store.evicted()
    }

    pub fn export_json(&self, path: &Path) -> Result<(), StoreError> {
        let _guard = ReentrancyGuard::enter();
        self.inner().store.export_json(path)
    }

    /// Load a dump into the store and the stats. Imported events keep their
    /// serialized addresses and arrive as [`AllocationKind::External`].
    pub fn import_from_json(&self, path: &Path) -> Result<usize, StoreError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let events = store::read_dump(path)?;
        let count = events.len();
        self.add_events(events);
        log::info!("imported {} allocations from {}", count, path.display());
        Ok(count)
    }

    pub fn function_stats(&self, limit: usize) -> Vec<FunctionStats> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.function_stats(limit)
    }

    pub fn function_stats_for(&self, name: &str) -> Option<FunctionStats> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.function_stats_for(name)
    }

    pub fn file_stats(&self, limit: usize) -> Vec<FileStats> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.file_stats(limit)
    }

    pub fn size_distribution(&self) -> Vec<SizeBucket> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.size_distribution()
    }

    pub fn memory_hotspots(&self, limit: usize) -> Vec<(String, u64)> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.memory_hotspots(limit)
    }

    pub fn call_stack_stats(&self) -> BTreeMap<String, u64> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.call_stack_stats()
    }

    /// The live-address side-table entry for `address`, if any.
    pub fn tracked_allocation(&self, address: u64) -> Option<TrackedAllocation> {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.tracking_for(address).cloned()
    }

    pub fn generate_report(&self) -> String {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.generate_report()
    }

    pub fn stats_summary(&self) -> String {
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.summary()
    }

    pub fn reset_stats(&self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        self.inner().stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tracer() -> Tracer {
        Tracer::new(TracerConfig {
            stack_depth: 4,
            data_dir: PathBuf::from("./data"),
            ..Default::default()
        })
    }

    #[test]
    fn nothing_is_recorded_while_capture_is_off() {
        let tracer = tracer();
        tracer.record_allocation(0x1000, 128, AllocationKind::Allocate, "allocate");
        assert!(tracer.allocations().is_empty());
    }

    #[test]
    fn allocate_then_free_leaves_no_leak() {
        let tracer = tracer();
        tracer.start_capture();
        tracer.record_allocation(0x1000, 128, AllocationKind::Allocate, "allocate");
        tracer.record_deallocation(0x1000);
        tracer.stop_capture();

        assert_eq!(tracer.allocations().len(), 1);
        assert!(tracer.leaks().is_empty());
        let stats = tracer.function_stats_for("allocate").unwrap();
        assert_eq!(stats.total_allocated, 128);
        assert_eq!(stats.current_allocated, 0);
    }

    #[test]
    fn an_unfreed_allocation_is_a_leak() {
        let tracer = tracer();
        tracer.start_capture();
        tracer.record_allocation(0x2000, 64, AllocationKind::Allocate, "allocate");
        tracer.stop_capture();

        let leaks = tracer.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].size, 64);
        let buckets = tracer.size_distribution();
        assert_eq!(buckets.len(), 1);
        assert_eq!((buckets[0].min_size, buckets[0].max_size), (64, 128));
        assert_eq!(buckets[0].count, 1);
    }

    #[test]
    fn concurrent_allocate_free_pairs_reconcile() {
        let tracer = tracer();
        tracer.start_capture();
        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                let tracer = &tracer;
                scope.spawn(move || {
                    for i in 0..5u64 {
                        let address = 0x10_000 + thread * 0x100 + i;
                        tracer.record_allocation(address, 100, AllocationKind::Allocate, "allocate");
                        tracer.record_deallocation(address);
                    }
                });
            }
        });
        tracer.stop_capture();

        assert_eq!(tracer.allocations().len(), 20);
        assert!(tracer.leaks().is_empty());
        let stats = tracer.function_stats_for("allocate").unwrap();
        assert_eq!(stats.allocation_count, 20);
        assert_eq!(stats.total_allocated, 2000);
        assert_eq!(stats.current_allocated, 0);
    }

    #[test]
    fn reallocate_produces_a_release_and_a_second_event() {
        let tracer = tracer();
        tracer.start_capture();
        tracer.record_allocation(0x1000, 16, AllocationKind::Allocate, "allocate");
        tracer.record_deallocation(0x1000);
        tracer.record_allocation(0x3000, 32, AllocationKind::Reallocate, "reallocate");
        tracer.record_deallocation(0x3000);
        tracer.stop_capture();

        let events = tracer.allocations();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| !event.is_live()));
        assert!(tracer.leaks().is_empty());
        assert_eq!(events[1].kind, AllocationKind::Reallocate);
    }

    #[test]
    fn leak_count_matches_the_live_counters() {
        let tracer = tracer();
        tracer.start_capture();
        tracer.record_allocation(0x1, 10, AllocationKind::Allocate, "allocate");
        tracer.record_allocation(0x2, 20, AllocationKind::Allocate, "allocate");
        tracer.record_allocation(0x3, 30, AllocationKind::Reallocate, "reallocate");
        tracer.record_deallocation(0x2);
        tracer.stop_capture();

        let live_total: u64 = tracer
            .function_stats(0)
            .iter()
            .map(|stats| stats.live_count)
            .sum();
        assert_eq!(tracer.leaks().len() as u64, live_total);
    }

    #[test]
    fn capture_toggles_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = Tracer::new(TracerConfig {
            stack_depth: 4,
            data_dir: dir.path().to_owned(),
            ..Default::default()
        });
        tracer.start_capture();
        tracer.start_capture();
        assert!(tracer.is_capturing());
        tracer.stop_capture();
        tracer.stop_capture();
        assert!(!tracer.is_capturing());
        tracer.initialize();
        tracer.initialize();
        assert!(dir.path().exists());
    }

    #[test]
    fn the_event_cap_applies_to_hook_recordings() {
        let tracer = Tracer::new(TracerConfig {
            event_cap: 3,
            stack_depth: 2,
            ..Default::default()
        });
        tracer.start_capture();
        for (i, size) in [1u64, 2, 3, 4, 5].iter().enumerate() {
            tracer.record_allocation(
                0x100 + i as u64,
                *size,
                AllocationKind::Allocate,
                "allocate",
            );
        }
        let sizes: Vec<u64> = tracer.allocations().iter().map(|e| e.size).collect();
        assert_eq!(sizes, vec![3, 4, 5]);
        assert_eq!(tracer.evicted_events(), 2);
    }

    #[test]
    fn shutdown_is_terminal_and_writes_the_dump() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = Tracer::new(TracerConfig {
            stack_depth: 2,
            data_dir: dir.path().to_owned(),
            ..Default::default()
        });
        tracer.initialize();
        tracer.start_capture();
        tracer.record_allocation(0x1000, 4096, AllocationKind::Allocate, "allocate");

        tracer.shutdown();
        assert!(dir.path().join(DUMP_FILE_NAME).exists());
        assert!(!tracer.is_capturing());
        assert!(tracer.allocations().is_empty());

        tracer.start_capture();
        tracer.record_allocation(0x2000, 64, AllocationKind::Allocate, "allocate");
        assert!(tracer.allocations().is_empty());
        tracer.shutdown();
    }

    #[test]
    fn exported_state_imports_into_a_fresh_tracer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");

        let original = tracer();
        original.start_capture();
        original.record_allocation(0x1000, 64, AllocationKind::Allocate, "allocate");
        original.record_allocation(0x2000, 128, AllocationKind::Allocate, "allocate");
        original.record_deallocation(0x2000);
        original.stop_capture();
        original.export_json(&path).unwrap();

        let fresh = tracer();
        assert_eq!(fresh.import_from_json(&path).unwrap(), 2);
        assert_eq!(fresh.leaks().len(), original.leaks().len());
        assert_eq!(fresh.leaks()[0].address, 0x1000);
        let stats = fresh.function_stats_for("allocate").unwrap();
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.current_allocated, 64);
    }

    #[test]
    fn the_callback_sees_each_committed_event() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn on_event(event: &AllocationEvent) {
            SEEN.fetch_add(event.size as usize, Ordering::SeqCst);
        }

        let tracer = tracer();
        tracer.set_callback(Some(on_event));
        tracer.start_capture();
        tracer.record_allocation(0x1000, 5, AllocationKind::Allocate, "allocate");
        tracer.record_allocation(0x2000, 7, AllocationKind::Allocate, "allocate");
        tracer.stop_capture();
        assert_eq!(SEEN.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn queries_on_an_empty_tracer_are_empty_not_errors() {
        let tracer = tracer();
        assert_eq!(tracer.query_by_function("allocate").total_count, 0);
        assert_eq!(tracer.query_by_size_range(0, u64::MAX).total_count, 0);
        assert!(tracer.allocation_timeline(1_000).is_empty());
        assert!(tracer.generate_report().contains("Total Allocations: 0"));
    }
}
