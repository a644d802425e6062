use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use memtrace_types::AllocationEvent;

/// Fixed histogram buckets, lower bound inclusive, upper bound exclusive.
pub const SIZE_BUCKETS: [(u64, u64); 11] = [
    (0, 16),
    (16, 32),
    (32, 64),
    (64, 128),
    (128, 256),
    (256, 512),
    (512, 1024),
    (1024, 4096),
    (4096, 16384),
    (16384, 65536),
    (65536, u64::MAX),
];

/// Frames that make up a stack fingerprint.
const FINGERPRINT_FRAMES: usize = 5;
const FINGERPRINT_SEPARATOR: &str = " <- ";

/// Incremental per-function counters.
#[derive(Debug, Clone, Default)]
pub struct FunctionStats {
    pub name: String,
    /// Events observed for this function, live or released.
    pub allocation_count: u64,
    /// Bytes ever allocated through this function.
    pub total_allocated: u64,
    /// Bytes still live.
    pub current_allocated: u64,
    /// Events still live.
    pub live_count: u64,
    /// Largest single allocation observed.
    pub peak_allocated: u64,
    /// `total_allocated / allocation_count`, recomputed on each insert.
    pub avg_size: f64,
    /// Exact request size -> occurrence count.
    pub size_distribution: BTreeMap<u64, u64>,
    first_seen: u64,
}

/// Incremental per-file counters.
#[derive(Debug, Clone, Default)]
pub struct FileStats {
    pub path: String,
    pub allocation_count: u64,
    pub total_allocated: u64,
    pub current_allocated: u64,
    /// Event count per call-site function seen in this file.
    pub function_counts: BTreeMap<String, u64>,
    first_seen: u64,
}

/// One row of the aggregated size histogram. Upper bound `u64::MAX` renders
/// as unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBucket {
    pub min_size: u64,
    pub max_size: u64,
    pub count: u64,
    pub total_size: u64,
}

/// Side-table entry for a live address, kept so a free can decrement the
/// live counters without rescanning the event log.
#[derive(Debug, Clone)]
pub struct TrackedAllocation {
    pub function: String,
    pub file: String,
    pub size: u64,
    pub stack_trace: Vec<String>,
}

/// Rollups computed on event submission, independent of the store.
#[derive(Default)]
pub struct Stats {
    functions: HashMap<String, FunctionStats>,
    files: HashMap<String, FileStats>,
    call_stacks: HashMap<String, u64>,
    tracking: HashMap<u64, TrackedAllocation>,
    total_allocations: u64,
    total_allocated: u64,
    seq: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into every table.
    pub fn record(&mut self, event: &AllocationEvent) {
        let seq = self.seq;
        self.seq += 1;

        let function = self
            .functions
            .entry(event.function.clone())
            .or_insert_with(|| FunctionStats {
                name: event.function.clone(),
                first_seen: seq,
                ..Default::default()
            });
        function.allocation_count += 1;
        function.total_allocated += event.size;
        function.peak_allocated = function.peak_allocated.max(event.size);
        function.avg_size = function.total_allocated as f64 / function.allocation_count as f64;
        *function.size_distribution.entry(event.size).or_default() += 1;
        if event.is_live() {
            function.current_allocated += event.size;
            function.live_count += 1;
        }

        let file = self
            .files
            .entry(event.file.clone())
            .or_insert_with(|| FileStats {
                path: event.file.clone(),
                first_seen: seq,
                ..Default::default()
            });
        file.allocation_count += 1;
        file.total_allocated += event.size;
        if event.is_live() {
            file.current_allocated += event.size;
        }
        *file.function_counts.entry(event.function.clone()).or_default() += 1;

        if !event.stack_trace.is_empty() {
            *self
                .call_stacks
                .entry(fingerprint(&event.stack_trace))
                .or_default() += 1;
        }

        self.total_allocations += 1;
        self.total_allocated += event.size;

        if event.is_live() {
            self.tracking.insert(
                event.address,
                TrackedAllocation {
                    function: event.function.clone(),
                    file: event.file.clone(),
                    size: event.size,
                    stack_trace: event.stack_trace.clone(),
                },
            );
        }
    }

    /// Decrement the live counters for `address`. Unknown addresses are
    /// ignored.
    pub fn record_free(&mut self, address: u64) {
        let Some(tracked) = self.tracking.remove(&address) else {
            return;
        };
        if let Some(function) = self.functions.get_mut(&tracked.function) {
            function.current_allocated = function.current_allocated.saturating_sub(tracked.size);
            function.live_count = function.live_count.saturating_sub(1);
        }
        if let Some(file) = self.files.get_mut(&tracked.file) {
            file.current_allocated = file.current_allocated.saturating_sub(tracked.size);
        }
    }

    /// The side-table entry for a live address, if any.
    pub fn tracking_for(&self, address: u64) -> Option<&TrackedAllocation> {
        self.tracking.get(&address)
    }

    /// Per-function counters sorted by total bytes, descending; ties keep
    /// first-seen order. `limit == 0` returns all.
    pub fn function_stats(&self, limit: usize) -> Vec<FunctionStats> {
        let mut stats: Vec<FunctionStats> = self.functions.values().cloned().collect();
        stats.sort_by(|a, b| {
            b.total_allocated
                .cmp(&a.total_allocated)
                .then(a.first_seen.cmp(&b.first_seen))
        });
        if limit > 0 {
            stats.truncate(limit);
        }
        stats
    }

    /// Counters for one function.
    pub fn function_stats_for(&self, name: &str) -> Option<FunctionStats> {
        self.functions.get(name).cloned()
    }

    /// Per-file counters sorted by total bytes, descending.
    pub fn file_stats(&self, limit: usize) -> Vec<FileStats> {
        let mut stats: Vec<FileStats> = self.files.values().cloned().collect();
        stats.sort_by(|a, b| {
            b.total_allocated
                .cmp(&a.total_allocated)
                .then(a.first_seen.cmp(&b.first_seen))
        });
        if limit > 0 {
            stats.truncate(limit);
        }
        stats
    }

    /// The fixed-bucket histogram over every recorded size. Empty buckets
    /// are elided.
    pub fn size_distribution(&self) -> Vec<SizeBucket> {
        let mut buckets: Vec<SizeBucket> = SIZE_BUCKETS
            .iter()
            .map(|&(min_size, max_size)| SizeBucket {
                min_size,
                max_size,
                count: 0,
                total_size: 0,
            })
            .collect();

        for function in self.functions.values() {
            for (&size, &count) in &function.size_distribution {
                for bucket in &mut buckets {
                    if size >= bucket.min_size && size < bucket.max_size {
                        bucket.count += count;
                        bucket.total_size += size * count;
                        break;
                    }
                }
            }
        }

        buckets.retain(|bucket| bucket.count > 0);
        buckets
    }

    /// Top `limit` functions by total bytes allocated. `limit == 0` returns
    /// all.
    pub fn memory_hotspots(&self, limit: usize) -> Vec<(String, u64)> {
        self.function_stats(limit)
            .into_iter()
            .map(|stats| (stats.name, stats.total_allocated))
            .collect()
    }

    /// Stack-fingerprint occurrence counts.
    pub fn call_stack_stats(&self) -> BTreeMap<String, u64> {
        self.call_stacks
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    /// Multi-section text report over every table.
    pub fn generate_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "======================================");
        let _ = writeln!(out, "       Memory Tracer Report");
        let _ = writeln!(out, "======================================\n");
        let _ = writeln!(out, "Total Allocations: {}", self.total_allocations);
        let _ = writeln!(
            out,
            "Total Memory Allocated: {}",
            format_size(self.total_allocated)
        );
        let _ = writeln!(out, "Unique Functions: {}", self.functions.len());
        let _ = writeln!(out, "Unique Files: {}\n", self.files.len());

        let _ = writeln!(out, "--- Top 10 Functions by Allocation Size ---");
        for (i, stats) in self.function_stats(10).iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, stats.name);
            let _ = writeln!(out, "   Allocations: {}", stats.allocation_count);
            let _ = writeln!(out, "   Total: {}", format_size(stats.total_allocated));
            let _ = writeln!(out, "   Current: {}", format_size(stats.current_allocated));
            let _ = writeln!(out, "   Avg: {}", format_size(stats.avg_size as u64));
        }

        let _ = writeln!(out, "\n--- Size Distribution ---");
        for bucket in self.size_distribution() {
            let upper = if bucket.max_size == u64::MAX {
                "inf)".to_owned()
            } else {
                format!("{})", format_size(bucket.max_size))
            };
            let _ = writeln!(
                out,
                "[{}, {}: {} allocs, {}",
                format_size(bucket.min_size),
                upper,
                bucket.count,
                format_size(bucket.total_size)
            );
        }

        let _ = writeln!(out, "\n======================================");
        out
    }

    /// Three-line summary for dashboards.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total allocations: {}", self.total_allocations);
        let _ = writeln!(out, "Total memory: {}", format_size(self.total_allocated));
        let _ = writeln!(out, "Functions: {}", self.functions.len());
        out
    }

    pub fn reset(&mut self) {
        self.functions.clear();
        self.files.clear();
        self.call_stacks.clear();
        self.tracking.clear();
        self.total_allocations = 0;
        self.total_allocated = 0;
        self.seq = 0;
    }
}

/// Concatenation of the first five innermost frames; buckets stacks by
/// frequency without keeping the full trace as a key.
fn fingerprint(stack_trace: &[String]) -> String {
    stack_trace
        .iter()
        .take(FINGERPRINT_FRAMES)
        .cloned()
        .collect::<Vec<_>>()
        .join(FINGERPRINT_SEPARATOR)
}

/// `4096` -> `"4.00 KB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
