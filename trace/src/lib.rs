//! Process-local memory allocation tracer.
//!
//! Every heap allocation and deallocation of the program under trace is
//! intercepted, stamped with timestamp, thread id and a symbolicated call
//! stack, committed to an indexed in-memory store and folded into incremental
//! statistics. Interception is installed either by making [`TracingAllocator`]
//! the `#[global_allocator]`, or, with the `hooks` feature, by loading the
//! cdylib ahead of libc so its `malloc`/`free`/`realloc` replacements take
//! over.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ffi::c_void;

mod error;
mod guard;
mod recorder;
mod stack;
pub mod stats;
pub mod store;
mod tracer;

#[cfg(feature = "hooks")]
pub mod hooks;

pub use error::{HookError, StoreError};
pub use memtrace_types::{
    AllocationEvent, AllocationKind, Timestamp, RELEASED_ADDRESS, UNKNOWN_FILE,
};
pub use stats::{FileStats, FunctionStats, SizeBucket, Stats, TrackedAllocation};
pub use store::{EventId, QueryResult, Store, StoreSummary, TimelinePoint, DUMP_FILE_NAME};
pub use tracer::{AllocationCallback, Tracer, TracerConfig};

/// Drop-in `#[global_allocator]` that forwards to [`System`] and reports
/// every call to the installed [`Tracer`].
///
/// ```no_run
/// use memtrace::{Tracer, TracerConfig, TracingAllocator};
///
/// #[global_allocator]
/// static ALLOC: TracingAllocator = TracingAllocator;
///
/// fn main() {
///     let tracer = Tracer::new(TracerConfig::default()).install();
///     tracer.initialize();
///     tracer.start_capture();
/// }
/// ```
pub struct TracingAllocator;

unsafe impl GlobalAlloc for TracingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            if let Some(tracer) = Tracer::global() {
                tracer.record_allocation_from(
                    ptr as u64,
                    layout.size() as u64,
                    AllocationKind::Allocate,
                    "allocate",
                    Self::alloc as usize as *mut c_void,
                );
            }
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            if let Some(tracer) = Tracer::global() {
                tracer.record_allocation_from(
                    ptr as u64,
                    layout.size() as u64,
                    AllocationKind::Allocate,
                    "allocate",
                    Self::alloc_zeroed as usize as *mut c_void,
                );
            }
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Release first, so a racing allocation cannot observe the address
        // as still live.
        if !ptr.is_null() {
            if let Some(tracer) = Tracer::global() {
                tracer.record_deallocation(ptr as u64);
            }
        }
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if let Some(tracer) = Tracer::global() {
            if !ptr.is_null() {
                tracer.record_deallocation(ptr as u64);
            }
            if !new_ptr.is_null() {
                tracer.record_allocation_from(
                    new_ptr as u64,
                    new_size as u64,
                    AllocationKind::Reallocate,
                    "reallocate",
                    Self::realloc as usize as *mut c_void,
                );
            }
        }
        new_ptr
    }
}
