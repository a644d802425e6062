use std::ffi::c_void;
use std::time::Instant;

use lazy_static::lazy_static;
use memtrace_types::{AllocationEvent, AllocationKind, Timestamp};

use crate::stack::{self, Trace};

lazy_static! {
    static ref TRACE_START: Instant = Instant::now();
}

/// Pin the zero point of the timestamp clock. Called once at tracer
/// construction so the first event does not pay for the lazy init.
pub(crate) fn pin_start() {
    lazy_static::initialize(&TRACE_START);
}

/// Monotonic nanoseconds since the pinned start instant.
pub(crate) fn timestamp_now() -> Timestamp {
    TRACE_START.elapsed().as_nanos() as Timestamp
}

pub(crate) fn current_thread_id() -> u32 {
    thread_id::get() as u32
}

/// Stamp a raw hook observation into a full event: timestamp, thread id and
/// the symbolicated stack above `stop`. Runs outside the commit lock and is
/// allowed to allocate; the caller holds the reentrancy guard.
pub(crate) fn build_event(
    address: u64,
    size: u64,
    kind: AllocationKind,
    function: &str,
    stop: *mut c_void,
    stack_depth: usize,
) -> AllocationEvent {
    let trace = Trace::new(stop);
    let resolved = stack::resolve(&trace, stack_depth);
    AllocationEvent {
        timestamp: timestamp_now(),
        address,
        size,
        kind,
        function: function.to_owned(),
        file: resolved.file,
        line: resolved.line,
        thread_id: current_thread_id(),
        stack_trace: resolved.frames,
    }
}
