//! Types for representing traced heap allocations
//!
//! This crate defines the one record that moves through the tracing pipeline
//! and the on-disk dump format. Field names of [`AllocationEvent`] are the
//! dump format; changing them changes what `allocations.json` looks like.

#![forbid(missing_docs)]

use serde::{Deserialize, Serialize};

/// Timestamp type, nanoseconds since the tracer pinned its start instant.
pub type Timestamp = u64;

/// Address value stored on an event once its matching free has been observed.
///
/// A zero address never names a real heap allocation, so it doubles as the
/// "released" sentinel both in memory and in the dump.
pub const RELEASED_ADDRESS: u64 = 0;

/// Source file recorded when no location could be resolved for an event.
pub const UNKNOWN_FILE: &str = "unknown";

/// Origin of an allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationKind {
    /// Produced by an intercepted `allocate` call.
    Allocate,
    /// Produced by the allocation half of an intercepted `reallocate` call.
    Reallocate,
    /// Submitted from outside the interceptor, e.g. imported from a dump.
    #[default]
    External,
}

/// One traced heap allocation.
///
/// Created by the event recorder at interception time, mutated only by
/// clearing `address` when the matching free is observed, and retained until
/// store trim or shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationEvent {
    /// Monotonic nanosecond tick taken at interception time.
    pub timestamp: Timestamp,
    /// Heap pointer returned by the underlying allocator, or
    /// [`RELEASED_ADDRESS`] once the matching free has been observed.
    pub address: u64,
    /// Bytes requested; for `reallocate`, the new size.
    pub size: u64,
    /// How the event entered the pipeline. Not part of the dump format;
    /// imported events default to [`AllocationKind::External`].
    #[serde(skip)]
    pub kind: AllocationKind,
    /// Symbolic call-site name best known at capture time. For unannotated
    /// hooks this is the name of the intercepted primitive.
    pub function: String,
    /// Best-effort source file, or [`UNKNOWN_FILE`].
    pub file: String,
    /// Best-effort source line, or `0`.
    pub line: i32,
    /// Stable numeric identifier of the submitting thread.
    pub thread_id: u32,
    /// Resolved frame symbols, innermost first, truncated at the configured
    /// stack depth.
    pub stack_trace: Vec<String>,
}

impl AllocationEvent {
    /// Whether the matching free has not been observed yet.
    pub fn is_live(&self) -> bool {
        self.address != RELEASED_ADDRESS
    }

    /// Mark the matching free as observed. One-way within the event's
    /// lifetime.
    pub fn release(&mut self) {
        self.address = RELEASED_ADDRESS;
    }
}

/// The on-disk dump: the full event log under an `allocations` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dump {
    /// Every retained event, in append order.
    pub allocations: Vec<AllocationEvent>,
}
