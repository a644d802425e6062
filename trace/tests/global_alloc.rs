//! End-to-end capture through the real allocator. Everything lives in one
//! test function: the tracer is process-global, and parallel test threads
//! would otherwise contaminate each other's event logs.

use memtrace::{AllocationKind, Tracer, TracerConfig, TracingAllocator, DUMP_FILE_NAME};

#[global_allocator]
static ALLOC: TracingAllocator = TracingAllocator;

// Prime sizes, so allocations made by the test harness itself cannot
// plausibly collide with the ones the assertions look for.
const FREED: usize = 7919;
const GROWN: usize = 6553;
const LEAKED: usize = 9973;

#[test]
fn capture_observes_real_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::new(TracerConfig {
        stack_depth: 4,
        data_dir: dir.path().to_owned(),
        ..Default::default()
    })
    .install();
    tracer.initialize();
    tracer.start_capture();

    let freed = Vec::<u8>::with_capacity(FREED);
    drop(freed);

    let mut grown = Vec::<u8>::with_capacity(GROWN / 2);
    grown.reserve_exact(GROWN);

    let leaked = Box::leak(vec![0u8; LEAKED].into_boxed_slice());

    tracer.stop_capture();

    let events = tracer.allocations();
    assert!(
        events
            .iter()
            .any(|event| event.size == FREED as u64 && !event.is_live()),
        "the freed buffer should be recorded and released"
    );
    assert!(
        events
            .iter()
            .any(|event| event.size == GROWN as u64 && event.kind == AllocationKind::Reallocate),
        "growing a vector should be recorded as a reallocation"
    );

    assert!(tracer
        .leaks()
        .iter()
        .any(|event| event.size == LEAKED as u64));
    assert!(tracer.query_by_size_range(LEAKED as u64, LEAKED as u64).total_count >= 1);

    let stats = tracer.function_stats_for("allocate").unwrap();
    assert!(stats.total_allocated >= (FREED + LEAKED) as u64);
    assert_eq!(leaked.len(), LEAKED);

    tracer.shutdown();
    assert!(dir.path().join(DUMP_FILE_NAME).exists());
}
