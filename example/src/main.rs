//! Demo workload: runs a few allocation patterns under the tracer, then
//! prints the charts, the report and the leak listing.

use std::time::Duration;

use memtrace::{Tracer, TracerConfig, TracingAllocator};
use memtrace_analyze::charts;

#[global_allocator]
static ALLOC: TracingAllocator = TracingAllocator;

#[inline(never)]
fn build_strings() -> usize {
    let mut parts = Vec::new();
    for i in 0..64 {
        parts.push(format!("part-{i:04}"));
    }
    parts.concat().len()
}

#[inline(never)]
fn churn_small() {
    for _ in 0..100 {
        let boxed = Box::new([0u8; 24]);
        drop(boxed);
    }
    for _ in 0..10 {
        let buffer = vec![0u8; 256];
        drop(buffer);
    }
}

#[inline(never)]
fn grow_a_vector() -> usize {
    let mut data = Vec::with_capacity(128);
    for i in 0..4096u32 {
        data.push(i);
    }
    data.len()
}

#[inline(never)]
fn leak_some() {
    let leaked: &'static mut [u8] = Box::leak(vec![0u8; 200].into_boxed_slice());
    leaked[0] = 1;
}

fn worker(id: usize) {
    for round in 0..5 {
        let data = vec![0u8; 100 + id * 10 + round];
        std::thread::sleep(Duration::from_millis(2));
        drop(data);
    }
}

fn main() {
    pretty_env_logger::init();

    let tracer = Tracer::new(TracerConfig {
        stack_depth: 16,
        ..Default::default()
    })
    .install();
    tracer.initialize();
    tracer.start_capture();

    println!("Running test functions...");
    for _ in 0..3 {
        build_strings();
        churn_small();
        grow_a_vector();
        leak_some();
    }

    println!("Running multi-threaded test...");
    std::thread::scope(|scope| {
        for id in 0..4 {
            scope.spawn(move || worker(id));
        }
    });

    tracer.stop_capture();
    log::info!("captured {} events", tracer.allocations().len());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = charts::function_allocation_chart(tracer, 10, &mut out);
    let _ = charts::size_distribution_histogram(tracer, &mut out);
    let _ = charts::memory_hotspots_chart(tracer, 10, &mut out);
    let _ = charts::file_allocation_chart(tracer, 10, &mut out);
    let _ = charts::memory_timeline(tracer, tracer.config().timeline_bucket_ns, &mut out);
    drop(out);

    print!("{}", tracer.generate_report());

    let leaks = tracer.leaks();
    println!("Found {} potential memory leaks.", leaks.len());
    for (i, leak) in leaks.iter().take(5).enumerate() {
        println!(
            "  {}. {} @ {}:{} ({} bytes)",
            i + 1,
            leak.function,
            leak.file,
            leak.line,
            leak.size
        );
    }

    // Writes ./data/allocations.json on the way out.
    tracer.shutdown();
}
