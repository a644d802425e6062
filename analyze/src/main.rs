use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use memtrace::{Tracer, TracerConfig};
use memtrace_analyze::charts;

/// Inspect a memtrace dump: report, charts and the leak listing.
#[derive(Parser)]
#[command(name = "memtrace-analyze", version)]
struct Args {
    /// Path to an allocations.json dump.
    dump: PathBuf,

    /// Rows shown per chart.
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Timeline bucket width in nanoseconds.
    #[arg(long, default_value_t = 1_000_000_000)]
    bucket_ns: u64,

    /// Print the leak listing only.
    #[arg(long)]
    leaks: bool,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let tracer = Tracer::new(TracerConfig::default());
    let imported = tracer
        .import_from_json(&args.dump)
        .with_context(|| format!("cannot load {}", args.dump.display()))?;
    log::debug!("loaded {} events from {}", imported, args.dump.display());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let leaks = tracer.leaks();

    if !args.leaks {
        write!(out, "{}", tracer.generate_report())?;
        charts::function_allocation_chart(&tracer, args.limit, &mut out)?;
        charts::size_distribution_histogram(&tracer, &mut out)?;
        charts::memory_hotspots_chart(&tracer, args.limit, &mut out)?;
        charts::file_allocation_chart(&tracer, args.limit, &mut out)?;
        charts::call_stack_frequency_chart(&tracer, args.limit, &mut out)?;
        charts::memory_timeline(&tracer, args.bucket_ns, &mut out)?;
    }

    writeln!(out, "Found {} potential memory leaks.", leaks.len())?;
    for (i, leak) in leaks.iter().take(args.limit.max(1)).enumerate() {
        writeln!(
            out,
            "  {}. {} @ {}:{} ({} bytes)",
            i + 1,
            leak.function,
            leak.file,
            leak.line,
            leak.size
        )?;
    }
    Ok(())
}
