//! Bar charts over the tracer's rollups, rendered to any writer.

use std::io::{self, Write};

use memtrace::stats::format_size;
use memtrace::Tracer;

const FUNCTION_BAR_WIDTH: usize = 50;
const HISTOGRAM_BAR_WIDTH: usize = 40;
const HOTSPOT_BAR_WIDTH: usize = 45;
const FILE_BAR_WIDTH: usize = 40;
const STACK_BAR_WIDTH: usize = 30;
const TIMELINE_BAR_WIDTH: usize = 40;

fn bar(value: u64, max: u64, width: usize) -> String {
    let filled = if max == 0 {
        0
    } else {
        ((value as f64 / max as f64) * width as f64) as usize
    };
    let filled = filled.min(width);
    let mut bar = "█".repeat(filled);
    bar.push_str(&" ".repeat(width - filled));
    bar
}

fn truncated(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_owned(),
        None => text.to_owned(),
    }
}

fn header(out: &mut dyn Write, title: &str) -> io::Result<()> {
    writeln!(out, "\n========================================")?;
    writeln!(out, "  {}", title)?;
    writeln!(out, "========================================\n")
}

fn format_timestamp(ns: u64) -> String {
    format!("{:.1}s", ns as f64 / 1e9)
}

/// Functions ranked by total bytes allocated.
pub fn function_allocation_chart(
    tracer: &Tracer,
    limit: usize,
    out: &mut dyn Write,
) -> io::Result<()> {
    let stats = tracer.function_stats(limit);
    let Some(max) = stats.first().map(|s| s.total_allocated) else {
        return writeln!(out, "No allocation data available.");
    };

    header(out, "Function Memory Allocation Chart")?;
    for entry in &stats {
        writeln!(
            out,
            "{:<25} |{}| {}",
            truncated(&entry.name, 24),
            bar(entry.total_allocated, max, FUNCTION_BAR_WIDTH),
            format_size(entry.total_allocated)
        )?;
    }
    writeln!(out)
}

/// Allocation counts per fixed size bucket.
pub fn size_distribution_histogram(tracer: &Tracer, out: &mut dyn Write) -> io::Result<()> {
    let buckets = tracer.size_distribution();
    let Some(max) = buckets.iter().map(|b| b.count).max() else {
        return writeln!(out, "No size distribution data available.");
    };

    header(out, "Size Distribution Histogram")?;
    for bucket in &buckets {
        let upper = if bucket.max_size == u64::MAX {
            "inf".to_owned()
        } else {
            format_size(bucket.max_size)
        };
        let label = format!("{}-{}", format_size(bucket.min_size), upper);
        writeln!(
            out,
            "{:<20} |{}| {} allocs",
            truncated(&label, 20),
            bar(bucket.count, max, HISTOGRAM_BAR_WIDTH),
            bucket.count
        )?;
    }
    writeln!(out)
}

/// The top allocating call sites.
pub fn memory_hotspots_chart(tracer: &Tracer, limit: usize, out: &mut dyn Write) -> io::Result<()> {
    let hotspots = tracer.memory_hotspots(limit);
    let Some(&(_, max)) = hotspots.first() else {
        return writeln!(out, "No hotspot data available.");
    };

    header(out, "Memory Hotspots")?;
    for (i, (function, total)) in hotspots.iter().enumerate() {
        writeln!(
            out,
            "{:>2}. {:<22} |{}| {}",
            i + 1,
            truncated(function, 21),
            bar(*total, max, HOTSPOT_BAR_WIDTH),
            format_size(*total)
        )?;
    }
    writeln!(out)
}

/// Files ranked by total bytes allocated. Only the file name is shown.
pub fn file_allocation_chart(tracer: &Tracer, limit: usize, out: &mut dyn Write) -> io::Result<()> {
    let stats = tracer.file_stats(limit);
    let Some(max) = stats.first().map(|s| s.total_allocated) else {
        return writeln!(out, "No file allocation data available.");
    };

    header(out, "File Memory Allocation Chart")?;
    for entry in &stats {
        let name = entry
            .path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(entry.path.as_str());
        writeln!(
            out,
            "{:<28} |{}| {}",
            truncated(name, 27),
            bar(entry.total_allocated, max, FILE_BAR_WIDTH),
            format_size(entry.total_allocated)
        )?;
    }
    writeln!(out)
}

/// Stack fingerprints ranked by frequency, labeled by their outermost frame.
pub fn call_stack_frequency_chart(
    tracer: &Tracer,
    limit: usize,
    out: &mut dyn Write,
) -> io::Result<()> {
    let mut stacks: Vec<(String, u64)> = tracer.call_stack_stats().into_iter().collect();
    stacks.sort_by(|a, b| b.1.cmp(&a.1));
    if limit > 0 {
        stacks.truncate(limit);
    }
    let Some(&(_, max)) = stacks.first() else {
        return writeln!(out, "No call stack data available.");
    };

    header(out, "Top Call Stacks by Frequency")?;
    for (i, (stack, count)) in stacks.iter().enumerate() {
        let label = stack.rsplit(" <- ").next().unwrap_or(stack.as_str());
        writeln!(
            out,
            "{:>3}. {:<30} |{}| {}",
            i + 1,
            truncated(label, 30),
            bar(*count, max, STACK_BAR_WIDTH),
            count
        )?;
    }
    writeln!(out)
}

/// Live bytes per time bucket.
pub fn memory_timeline(tracer: &Tracer, bucket_ns: u64, out: &mut dyn Write) -> io::Result<()> {
    let timeline = tracer.allocation_timeline(bucket_ns);
    let Some(max) = timeline.iter().map(|p| p.memory_usage).max() else {
        return writeln!(out, "No timeline data available.");
    };

    header(out, "Memory Usage Timeline")?;
    for point in &timeline {
        writeln!(
            out,
            "{:>12} |{}| {}",
            format_timestamp(point.timestamp),
            bar(point.memory_usage, max, TIMELINE_BAR_WIDTH),
            format_size(point.memory_usage)
        )?;
    }
    writeln!(out, "\nPeak usage: {}\n", format_size(max))
}

/// Render one chart into a string.
pub fn render_to_string<F>(draw: F) -> String
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let mut buffer = Vec::new();
    let _ = draw(&mut buffer);
    String::from_utf8_lossy(&buffer).into_owned()
}
