//! Realtime dashboard: the one thread the tracing stack owns.

use std::io::{self, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use memtrace::Tracer;

use crate::charts;

/// Periodically redraws a dashboard of aggregate snapshots on stdout.
///
/// The renderer never sits on the allocation hot path; it wakes on an
/// interval, reads rollups through the tracer facade and sleeps again.
/// [`RealtimeMonitor::stop`] joins the thread.
pub struct RealtimeMonitor {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RealtimeMonitor {
    pub fn start(tracer: &'static Tracer, refresh_interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("memtrace-monitor".to_owned())
            .spawn(move || {
                let tick = crossbeam_channel::tick(refresh_interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(tick) -> _ => {
                            let mut out = io::stdout().lock();
                            let _ = write!(out, "\x1b[2J\x1b[H");
                            let _ = draw_dashboard(tracer, &mut out);
                            let _ = out.flush();
                        }
                    }
                }
            })
            .expect("failed to spawn the monitor thread");
        log::info!("realtime monitor started");
        RealtimeMonitor {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop redrawing and join the renderer thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop.send(());
            let _ = handle.join();
            log::info!("realtime monitor stopped");
        }
    }
}

impl Drop for RealtimeMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn draw_dashboard(tracer: &Tracer, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "========================================")?;
    writeln!(out, "  Realtime Memory Monitor")?;
    writeln!(out, "========================================\n")?;
    write!(out, "{}", tracer.stats_summary())?;
    charts::memory_hotspots_chart(tracer, 5, out)?;
    charts::size_distribution_histogram(tracer, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace::TracerConfig;

    #[test]
    fn the_monitor_thread_stops_on_request() {
        let tracer: &'static Tracer = Box::leak(Box::new(Tracer::new(TracerConfig::default())));
        let monitor = RealtimeMonitor::start(tracer, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        monitor.stop();
    }

    #[test]
    fn dropping_the_monitor_also_joins_it() {
        let tracer: &'static Tracer = Box::leak(Box::new(Tracer::new(TracerConfig::default())));
        let _ = RealtimeMonitor::start(tracer, Duration::from_millis(5));
    }
}
