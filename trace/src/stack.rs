use std::ffi::c_void;
use std::ops::Deref;

use memtrace_types::UNKNOWN_FILE;

const TRACE_MAX_SIZE: usize = 64;

/// A size-limited stack trace composed of instruction pointers.
pub(crate) struct Trace {
    size: usize,
    data: [*mut c_void; TRACE_MAX_SIZE],
}

impl Deref for Trace {
    type Target = [*mut c_void];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.size]
    }
}

impl Trace {
    /// Construct and fill a new trace, recording frames above `stop`.
    #[inline(never)]
    pub fn new(stop: *mut c_void) -> Self {
        let mut trace = Self {
            size: 0,
            data: [std::ptr::null_mut(); TRACE_MAX_SIZE],
        };
        trace.fill(stop);
        trace
    }

    /// Fill a trace from the current call stack.
    ///
    /// Frames up to and including the one whose symbol address equals `stop`
    /// are skipped. When `stop` is null, or never matches (the hook got
    /// inlined), the whole walk is kept instead.
    pub fn fill(&mut self, stop: *mut c_void) {
        let mut index = 0;
        let data = &mut self.data;
        data.fill(std::ptr::null_mut());

        let mut record = stop.is_null();
        backtrace::trace(|frame| {
            if !record {
                record = frame.symbol_address() == stop;
            } else {
                data[index] = frame.ip();
                index += 1;
            }
            index < data.len()
        });
        if index == 0 && !stop.is_null() {
            backtrace::trace(|frame| {
                data[index] = frame.ip();
                index += 1;
                index < data.len()
            });
        }
        let mut size = index;
        while size > 0 && self.data[size - 1].is_null() {
            size -= 1;
        }
        self.size = size;
    }
}

/// Frame symbols plus the best-effort source location of the call site.
pub(crate) struct ResolvedStack {
    pub frames: Vec<String>,
    pub file: String,
    pub line: i32,
}

/// Resolve at most `max_frames` instruction pointers to symbol names,
/// innermost first. Unresolvable frames are dropped. The source location is
/// taken from the first frame that carries one.
pub(crate) fn resolve(trace: &Trace, max_frames: usize) -> ResolvedStack {
    let mut frames = Vec::new();
    let mut file = None;
    let mut line = 0;

    for ip in trace.iter() {
        if frames.len() == max_frames {
            break;
        }
        let mut symbol = None;
        let mut location = None;
        backtrace::resolve(*ip as _, |sym| {
            if let Some(name) = sym.name() {
                symbol = Some(format!("{:#}", name));
            }
            if location.is_none() {
                if let Some(path) = sym.filename() {
                    location = Some((path.display().to_string(), sym.lineno().unwrap_or(0)));
                }
            }
        });
        if let Some(name) = symbol {
            if !name.is_empty() {
                frames.push(name);
            }
        }
        if file.is_none() {
            if let Some((path, lineno)) = location {
                file = Some(path);
                line = lineno as i32;
            }
        }
    }

    ResolvedStack {
        frames,
        file: file.unwrap_or_else(|| UNKNOWN_FILE.to_owned()),
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here() -> Trace {
        Trace::new(std::ptr::null_mut())
    }

    #[test]
    fn fill_walks_the_current_stack() {
        let trace = capture_here();
        assert!(!trace.is_empty());
        assert!(trace.len() <= TRACE_MAX_SIZE);
    }

    #[test]
    fn unknown_stop_falls_back_to_the_whole_walk() {
        // A symbol address that cannot appear in this stack.
        let trace = Trace::new(usize::MAX as *mut _);
        assert!(!trace.is_empty());
    }

    #[test]
    fn resolve_truncates_at_the_requested_depth() {
        let trace = capture_here();
        let resolved = resolve(&trace, 3);
        assert!(resolved.frames.len() <= 3);
    }

    #[test]
    fn resolve_on_an_empty_trace_yields_the_sentinels() {
        let trace = Trace {
            size: 0,
            data: [std::ptr::null_mut(); TRACE_MAX_SIZE],
        };
        let resolved = resolve(&trace, 32);
        assert!(resolved.frames.is_empty());
        assert_eq!(resolved.file, UNKNOWN_FILE);
        assert_eq!(resolved.line, 0);
    }
}
