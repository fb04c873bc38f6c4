//! Chrome trace output (-d trace), for profiling engine phases and target
//! evaluation spans in about:tracing / Perfetto.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
    count: usize,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
            count: 0,
        })
    }

    fn write_complete(&mut self, name: &str, tid: usize, start: Instant, end: Instant) {
        if self.count > 0 {
            let _ = write!(self.w, ",\n");
        }
        let _ = write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }}",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        );
        self.count += 1;
    }

    fn close(&mut self) -> std::io::Result<()> {
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap() = Some(trace);
    Ok(())
}

pub fn if_enabled(f: impl FnOnce(&mut dyn FnMut(&str, usize, Instant, Instant))) {
    let mut guard = TRACE.lock().unwrap();
    if let Some(trace) = guard.as_mut() {
        f(&mut |name, tid, start, end| trace.write_complete(name, tid, start, end));
    }
}

/// Run a closure and record it as a complete event on track 0.
#[inline]
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if_enabled(|emit| emit(name, 0, start, end));
    result
}

/// Record an externally-timed span, e.g. a worker's evaluation window.
pub fn span(name: &str, tid: usize, start: Instant, end: Instant) {
    if_enabled(|emit| emit(name, tid, start, end));
}

pub fn close() -> std::io::Result<()> {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        return trace.close();
    }
    Ok(())
}
