use crate::clock::{Clock, MonotonicClock};
use chrome_trace::{validate_args, InstantScope, Phase, StreamWriter, TraceError, TraceEvent};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thread_local::ThreadLocal;

type Sink = Box<dyn Write + Send>;

/// One span opened on a thread and not yet closed. Spans on a thread form a
/// stack: last opened closes first.
struct OpenSpan {
    name: String,
    cat: String,
    args: Option<Map<String, Value>>,
    start: u64,
    /// Opened via [`Recorder::begin`]: a `B` record is already in the file
    /// and closing emits `E` instead of `X`.
    streaming: bool,
}

struct ThreadState {
    tid: u32,
    name: String,
    stack: Vec<OpenSpan>,
    metadata_sent: bool,
}

struct Session {
    writer: Mutex<Option<StreamWriter<Sink>>>,
    clock: Box<dyn Clock>,
    pid: u32,
    strict: bool,
    thread_sort_keys: Vec<(String, i32)>,
    threads: ThreadLocal<Mutex<ThreadState>>,
    write_error: Mutex<Option<TraceError>>,
    enabled: AtomicBool,
}

/// Handle to a trace session.
///
/// Cheap to clone and share across threads. A disabled recorder (no sink)
/// turns every operation into a no-op: [`Recorder::span`] on it captures no
/// timestamp, allocates nothing, and takes no lock, so instrumentation can
/// stay in place unconditionally.
///
/// Sessions are explicit values, not process globals; independent sessions
/// (e.g. in tests) do not interfere with each other.
#[derive(Clone)]
pub struct Recorder {
    session: Option<Arc<Session>>,
}

/// Configures and opens a [`Recorder`].
pub struct RecorderBuilder {
    pid: Option<u32>,
    clock: Option<Box<dyn Clock>>,
    strict: bool,
    thread_sort_keys: Vec<(String, i32)>,
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self {
            pid: None,
            clock: None,
            strict: false,
            // These sort key substrings work in chrome://tracing but notably
            // not in perfetto when fed json input.
            thread_sort_keys: vec![("main".to_string(), -1)],
        }
    }
}

impl RecorderBuilder {
    /// Overrides the pid stamped on records. Useful in distributed setups
    /// where pids get reused, and in tests.
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// In strict mode a failing sink write panics instead of being logged
    /// and deferred to [`Recorder::close`].
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Threads whose name contains `substring` get the given sort index in
    /// the viewer. Later entries win when several substrings match.
    pub fn thread_sort_key(mut self, substring: impl Into<String>, index: i32) -> Self {
        self.thread_sort_keys.push((substring.into(), index));
        self
    }

    pub fn open(self, sink: impl Write + Send + 'static) -> Result<Recorder, TraceError> {
        let writer = StreamWriter::new(Box::new(sink) as Sink)?;
        Ok(Recorder {
            session: Some(Arc::new(Session {
                writer: Mutex::new(Some(writer)),
                clock: self.clock.unwrap_or_else(|| Box::new(MonotonicClock::new())),
                pid: self.pid.unwrap_or_else(std::process::id),
                strict: self.strict,
                thread_sort_keys: self.thread_sort_keys,
                threads: ThreadLocal::new(),
                write_error: Mutex::new(None),
                enabled: AtomicBool::new(true),
            })),
        })
    }

    pub fn open_path(self, path: impl AsRef<Path>) -> Result<Recorder, TraceError> {
        let file = File::create(path.as_ref())?;
        self.open(BufWriter::new(file))
    }

    pub fn disabled(self) -> Recorder {
        Recorder { session: None }
    }
}

impl Recorder {
    /// Recorder with no sink. All operations are no-ops.
    pub fn disabled() -> Self {
        Self { session: None }
    }

    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::default()
    }

    /// Opens a session writing to `sink`; the array preamble is written
    /// immediately.
    pub fn open(sink: impl Write + Send + 'static) -> Result<Self, TraceError> {
        Self::builder().open(sink)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Self::builder().open_path(path)
    }

    /// Opens a session if `path` is given, a disabled recorder otherwise.
    pub fn open_optional(path: Option<impl AsRef<Path>>) -> Result<Self, TraceError> {
        match path {
            Some(path) => Self::open_path(path),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active().is_some()
    }

    fn active(&self) -> Option<&Arc<Session>> {
        self.session
            .as_ref()
            .filter(|s| s.enabled.load(Ordering::Relaxed))
    }

    /// Opens a scoped span. The returned guard emits exactly one `X` record
    /// when dropped, on every exit path including unwinding.
    #[must_use = "the span closes when the guard is dropped"]
    pub fn span(&self, name: &str, cat: &str) -> SpanGuard {
        self.enter_span(name, cat, None)
    }

    /// [`Recorder::span`] with key-value arguments attached to the record.
    ///
    /// Values must be scalars (string, number, bool); anything else is
    /// rejected here, before any timestamp capture or write.
    pub fn span_with_args(
        &self,
        name: &str,
        cat: &str,
        args: Map<String, Value>,
    ) -> Result<SpanGuard, TraceError> {
        validate_args(&args)?;
        Ok(self.enter_span(name, cat, Some(args)))
    }

    /// Runs `work` under a span, passing its return value through. Closure
    /// form of [`Recorder::span`] for wrapping a whole function body or call
    /// site; use [`Recorder::span_with_args`] inside `work` when the call's
    /// parameters should land on the record.
    pub fn trace_fn<T>(&self, name: &str, cat: &str, work: impl FnOnce() -> T) -> T {
        let _span = self.span(name, cat);
        work()
    }

    /// Emits a `B` record immediately and pushes the span onto the calling
    /// thread's stack. Closed by [`Recorder::end`] (or force-closed at
    /// [`Recorder::close`]). Prefer [`Recorder::span`] unless records must
    /// hit the sink while the span is still running.
    pub fn begin(&self, name: &str, cat: &str) {
        let Some(session) = self.active() else {
            return;
        };
        let start = session.clock.now_micros();
        let tid;
        {
            let mut state = session.thread_state();
            tid = state.tid;
            session.emit_thread_metadata(&mut state);
            state.stack.push(OpenSpan {
                name: name.to_string(),
                cat: cat.to_string(),
                args: None,
                start,
                streaming: true,
            });
        }
        session.emit(TraceEvent {
            name: name.to_string(),
            cat: Some(cat.to_string()),
            ph: Phase::Begin,
            ts: start,
            dur: None,
            pid: session.pid,
            tid,
            args: None,
            s: None,
        });
    }

    /// Closes the innermost open span on the calling thread.
    pub fn end(&self) {
        let Some(session) = self.active() else {
            return;
        };
        session.close_innermost();
    }

    /// Emits an instant (`i`) record.
    pub fn instant(&self, name: &str, cat: &str, scope: InstantScope) {
        let Some(session) = self.active() else {
            return;
        };
        let ts = session.clock.now_micros();
        let tid = session.thread_tid_with_metadata();
        session.emit(TraceEvent {
            name: name.to_string(),
            cat: Some(cat.to_string()),
            ph: Phase::Instant,
            ts,
            dur: None,
            pid: session.pid,
            tid,
            args: None,
            s: Some(scope),
        });
    }

    /// Emits a counter (`C`) record with a single `value` series.
    ///
    /// Non-finite samples have no JSON representation and are dropped with a
    /// warning.
    pub fn counter(&self, name: &str, value: f64) {
        if !value.is_finite() {
            tracing::warn!(name, value, "dropping non-finite counter sample");
            return;
        }
        let mut args = Map::new();
        args.insert("value".to_string(), Value::from(value));
        // A finite f64 always passes scalar validation.
        let _ = self.counter_values(name, args);
    }

    /// Emits a counter (`C`) record with one series per argument key.
    pub fn counter_values(&self, name: &str, args: Map<String, Value>) -> Result<(), TraceError> {
        validate_args(&args)?;
        let Some(session) = self.active() else {
            return Ok(());
        };
        let ts = session.clock.now_micros();
        let tid = session.thread_tid_with_metadata();
        session.emit(TraceEvent {
            name: name.to_string(),
            cat: None,
            ph: Phase::Counter,
            ts,
            dur: None,
            pid: session.pid,
            tid,
            args: Some(args),
            s: None,
        });
        Ok(())
    }

    /// Flushes and finalizes the trace file.
    ///
    /// Spans still open on any thread are force-closed, innermost first,
    /// stamped with the close-time timestamp; the file stays valid at the
    /// cost of slightly understating their real end. The first write error
    /// deferred during the session (non-strict mode) is surfaced here.
    ///
    /// Idempotent; later calls and span operations on remaining clones are
    /// no-ops.
    pub fn close(&self) -> Result<(), TraceError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if !session.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        session.shutdown()
    }
}

impl Session {
    fn thread_state(&self) -> MutexGuard<'_, ThreadState> {
        let state = self.threads.get_or(|| {
            let tid = unsafe { libc::syscall(libc::SYS_gettid) as u32 };
            let name = std::thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("thread-{tid}"));
            Mutex::new(ThreadState {
                tid,
                name,
                stack: Vec::new(),
                metadata_sent: false,
            })
        });
        lock(state)
    }

    /// Emits the `thread_name` and `thread_sort_index` metadata pair the
    /// first time a thread contributes a record.
    fn emit_thread_metadata(&self, state: &mut ThreadState) {
        if state.metadata_sent {
            return;
        }
        state.metadata_sent = true;

        let mut sort_index = 0;
        for (substring, index) in &self.thread_sort_keys {
            if state.name.contains(substring.as_str()) {
                sort_index = *index;
            }
        }

        let mut name_args = Map::new();
        name_args.insert("name".to_string(), Value::from(state.name.as_str()));
        self.emit(TraceEvent {
            name: "thread_name".to_string(),
            cat: Some("__metadata".to_string()),
            ph: Phase::Metadata,
            ts: 0,
            dur: None,
            pid: self.pid,
            tid: state.tid,
            args: Some(name_args),
            s: None,
        });

        let mut sort_args = Map::new();
        sort_args.insert("sort_index".to_string(), Value::from(sort_index));
        self.emit(TraceEvent {
            name: "thread_sort_index".to_string(),
            cat: Some("__metadata".to_string()),
            ph: Phase::Metadata,
            ts: 0,
            dur: None,
            pid: self.pid,
            tid: state.tid,
            args: Some(sort_args),
            s: None,
        });
    }

    fn thread_tid_with_metadata(&self) -> u32 {
        let mut state = self.thread_state();
        self.emit_thread_metadata(&mut state);
        state.tid
    }

    fn close_innermost(&self) {
        let end = self.clock.now_micros();
        let (open, tid) = {
            let mut state = self.thread_state();
            let Some(open) = state.stack.pop() else {
                tracing::warn!("end() called with no span open on this thread");
                return;
            };
            self.emit_thread_metadata(&mut state);
            (open, state.tid)
        };
        self.emit(close_record(open, self.pid, tid, end));
    }

    /// Records dropped on write failure are counted once via the stored
    /// error; in strict mode the failing write panics instead.
    fn emit(&self, event: TraceEvent) {
        let result = {
            let mut writer = lock(&self.writer);
            match writer.as_mut() {
                Some(writer) => writer.write_event(&event),
                None => Ok(()),
            }
        };
        if let Err(err) = result {
            if self.strict {
                panic!("trace sink write failed: {err}");
            }
            tracing::warn!(error = %err, name = %event.name, "dropping trace record after write failure");
            let mut slot = lock(&self.write_error);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn shutdown(&self) -> Result<(), TraceError> {
        let end = self.clock.now_micros();
        for state in self.threads.iter() {
            let mut state = lock(state);
            if state.stack.is_empty() {
                continue;
            }
            tracing::warn!(
                tid = state.tid,
                open = state.stack.len(),
                "force-closing spans still open at trace close"
            );
            self.emit_thread_metadata(&mut state);
            let tid = state.tid;
            while let Some(open) = state.stack.pop() {
                self.emit(close_record(open, self.pid, tid, end));
            }
        }

        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            writer.finish()?;
        }
        if let Some(err) = lock(&self.write_error).take() {
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.shutdown() {
                tracing::warn!(error = %err, "error finalizing trace file on drop");
            }
        }
    }
}

fn close_record(open: OpenSpan, pid: u32, tid: u32, end: u64) -> TraceEvent {
    if open.streaming {
        TraceEvent {
            name: open.name,
            cat: Some(open.cat),
            ph: Phase::End,
            ts: end,
            dur: None,
            pid,
            tid,
            args: open.args,
            s: None,
        }
    } else {
        TraceEvent {
            name: open.name,
            cat: Some(open.cat),
            ph: Phase::Complete,
            ts: open.start,
            dur: Some(end.saturating_sub(open.start)),
            pid,
            tid,
            args: open.args,
            s: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Recorder {
    fn enter_span(&self, name: &str, cat: &str, args: Option<Map<String, Value>>) -> SpanGuard {
        let Some(session) = self.active() else {
            return SpanGuard { session: None };
        };
        let start = session.clock.now_micros();
        let mut state = session.thread_state();
        state.stack.push(OpenSpan {
            name: name.to_string(),
            cat: cat.to_string(),
            args,
            start,
            streaming: false,
        });
        drop(state);
        SpanGuard {
            session: Some(session.clone()),
        }
    }
}

/// Scope guard for one span. Dropping it (normal exit, early return, or
/// unwind) pops the span from the thread's stack and emits the `X` record.
#[must_use = "the span closes when the guard is dropped"]
pub struct SpanGuard {
    session: Option<Arc<Session>>,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // If close() already force-closed this span the stack is empty
            // and close_innermost only logs.
            if session.enabled.load(Ordering::Relaxed) {
                session.close_innermost();
            }
        }
    }
}
