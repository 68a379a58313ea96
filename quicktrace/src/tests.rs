use crate::clock::Clock;
use crate::{FailureTrace, InstantScope, Phase, Recorder, SharedBuf, TraceError, TraceEvent};
use rstest::{fixture, rstest};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    fn set(&self, micros: u64) {
        self.0.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts captures so tests can prove the disabled path never reads time.
#[derive(Clone, Default)]
struct CountingClock(Arc<AtomicU64>);

impl CountingClock {
    fn captures(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clock for CountingClock {
    fn now_micros(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

struct TestSetup {
    buf: SharedBuf,
    clock: ManualClock,
    recorder: Recorder,
}

#[fixture]
fn setup() -> TestSetup {
    let buf = SharedBuf::new();
    let clock = ManualClock::default();
    let recorder = Recorder::builder()
        .pid(4)
        .clock(clock.clone())
        .open(buf.clone())
        .expect("failed to open recorder");
    TestSetup {
        buf,
        clock,
        recorder,
    }
}

fn parse(buf: &SharedBuf) -> Vec<TraceEvent> {
    let content = String::from_utf8(buf.contents()).expect("trace is not utf-8");
    crate::read_str(&content).expect("trace did not parse")
}

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[rstest]
fn complete_records_carry_start_and_duration(setup: TestSetup) {
    setup.clock.set(123_000_000);
    {
        let _span = setup
            .recorder
            .span_with_args("name_here", "cat_here", args(&[("arg", json!(1))]))
            .unwrap();
        setup.clock.set(125_000_000);
    }
    {
        let _span = setup.recorder.span("name2_here", "cat_here");
        setup.clock.set(125_500_000);
    }
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    assert_eq!(events.len(), 4);

    assert_eq!(events[0].ph, Phase::Metadata);
    assert_eq!(events[0].name, "thread_name");
    assert_eq!(events[0].pid, 4);
    assert_eq!(events[1].ph, Phase::Metadata);
    assert_eq!(events[1].name, "thread_sort_index");

    assert_eq!(events[2].name, "name_here");
    assert_eq!(events[2].cat.as_deref(), Some("cat_here"));
    assert_eq!(events[2].ph, Phase::Complete);
    assert_eq!(events[2].ts, 123_000_000);
    assert_eq!(events[2].dur, Some(2_000_000));
    assert_eq!(events[2].args.as_ref().unwrap()["arg"], json!(1));

    assert_eq!(events[3].name, "name2_here");
    assert_eq!(events[3].ts, 125_000_000);
    assert_eq!(events[3].dur, Some(500_000));
}

#[rstest]
fn nested_spans_close_innermost_first(setup: TestSetup) {
    setup.clock.set(100);
    {
        let _main = setup.recorder.span("main", "app");
        setup.clock.set(110);
        {
            let _sub = setup.recorder.span("sub1", "app");
            setup.clock.set(110);
        }
        {
            let _sub = setup.recorder.span("sub2", "app");
            setup.clock.set(120);
        }
        setup.clock.set(130);
    }
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let spans: Vec<&TraceEvent> = events.iter().filter(|e| e.ph == Phase::Complete).collect();
    assert_eq!(spans.len(), 3);

    // Write order is completion order, innermost first.
    assert_eq!(spans[0].name, "sub1");
    assert_eq!(spans[1].name, "sub2");
    assert_eq!(spans[2].name, "main");

    // Zero-duration spans are legal.
    assert_eq!(spans[0].dur, Some(0));

    let main = spans[2];
    for sub in &spans[..2] {
        assert!(sub.ts >= main.ts);
        assert!(sub.ts + sub.dur.unwrap() <= main.ts + main.dur.unwrap());
        assert_eq!(sub.pid, main.pid);
        assert_eq!(sub.tid, main.tid);
    }
}

#[test]
fn disabled_recorder_is_a_complete_no_op() {
    let recorder = Recorder::disabled();
    assert!(!recorder.is_enabled());
    for _ in 0..100 {
        let _span = recorder.span("never", "never");
    }
    recorder.instant("never", "never", InstantScope::Thread);
    recorder.counter("never", 1.0);
    recorder.end();
    recorder.close().unwrap();
}

#[test]
fn closed_session_captures_no_timestamps() {
    let buf = SharedBuf::new();
    let clock = CountingClock::default();
    let recorder = Recorder::builder()
        .clock(clock.clone())
        .open(buf.clone())
        .unwrap();
    recorder.close().unwrap();

    let captures = clock.captures();
    let written = buf.len();
    for _ in 0..100 {
        let _span = recorder.span("late", "late");
    }
    recorder.counter("late", 1.0);
    assert_eq!(clock.captures(), captures);
    assert_eq!(buf.len(), written);
}

#[rstest]
fn non_scalar_args_fail_before_any_write(setup: TestSetup) {
    let before = setup.buf.len();
    let result = setup
        .recorder
        .span_with_args("bad", "app", args(&[("foo", json!([1, 2]))]));
    assert!(matches!(
        result,
        Err(TraceError::InvalidArgument { ref key }) if key == "foo"
    ));
    assert_eq!(setup.buf.len(), before);

    let result = setup
        .recorder
        .counter_values("bad", args(&[("nested", json!({"a": 1}))]));
    assert!(matches!(result, Err(TraceError::InvalidArgument { .. })));
    assert_eq!(setup.buf.len(), before);
}

#[rstest]
fn span_record_is_emitted_on_unwind(setup: TestSetup) {
    setup.clock.set(10);
    let recorder = setup.recorder.clone();
    let clock = setup.clock.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _span = recorder.span("doomed", "app");
        clock.set(15);
        panic!("guarded code failed");
    }));
    assert!(result.is_err());
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let doomed: Vec<&TraceEvent> = events.iter().filter(|e| e.name == "doomed").collect();
    assert_eq!(doomed.len(), 1);
    assert_eq!(doomed[0].ph, Phase::Complete);
    assert_eq!(doomed[0].dur, Some(5));
}

#[rstest]
fn leaked_spans_are_force_closed(setup: TestSetup) {
    setup.clock.set(100);
    let guard = setup.recorder.span("orphan", "app");
    std::mem::forget(guard);
    setup.clock.set(150);
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let orphan: Vec<&TraceEvent> = events.iter().filter(|e| e.name == "orphan").collect();
    assert_eq!(orphan.len(), 1);
    assert_eq!(orphan[0].ph, Phase::Complete);
    assert_eq!(orphan[0].ts, 100);
    assert_eq!(orphan[0].dur, Some(50));
}

#[rstest]
fn begin_end_emit_paired_streaming_records(setup: TestSetup) {
    setup.clock.set(10);
    setup.recorder.begin("stream", "app");
    setup.clock.set(25);
    setup.recorder.end();
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let begin: Vec<&TraceEvent> = events.iter().filter(|e| e.ph == Phase::Begin).collect();
    let end: Vec<&TraceEvent> = events.iter().filter(|e| e.ph == Phase::End).collect();
    assert_eq!(begin.len(), 1);
    assert_eq!(end.len(), 1);
    assert_eq!(begin[0].name, "stream");
    assert_eq!(begin[0].ts, 10);
    assert_eq!(end[0].ts, 25);
    assert_eq!(begin[0].tid, end[0].tid);
}

#[rstest]
fn unmatched_begin_is_force_closed_with_end(setup: TestSetup) {
    setup.clock.set(10);
    setup.recorder.begin("dangling", "app");
    setup.clock.set(30);
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let end: Vec<&TraceEvent> = events
        .iter()
        .filter(|e| e.name == "dangling" && e.ph == Phase::End)
        .collect();
    assert_eq!(end.len(), 1);
    assert_eq!(end[0].ts, 30);
}

#[rstest]
fn trace_fn_wraps_work_in_a_span(setup: TestSetup) {
    setup.clock.set(40);
    let out = setup.recorder.trace_fn("compute", "app", || {
        setup.clock.set(65);
        7
    });
    assert_eq!(out, 7);
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let span = events.iter().find(|e| e.name == "compute").unwrap();
    assert_eq!(span.ph, Phase::Complete);
    assert_eq!(span.ts, 40);
    assert_eq!(span.dur, Some(25));
}

#[rstest]
fn non_finite_counters_are_dropped(setup: TestSetup) {
    let before = setup.buf.len();
    setup.recorder.counter("bad", f64::NAN);
    setup.recorder.counter("bad", f64::INFINITY);
    assert_eq!(setup.buf.len(), before);

    setup.recorder.counter("good", 1.0);
    setup.recorder.close().unwrap();
    let events = parse(&setup.buf);
    assert!(events.iter().all(|e| e.name != "bad"));
    assert!(events.iter().any(|e| e.name == "good"));
}

#[rstest]
fn instants_and_counters(setup: TestSetup) {
    setup.clock.set(7);
    setup.recorder.instant("mark", "app", InstantScope::Process);
    setup.recorder.counter("depth", 3.0);
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let mark = events.iter().find(|e| e.name == "mark").unwrap();
    assert_eq!(mark.ph, Phase::Instant);
    assert_eq!(mark.ts, 7);
    assert_eq!(mark.s, Some(InstantScope::Process));

    let depth = events.iter().find(|e| e.name == "depth").unwrap();
    assert_eq!(depth.ph, Phase::Counter);
    assert_eq!(depth.args.as_ref().unwrap()["value"], json!(3.0));
}

#[rstest]
fn thread_metadata_is_emitted_once(setup: TestSetup) {
    for _ in 0..3 {
        let _span = setup.recorder.span("work", "app");
    }
    setup.recorder.close().unwrap();

    let events = parse(&setup.buf);
    let names: Vec<&TraceEvent> = events.iter().filter(|e| e.name == "thread_name").collect();
    assert_eq!(names.len(), 1);
}

#[test]
fn independent_sessions_do_not_interfere() {
    let buf_a = SharedBuf::new();
    let buf_b = SharedBuf::new();
    let a = Recorder::builder().pid(1).open(buf_a.clone()).unwrap();
    let b = Recorder::builder().pid(2).open(buf_b.clone()).unwrap();
    {
        let _span = a.span("only_a", "app");
    }
    a.close().unwrap();
    {
        let _span = b.span("only_b", "app");
    }
    b.close().unwrap();

    let events_a = parse(&buf_a);
    let events_b = parse(&buf_b);
    assert!(events_a.iter().any(|e| e.name == "only_a"));
    assert!(events_a.iter().all(|e| e.name != "only_b"));
    assert!(events_b.iter().any(|e| e.name == "only_b"));
}

#[test]
fn concurrent_threads_keep_their_own_stacks() {
    let buf = SharedBuf::new();
    let recorder = Recorder::open(buf.clone()).unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let recorder = recorder.clone();
        handles.push(std::thread::spawn(move || {
            for j in 0..10 {
                let _outer = recorder.span(&format!("outer-{i}-{j}"), "work");
                let _inner = recorder.span(&format!("inner-{i}-{j}"), "work");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    recorder.close().unwrap();

    let events = parse(&buf);
    let spans: Vec<&TraceEvent> = events.iter().filter(|e| e.ph == Phase::Complete).collect();
    assert_eq!(spans.len(), 80);

    let tids: std::collections::HashSet<u32> = spans.iter().map(|e| e.tid).collect();
    assert_eq!(tids.len(), 4);

    // Inner closes before outer on every thread, so per-thread write order
    // alternates inner, outer.
    for tid in tids {
        let per_thread: Vec<&&TraceEvent> = spans.iter().filter(|e| e.tid == tid).collect();
        for pair in per_thread.chunks(2) {
            assert!(pair[0].name.starts_with("inner-"));
            assert!(pair[1].name.starts_with("outer-"));
        }
    }
}

#[test]
fn abrupt_termination_leaves_recoverable_file() {
    let buf = SharedBuf::new();
    let clock = ManualClock::default();
    let recorder = Recorder::builder()
        .pid(9)
        .clock(clock.clone())
        .open(buf.clone())
        .unwrap();
    for i in 0..5 {
        clock.set(i * 10);
        let _span = recorder.span(&format!("ev{i}"), "app");
    }
    // No close(): the buffer is missing its closing bracket, as after a
    // crash mid-session.
    let content = String::from_utf8(buf.contents()).unwrap();
    assert!(!content.trim_end().ends_with(']'));

    let events = crate::read_str(&content).unwrap();
    assert_eq!(
        events.iter().filter(|e| e.ph == Phase::Complete).count(),
        5
    );
    recorder.close().unwrap();
}

#[test]
fn failure_trace_saves_only_on_error() {
    let dir = TempDir::new().unwrap();
    let traces = dir.path().join("failure_traces");

    let ok: Result<(), &str> = FailureTrace::run(&traces, |recorder| {
        let _span = recorder.span("fine", "app");
        Ok(())
    });
    assert!(ok.is_ok());
    assert!(!traces.exists());

    let failed: Result<(), &str> = FailureTrace::run(&traces, |recorder| {
        let _span = recorder.span("broken", "app");
        Err("boom")
    });
    assert_eq!(failed, Err("boom"));

    let saved: Vec<_> = std::fs::read_dir(&traces).unwrap().flatten().collect();
    assert_eq!(saved.len(), 1);
    let events = crate::read_file(saved[0].path()).unwrap();
    assert!(events.iter().any(|e| e.name == "broken"));
}

#[test]
fn failure_trace_always_mode_keeps_successes() {
    let dir = TempDir::new().unwrap();
    let traces = dir.path().join("always");
    let session = FailureTrace::new(&traces, true).unwrap();
    {
        let _span = session.recorder().span("kept", "app");
    }
    let path = session.finish(false).unwrap();
    assert!(path.is_some());
}
