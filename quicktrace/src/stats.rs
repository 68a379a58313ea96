//! Background samplers that record process-level counters into a session.
//!
//! Each sampler runs on its own thread and emits one counter record per
//! interval: `proc_cpu_pct` (process CPU time as a percentage of wall time
//! since the previous sample) and `num_fds` (open file descriptors, read
//! from `/proc/self/fd`). Stop the collector before closing the recorder,
//! or the samplers simply start hitting the disabled fast path.

use crate::Recorder;
use chrome_trace::TraceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Cpu,
    Fd,
}

pub const DEFAULT_STATS: &[Stat] = &[Stat::Cpu, Stat::Fd];
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Handle to the running sampler threads.
pub struct StatsCollector {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Starts one sampler thread per requested stat.
pub fn start(
    recorder: &Recorder,
    which: &[Stat],
    interval: Duration,
) -> Result<StatsCollector, TraceError> {
    let running = Arc::new(AtomicBool::new(true));
    let mut handles = Vec::new();
    for stat in which {
        let recorder = recorder.clone();
        let running = running.clone();
        let name = match stat {
            Stat::Cpu => "quicktrace-cpu-stats",
            Stat::Fd => "quicktrace-fd-stats",
        };
        let stat = *stat;
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match stat {
                Stat::Cpu => cpu_sampler(recorder, running, interval),
                Stat::Fd => fd_sampler(recorder, running, interval),
            })?;
        handles.push(handle);
    }
    Ok(StatsCollector { running, handles })
}

impl StatsCollector {
    /// Signals the samplers and waits for them to exit. Returns within one
    /// sampling interval.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn cpu_sampler(recorder: Recorder, running: Arc<AtomicBool>, interval: Duration) {
    let mut prev_wall = Instant::now();
    let mut prev_cpu = process_cpu_micros();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        let wall = Instant::now();
        let cpu = process_cpu_micros();
        let elapsed = wall.duration_since(prev_wall).as_micros() as f64;
        if elapsed > 0.0 {
            let pct = 100.0 * (cpu.saturating_sub(prev_cpu)) as f64 / elapsed;
            recorder.counter("proc_cpu_pct", pct);
        }
        prev_wall = wall;
        prev_cpu = cpu;
    }
}

fn fd_sampler(recorder: Recorder, running: Arc<AtomicBool>, interval: Duration) {
    while running.load(Ordering::SeqCst) {
        recorder.counter("num_fds", fd_count() as f64);
        std::thread::sleep(interval);
    }
}

/// User plus system CPU time consumed by this process, in microseconds.
fn process_cpu_micros() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    timeval_micros(usage.ru_utime) + timeval_micros(usage.ru_stime)
}

fn timeval_micros(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1_000_000 + (tv.tv_usec as u64)
}

fn fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or(0)
}
