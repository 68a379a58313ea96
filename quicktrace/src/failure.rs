//! Buffered sessions that only hit disk when the guarded work fails.
//!
//! The trace is recorded into memory; [`FailureTrace::finish`] persists it
//! to a rotating directory when the caller reports a failure (or when
//! `always` is set). The directory keeps at most [`KEEP_MAX`] files, oldest
//! removed first, and may be written to by several processes at once, so
//! cleanup races are tolerated rather than surfaced.

use crate::Recorder;
use chrome_trace::{SharedBuf, TraceError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

/// Maximum number of saved traces kept in the directory.
pub const KEEP_MAX: usize = 100;

const SEQUENCE_DIGITS: u32 = 4;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// In-memory trace session saved to disk only on failure.
pub struct FailureTrace {
    recorder: Recorder,
    buf: SharedBuf,
    dir: PathBuf,
    always: bool,
}

impl FailureTrace {
    /// Starts a buffered session. Saved files land under `dir` as
    /// `{pid}_{date}_{seq}.trace`.
    pub fn start(dir: impl AsRef<Path>) -> Result<Self, TraceError> {
        Self::new(dir, false)
    }

    /// `always` persists the trace regardless of the outcome reported to
    /// [`FailureTrace::finish`].
    pub fn new(dir: impl AsRef<Path>, always: bool) -> Result<Self, TraceError> {
        let buf = SharedBuf::new();
        let recorder = Recorder::open(buf.clone())?;
        Ok(Self {
            recorder,
            buf,
            dir: dir.as_ref().to_path_buf(),
            always,
        })
    }

    /// The recorder to instrument the guarded work with.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Closes the session and persists the buffered trace if `failed` (or
    /// the session was created with `always`). Returns the saved path, if
    /// any.
    pub fn finish(self, failed: bool) -> Result<Option<PathBuf>, TraceError> {
        self.recorder.close()?;
        if !failed && !self.always {
            return Ok(None);
        }

        remove_oldest(&self.dir, KEEP_MAX);
        std::fs::create_dir_all(&self.dir)?;
        let path = next_trace_path(&self.dir);
        std::fs::write(&path, self.buf.contents())?;
        tracing::warn!(path = %path.display(), "saved failure trace");
        Ok(Some(path))
    }

    /// Runs `work` under a buffered session, keeping the trace only when it
    /// returns `Err`. The work's result is passed through untouched; save
    /// errors are logged, not propagated, so a failing trace directory never
    /// masks the real error.
    pub fn run<T, E>(
        dir: impl AsRef<Path>,
        work: impl FnOnce(&Recorder) -> Result<T, E>,
    ) -> Result<T, E> {
        let session = match Self::start(dir) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(error = %err, "failure tracing unavailable");
                return work(&Recorder::disabled());
            }
        };
        let result = work(session.recorder());
        if let Err(err) = session.finish(result.is_err()) {
            tracing::warn!(error = %err, "could not save failure trace");
        }
        result
    }
}

fn next_trace_path(dir: &Path) -> PathBuf {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10u32.pow(SEQUENCE_DIGITS);
    let stamp = humantime::format_rfc3339_seconds(SystemTime::now())
        .to_string()
        .replace(['-', ':'], "")
        .replace('T', "_")
        .trim_end_matches('Z')
        .to_string();
    dir.join(format!("{}_{}_{:04}.trace", std::process::id(), stamp, seq))
}

/// Removes oldest files until fewer than `keep` remain. Concurrent writers
/// may be cleaning the same directory; a file deleted under us is fine.
fn remove_oldest(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                // Make files we cannot stat the least likely removal targets.
                .unwrap_or_else(|_| SystemTime::now());
            (modified, entry.path())
        })
        .collect();
    entries.sort();

    let mut remaining = entries.len();
    for (_, path) in entries {
        if remaining < keep {
            break;
        }
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(error = %err, path = %path.display(), "could not remove old failure trace");
        }
        remaining -= 1;
    }
}
