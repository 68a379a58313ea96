//! # quicktrace
//!
//! Easy Chrome Trace Event output for instrumented code. Open a session
//! against any byte sink (or none, which disables tracing entirely), wrap
//! interesting work in scoped spans, and load the resulting file into
//! Perfetto or `about:tracing`.
//!
//! ```no_run
//! use quicktrace::Recorder;
//!
//! # fn main() -> Result<(), quicktrace::TraceError> {
//! let recorder = Recorder::open_path("app.trace")?;
//! {
//!     let _span = recorder.span("load_config", "startup");
//!     // ... work ...
//! }
//! recorder.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! When tracing is disabled ([`Recorder::disabled`], or
//! [`Recorder::open_optional`] with `None`) the span call is a no-op: no
//! timestamp capture, no allocation, no lock. Instrumentation can therefore
//! be left in place permanently and enabled per run.
//!
//! Traces from separate processes are combined offline with
//! [`chrome_trace::merge`]; pass a shared path fragment to the children and
//! merge the per-process files afterwards.

pub mod clock;
pub mod failure;
mod recorder;
pub mod stats;

#[cfg(test)]
mod tests;

pub use chrome_trace::{
    merge, merge_to_file, read_file, read_str, IdRemap, InstantScope, Phase, SharedBuf,
    StreamWriter, TraceError, TraceEvent,
};
pub use clock::{Clock, MonotonicClock};
pub use failure::FailureTrace;
pub use recorder::{Recorder, RecorderBuilder, SpanGuard};
