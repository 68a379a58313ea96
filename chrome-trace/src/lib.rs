//! # Chrome Trace
//!
//! Types and file I/O for the Chrome Trace Event Format, the JSON trace
//! dialect understood by both Perfetto and `about:tracing`. Only the
//! consensus subset of the format is modeled: the fixed field names
//! `name`, `cat`, `ph`, `ts`, `dur`, `pid`, `tid`, `args` and the instant
//! scope field `s`.
//!
//! A trace file is a JSON array of event objects, written incrementally so
//! that a process dying mid-trace leaves a file the viewers (and this
//! crate's own [`read_str`]) can still load. Timestamps are microseconds
//! from an arbitrary per-process epoch.
//!
//! ```
//! use chrome_trace::{Phase, StreamWriter, TraceEvent};
//!
//! let event = TraceEvent::builder()
//!     .name("startup".to_string())
//!     .ph(Phase::Complete)
//!     .ts(10)
//!     .dur(250)
//!     .pid(1)
//!     .tid(1)
//!     .build();
//!
//! let mut writer = StreamWriter::new(Vec::new())?;
//! writer.write_event(&event)?;
//! let trace = String::from_utf8(writer.finish()?).unwrap();
//! assert_eq!(chrome_trace::read_str(&trace)?.len(), 1);
//! # Ok::<(), chrome_trace::TraceError>(())
//! ```

mod error;
mod merge;
mod reader;
mod writer;

pub use error::TraceError;
pub use merge::{merge, merge_to_file, IdRemap};
pub use reader::{read_file, read_str};
pub use writer::{SharedBuf, StreamWriter};

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event phase codes used by this crate.
///
/// The single-character code determines how a record is interpreted by the
/// trace viewer: `B`/`E` bracket a duration, `X` carries the duration
/// inline, `i` is a zero-duration marker, `C` a counter sample, and `M`
/// process/thread metadata such as thread names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Begin phase of a duration event. Must be matched by an `End` on the
    /// same thread, in strict nesting order.
    #[serde(rename = "B")]
    Begin,
    /// End phase of a duration event.
    #[serde(rename = "E")]
    End,
    /// Complete event combining begin and end with an inline duration.
    #[serde(rename = "X")]
    Complete,
    /// Instant event with no duration.
    #[serde(rename = "i")]
    Instant,
    /// Counter event tracking values over time.
    #[serde(rename = "C")]
    Counter,
    /// Metadata event for thread/process names and sort order.
    #[serde(rename = "M")]
    Metadata,
}

/// Visual scope of an instant event: how tall the marker is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstantScope {
    /// Spans the entire timeline.
    #[serde(rename = "g")]
    Global,
    /// Spans all threads of the emitting process.
    #[serde(rename = "p")]
    Process,
    /// Confined to the emitting thread's lane (default).
    #[serde(rename = "t")]
    Thread,
}

/// One record of a trace file.
///
/// `ts` and `dur` are microseconds. For `Complete` events `ts` marks the
/// span start and `ts + dur` the span end; `dur` is absent for every other
/// phase. `pid`/`tid` group records into per-process and per-thread lanes.
/// `args` is a flat map of scalar values shown in the event details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct TraceEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat: Option<String>,
    pub ph: Phase,
    #[serde(default)]
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<u64>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    /// Instant scope, only meaningful for `Instant` records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<InstantScope>,
}

/// Checks that every argument value is a scalar (string, number, or bool).
///
/// Arrays, objects, and nulls are rejected up front so a bad value fails at
/// the call site instead of surfacing as a half-written record at
/// serialization time.
pub fn validate_args(args: &Map<String, Value>) -> Result<(), TraceError> {
    for (key, value) in args {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(TraceError::InvalidArgument { key: key.clone() })
            }
        }
    }
    Ok(())
}
