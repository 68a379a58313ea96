use crate::{TraceError, TraceEvent};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Incremental writer for the JSON array trace format.
///
/// The opening bracket is written on construction and every record is
/// flushed as a syntactically complete object, so an abrupt termination
/// leaves a file missing at most the closing bracket. The record separator
/// is written *before* the next record rather than after the previous one,
/// so the last record actually flushed is never followed by a trailing
/// comma.
pub struct StreamWriter<W: Write> {
    out: W,
    first: bool,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(mut out: W) -> Result<Self, TraceError> {
        out.write_all(b"[\n")?;
        out.flush()?;
        Ok(Self { out, first: true })
    }

    pub fn write_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        if !self.first {
            self.out.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.out, event)?;
        self.out.flush()?;
        Ok(())
    }

    /// Writes the closing bracket and hands the sink back.
    pub fn finish(mut self) -> Result<W, TraceError> {
        self.out.write_all(b"\n]\n")?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Cloneable in-memory sink.
///
/// Every clone appends to the same buffer, which can be read back after the
/// writing session is done. Used for buffered failure traces and in tests.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
