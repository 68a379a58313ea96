use crate::{read_file, StreamWriter, TraceError, TraceEvent};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Explicit pid/tid rewriting applied before records are merged.
///
/// Without a remap, colliding ids from different inputs are preserved as-is
/// so each input keeps its own per-process lanes in the viewer.
#[derive(Debug, Clone, Default)]
pub struct IdRemap {
    pub pids: HashMap<u32, u32>,
    pub tids: HashMap<u32, u32>,
}

impl IdRemap {
    fn apply(&self, event: &mut TraceEvent) {
        if let Some(&pid) = self.pids.get(&event.pid) {
            event.pid = pid;
        }
        if let Some(&tid) = self.tids.get(&event.tid) {
            event.tid = tid;
        }
    }
}

/// Merges trace files into one trace written to `out`.
///
/// Inputs are concatenated in argument order with per-file record order
/// preserved; no global timestamp sort is performed, viewers sort
/// internally. Timestamps are not reconciled across inputs either: each
/// producing process keeps its own clock epoch, so merged output is only
/// meaningful when the producers shared one or the consumer tolerates
/// per-pid epoch skew.
///
/// Truncated inputs are recovered up to their last complete record; an
/// input that is not a trace file at all fails the merge.
pub fn merge<W: Write>(
    inputs: &[impl AsRef<Path>],
    out: W,
    remap: Option<&IdRemap>,
) -> Result<W, TraceError> {
    let mut writer = StreamWriter::new(out)?;
    for input in inputs {
        let path = input.as_ref();
        let events = read_file(path)?;
        tracing::debug!(
            path = %path.display(),
            records = events.len(),
            "merging trace file"
        );
        for mut event in events {
            if let Some(remap) = remap {
                remap.apply(&mut event);
            }
            writer.write_event(&event)?;
        }
    }
    writer.finish()
}

/// [`merge`] with a file path destination.
pub fn merge_to_file(
    inputs: &[impl AsRef<Path>],
    output: impl AsRef<Path>,
    remap: Option<&IdRemap>,
) -> Result<(), TraceError> {
    let file = File::create(output.as_ref())?;
    merge(inputs, BufWriter::new(file), remap)?;
    Ok(())
}
