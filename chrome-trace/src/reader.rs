use crate::{TraceError, TraceEvent};
use std::path::Path;

/// Reads every complete record from a trace file.
///
/// Tolerates files that were never finalized: a missing closing bracket or
/// a partially written trailing record is truncated at the last complete
/// record instead of failing the whole file. Input that does not start with
/// the array opening bracket is rejected as not a trace file.
pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, TraceError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    read_str(&content)
}

/// In-memory variant of [`read_file`]. Same truncation tolerance.
pub fn read_str(content: &str) -> Result<Vec<TraceEvent>, TraceError> {
    let Some(body) = content.trim_start().strip_prefix('[') else {
        return Err(TraceError::Format(
            "missing opening bracket".to_string(),
        ));
    };

    let mut events = Vec::new();
    let bytes = body.as_bytes();
    let mut pos = 0;
    loop {
        while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t' | b'\r' | b'\n' | b',') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b']' {
            break;
        }
        let mut de = serde_json::Deserializer::from_str(&body[pos..]).into_iter::<TraceEvent>();
        match de.next() {
            None => break,
            Some(Ok(event)) => {
                pos += de.byte_offset();
                events.push(event);
            }
            Some(Err(err)) => {
                tracing::warn!(
                    error = %err,
                    recovered = events.len(),
                    "trace file truncated, dropping trailing partial record"
                );
                break;
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Phase;

    #[test]
    fn reads_complete_file() {
        let content = r#"[
{"name":"a","ph":"X","ts":1,"dur":2,"pid":1,"tid":1},
{"name":"b","cat":"c","ph":"i","ts":3,"pid":1,"tid":1,"s":"t"}
]
"#;
        let events = read_str(content).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].ph, Phase::Complete);
        assert_eq!(events[0].dur, Some(2));
        assert_eq!(events[1].cat.as_deref(), Some("c"));
    }

    #[test]
    fn recovers_records_from_truncated_file() {
        let content = "[\n{\"name\":\"a\",\"ph\":\"X\",\"ts\":1,\"dur\":0,\"pid\":1,\"tid\":1},\n{\"name\":\"b\",\"ph\":\"X\",\"ts\":2,\"du";
        let events = read_str(content).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "a");
    }

    #[test]
    fn missing_closing_bracket_keeps_all_records() {
        let content = "[\n{\"name\":\"a\",\"ph\":\"X\",\"ts\":1,\"dur\":0,\"pid\":1,\"tid\":1},\n{\"name\":\"b\",\"ph\":\"X\",\"ts\":2,\"dur\":1,\"pid\":1,\"tid\":1}";
        let events = read_str(content).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn non_trace_input_is_a_format_error() {
        assert!(matches!(
            read_str("{\"hello\": 1}"),
            Err(TraceError::Format(_))
        ));
        assert!(matches!(read_str(""), Err(TraceError::Format(_))));
    }

    #[test]
    fn empty_array_is_empty_trace() {
        assert!(read_str("[\n]\n").unwrap().is_empty());
        assert!(read_str("[]").unwrap().is_empty());
    }
}
