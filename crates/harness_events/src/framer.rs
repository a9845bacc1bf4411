use serde_json::Value;

/// Parse outcome for one logical NDJSON line.
#[derive(Debug, Clone)]
pub struct FramedLine {
    /// 1-based line number in the underlying byte stream (blank lines count).
    pub line_number: usize,
    pub outcome: Result<Value, FrameError>,
}

/// A line that was not valid JSON. The framer never fails the stream for
/// malformed input; it reports the line and keeps going.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}: `{raw}`")]
pub struct FrameError {
    pub message: String,
    /// The offending line, CR-stripped, as received.
    pub raw: String,
}

/// Splits a byte stream into newline-delimited JSON parse results.
///
/// Feed chunks with [`LineFramer::push`]; a partial trailing line is buffered
/// until its newline arrives. Call [`LineFramer::finish`] at end of stream to
/// flush a non-empty residual. Empty and whitespace-only lines are skipped,
/// and a single trailing `\r` is stripped before parsing.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    line_number: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FramedLine> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(framed) = self.frame(&line[..line.len() - 1]) {
                out.push(framed);
            }
        }
        out
    }

    /// Flushes the residual after end of stream, if any.
    pub fn finish(&mut self) -> Option<FramedLine> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        self.frame(&rest)
    }

    fn frame(&mut self, bytes: &[u8]) -> Option<FramedLine> {
        self.line_number += 1;

        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_suffix('\r').unwrap_or(&text);
        if text.chars().all(char::is_whitespace) {
            return None;
        }

        let outcome = serde_json::from_str::<Value>(text).map_err(|err| FrameError {
            message: format!("invalid JSON: {err}"),
            raw: text.to_string(),
        });
        Some(FramedLine {
            line_number: self.line_number,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(lines: &[FramedLine]) -> Vec<Value> {
        lines
            .iter()
            .map(|l| l.outcome.clone().expect("expected parsed line"))
            .collect()
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"a\"").is_empty());
        assert!(framer.push(b": 1}").is_empty());
        let lines = framer.push(b"\n{\"b\": 2}\n");
        assert_eq!(
            values(&lines),
            vec![
                serde_json::json!({"a": 1}),
                serde_json::json!({"b": 2}),
            ]
        );
        assert!(framer.finish().is_none());
    }

    #[test]
    fn skips_blank_and_whitespace_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"\n   \n\t\n{\"ok\": true}\n");
        assert_eq!(lines.len(), 1);
        // Blank lines still advance the counter.
        assert_eq!(lines[0].line_number, 4);
    }

    #[test]
    fn strips_trailing_carriage_return() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"{\"crlf\": true}\r\n");
        assert_eq!(values(&lines), vec![serde_json::json!({"crlf": true})]);
    }

    #[test]
    fn malformed_line_is_reported_and_stream_continues() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"not json\n{\"fine\": 1}\n");
        assert_eq!(lines.len(), 2);

        let err = lines[0].outcome.as_ref().unwrap_err();
        assert_eq!(err.raw, "not json");
        assert!(err.message.contains("invalid JSON"));

        assert_eq!(lines[1].outcome.as_ref().unwrap()["fine"], 1);
    }

    #[test]
    fn finish_parses_unterminated_residual() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"tail\": 3}").is_empty());
        let last = framer.finish().expect("residual line");
        assert_eq!(last.outcome.unwrap()["tail"], 3);
        assert!(framer.finish().is_none());
    }
}
