//! Incremental newline-delimited JSON decoding.
//!
//! Chunks arrive at arbitrary boundaries. Every complete line is decoded as
//! soon as its newline shows up; the trailing partial line is held until more
//! bytes arrive or the stream ends.

use serde_json::Value;

#[derive(Debug)]
pub enum DecodedLine {
    Event(Value),
    Malformed {
        line: String,
        error: serde_json::Error,
    },
}

#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    /// Bytes after the last newline seen so far
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every line it completes. Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let line = &self.buffer[start..start + offset];
            start += offset + 1;
            if let Some(item) = decode_line(line) {
                decoded.push(item);
            }
        }
        self.buffer.drain(..start);
        decoded
    }

    /// End of stream: one last attempt at an unterminated final line.
    /// An undecodable fragment is dropped.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        match decode_line(&rest)? {
            DecodedLine::Event(value) => Some(value),
            DecodedLine::Malformed { line, error } => {
                tracing::debug!("Discarding trailing fragment {:?}: {}", line, error);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<DecodedLine> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(match serde_json::from_slice(line) {
        Ok(value) => DecodedLine::Event(value),
        Err(error) => DecodedLine::Malformed {
            line: String::from_utf8_lossy(line).into_owned(),
            error,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(lines: Vec<DecodedLine>) -> Vec<Value> {
        lines
            .into_iter()
            .map(|l| match l {
                DecodedLine::Event(v) => v,
                DecodedLine::Malformed { line, .. } => panic!("malformed: {line}"),
            })
            .collect()
    }

    #[test]
    fn line_split_across_chunks_is_decoded_once() {
        let mut decoder = NdjsonDecoder::new();
        let first = events(decoder.push(b"{\"session_id\":\"abc\"}\n{\"typ"));
        assert_eq!(first, vec![json!({"session_id": "abc"})]);
        assert_eq!(decoder.pending_bytes(), 5);

        let second = events(decoder.push(b"e\":\"result\"}\n"));
        assert_eq!(second, vec![json!({"type": "result"})]);
        assert_eq!(decoder.pending_bytes(), 0);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn many_lines_in_one_chunk_and_blank_lines() {
        let mut decoder = NdjsonDecoder::new();
        let out = events(decoder.push(b"1\n\n  \r\n[2]\n\"three\"\n"));
        assert_eq!(out, vec![json!(1), json!([2]), json!("three")]);
    }

    #[test]
    fn malformed_line_does_not_stop_decoding() {
        let mut decoder = NdjsonDecoder::new();
        let out = decoder.push(b"{\"a\":1}\nnot json\n{\"b\":2}\n");
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[1], DecodedLine::Malformed { line, .. } if line == "not json"));
        assert!(matches!(&out[2], DecodedLine::Event(v) if v == &json!({"b": 2})));
    }

    #[test]
    fn unterminated_final_line_is_decoded_at_finish() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"{\"type\":\"res").is_empty());
        assert!(decoder.push(b"ult\"}").is_empty());
        assert_eq!(decoder.finish(), Some(json!({"type": "result"})));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn invalid_trailing_fragment_is_dropped() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"ok\":true}\n{\"trunc");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "{\"text\":\"caf\u{e9} \u{2713}\"}\n".as_bytes();
        let mut decoder = NdjsonDecoder::new();
        let mut out = Vec::new();
        for byte in line {
            out.extend(events(decoder.push(std::slice::from_ref(byte))));
        }
        assert_eq!(out, vec![json!({"text": "caf\u{e9} \u{2713}"})]);
    }
}
