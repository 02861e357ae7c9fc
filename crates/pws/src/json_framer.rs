//! Split a byte stream into complete top-level JSON values.
//!
//! The legacy text-framed channel carries concatenated JSON values with no
//! delimiters.  The framer buffers incoming bytes and probes the buffer with
//! the JSON parser: the stream deserializer yields each complete value with
//! its end offset, reports "end of input" for a value still in flight, and a
//! syntax error for garbage.  Incomplete input (including a trailing partial
//! UTF-8 sequence) is retained for the next feed; invalid input discards the
//! buffer.

use tracing::warn;

/// Incremental framer over a byte stream of concatenated JSON values.
#[derive(Debug, Default)]
pub struct JsonFramer {
    buf: Vec<u8>,
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered and not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes; returns every complete top-level JSON value now available,
    /// in order, as trimmed text slices of the original stream.
    ///
    /// Feeding may be byte-at-a-time or in arbitrary chunks; value boundaries
    /// need not align with feed boundaries.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        // Probe only the valid UTF-8 prefix; a partial multi-byte sequence at
        // the end is not an error, it just has not finished arriving.
        let text = match std::str::from_utf8(&self.buf) {
            Ok(s) => s,
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                std::str::from_utf8(&self.buf[..valid]).expect("validated prefix")
            }
            Err(_) => {
                warn!("discarding non-UTF-8 bytes on the text channel");
                self.buf.clear();
                return Vec::new();
            }
        };

        let mut values = Vec::new();
        let mut consumed = 0usize;
        let mut invalid = false;
        {
            let mut probe = serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>();
            loop {
                match probe.next() {
                    None => {
                        // only whitespace remained; safe to drop
                        consumed = text.len();
                        break;
                    }
                    Some(Ok(value)) => {
                        let end = probe.byte_offset();
                        // A number running to the very end of the buffer is
                        // ambiguous: "3" may be the prefix of "3.5".  Hold it
                        // until a delimiter (or any further byte) arrives.
                        if value.is_number() && end == text.len() && text.len() == self.buf.len() {
                            break;
                        }
                        values.push(text[consumed..end].trim().to_owned());
                        consumed = end;
                    }
                    Some(Err(e)) if e.is_eof() => break, // incomplete; wait for more bytes
                    Some(Err(e)) => {
                        warn!(error = %e, "discarding invalid JSON on the text channel");
                        invalid = true;
                        break;
                    }
                }
            }
        }

        if invalid {
            self.buf.clear();
        } else if consumed > 0 {
            self.buf.drain(..consumed);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_concatenated_values_fed_byte_at_a_time() {
        let mut framer = JsonFramer::new();
        let mut out = Vec::new();
        for b in br#"{"a":1}{"b":2}[3]"# {
            out.extend(framer.push(&[*b]));
        }
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#, "[3]"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn emits_whole_buffer_when_it_is_one_value() {
        let mut framer = JsonFramer::new();
        assert_eq!(framer.push(br#"{"a":[1,2,3]}"#), vec![r#"{"a":[1,2,3]}"#]);
    }

    #[test]
    fn invalid_json_discards_the_buffer() {
        let mut framer = JsonFramer::new();
        assert!(framer.push(b"[1,,2]").is_empty());
        assert_eq!(framer.pending(), 0);
        // the framer still works afterwards
        assert_eq!(framer.push(b"true"), vec!["true"]);
    }

    #[test]
    fn values_before_the_garbage_are_still_emitted() {
        let mut framer = JsonFramer::new();
        assert_eq!(framer.push(br#"{"a":1}[1,,2]"#), vec![r#"{"a":1}"#]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn incomplete_value_is_retained() {
        let mut framer = JsonFramer::new();
        assert!(framer.push(b"{").is_empty());
        assert_eq!(framer.pending(), 1);
        assert_eq!(framer.push(br#""k":null}"#), vec![r#"{"k":null}"#]);
    }

    #[test]
    fn whitespace_between_values_is_tolerated() {
        let mut framer = JsonFramer::new();
        let out = framer.push(b"  1 \n\t 2   [3]\n");
        assert_eq!(out, vec!["1", "2", "[3]"]);
        assert_eq!(framer.pending(), 0);
    }

    /// Law: any list of values, concatenated with arbitrary whitespace and
    /// fed in arbitrary-sized chunks, comes back out as the same list.
    #[test]
    fn chunking_does_not_change_the_result() {
        let stream = br#"{"op":"add","args":[1,2]} "x" 3.5 [true,null] {"nested":{"deep":[{}]}}"#;
        let expected = vec![
            r#"{"op":"add","args":[1,2]}"#,
            r#""x""#,
            "3.5",
            "[true,null]",
            r#"{"nested":{"deep":[{}]}}"#,
        ];
        for chunk_size in [1, 2, 3, 5, 7, 11, stream.len()] {
            let mut framer = JsonFramer::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                out.extend(framer.push(chunk));
            }
            assert_eq!(out, expected, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn trailing_bare_number_waits_for_a_delimiter() {
        let mut framer = JsonFramer::new();
        assert!(framer.push(b"12").is_empty());
        assert!(framer.push(b"3").is_empty());
        assert_eq!(framer.push(b" "), vec!["123"]);
    }

    #[test]
    fn split_utf8_sequences_are_held_back() {
        // "héllo" with the é split across feeds
        let bytes = r#""héllo""#.as_bytes();
        let mut framer = JsonFramer::new();
        let split = 3; // lands inside the two-byte é
        assert!(framer.push(&bytes[..split]).is_empty());
        assert_eq!(framer.push(&bytes[split..]), vec![r#""héllo""#]);
    }
}
