//! NDJSON line decoder.
//!
//! [`LineDecoder`] turns arbitrarily chunked bytes into parsed JSON records.
//! Bytes are carried across chunk boundaries undecoded, so a UTF-8 codepoint
//! split between two chunks is whole again by the time its line is decoded
//! (`\n` never occurs inside a multi-byte sequence).
//!
//! [`decode_stream`] wraps a transport byte stream into a lazy record stream
//! that honours a [`CancellationToken`].

use std::collections::VecDeque;

use futures_util::stream::{self, FusedStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::DebateError;
use crate::transport::ByteStream;

/// Decoder knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Log dropped lines at `warn` instead of `trace`.
    pub log_malformed_lines: bool,
}

/// Stateful, push-based NDJSON decoder.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
    // Prefix of `carry` already searched for a newline.
    scanned: usize,
    options: DecodeOptions,
    dropped: usize,
}

impl LineDecoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self { carry: Vec::new(), scanned: 0, options, dropped: 0 }
    }

    /// Feed one chunk, returning every record it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.carry.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.carry[from..].iter().position(|&b| b == b'\n') {
            let end = from + pos;
            match parse_line(&self.carry[start..end], &self.options) {
                Line::Record(value) => out.push(value),
                Line::Blank => {}
                Line::Malformed => self.dropped += 1,
            }
            start = end + 1;
            from = start;
        }
        self.carry.drain(..start);
        self.scanned = self.carry.len();
        out
    }

    /// Parse whatever is left after the final chunk.
    pub fn finish(&mut self) -> Vec<Value> {
        let tail = std::mem::take(&mut self.carry);
        self.scanned = 0;
        match parse_line(&tail, &self.options) {
            Line::Record(value) => vec![value],
            Line::Blank => Vec::new(),
            Line::Malformed => {
                self.dropped += 1;
                Vec::new()
            }
        }
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    /// Lines dropped so far because they were not valid UTF-8 JSON.
    pub fn dropped_lines(&self) -> usize {
        self.dropped
    }
}

enum Line {
    Record(Value),
    Blank,
    Malformed,
}

fn parse_line(raw: &[u8], options: &DecodeOptions) -> Line {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            report_drop(options, &String::from_utf8_lossy(raw), &e.to_string());
            return Line::Malformed;
        }
    };
    if line.is_empty() {
        return Line::Blank;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Line::Record(value),
        Err(e) => {
            report_drop(options, line, &e.to_string());
            Line::Malformed
        }
    }
}

fn report_drop(options: &DecodeOptions, line: &str, reason: &str) {
    if options.log_malformed_lines {
        tracing::warn!(%line, %reason, "dropping malformed stream line");
    } else {
        tracing::trace!(%line, %reason, "dropping malformed stream line");
    }
}

// ---------------------------------------------------------------------------
// Async adapter
// ---------------------------------------------------------------------------

struct DecodeState {
    reader: Option<ByteStream>,
    decoder: LineDecoder,
    ready: VecDeque<Value>,
    cancel: CancellationToken,
}

/// Decode a transport byte stream into a lazy, single-pass record stream.
///
/// Yields `Err` only for a transport failure mid-stream, and nothing after it.
/// Once `cancel` fires the reader is dropped and nothing more is yielded, even
/// records already decoded from the current chunk. Polling after the end
/// keeps returning `None`.
pub fn decode_stream(
    bytes: ByteStream,
    cancel: CancellationToken,
    options: DecodeOptions,
) -> impl FusedStream<Item = Result<Value, DebateError>> + Send {
    let state = DecodeState {
        reader: Some(bytes),
        decoder: LineDecoder::new(options),
        ready: VecDeque::new(),
        cancel,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.cancel.is_cancelled() {
                st.reader = None;
                return None;
            }
            if let Some(value) = st.ready.pop_front() {
                return Some((Ok(value), st));
            }
            let reader = st.reader.as_mut()?;
            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => None,
                chunk = reader.next() => Some(chunk),
            };
            match next {
                None => {
                    tracing::debug!("stream cancelled; dropping reader");
                    st.reader = None;
                    return None;
                }
                Some(Some(Ok(chunk))) => {
                    let records = st.decoder.push(&chunk);
                    st.ready.extend(records);
                }
                Some(Some(Err(e))) => {
                    st.reader = None;
                    st.ready.clear();
                    return Some((Err(e), st));
                }
                Some(None) => {
                    st.reader = None;
                    let records = st.decoder.finish();
                    st.ready.extend(records);
                    if st.decoder.dropped_lines() > 0 {
                        tracing::debug!(dropped = st.decoder.dropped_lines(), "stream finished with dropped lines");
                    }
                }
            }
        }
    })
    .fuse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_chunk_two_lines() {
        let mut d = LineDecoder::default();
        let out = d.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(out, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(d.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_line_is_carried() {
        let mut d = LineDecoder::default();
        assert!(d.push(b"{\"type\":\"delta\",\"turn_id\":1,\"sp").is_empty());
        let out = d.push(b"eaker\":\"A\",\"delta\":\"hi\"}\n");
        assert_eq!(
            out,
            vec![json!({"type": "delta", "turn_id": 1, "speaker": "A", "delta": "hi"})]
        );
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut d = LineDecoder::default();
        let out = d.push(b"{\"x\":true}\r\n");
        assert_eq!(out, vec![json!({"x": true})]);
    }

    #[test]
    fn test_empty_lines_are_not_errors() {
        let mut d = LineDecoder::default();
        let out = d.push(b"\n\r\n   \n{\"x\":1}\n\n");
        assert_eq!(out, vec![json!({"x": 1})]);
        assert_eq!(d.dropped_lines(), 0);
    }

    #[test]
    fn test_malformed_line_dropped() {
        let mut d = LineDecoder::new(DecodeOptions { log_malformed_lines: true });
        let out = d.push(b"{\"n\":1}\n{oops\n{\"n\":2}\n");
        assert_eq!(out, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(d.dropped_lines(), 1);
    }

    #[test]
    fn test_split_multibyte_codepoint() {
        let line = "{\"delta\":\"caf\u{e9} \u{1f600}\"}\n".as_bytes();
        // split inside the 4-byte emoji
        let cut = line.len() - 5;
        let mut d = LineDecoder::default();
        assert!(d.push(&line[..cut]).is_empty());
        let out = d.push(&line[cut..]);
        assert_eq!(out, vec![json!({"delta": "caf\u{e9} \u{1f600}"})]);
    }

    #[test]
    fn test_finish_parses_unterminated_tail() {
        let mut d = LineDecoder::default();
        assert_eq!(d.push(b"{\"a\":1}\n{\"b\":"), vec![json!({"a": 1})]);
        d.push(b"2}");
        assert_eq!(d.finish(), vec![json!({"b": 2})]);
        assert!(d.finish().is_empty());
    }

    #[test]
    fn test_finish_drops_garbage_tail() {
        let mut d = LineDecoder::default();
        d.push(b"{\"b\":");
        assert!(d.finish().is_empty());
        assert_eq!(d.dropped_lines(), 1);
    }

    #[test]
    fn test_invalid_utf8_line_dropped() {
        let mut d = LineDecoder::default();
        let out = d.push(b"\xff\xfe\n{\"ok\":1}\n");
        assert_eq!(out, vec![json!({"ok": 1})]);
        assert_eq!(d.dropped_lines(), 1);
    }

    #[test]
    fn test_long_line_in_tiny_chunks() {
        let text = "x".repeat(20_000);
        let line = format!("{}\n{{\"n\":2}}\n", serde_json::json!({ "t": text }));
        let mut d = LineDecoder::default();
        let mut out = Vec::new();
        for chunk in line.as_bytes().chunks(3) {
            out.extend(d.push(chunk));
            assert!(d.scanned <= d.pending_bytes());
        }
        assert_eq!(out, vec![json!({ "t": text }), json!({"n": 2})]);
        assert_eq!(d.pending_bytes(), 0);
    }

    #[test]
    fn test_scan_offset_resets_after_finish() {
        let mut d = LineDecoder::default();
        d.push(b"{\"a\":");
        assert_eq!(d.scanned, 5);
        assert!(d.finish().is_empty());
        assert_eq!(d.push(b"{\"b\":1}\n"), vec![json!({"b": 1})]);
    }

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        stream::iter(parts.iter().map(|p| Ok(bytes::Bytes::from_static(*p))).collect::<Vec<_>>()).boxed()
    }

    #[tokio::test]
    async fn test_polling_after_end_keeps_returning_none() {
        let records = decode_stream(chunks(&[b"{\"n\":1}\n"]), CancellationToken::new(), DecodeOptions::default());
        tokio::pin!(records);
        assert!(records.next().await.is_some());
        assert!(records.next().await.is_none());
        assert!(records.is_terminated());
        assert!(records.next().await.is_none());
    }

    #[tokio::test]
    async fn test_polling_after_cancel_keeps_returning_none() {
        let cancel = CancellationToken::new();
        let records = decode_stream(chunks(&[b"{\"n\":1}\n{\"n\":2}\n"]), cancel.clone(), DecodeOptions::default());
        tokio::pin!(records);
        assert!(records.next().await.is_some());
        cancel.cancel();
        for _ in 0..3 {
            assert!(records.next().await.is_none());
        }
    }
}
