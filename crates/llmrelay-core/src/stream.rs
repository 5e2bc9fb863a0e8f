//! Streaming relay: reads upstream bytes in 4 KiB chunks, feeds them through
//! the usage parser and the capped body buffer, forwards to the client, and
//! handles three shape mismatches — gzip'd non-stream bodies, a non-stream
//! upstream serving a streaming client, and Gemini's `alt=sse` JSON-array
//! reformatting.

use std::io::Read;

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use llmrelay_protocol::sse::{SseParser, render_data_frame};
use llmrelay_transform::{UsageAccumulator, parse_usage_fragment};

pub const CHUNK_SIZE: usize = 4096;
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Accumulates usage and a capped copy of the body while bytes pass through
/// on their way to the client.
#[derive(Default)]
pub struct RelayTap {
    pub usage: UsageAccumulator,
    body: BytesMut,
    sse: SseParser,
}

impl RelayTap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of raw upstream bytes through usage extraction (only
    /// lines shaped `data: ...` are parsed) and appends to the capped body
    /// buffer.
    pub fn observe_stream_chunk(&mut self, chunk: &Bytes) {
        for event in self.sse.push_bytes(chunk) {
            if event.data != "[DONE]" {
                parse_usage_fragment(&event.data, &mut self.usage);
            }
        }
        self.append_body(chunk);
    }

    /// Feeds a complete non-stream JSON body (already gunzipped if needed).
    pub fn observe_complete_body(&mut self, body: &[u8]) {
        if let Ok(text) = std::str::from_utf8(body) {
            parse_usage_fragment(text, &mut self.usage);
        }
        self.append_body(body);
    }

    fn append_body(&mut self, bytes: &[u8]) {
        let remaining = MAX_BODY_BYTES.saturating_sub(self.body.len());
        if remaining == 0 {
            return;
        }
        let take = remaining.min(bytes.len());
        self.body.extend_from_slice(&bytes[..take]);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn finish(&mut self) {
        for event in self.sse.finish() {
            if event.data != "[DONE]" {
                parse_usage_fragment(&event.data, &mut self.usage);
            }
        }
    }
}

/// Gzip detection: the first two bytes `1f 8b`.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn maybe_gunzip(bytes: Bytes) -> Bytes {
    if is_gzip(&bytes) {
        match gunzip(&bytes) {
            Ok(decompressed) => Bytes::from(decompressed),
            Err(err) => {
                tracing::warn!(error = %err, "gzip decode failed, forwarding raw bytes");
                bytes
            }
        }
    } else {
        bytes
    }
}

/// Re-emits a Gemini JSON-array non-stream body as SSE `data: ...\r\n\r\n`
/// events, for `alt=sse` handling. No `[DONE]` marker — Gemini's contract is
/// connection close.
pub fn gemini_array_to_sse(body: &[u8]) -> Vec<Bytes> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return Vec::new();
    };
    let elements: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    elements
        .into_iter()
        .filter_map(|element| serde_json::to_string(&element).ok())
        .map(|payload| {
            let mut out = Vec::with_capacity(payload.len() + 8);
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(payload.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
            Bytes::from(out)
        })
        .collect()
}

pub fn done_frame() -> Bytes {
    render_data_frame("[DONE]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gzip_magic_bytes() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzip(b"{\"a\":1}"));
    }

    #[test]
    fn body_cap_truncates_at_exactly_ten_mib() {
        let mut tap = RelayTap::new();
        let chunk = vec![b'a'; MAX_BODY_BYTES + 1];
        tap.observe_complete_body(&chunk);
        assert_eq!(tap.body().len(), MAX_BODY_BYTES);
    }

    #[test]
    fn gemini_array_reformats_each_element_as_sse() {
        let body = br#"[{"candidates":[]},{"candidates":[]}]"#;
        let events = gemini_array_to_sse(body);
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with(b"data: "));
        assert!(events[0].ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn observe_stream_chunk_accumulates_usage_additively() {
        let mut tap = RelayTap::new();
        tap.observe_stream_chunk(&Bytes::from_static(b"data: {\"usageMetadata\":{\"promptTokenCount\":10}}\n\n"));
        tap.observe_stream_chunk(&Bytes::from_static(b"data: {\"usageMetadata\":{\"candidatesTokenCount\":4}}\n\n"));
        assert_eq!(tap.usage.input_tokens, 10);
        assert_eq!(tap.usage.output_tokens, 4);
    }
}
