//! Incremental server-sent-events decoder.
//!
//! Byte chunks arrive with no alignment to event boundaries, so the
//! decoder buffers until a full line is available. Only `data:` lines
//! carry payloads; the `[DONE]` sentinel is swallowed. A payload that
//! fails to decode is surfaced as one failed item without terminating
//! the stream.

use crate::provider::error::ProviderError;
use crate::provider::types::StreamEvent;

#[derive(Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, ProviderError>> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            if let Some(item) = decode_line(line.trim_end_matches(['\n', '\r'])) {
                out.push(item);
            }
        }
        out
    }
}

fn decode_line(line: &str) -> Option<Result<StreamEvent, ProviderError>> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str::<StreamEvent>(payload)
            .map_err(|e| ProviderError::Stream(format!("{e}: {payload}"))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_events() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: {\"event\":\"message\",\"answer\":\"Hi\"}\n\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::Message { answer, .. } if answer == "Hi"
        ));
    }

    #[test]
    fn buffers_events_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"event\":\"mess").is_empty());
        let events = dec.push(b"age\",\"answer\":\"partial\"}\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut dec = SseDecoder::new();
        let events = dec.push(
            b"data: {\"event\":\"ping\"}\ndata: {\"event\":\"message\",\"answer\":\"a\"}\n",
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn done_sentinel_and_blank_lines_are_swallowed() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: [DONE]\n\n\nevent: message\n");
        assert!(events.is_empty());
    }

    #[test]
    fn decode_failure_is_one_failed_item() {
        let mut dec = SseDecoder::new();
        let events =
            dec.push(b"data: not json\ndata: {\"event\":\"message\",\"answer\":\"ok\"}\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Err(ProviderError::Stream(_))));
        assert!(events[1].is_ok());
    }

    #[test]
    fn crlf_lines_decode() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: {\"event\":\"ping\"}\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].as_ref().unwrap(), StreamEvent::Ping));
    }
}
