//! State machine for decoding the backend's Anthropic-grammar SSE stream into
//! canonical deltas, plus the re-framers that render those deltas for callers.
//!
//! The [`SseDecoder`] is line-oriented and format-agnostic: it remembers the
//! last `event:` kind and interprets each `data:` line against it. Only
//! `content_block_delta` produces output; `message_stop` produces the terminal
//! delta and finishes the decoder.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use super::anthropic_types::{Delta, StreamEvent};
use super::canonical::StreamDelta;
use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use super::response::truncate;
use super::vertex_types::ContentBlockDeltaEvent;
use crate::error::{ProxyError, Result};

/// Longest SSE line accepted from the backend before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct SseDecoder {
    current_event: Option<String>,
    current_data: Option<String>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `message_stop` has been seen; further lines are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn current_event(&self) -> Option<&str> {
        self.current_event.as_deref()
    }

    pub fn current_data(&self) -> Option<&str> {
        self.current_data.as_deref()
    }

    /// Feed one line (with or without its trailing newline).
    pub fn feed_line(&mut self, line: &str) -> Option<StreamDelta> {
        if self.finished {
            return None;
        }

        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(kind) = line.strip_prefix("event:") {
            self.current_event = Some(kind.trim().to_string());
            return None;
        }

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            self.current_data = Some(data.to_string());
            return self.dispatch(data);
        }

        tracing::debug!(line = %truncate(line, 200), "Ignoring unexpected SSE line");
        None
    }

    fn dispatch(&mut self, data: &str) -> Option<StreamDelta> {
        match self.current_event.as_deref() {
            Some("message_start" | "ping" | "content_block_start" | "content_block_stop") => None,
            Some("message_delta") => None,
            Some("content_block_delta") => {
                match serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    Ok(event) => Some(StreamDelta::Content(event.delta.text)),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            data = %truncate(data, 500),
                            "Skipping unparseable content_block_delta"
                        );
                        None
                    }
                }
            }
            Some("message_stop") => {
                self.finished = true;
                Some(StreamDelta::MessageStop)
            }
            Some(other) => {
                tracing::warn!(
                    event = other,
                    data = %truncate(data, 500),
                    "Ignoring unrecognized stream event"
                );
                None
            }
            None => {
                tracing::debug!(data = %truncate(data, 200), "Ignoring data line with no event");
                None
            }
        }
    }
}

/// Drive an [`SseDecoder`] over a backend byte stream.
///
/// Lines are reassembled across chunk boundaries before UTF-8 decoding. The
/// stream ends after `MessageStop` (without reading further), on clean end of
/// input, or after yielding the first read error. A line longer than
/// [`MAX_LINE_BYTES`] is reported as a read error.
pub fn decode_sse_stream<S>(byte_stream: S) -> impl Stream<Item = Result<StreamDelta>> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes of `buffer` already known to contain no newline
        let mut scanned = 0;
        let mut failed = false;

        tokio::pin!(byte_stream);

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "Backend stream read failed");
                    yield Err(e);
                    failed = true;
                    break 'read;
                }
            };

            buffer.extend_from_slice(&chunk);

            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=scanned + offset).collect();
                scanned = 0;
                if let Some(delta) = decoder.feed_line(&String::from_utf8_lossy(&line)) {
                    yield Ok(delta);
                }
                if decoder.is_finished() {
                    break 'read;
                }
            }
            scanned = buffer.len();

            if buffer.len() > MAX_LINE_BYTES {
                tracing::error!(buffered = buffer.len(), "Backend SSE line exceeds limit");
                yield Err(ProxyError::stream_read(format!(
                    "Backend SSE line exceeds {MAX_LINE_BYTES} bytes"
                )));
                failed = true;
                break 'read;
            }
        }

        // Unterminated final line on clean close
        if !failed && !decoder.is_finished() && !buffer.is_empty() {
            if let Some(delta) = decoder.feed_line(&String::from_utf8_lossy(&buffer)) {
                yield Ok(delta);
            }
        }
    }
}

/// Wrap one text delta as an OpenAI `chat.completion.chunk`. Every chunk gets
/// a fresh id.
pub fn openai_chunk(text: String, model: &str, created: i64) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: Some(text),
            },
            finish_reason: None,
        }],
    }
}

/// Re-frames canonical deltas as Anthropic stream events, numbering content
/// deltas with an increasing `index`.
#[derive(Debug, Default)]
pub struct AnthropicFramer {
    next_index: usize,
}

impl AnthropicFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&mut self, delta: StreamDelta) -> StreamEvent {
        match delta {
            StreamDelta::Content(text) => {
                let index = self.next_index;
                self.next_index += 1;
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text },
                }
            }
            StreamDelta::MessageStop => StreamEvent::MessageStop,
        }
    }
}

/// Split `text` into at most `pieces` roughly equal parts, by characters.
pub fn chunk_text(text: &str, pieces: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let pieces = pieces.max(1);
    let size = chars.len().div_ceil(pieces);
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn feed_all(decoder: &mut SseDecoder, input: &str) -> Vec<StreamDelta> {
        input.lines().filter_map(|l| decoder.feed_line(l)).collect()
    }

    async fn collect(chunks: Vec<Result<Bytes>>) -> Vec<Result<StreamDelta>> {
        decode_sse_stream(stream::iter(chunks)).collect().await
    }

    #[test]
    fn test_single_content_delta() {
        let mut decoder = SseDecoder::new();
        let deltas = feed_all(
            &mut decoder,
            "event: content_block_delta\ndata: {\"delta\":{\"text\":\"Hi\"}}\n\n",
        );
        assert_eq!(deltas, vec![StreamDelta::Content("Hi".to_string())]);
        assert_eq!(decoder.current_event(), Some("content_block_delta"));
        assert_eq!(decoder.current_data(), Some("{\"delta\":{\"text\":\"Hi\"}}"));
    }

    #[test]
    fn test_message_stop_ends_processing() {
        let mut decoder = SseDecoder::new();
        let deltas = feed_all(
            &mut decoder,
            "event: message_stop\ndata: {}\n\nevent: content_block_delta\ndata: {\"delta\":{\"text\":\"late\"}}\n\n",
        );
        assert_eq!(deltas, vec![StreamDelta::MessageStop]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_malformed_delta_does_not_abort() {
        let mut decoder = SseDecoder::new();
        let deltas = feed_all(
            &mut decoder,
            "event: content_block_delta\ndata: {not json\n\n\
             event: content_block_delta\ndata: {\"delta\":{\"text\":\"ok\"}}\n\n",
        );
        assert_eq!(deltas, vec![StreamDelta::Content("ok".to_string())]);
    }

    #[test]
    fn test_control_and_unknown_events_are_ignored() {
        let mut decoder = SseDecoder::new();
        let deltas = feed_all(
            &mut decoder,
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
             event: ping\ndata: {}\n\n\
             event: content_block_start\ndata: {}\n\n\
             event: mystery\ndata: {}\n\n\
             garbage line\n\
             event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"A\"}}\n\n\
             event: content_block_stop\ndata: {}\n\n\
             event: message_delta\ndata: {\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
        );
        assert_eq!(deltas, vec![StreamDelta::Content("A".to_string())]);
        assert!(!decoder.is_finished());
    }

    #[tokio::test]
    async fn test_stream_reassembles_split_lines() {
        let chunks = vec![
            Ok(Bytes::from_static(b"event: content_")),
            Ok(Bytes::from_static(b"block_delta\ndata: {\"delta\":{\"text\":\"caf")),
            // "é" split across two chunks
            Ok(Bytes::from_static(b"\xc3")),
            Ok(Bytes::from_static(b"\xa9\"}}\r\n\r\nevent: message_stop\ndata: {}\n\n")),
        ];

        let deltas: Vec<StreamDelta> = collect(chunks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(
            deltas,
            vec![
                StreamDelta::Content("café".to_string()),
                StreamDelta::MessageStop
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_stops_reading_after_message_stop() {
        let chunks = vec![
            Ok(Bytes::from_static(b"event: message_stop\ndata: {}\n\n")),
            Err(ProxyError::stream_read("must not be polled")),
        ];
        let items = collect(chunks).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::MessageStop);
    }

    #[tokio::test]
    async fn test_clean_eof_without_stop_is_normal_close() {
        let chunks = vec![Ok(Bytes::from_static(
            b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"tail\"}}",
        ))];
        let items = collect(chunks).await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap(),
            &StreamDelta::Content("tail".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_error_surfaces() {
        let chunks = vec![
            Ok(Bytes::from_static(
                b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"a\"}}\n\n",
            )),
            Err(ProxyError::stream_read("connection reset")),
            Ok(Bytes::from_static(
                b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"b\"}}\n\n",
            )),
        ];
        let items = collect(chunks).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProxyError::StreamRead { .. })));
    }

    #[tokio::test]
    async fn test_oversized_line_is_read_error() {
        let half = Bytes::from(vec![b'x'; MAX_LINE_BYTES / 2 + 1]);
        let chunks = vec![
            Ok(Bytes::from_static(
                b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"a\"}}\n\n",
            )),
            Ok(half.clone()),
            Ok(half),
            Ok(Bytes::from_static(b"\nevent: message_stop\ndata: {}\n\n")),
        ];
        let items = collect(chunks).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::Content("a".to_string()));
        assert!(matches!(items[1], Err(ProxyError::StreamRead { .. })));
    }

    #[tokio::test]
    async fn test_partial_line_dropped_after_read_error() {
        let chunks = vec![
            Ok(Bytes::from_static(
                b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"cut\"}}",
            )),
            Err(ProxyError::stream_read("connection reset")),
        ];
        let items = collect(chunks).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn test_line_split_across_many_chunks() {
        let line = b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"slow\"}}\n\n";
        let chunks: Vec<Result<Bytes>> = line
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let items = collect(chunks).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::Content("slow".to_string()));
    }

    #[test]
    fn test_openai_chunk_shape() {
        let a = openai_chunk("Hi".to_string(), "gpt-4o", 123);
        let b = openai_chunk("there".to_string(), "gpt-4o", 123);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("chatcmpl-"));

        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(json["choices"][0]["index"], 0);
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert!(json["choices"][0].as_object().unwrap().contains_key("finish_reason"));
    }

    #[test]
    fn test_anthropic_framer_indexes() {
        let mut framer = AnthropicFramer::new();
        let first = serde_json::to_value(framer.frame(StreamDelta::Content("a".into()))).unwrap();
        let second = serde_json::to_value(framer.frame(StreamDelta::Content("b".into()))).unwrap();
        let stop = framer.frame(StreamDelta::MessageStop);

        assert_eq!(first["type"], "content_block_delta");
        assert_eq!(first["index"], 0);
        assert_eq!(first["delta"]["type"], "text_delta");
        assert_eq!(second["index"], 1);
        assert_eq!(second["delta"]["text"], "b");
        assert_eq!(stop.event_name(), "message_stop");
        assert_eq!(
            serde_json::to_value(stop).unwrap(),
            serde_json::json!({"type": "message_stop"})
        );
    }

    #[test]
    fn test_chunk_text() {
        let pieces = chunk_text("abcdefghijklmnopqrstuvwxy", 10);
        assert_eq!(pieces.len(), 9);
        assert_eq!(pieces.concat(), "abcdefghijklmnopqrstuvwxy");
        assert!(pieces.iter().all(|p| p.chars().count() <= 3));

        assert_eq!(chunk_text("héllo", 10).len(), 5);
        assert!(chunk_text("", 10).is_empty());
        assert_eq!(chunk_text("abc", 0), vec!["abc".to_string()]);
    }
}
