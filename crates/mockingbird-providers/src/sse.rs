//! SSE (Server-Sent Events) transport.
//!
//! The write side turns fragments into `data: {chunk}` frames as they are
//! produced, then appends `data: [DONE]` once the choice has finished. The
//! read side parses any byte stream back into fragments and reports a stream
//! that closes before the sentinel as [`MockingbirdError::StreamTruncated`].

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{trace, warn};

use mockingbird_core::error::{MockingbirdError, Result};
use mockingbird_core::protocol::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, DONE_SENTINEL, FUNCTION_TYPE, FunctionDelta,
    SSE_DATA_PREFIX, ToolCallDelta,
};
use mockingbird_core::types::{FinishReason, Role, StreamChunkEvent, ToolCallUpdate};

/// Generate a fresh stream id.
pub fn new_stream_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Serializes fragments of one stream into wire frames.
#[derive(Debug, Clone)]
pub struct SseEncoder {
    stream_id: String,
    model: String,
    created: i64,
}

impl SseEncoder {
    pub fn new(stream_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            model: model.into(),
            created: Utc::now().timestamp(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Build the wire chunk for one fragment. Exactly one payload field is populated.
    pub fn chunk(&self, event: &StreamChunkEvent) -> ChatCompletionChunk {
        let mut delta = ChunkDelta {
            role: Role::Assistant.as_str().into(),
            ..ChunkDelta::default()
        };
        let mut finish_reason = None;

        match event {
            StreamChunkEvent::TextDelta { text, .. } => delta.content = text.clone(),
            StreamChunkEvent::ReasoningDelta { text, .. } => delta.reasoning = Some(text.clone()),
            StreamChunkEvent::ToolCallUpdateDelta { update, .. } => {
                delta.tool_calls = Some(vec![ToolCallDelta {
                    index: update.index,
                    id: update.id.clone().unwrap_or_default(),
                    call_type: FUNCTION_TYPE.into(),
                    function: FunctionDelta {
                        name: update.name.clone().unwrap_or_default(),
                        arguments: update.arguments.clone().unwrap_or_default(),
                    },
                }]);
            }
            StreamChunkEvent::Done {
                finish_reason: reason,
                ..
            } => finish_reason = Some(reason.as_str().to_string()),
        }

        ChatCompletionChunk::new(
            &self.stream_id,
            self.created,
            &self.model,
            ChunkChoice {
                index: event.choice(),
                delta,
                finish_reason,
            },
        )
    }

    /// Encode one fragment as an SSE frame.
    pub fn encode(&self, event: &StreamChunkEvent) -> Result<Bytes> {
        let json = serde_json::to_string(&self.chunk(event))?;
        Ok(Bytes::from(format!("{SSE_DATA_PREFIX}{json}\n\n")))
    }

    /// The end-of-stream sentinel frame.
    pub fn sentinel() -> Bytes {
        Bytes::from(format!("{SSE_DATA_PREFIX}{DONE_SENTINEL}\n\n"))
    }
}

struct EncodeState<F> {
    fragments: Pin<Box<dyn Stream<Item = StreamChunkEvent> + Send>>,
    encoder: SseEncoder,
    encode: F,
    saw_done: bool,
    closed: bool,
}

/// Pipe fragments into wire frames as they arrive.
///
/// The sentinel is written only if the fragment stream delivered a `Done`
/// before closing; a stream abandoned mid-turn ends without it.
pub fn encode_stream<S>(fragments: S, encoder: SseEncoder) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = StreamChunkEvent> + Send + 'static,
{
    encode_with(fragments, encoder, SseEncoder::encode)
}

/// A fragment that fails to encode ends the stream without the sentinel,
/// so readers see a truncated turn instead of a silently shortened one.
fn encode_with<S, F>(fragments: S, encoder: SseEncoder, encode: F) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = StreamChunkEvent> + Send + 'static,
    F: Fn(&SseEncoder, &StreamChunkEvent) -> Result<Bytes> + Send + 'static,
{
    futures::stream::unfold(
        EncodeState {
            fragments: Box::pin(fragments),
            encoder,
            encode,
            saw_done: false,
            closed: false,
        },
        |mut state| async move {
            if state.closed {
                return None;
            }
            match state.fragments.next().await {
                Some(event) => match (state.encode)(&state.encoder, &event) {
                    Ok(frame) => {
                        if event.is_done() {
                            state.saw_done = true;
                        }
                        Some((frame, state))
                    }
                    Err(e) => {
                        warn!(%e, stream_id = %state.encoder.stream_id(), "Failed to encode fragment, abandoning stream");
                        state.closed = true;
                        None
                    }
                },
                None => {
                    state.closed = true;
                    if state.saw_done {
                        return Some((SseEncoder::sentinel(), state));
                    }
                    trace!(stream_id = %state.encoder.stream_id(), "Fragment stream closed without completion");
                    None
                }
            }
        },
    )
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = std::result::Result<Bytes, String>> + Send>>,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseState {
    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

/// Parse a byte stream as SSE events.
///
/// Lines are split on raw bytes so multi-byte characters spanning chunk
/// boundaries survive intact.
pub fn parse_sse_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes> + 'static,
    E: Display + 'static,
{
    let byte_stream = byte_stream.map(|chunk| chunk.map(Into::into).map_err(|e| e.to_string()));

    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        state.current_id = Some(value.trim_start().to_string());
                    }
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(MockingbirdError::Transport(format!("SSE stream error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        // Flush a final unterminated line, then any pending event.
                        if !state.buffer.is_empty() {
                            state.buffer.push(b'\n');
                            continue;
                        }
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// A decoded fragment tagged with the stream it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFragment {
    pub stream_id: String,
    pub event: StreamChunkEvent,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Map one wire chunk back to fragments.
pub fn decode_chunk(chunk: &ChatCompletionChunk) -> Vec<StreamChunkEvent> {
    let mut events = Vec::new();
    for choice in &chunk.choices {
        let delta = &choice.delta;
        if let Some(reasoning) = delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
            events.push(StreamChunkEvent::ReasoningDelta {
                choice: choice.index,
                text: reasoning.to_string(),
            });
        }
        if !delta.content.is_empty() {
            events.push(StreamChunkEvent::TextDelta {
                choice: choice.index,
                text: delta.content.clone(),
            });
        }
        for call in delta.tool_calls.iter().flatten() {
            events.push(StreamChunkEvent::ToolCallUpdateDelta {
                choice: choice.index,
                update: ToolCallUpdate {
                    index: call.index,
                    id: non_empty(&call.id),
                    name: non_empty(&call.function.name),
                    arguments: non_empty(&call.function.arguments),
                },
            });
        }
        if let Some(reason) = &choice.finish_reason {
            events.push(StreamChunkEvent::Done {
                choice: choice.index,
                finish_reason: FinishReason::from_wire(reason),
            });
        }
    }
    events
}

struct DecodeState {
    sse: Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>,
    pending: VecDeque<WireFragment>,
    finished: bool,
}

/// Decode a wire byte stream into fragments.
///
/// Ends cleanly after the `[DONE]` sentinel. If the bytes run out first the
/// last item is `Err(StreamTruncated)`.
pub fn decode_wire_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<WireFragment>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes> + 'static,
    E: Display + 'static,
{
    futures::stream::unfold(
        DecodeState {
            sse: Box::pin(parse_sse_stream(byte_stream)),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(fragment) = state.pending.pop_front() {
                    return Some((Ok(fragment), state));
                }
                if state.finished {
                    return None;
                }

                match state.sse.next().await {
                    Some(Ok(sse_event)) => {
                        let data = sse_event.data.trim();
                        if data == DONE_SENTINEL {
                            state.finished = true;
                            continue;
                        }

                        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(%e, data, "Failed to parse wire chunk");
                                continue;
                            }
                        };
                        state
                            .pending
                            .extend(decode_chunk(&chunk).into_iter().map(|event| WireFragment {
                                stream_id: chunk.id.clone(),
                                event,
                            }));
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        state.finished = true;
                        return Some((Err(MockingbirdError::StreamTruncated), state));
                    }
                }
            }
        },
    )
}
