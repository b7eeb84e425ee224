//! Chat-completion chunk wire protocol.
//!
//! Every streamed fragment is one SSE `data:` line carrying a
//! [`ChatCompletionChunk`]. A turn ends with a chunk whose `finishReason` is
//! set, followed by the literal `data: [DONE]` sentinel line.

use serde::{Deserialize, Serialize};

/// Prefix of every SSE data line.
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Payload of the end-of-stream sentinel line.
pub const DONE_SENTINEL: &str = "[DONE]";

/// `object` value of every chunk.
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Tool call `type` value.
pub const FUNCTION_TYPE: &str = "function";

/// One wire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(rename = "finishReason", default)]
    pub finish_reason: Option<String>,
}

/// Chunk payload. `content` is always serialized, empty when the event
/// carries reasoning or tool-call data instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub call_type: String,
    #[serde(default)]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn default_function_type() -> String {
    FUNCTION_TYPE.into()
}

impl ChatCompletionChunk {
    pub fn new(id: &str, created: i64, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.into(),
            created,
            model: model.to_string(),
            choices: vec![choice],
        }
    }
}
