use std::slice;

use serde::{Deserialize, Serialize};

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Why a choice stopped producing fragments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
        }
    }

    /// Parse a wire finish reason. Unknown values map to `Stop`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

/// Partial tool-call data carried by one fragment.
///
/// `index` is the stable position of the call within its turn and is used
/// to key the call when `id` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallUpdate {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One protocol fragment of a streamed assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunkEvent {
    TextDelta {
        choice: u32,
        text: String,
    },
    ReasoningDelta {
        choice: u32,
        text: String,
    },
    ToolCallUpdateDelta {
        choice: u32,
        update: ToolCallUpdate,
    },
    Done {
        choice: u32,
        finish_reason: FinishReason,
    },
}

impl StreamChunkEvent {
    /// The choice (turn) index this fragment belongs to.
    pub fn choice(&self) -> u32 {
        match self {
            StreamChunkEvent::TextDelta { choice, .. }
            | StreamChunkEvent::ReasoningDelta { choice, .. }
            | StreamChunkEvent::ToolCallUpdateDelta { choice, .. }
            | StreamChunkEvent::Done { choice, .. } => *choice,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamChunkEvent::Done { .. })
    }
}

/// A tool call as reconstructed from streamed fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Prefix-growing argument JSON text.
    pub arguments: String,
}

impl ToolCall {
    /// Parse the accumulated arguments, if they form complete JSON.
    pub fn parsed_arguments(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.arguments).ok()
    }
}

/// Result of executing a tool call. Arrival is independent of the call's
/// streaming completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A tool call paired with its result, when one was correlated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,
}

/// Distinct kinds of finalized single-kind messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Reasoning,
    Text,
    ToolCalls,
}

/// A frozen single-kind assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalizedMessage {
    Reasoning { text: String },
    Text { text: String },
    ToolCalls { calls: Vec<ToolCallRecord> },
}

impl FinalizedMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            FinalizedMessage::Reasoning { .. } => MessageKind::Reasoning,
            FinalizedMessage::Text { .. } => MessageKind::Text,
            FinalizedMessage::ToolCalls { .. } => MessageKind::ToolCalls,
        }
    }
}

/// A turn's output spanning more than one message kind, kept as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeMessage {
    pub role: Role,
    pub generation_id: String,
    /// Inner messages in first-observed order.
    pub ordered_inner: Vec<FinalizedMessage>,
}

/// What one assistant turn contributes to the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "message", rename_all = "snake_case")]
pub enum AssistantMessage {
    Single(FinalizedMessage),
    Composite(CompositeMessage),
}

impl AssistantMessage {
    /// The finalized messages in order, regardless of wrapping.
    pub fn messages(&self) -> &[FinalizedMessage] {
        match self {
            AssistantMessage::Single(message) => slice::from_ref(message),
            AssistantMessage::Composite(composite) => &composite.ordered_inner,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, AssistantMessage::Composite(_))
    }

    /// Concatenated text of all text messages.
    pub fn text(&self) -> String {
        self.messages()
            .iter()
            .filter_map(|m| match m {
                FinalizedMessage::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated reasoning of all reasoning messages.
    pub fn reasoning(&self) -> String {
        self.messages()
            .iter()
            .filter_map(|m| match m {
                FinalizedMessage::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallRecord> {
        self.messages()
            .iter()
            .flat_map(|m| match m {
                FinalizedMessage::ToolCalls { calls } => calls.iter().collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect()
    }
}
