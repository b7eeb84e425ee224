//! Agent runtime: turns a provider's fragment stream into conversation history.
//!
//! Each turn is encoded to wire frames, decoded, aggregated into live
//! [`aggregator::MessageSnapshot`]s, correlated with tool results and
//! finalized into one history entry. Observers receive [`AgentEvent`]s as the
//! turn progresses.

use serde::{Deserialize, Serialize};

use mockingbird_core::types::{AssistantMessage, FinishReason, ToolCallResult};
use mockingbird_providers::TurnScript;

pub mod aggregator;
pub mod composite;
pub mod correlator;
pub mod runtime;
pub mod sink;

pub use runtime::{Agent, ToolResultSender, TurnContext, tool_result_channel};

/// Events emitted by the agent runtime during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Streaming text delta for live typing indicators.
    #[serde(rename = "partial_reply")]
    PartialReply { delta: String },

    /// Reasoning content.
    #[serde(rename = "reasoning")]
    ReasoningStream { text: String },

    /// A tool call finished streaming.
    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        tool: String,
        params: serde_json::Value,
    },

    /// A tool result was attached to its call.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },

    /// The turn finished and its message joined the history.
    #[serde(rename = "turn_complete")]
    TurnComplete {
        generation_id: String,
        composite: bool,
        orphaned_results: usize,
    },

    /// The turn failed or was cancelled.
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    /// Stream id of the turn; also the composite's generation id.
    pub generation_id: String,
    pub script: TurnScript,
    /// The history unit appended for this turn, if it produced any content.
    pub message: Option<AssistantMessage>,
    /// Results whose call never appeared in the stream.
    pub orphaned_results: Vec<ToolCallResult>,
    pub finish_reason: Option<FinishReason>,
    pub fragments: usize,
    pub tool_calls: usize,
    pub duration_ms: u64,
}
