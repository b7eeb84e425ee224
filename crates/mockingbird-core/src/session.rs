//! Conversation model — ordered, role-tagged history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AssistantMessage, Role, ToolCallResult};

/// A single entry in the conversation history (and one JSONL transcript line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum HistoryEntry {
    #[serde(rename = "user")]
    User {
        content: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// One assistant turn. A composite counts as a single entry.
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        HistoryEntry::User {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(message: AssistantMessage) -> Self {
        HistoryEntry::Assistant {
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn tool(result: &ToolCallResult) -> Self {
        HistoryEntry::Tool {
            tool_call_id: result.tool_call_id.clone(),
            content: result.result.clone(),
            is_error: result.is_error,
            timestamp: Utc::now(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            HistoryEntry::User { .. } => Role::User,
            HistoryEntry::Assistant { .. } => Role::Assistant,
            HistoryEntry::Tool { .. } => Role::Tool,
        }
    }

    /// Text of a user entry.
    pub fn user_text(&self) -> Option<&str> {
        match self {
            HistoryEntry::User { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// An in-memory conversation: an id plus its ordered history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub entries: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn from_entries(id: impl Into<String>, entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries,
            ..Self::with_id(id)
        }
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The most recent user message, which triggers the next turn.
    pub fn last_user_message(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| e.user_text())
    }

    pub fn assistant_turns(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.role() == Role::Assistant)
            .count()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
