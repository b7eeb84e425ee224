//! JSONL-based transcript store — conversations as append-only JSONL files.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{MockingbirdError, Result};
use crate::session::{Conversation, HistoryEntry};

/// File-based conversation store.
///
/// Layout: `<base>/<conversation_id>.jsonl`, one [`HistoryEntry`] per line.
pub struct JsonlTranscriptStore {
    base: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Default store location: `~/.mockingbird/transcripts/`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("transcripts")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn transcript_path(&self, conversation_id: &str) -> Result<PathBuf> {
        if conversation_id.is_empty()
            || conversation_id.contains(['/', '\\'])
            || conversation_id.starts_with('.')
        {
            return Err(MockingbirdError::Session(format!(
                "invalid conversation id: {conversation_id:?}"
            )));
        }
        Ok(self.base.join(format!("{conversation_id}.jsonl")))
    }

    /// Append entries to a conversation's transcript.
    pub async fn append(&self, conversation_id: &str, entries: &[HistoryEntry]) -> Result<()> {
        let path = self.transcript_path(conversation_id)?;
        tokio::fs::create_dir_all(&self.base).await?;

        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!(conversation_id, count = entries.len(), "Appended transcript entries");
        Ok(())
    }

    /// Load a conversation. A missing transcript yields an empty conversation.
    pub async fn load(&self, conversation_id: &str) -> Result<Conversation> {
        let path = self.transcript_path(conversation_id)?;
        if !path.exists() {
            return Ok(Conversation::with_id(conversation_id));
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Conversation::from_entries(conversation_id, parse_jsonl(&data)))
    }

    /// Delete a conversation's transcript.
    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        let path = self.transcript_path(conversation_id)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Parse JSONL history, skipping blank and unreadable lines.
fn parse_jsonl(data: &str) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();
    for (line_no, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = line_no + 1, %e, "Skipping unreadable transcript line"),
        }
    }
    entries
}

/// Load a history file for replay: a JSON array of entries, or JSONL.
pub async fn load_history_file(path: &Path) -> Result<Vec<HistoryEntry>> {
    let data = tokio::fs::read_to_string(path).await?;
    let trimmed = data.trim_start();
    if trimmed.starts_with('[') {
        let entries: Vec<HistoryEntry> = serde_json::from_str(trimmed)?;
        return Ok(entries);
    }
    Ok(parse_jsonl(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, FinalizedMessage};

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());

        store
            .append("conv-1", &[HistoryEntry::user("hello")])
            .await
            .unwrap();
        store
            .append(
                "conv-1",
                &[HistoryEntry::assistant(AssistantMessage::Single(
                    FinalizedMessage::Text { text: "hi".into() },
                ))],
            )
            .await
            .unwrap();

        let conversation = store.load("conv-1").await.unwrap();
        assert_eq!(conversation.entries.len(), 2);
        assert_eq!(conversation.last_user_message(), Some("hello"));
        assert_eq!(conversation.assistant_turns(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        let conversation = store.load("nope").await.unwrap();
        assert!(conversation.entries.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        assert!(store.load("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_load_history_file_array_and_jsonl() {
        let dir = tempfile::tempdir().unwrap();

        let array_path = dir.path().join("history.json");
        tokio::fs::write(&array_path, r#"[{"role":"user","content":"a"}]"#)
            .await
            .unwrap();
        assert_eq!(load_history_file(&array_path).await.unwrap().len(), 1);

        let jsonl_path = dir.path().join("history.jsonl");
        tokio::fs::write(
            &jsonl_path,
            "{\"role\":\"user\",\"content\":\"a\"}\n\nnot json\n{\"role\":\"user\",\"content\":\"b\"}\n",
        )
        .await
        .unwrap();
        assert_eq!(load_history_file(&jsonl_path).await.unwrap().len(), 2);
    }
}
