//! Output collaborators: where finished messages and wire frames go.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use mockingbird_core::session::HistoryEntry;
use mockingbird_core::transcript_store::JsonlTranscriptStore;
use mockingbird_core::types::AssistantMessage;

/// Stores a turn's finished assistant message.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist(
        &self,
        conversation_id: &str,
        turn_id: &str,
        message: &AssistantMessage,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl MessageSink for JsonlTranscriptStore {
    async fn persist(
        &self,
        conversation_id: &str,
        _turn_id: &str,
        message: &AssistantMessage,
    ) -> anyhow::Result<()> {
        self.append(conversation_id, &[HistoryEntry::assistant(message.clone())])
            .await?;
        Ok(())
    }
}

/// Collects persisted messages in memory.
#[derive(Default)]
pub struct MemoryMessageSink {
    messages: Mutex<Vec<(String, String, AssistantMessage)>>,
}

impl MemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(conversation_id, turn_id, message)` in persist order.
    pub fn messages(&self) -> Vec<(String, String, AssistantMessage)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageSink for MemoryMessageSink {
    async fn persist(
        &self,
        conversation_id: &str,
        turn_id: &str,
        message: &AssistantMessage,
    ) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((conversation_id.into(), turn_id.into(), message.clone()));
        Ok(())
    }
}

/// Receives wire frames as they are produced.
pub trait EventSink: Send + Sync {
    fn deliver(&self, frame: &Bytes);
}

/// Discards frames.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn deliver(&self, _frame: &Bytes) {}
}

/// Buffers frames in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    frames: Mutex<Vec<Bytes>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Everything delivered so far, as text.
    pub fn wire_text(&self) -> String {
        let frames = self.frames();
        String::from_utf8_lossy(&frames.concat()).into_owned()
    }
}

impl EventSink for MemoryEventSink {
    fn deliver(&self, frame: &Bytes) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
    }
}

/// Writes frames to any writer, flushing after each one.
pub struct WriterEventSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl WriterEventSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> EventSink for WriterEventSink<W> {
    fn deliver(&self, frame: &Bytes) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(frame).and_then(|_| writer.flush()) {
            warn!(%e, "Failed to write wire frame");
        }
    }
}

/// Fans frames out to a channel, e.g. for a remote listener.
impl EventSink for mpsc::UnboundedSender<Bytes> {
    fn deliver(&self, frame: &Bytes) {
        if self.send(frame.clone()).is_err() {
            warn!("Wire frame listener dropped");
        }
    }
}
