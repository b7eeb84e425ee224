//! Model provider abstraction.
//!
//! A provider turns a conversation history into a stream of fragments for the
//! next assistant turn. The only implementation is [`ScriptedProvider`], which
//! follows instruction chains embedded in user messages.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mockingbird_core::error::Result;
use mockingbird_core::session::HistoryEntry;
use mockingbird_core::types::StreamChunkEvent;

pub mod generator;
pub mod instructions;
pub mod progression;
pub mod scripted;
pub mod sse;

pub use generator::TurnScript;
pub use scripted::ScriptedProvider;

/// A request for the next assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub history: Vec<HistoryEntry>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunkEvent> + Send>>;

/// A turn in flight.
pub struct ProviderTurn {
    /// What the provider decided to stream.
    pub script: TurnScript,
    /// Fragments in emission order. Ends after `Done`, or early on cancellation.
    pub chunks: ChunkStream,
}

/// The core provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "scripted").
    fn id(&self) -> &str;

    /// Start streaming the next turn.
    ///
    /// Cancelling `cancel` stops emission; the chunk stream then closes
    /// without a `Done`.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderTurn>;
}
