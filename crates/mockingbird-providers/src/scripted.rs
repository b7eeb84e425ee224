//! The scripted provider: replays instruction chains embedded in user messages.

use async_trait::async_trait;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mockingbird_core::config::{Config, InstructionsConfig, StreamConfig};
use mockingbird_core::error::{MockingbirdError, Result};
use mockingbird_core::session::HistoryEntry;

use crate::generator::{StreamGenerator, TurnScript, seed_for};
use crate::progression::analyze;
use crate::{CompletionRequest, LlmProvider, ProviderTurn};

pub struct ScriptedProvider {
    generator: StreamGenerator,
    markers: InstructionsConfig,
}

impl ScriptedProvider {
    pub fn new(stream: StreamConfig, markers: InstructionsConfig) -> Self {
        Self {
            generator: StreamGenerator::new(stream),
            markers,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.stream(), config.instructions())
    }

    pub fn markers(&self) -> &InstructionsConfig {
        &self.markers
    }

    /// Resolve what the next turn streams and the seed it streams with.
    pub fn select(&self, history: &[HistoryEntry]) -> Result<(TurnScript, u64)> {
        let progression = analyze(history, &self.markers)?;
        let trigger = history
            .iter()
            .rev()
            .find_map(HistoryEntry::user_text)
            .unwrap_or_default();
        Ok((TurnScript::from_progression(progression), seed_for(trigger)))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderTurn> {
        let (script, seed) = self.select(&request.history)?;
        let fragments = self.generator.plan(&script, seed);

        info!(
            model = %request.model,
            step = script.marker().unwrap_or("-"),
            "Starting scripted turn"
        );

        let (rx, handle) = self.generator.clone().spawn(fragments, cancel);
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(written)) => debug!(written, "Generation finished"),
                Ok(Err(MockingbirdError::Cancelled)) => debug!("Generation cancelled"),
                Ok(Err(e)) => warn!(%e, "Generation failed"),
                Err(e) => warn!(%e, "Generation task panicked"),
            }
        });

        Ok(ProviderTurn {
            script,
            chunks: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}
