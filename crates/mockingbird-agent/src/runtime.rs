//! Turn runtime: streams one assistant turn through the wire and back into history.
//!
//! The provider's fragments are encoded to SSE frames, teed to the event
//! sink, decoded again and aggregated, so the history always reflects exactly
//! what went over the wire. Completed tool calls are handed to the executor
//! while the rest of the turn is still streaming.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mockingbird_core::config::{Config, DEFAULT_MODEL};
use mockingbird_core::error::{MockingbirdError, Result};
use mockingbird_core::session::{Conversation, HistoryEntry};
use mockingbird_core::types::{StreamChunkEvent, ToolCall, ToolCallResult};
use mockingbird_providers::sse::{SseEncoder, WireFragment, decode_wire_stream, encode_stream, new_stream_id};
use mockingbird_providers::{CompletionRequest, LlmProvider, ScriptedProvider};
use mockingbird_tools::{ToolExecutor, ToolRegistry};

use crate::aggregator::{MessageAggregator, MessageKey, MessageSnapshot};
use crate::composite::build_assistant_message;
use crate::correlator::{Delivery, ToolResultCorrelator};
use crate::sink::{EventSink, MessageSink, NullEventSink};
use crate::{AgentEvent, TurnReport};

/// Delivers tool results from outside the turn, in any order.
#[derive(Debug, Clone)]
pub struct ToolResultSender(mpsc::UnboundedSender<ToolCallResult>);

impl ToolResultSender {
    /// Returns false once the turn has stopped accepting results.
    pub fn send(&self, result: ToolCallResult) -> bool {
        self.0.send(result).is_ok()
    }
}

pub type ToolResultReceiver = mpsc::UnboundedReceiver<ToolCallResult>;

pub fn tool_result_channel() -> (ToolResultSender, ToolResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ToolResultSender(tx), rx)
}

/// Per-turn inputs and observers.
pub struct TurnContext {
    pub cancel: CancellationToken,
    pub external_results: Option<ToolResultReceiver>,
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
    pub snapshots: Option<watch::Sender<MessageSnapshot>>,
    /// Run completed calls through the agent's executor.
    pub execute_tools: bool,
}

impl Default for TurnContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            external_results: None,
            events: None,
            snapshots: None,
            execute_tools: true,
        }
    }
}

impl TurnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_results(mut self, results: ToolResultReceiver) -> Self {
        self.external_results = Some(results);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_snapshots(mut self, snapshots: watch::Sender<MessageSnapshot>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn without_tool_execution(mut self) -> Self {
        self.execute_tools = false;
        self
    }
}

/// Drives assistant turns for conversations.
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    message_sink: Option<Arc<dyn MessageSink>>,
    event_sink: Arc<dyn EventSink>,
    model: String,
}

impl Agent {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            provider,
            tools,
            message_sink: None,
            event_sink: Arc::new(NullEventSink),
            model: DEFAULT_MODEL.into(),
        }
    }

    /// Scripted provider and built-in tools, configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ScriptedProvider::from_config(config)),
            Arc::new(ToolRegistry::with_builtins()),
        )
        .with_model(config.model())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.message_sink = Some(sink);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one assistant turn for the conversation.
    ///
    /// On success the turn's message (and any tool results) are appended to
    /// the conversation. A cancelled or cut-off turn appends nothing.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        ctx: TurnContext,
    ) -> Result<TurnReport> {
        let start = Instant::now();
        let TurnContext {
            cancel,
            mut external_results,
            events,
            snapshots,
            execute_tools,
        } = ctx;

        let request = CompletionRequest {
            model: self.model.clone(),
            history: conversation.entries().to_vec(),
        };

        let turn = match self.provider.stream(&request, cancel.clone()).await {
            Ok(turn) => turn,
            Err(e) => {
                error!(%e, provider = self.provider.id(), "Provider failed to start turn");
                if let Some(tx) = &events {
                    let _ = tx.send(AgentEvent::Error {
                        kind: e.kind().into(),
                        message: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        let stream_id = new_stream_id();
        let encoder = SseEncoder::new(&stream_id, &self.model);
        let event_sink = Arc::clone(&self.event_sink);
        let frames = encode_stream(turn.chunks, encoder).map(move |frame| {
            event_sink.deliver(&frame);
            Ok::<_, Infallible>(frame)
        });
        let mut wire = std::pin::pin!(decode_wire_stream(frames));

        let mut state = TurnState {
            aggregator: MessageAggregator::new(),
            correlator: ToolResultCorrelator::new(),
            executions: JoinSet::new(),
            tools: Arc::clone(&self.tools),
            execute_tools,
            events,
            snapshots,
            fragments: 0,
            tool_calls: 0,
        };

        let mut stream_open = true;
        let mut results_open = external_results.is_some();
        let mut failure: Option<MockingbirdError> = None;

        while failure.is_none() && (stream_open || !state.executions.is_empty()) {
            tokio::select! {
                next = wire.next(), if stream_open => match next {
                    Some(Ok(fragment)) => state.on_fragment(fragment),
                    Some(Err(e)) => {
                        stream_open = false;
                        failure = Some(e);
                    }
                    None => stream_open = false,
                },
                received = recv_external(&mut external_results), if results_open => match received {
                    Some(result) => state.deliver(result),
                    None => results_open = false,
                },
                Some(joined) = state.executions.join_next(), if !state.executions.is_empty() => match joined {
                    Ok(result) => state.deliver(result),
                    Err(e) => warn!(%e, "Tool execution task failed"),
                },
                _ = cancel.cancelled(), if !stream_open => {
                    failure = Some(MockingbirdError::Cancelled);
                }
            }
        }

        if let Some(e) = failure {
            state.executions.abort_all();
            let e = match e {
                MockingbirdError::StreamTruncated if cancel.is_cancelled() => {
                    MockingbirdError::Cancelled
                }
                other => other,
            };
            warn!(%e, fragments = state.fragments, "Turn did not complete");
            state.emit(AgentEvent::Error {
                kind: e.kind().into(),
                message: e.to_string(),
            });
            return Err(e);
        }

        // Results already queued by external sources still count.
        if let Some(rx) = external_results.as_mut() {
            while let Ok(result) = rx.try_recv() {
                state.deliver(result);
            }
        }

        let finish_reason = state
            .aggregator
            .keys()
            .first()
            .and_then(|key| state.aggregator.snapshot(key))
            .and_then(MessageSnapshot::finish_reason);

        let TurnState {
            aggregator,
            correlator,
            events,
            fragments,
            tool_calls,
            ..
        } = state;

        let orphaned_results = correlator.finish();
        let message = build_assistant_message(&stream_id, aggregator.finalize());

        if let Some(message) = &message {
            conversation.append(HistoryEntry::assistant(message.clone()));
            for record in message.tool_calls() {
                if let Some(result) = &record.result {
                    conversation.append(HistoryEntry::tool(result));
                }
            }
            if let Some(sink) = &self.message_sink {
                if let Err(e) = sink.persist(&conversation.id, &stream_id, message).await {
                    warn!(%e, conversation_id = %conversation.id, "Failed to persist message");
                }
            }
        } else {
            debug!("Turn produced no content");
        }

        if let Some(tx) = &events {
            let _ = tx.send(AgentEvent::TurnComplete {
                generation_id: stream_id.clone(),
                composite: message.as_ref().is_some_and(|m| m.is_composite()),
                orphaned_results: orphaned_results.len(),
            });
        }

        let report = TurnReport {
            generation_id: stream_id,
            script: turn.script,
            message,
            orphaned_results,
            finish_reason,
            fragments,
            tool_calls,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            generation_id = %report.generation_id,
            fragments = report.fragments,
            tool_calls = report.tool_calls,
            duration_ms = report.duration_ms,
            "Turn complete"
        );
        Ok(report)
    }
}

async fn recv_external(results: &mut Option<ToolResultReceiver>) -> Option<ToolCallResult> {
    match results {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Everything one in-flight turn owns. Only the turn's own task touches it.
struct TurnState {
    aggregator: MessageAggregator,
    correlator: ToolResultCorrelator,
    executions: JoinSet<ToolCallResult>,
    tools: Arc<dyn ToolExecutor>,
    execute_tools: bool,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    snapshots: Option<watch::Sender<MessageSnapshot>>,
    fragments: usize,
    tool_calls: usize,
}

impl TurnState {
    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn on_fragment(&mut self, fragment: WireFragment) {
        self.fragments += 1;
        match &fragment.event {
            StreamChunkEvent::TextDelta { text, .. } => self.emit(AgentEvent::PartialReply {
                delta: text.clone(),
            }),
            StreamChunkEvent::ReasoningDelta { text, .. } => {
                self.emit(AgentEvent::ReasoningStream { text: text.clone() })
            }
            _ => {}
        }

        let (key, applied) = self.aggregator.apply(&fragment.stream_id, &fragment.event);

        for id in &applied.observed_ids {
            if let Some(held) = self.correlator.observe_call(id, &key) {
                self.attach(&key, held);
            }
        }

        for call in applied.completed {
            // Positional ids only become known here.
            if let Some(held) = self.correlator.observe_call(&call.id, &key) {
                self.attach(&key, held);
            }
            self.tool_calls += 1;
            self.emit(AgentEvent::ToolCall {
                id: call.id.clone(),
                tool: call.name.clone(),
                params: call
                    .parsed_arguments()
                    .unwrap_or_else(|| serde_json::json!({})),
            });
            if self.execute_tools {
                self.spawn_execution(call);
            }
        }

        self.publish(&key);
    }

    fn spawn_execution(&mut self, call: ToolCall) {
        info!(tool = %call.name, id = %call.id, "Executing tool");
        let tools = Arc::clone(&self.tools);
        self.executions.spawn(async move {
            tools
                .execute(&call.name, &call.arguments)
                .await
                .into_result(call.id)
        });
    }

    fn deliver(&mut self, result: ToolCallResult) {
        if let Delivery::Attached { key, result } = self.correlator.deliver(result) {
            self.attach(&key, result);
            self.publish(&key);
        }
    }

    fn attach(&mut self, key: &MessageKey, result: ToolCallResult) {
        self.emit(AgentEvent::ToolResult {
            tool_call_id: result.tool_call_id.clone(),
            content: result.result.clone(),
            is_error: result.is_error,
        });
        if let Some(snapshot) = self.aggregator.snapshot_mut(key) {
            snapshot.attach_result(result);
        }
    }

    fn publish(&self, key: &MessageKey) {
        if let (Some(tx), Some(snapshot)) = (&self.snapshots, self.aggregator.snapshot(key)) {
            tx.send_replace(snapshot.clone());
        }
    }
}
