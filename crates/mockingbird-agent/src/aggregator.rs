//! Message update aggregator.
//!
//! Rebuilds one [`MessageSnapshot`] per (stream id, choice) from decoded
//! fragments. Snapshots are plain data: any number of observers can run
//! their own aggregator over the same fragments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use mockingbird_core::types::{
    FinalizedMessage, FinishReason, MessageKind, StreamChunkEvent, ToolCall, ToolCallRecord,
    ToolCallResult, ToolCallUpdate,
};

/// Identifies one message: a choice within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub stream_id: String,
    pub choice: u32,
}

impl MessageKey {
    pub fn new(stream_id: impl Into<String>, choice: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            choice,
        }
    }
}

/// Live state of one streamed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallState {
    /// Positional index within the turn.
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Argument text received so far.
    pub arguments: String,
    /// Last successful parse of `arguments`.
    pub parsed: Option<Value>,
    pub complete: bool,
}

impl ToolCallState {
    fn new(index: u32) -> Self {
        Self {
            index,
            id: None,
            name: None,
            arguments: String::new(),
            parsed: None,
            complete: false,
        }
    }

    /// The call's id, or a positional one if the stream never sent an id.
    pub fn call_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("call_{}", self.index))
    }

    /// Whether the arguments received so far form one whole JSON value.
    pub fn has_whole_arguments(&self) -> bool {
        !self.arguments.is_empty() && serde_json::from_str::<Value>(&self.arguments).is_ok()
    }

    pub fn to_call(&self) -> ToolCall {
        ToolCall {
            id: self.call_id(),
            name: self.name.clone().unwrap_or_default(),
            arguments: self.arguments.clone(),
        }
    }
}

/// What one fragment changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Call ids seen for the first time.
    pub observed_ids: Vec<String>,
    /// Calls that will receive no further fragments.
    pub completed: Vec<ToolCall>,
    /// The fragment was the message's `Done`.
    pub finished: bool,
}

/// The live reconstruction of one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallState>,
    pub tool_results: HashMap<String, ToolCallResult>,
    kinds: Vec<MessageKind>,
    finish_reason: Option<FinishReason>,
}

impl MessageSnapshot {
    /// Message kinds in the order they were first observed.
    pub fn kinds(&self) -> &[MessageKind] {
        &self.kinds
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCallState> {
        self.tool_calls.iter().find(|c| c.call_id() == id)
    }

    /// Best-effort current arguments of a call.
    pub fn current_arguments(&self, id: &str) -> Option<&Value> {
        self.tool_call(id).and_then(|c| c.parsed.as_ref())
    }

    /// Record a tool result, returning any result it replaced.
    pub fn attach_result(&mut self, result: ToolCallResult) -> Option<ToolCallResult> {
        let previous = self.tool_results.insert(result.tool_call_id.clone(), result);
        if let Some(prev) = &previous {
            warn!(tool_call_id = %prev.tool_call_id, "Replacing earlier tool result");
        }
        previous
    }

    fn note_kind(&mut self, kind: MessageKind) {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
    }

    /// Apply one fragment in arrival order.
    pub fn apply(&mut self, event: &StreamChunkEvent) -> Applied {
        let mut applied = Applied::default();
        if self.is_finished() {
            warn!(?event, "Ignoring fragment after completion");
            return applied;
        }

        match event {
            StreamChunkEvent::TextDelta { text, .. } => {
                if !text.is_empty() {
                    self.note_kind(MessageKind::Text);
                    self.text.push_str(text);
                }
            }
            StreamChunkEvent::ReasoningDelta { text, .. } => {
                if !text.is_empty() {
                    self.note_kind(MessageKind::Reasoning);
                    self.reasoning.push_str(text);
                }
            }
            StreamChunkEvent::ToolCallUpdateDelta { update, .. } => {
                self.note_kind(MessageKind::ToolCalls);
                self.apply_tool_update(update, &mut applied);
            }
            StreamChunkEvent::Done { finish_reason, .. } => {
                self.finish_reason = Some(*finish_reason);
                applied.completed = self.complete_calls(|_| true);
                applied.finished = true;
            }
        }
        applied
    }

    fn locate(&self, update: &ToolCallUpdate) -> Option<usize> {
        match &update.id {
            Some(id) => self
                .tool_calls
                .iter()
                .position(|c| c.id.as_deref() == Some(id.as_str()))
                .or_else(|| {
                    self.tool_calls
                        .iter()
                        .position(|c| c.id.is_none() && c.index == update.index)
                }),
            None => self.tool_calls.iter().rposition(|c| c.index == update.index),
        }
    }

    fn apply_tool_update(&mut self, update: &ToolCallUpdate, applied: &mut Applied) {
        let position = match self.locate(update) {
            Some(position) => position,
            None => {
                self.tool_calls.push(ToolCallState::new(update.index));
                self.tool_calls.len() - 1
            }
        };

        let state = &mut self.tool_calls[position];
        if state.complete {
            warn!(index = state.index, "Ignoring fragment for completed tool call");
            return;
        }

        if let Some(id) = &update.id {
            if state.id.is_none() {
                state.id = Some(id.clone());
                applied.observed_ids.push(id.clone());
            }
        }

        if let Some(name) = update.name.as_ref().filter(|n| !n.is_empty()) {
            if state.name.as_ref().is_some_and(|existing| existing != name) {
                debug!(index = state.index, %name, "Tool call name changed");
            }
            state.name = Some(name.clone());
        }

        if let Some(fragment) = update.arguments.as_ref().filter(|a| !a.is_empty()) {
            state.arguments.push_str(fragment);
            match serde_json::from_str::<Value>(&state.arguments) {
                Ok(value) => state.parsed = Some(value),
                Err(_) => trace!(index = state.index, "Arguments incomplete so far"),
            }
        }

        applied.completed = self.settle_calls();
    }

    /// Complete calls that a later call has overtaken once their arguments
    /// are whole. Calls still mid-argument wait for more fragments or `Done`.
    fn settle_calls(&mut self) -> Vec<ToolCall> {
        let Some(latest) = self.tool_calls.iter().map(|c| c.index).max() else {
            return Vec::new();
        };
        self.complete_calls(|c| c.index < latest && c.has_whole_arguments())
    }

    fn complete_calls(&mut self, predicate: impl Fn(&ToolCallState) -> bool) -> Vec<ToolCall> {
        let mut completed = Vec::new();
        for state in self.tool_calls.iter_mut().filter(|c| !c.complete) {
            if !predicate(state) {
                continue;
            }
            state.complete = true;
            if state.name.is_none() {
                warn!(index = state.index, "Tool call completed without a name");
            }
            completed.push(state.to_call());
        }
        completed
    }

    /// Freeze into finalized messages, one per kind, in first-observed order.
    pub fn finalize(&self) -> Vec<FinalizedMessage> {
        self.kinds
            .iter()
            .map(|kind| match kind {
                MessageKind::Reasoning => FinalizedMessage::Reasoning {
                    text: self.reasoning.clone(),
                },
                MessageKind::Text => FinalizedMessage::Text {
                    text: self.text.clone(),
                },
                MessageKind::ToolCalls => FinalizedMessage::ToolCalls {
                    calls: self
                        .tool_calls
                        .iter()
                        .map(|state| ToolCallRecord {
                            call: state.to_call(),
                            result: self.tool_results.get(&state.call_id()).cloned(),
                        })
                        .collect(),
                },
            })
            .collect()
    }
}

/// Snapshots for every message of a turn.
#[derive(Debug, Default)]
pub struct MessageAggregator {
    snapshots: HashMap<MessageKey, MessageSnapshot>,
    order: Vec<MessageKey>,
}

impl MessageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fragment to the snapshot it belongs to, creating it if needed.
    pub fn apply(&mut self, stream_id: &str, event: &StreamChunkEvent) -> (MessageKey, Applied) {
        let key = MessageKey::new(stream_id, event.choice());
        if !self.snapshots.contains_key(&key) {
            trace!(?key, "New message snapshot");
            self.order.push(key.clone());
        }
        let applied = self.snapshots.entry(key.clone()).or_default().apply(event);
        (key, applied)
    }

    pub fn snapshot(&self, key: &MessageKey) -> Option<&MessageSnapshot> {
        self.snapshots.get(key)
    }

    pub fn snapshot_mut(&mut self, key: &MessageKey) -> Option<&mut MessageSnapshot> {
        self.snapshots.get_mut(key)
    }

    /// Message keys in first-observed order.
    pub fn keys(&self) -> &[MessageKey] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every message has seen its `Done`.
    pub fn is_finished(&self) -> bool {
        !self.snapshots.is_empty() && self.snapshots.values().all(MessageSnapshot::is_finished)
    }

    /// Freeze every snapshot, in first-observed message order.
    pub fn finalize(self) -> Vec<FinalizedMessage> {
        let Self {
            mut snapshots,
            order,
        } = self;
        order
            .iter()
            .filter_map(|key| snapshots.remove(key))
            .flat_map(|snapshot| snapshot.finalize())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(t: &str) -> StreamChunkEvent {
        StreamChunkEvent::TextDelta {
            choice: 0,
            text: t.into(),
        }
    }

    fn reasoning(t: &str) -> StreamChunkEvent {
        StreamChunkEvent::ReasoningDelta {
            choice: 0,
            text: t.into(),
        }
    }

    fn tool(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamChunkEvent {
        StreamChunkEvent::ToolCallUpdateDelta {
            choice: 0,
            update: ToolCallUpdate {
                index,
                id: id.map(Into::into),
                name: name.map(Into::into),
                arguments: args.map(Into::into),
            },
        }
    }

    fn done() -> StreamChunkEvent {
        StreamChunkEvent::Done {
            choice: 0,
            finish_reason: FinishReason::Stop,
        }
    }

    #[test]
    fn test_text_and_reasoning_accumulate_independently() {
        let mut snapshot = MessageSnapshot::default();
        for event in [reasoning("think"), text("Hello"), reasoning(" more"), text(" world")] {
            snapshot.apply(&event);
        }
        assert_eq!(snapshot.text, "Hello world");
        assert_eq!(snapshot.reasoning, "think more");
        assert_eq!(snapshot.kinds(), &[MessageKind::Reasoning, MessageKind::Text]);
    }

    #[test]
    fn test_partial_arguments_parse_best_effort() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("c1"), Some("echo"), None));
        snapshot.apply(&tool(0, Some("c1"), None, Some(r#"{"text":"#)));
        assert!(snapshot.current_arguments("c1").is_none());

        snapshot.apply(&tool(0, Some("c1"), None, Some(r#""hi"}"#)));
        assert_eq!(snapshot.current_arguments("c1"), Some(&json!({"text": "hi"})));

        // A trailing fragment that breaks the parse keeps the last good value.
        snapshot.apply(&tool(0, Some("c1"), None, Some(",")));
        assert_eq!(snapshot.current_arguments("c1"), Some(&json!({"text": "hi"})));
        assert_eq!(snapshot.tool_calls[0].arguments, r#"{"text":"hi"},"#);
    }

    #[test]
    fn test_two_fragments_match_one() {
        let args = r#"{"path":"/tmp/x","flags":[1,2,3]}"#;
        let (first, second) = args.split_at(args.len() / 2);

        let mut split = MessageSnapshot::default();
        split.apply(&tool(0, Some("c1"), Some("read"), Some("")));
        split.apply(&tool(0, Some("c1"), None, Some(first)));
        split.apply(&tool(0, Some("c1"), None, Some(second)));

        let mut whole = MessageSnapshot::default();
        whole.apply(&tool(0, Some("c1"), Some("read"), Some("")));
        whole.apply(&tool(0, Some("c1"), None, Some(args)));

        assert_eq!(split.current_arguments("c1"), whole.current_arguments("c1"));
        assert_eq!(split.finalize(), whole.finalize());
    }

    #[test]
    fn test_positional_index_without_id() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, None, Some("echo"), None));
        snapshot.apply(&tool(0, None, None, Some("{}")));
        let applied = snapshot.apply(&done());

        assert_eq!(snapshot.tool_calls.len(), 1);
        assert_eq!(applied.completed.len(), 1);
        assert_eq!(applied.completed[0].id, "call_0");
        assert_eq!(applied.completed[0].name, "echo");
    }

    #[test]
    fn test_id_arriving_later_binds_to_index() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, None, Some("echo"), None));
        let applied = snapshot.apply(&tool(0, Some("late"), None, Some("{}")));
        assert_eq!(applied.observed_ids, vec!["late".to_string()]);
        assert_eq!(snapshot.tool_calls.len(), 1);
        assert_eq!(snapshot.tool_calls[0].call_id(), "late");
    }

    #[test]
    fn test_new_index_completes_previous_call() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("a"), Some("echo"), Some("{}")));
        let applied = snapshot.apply(&tool(1, Some("b"), Some("clock"), Some("")));
        assert_eq!(applied.observed_ids, vec!["b".to_string()]);
        assert_eq!(applied.completed.len(), 1);
        assert_eq!(applied.completed[0].id, "a");

        let applied = snapshot.apply(&done());
        assert!(applied.finished);
        assert_eq!(applied.completed.len(), 1);
        assert_eq!(applied.completed[0].id, "b");
    }

    #[test]
    fn test_interleaved_calls_complete_with_whole_arguments() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("a"), Some("echo"), Some(r#"{"te"#)));
        let applied = snapshot.apply(&tool(1, Some("b"), Some("clock"), Some("{}")));
        assert!(applied.completed.is_empty());

        let applied = snapshot.apply(&tool(0, Some("a"), None, Some(r#"xt":"hi"}"#)));
        assert_eq!(applied.completed.len(), 1);
        assert_eq!(applied.completed[0].id, "a");
        assert_eq!(applied.completed[0].arguments, r#"{"text":"hi"}"#);

        let applied = snapshot.apply(&done());
        assert_eq!(applied.completed.len(), 1);
        assert_eq!(applied.completed[0].id, "b");
        assert_eq!(applied.completed[0].arguments, "{}");
    }

    #[test]
    fn test_unfinished_arguments_wait_for_done() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("a"), Some("echo"), Some(r#"{"text":"#)));
        let applied = snapshot.apply(&tool(1, Some("b"), Some("echo"), Some("{}")));
        assert!(applied.completed.is_empty());

        let applied = snapshot.apply(&done());
        let ids: Vec<&str> = applied.completed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_completed_call_ignores_late_fragments() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("a"), Some("echo"), Some("{}")));
        snapshot.apply(&tool(1, Some("b"), Some("echo"), Some("")));
        assert!(snapshot.tool_call("a").unwrap().complete);

        let applied = snapshot.apply(&tool(0, Some("a"), Some("clock"), Some("x")));
        assert!(applied.completed.is_empty());
        let a = snapshot.tool_call("a").unwrap();
        assert_eq!(a.arguments, "{}");
        assert_eq!(a.name.as_deref(), Some("echo"));
    }

    #[test]
    fn test_fragments_after_done_are_ignored() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&text("final"));
        snapshot.apply(&done());

        let frozen = snapshot.clone();
        for event in [text(" extra"), reasoning("late"), tool(0, Some("x"), Some("echo"), Some("{}")), done()] {
            assert_eq!(snapshot.apply(&event), Applied::default());
        }
        assert_eq!(snapshot, frozen);
    }

    #[test]
    fn test_finalize_keeps_observed_order_and_results() {
        let mut snapshot = MessageSnapshot::default();
        snapshot.apply(&tool(0, Some("t1"), Some("echo"), Some(r#"{"text":"x"}"#)));
        snapshot.apply(&text("after"));
        snapshot.apply(&reasoning("last"));
        snapshot.apply(&done());
        snapshot.attach_result(ToolCallResult {
            tool_call_id: "t1".into(),
            result: "x".into(),
            is_error: false,
        });

        let finalized = snapshot.finalize();
        let kinds: Vec<MessageKind> = finalized.iter().map(FinalizedMessage::kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::ToolCalls, MessageKind::Text, MessageKind::Reasoning]
        );
        let FinalizedMessage::ToolCalls { calls } = &finalized[0] else {
            panic!("expected tool calls first");
        };
        assert_eq!(calls[0].result.as_ref().unwrap().result, "x");
    }

    #[test]
    fn test_aggregator_keeps_messages_apart() {
        let mut aggregator = MessageAggregator::new();
        aggregator.apply("s1", &text("one"));
        aggregator.apply(
            "s1",
            &StreamChunkEvent::TextDelta {
                choice: 1,
                text: "other".into(),
            },
        );
        aggregator.apply("s1", &text(" two"));

        let first = aggregator.snapshot(&MessageKey::new("s1", 0)).unwrap();
        assert_eq!(first.text, "one two");
        assert_eq!(aggregator.keys().len(), 2);
        assert!(!aggregator.is_finished());

        aggregator.apply("s1", &done());
        aggregator.apply(
            "s1",
            &StreamChunkEvent::Done {
                choice: 1,
                finish_reason: FinishReason::Stop,
            },
        );
        assert!(aggregator.is_finished());
        assert_eq!(aggregator.finalize().len(), 2);
    }
}
