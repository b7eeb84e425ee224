//! Instruction markup parser.
//!
//! A user message may embed a JSON payload between a start and an end
//! marker. The payload is either an explicit chain of steps:
//!
//! ```text
//! <instructions>{"instruction_chain": [ <step>, ... ]}</instructions>
//! ```
//!
//! or a single legacy step without the chain wrapper, treated as a
//! one-element chain. Each step looks like:
//!
//! ```text
//! { "id_message": "A",
//!   "reasoning": {"length": 12},
//!   "messages": [ {"text_message": {"length": 3}},
//!                 {"tool_call": [{"name": "echo", "args": {"text": "hi"}}]} ] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use mockingbird_core::config::InstructionsConfig;
use mockingbird_core::error::{MockingbirdError, Result};

/// Largest word count a text or reasoning request may ask for.
pub const MAX_LENGTH: u64 = 100_000;

/// One tool call to be streamed in fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionToolCall {
    pub name: String,
    /// Complete JSON object text.
    pub args_json: String,
}

/// One message of a step. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstructionMessage {
    Text { length: usize },
    ToolCalls { calls: Vec<InstructionToolCall> },
}

/// One executable turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionPlan {
    /// Identifying marker echoed into generated output.
    pub id_message: String,
    pub reasoning_length: Option<usize>,
    pub messages: Vec<InstructionMessage>,
}

/// An ordered chain of steps parsed from one user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionChain {
    pub steps: Vec<InstructionPlan>,
}

impl InstructionChain {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&InstructionPlan> {
        self.steps.get(index)
    }

    /// Payload in the preferred chain shape.
    pub fn to_payload(&self) -> Value {
        json!({
            "instruction_chain": self.steps.iter().map(InstructionPlan::to_payload).collect::<Vec<_>>(),
        })
    }

    /// Render the chain as delimited markup that [`parse_instructions`] accepts.
    pub fn to_markup(&self, markers: &InstructionsConfig) -> String {
        format!(
            "{}{}{}",
            markers.start_marker,
            self.to_payload(),
            markers.end_marker
        )
    }
}

impl InstructionPlan {
    pub fn to_payload(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|message| match message {
                InstructionMessage::Text { length } => {
                    json!({ "text_message": { "length": length } })
                }
                InstructionMessage::ToolCalls { calls } => {
                    let calls: Vec<Value> = calls
                        .iter()
                        .map(|call| {
                            let args = serde_json::from_str::<Value>(&call.args_json)
                                .unwrap_or_else(|_| Value::Object(Map::new()));
                            json!({ "name": call.name, "args": args })
                        })
                        .collect();
                    json!({ "tool_call": calls })
                }
            })
            .collect();

        let mut payload = json!({
            "id_message": self.id_message,
            "messages": messages,
        });
        if let Some(length) = self.reasoning_length {
            payload["reasoning"] = json!({ "length": length });
        }
        payload
    }

    pub fn has_tool_calls(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m, InstructionMessage::ToolCalls { .. }))
    }
}

/// Extract the delimited payload, if both markers are present.
fn extract_payload<'a>(text: &'a str, markers: &InstructionsConfig) -> Option<&'a str> {
    let start = text.find(&markers.start_marker)? + markers.start_marker.len();
    let end = text[start..].find(&markers.end_marker)? + start;
    Some(&text[start..end])
}

/// Parse embedded instruction markup from message text.
///
/// Returns `Ok(None)` when the markers are absent or the chain is empty,
/// and `MalformedInstruction` when the payload is not valid JSON or has no
/// usable step.
pub fn parse_instructions(
    text: &str,
    markers: &InstructionsConfig,
) -> Result<Option<InstructionChain>> {
    let Some(payload) = extract_payload(text, markers) else {
        return Ok(None);
    };

    let value: Value = serde_json::from_str(payload.trim())
        .map_err(|e| MockingbirdError::MalformedInstruction(format!("invalid JSON payload: {e}")))?;

    let Value::Object(root) = value else {
        return Err(MockingbirdError::MalformedInstruction(
            "payload must be a JSON object".into(),
        ));
    };

    match root.get("instruction_chain") {
        Some(Value::Array(raw_steps)) => parse_chain(raw_steps),
        Some(_) => Err(MockingbirdError::MalformedInstruction(
            "instruction_chain must be an array".into(),
        )),
        None => {
            let step = parse_step(&root).map_err(MockingbirdError::MalformedInstruction)?;
            Ok(Some(InstructionChain { steps: vec![step] }))
        }
    }
}

fn parse_chain(raw_steps: &[Value]) -> Result<Option<InstructionChain>> {
    if raw_steps.is_empty() {
        return Ok(None);
    }

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (position, raw) in raw_steps.iter().enumerate() {
        let parsed = match raw {
            Value::Object(fields) => parse_step(fields),
            _ => Err("step must be a JSON object".to_string()),
        };
        match parsed {
            Ok(step) => steps.push(step),
            Err(reason) if raw_steps.len() == 1 => {
                return Err(MockingbirdError::MalformedInstruction(reason));
            }
            Err(reason) => warn!(position, %reason, "Rejecting instruction step"),
        }
    }

    if steps.is_empty() {
        return Err(MockingbirdError::MalformedInstruction(format!(
            "none of the {} chain steps is usable",
            raw_steps.len()
        )));
    }
    Ok(Some(InstructionChain { steps }))
}

fn parse_step(fields: &Map<String, Value>) -> std::result::Result<InstructionPlan, String> {
    let id_message = match fields.get("id_message") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::String(_)) => return Err("id_message cannot be empty".into()),
        _ => return Err("step is missing a string id_message".into()),
    };

    let reasoning_length = match fields.get("reasoning") {
        None | Some(Value::Null) => None,
        Some(reasoning) => match reasoning.get("length").and_then(Value::as_u64) {
            Some(length) => Some(bounded_length(length).map_err(|e| {
                format!("step {id_message}: reasoning.{e}")
            })?),
            None => {
                return Err(format!(
                    "step {id_message}: reasoning.length must be a non-negative integer"
                ));
            }
        },
    };

    let raw_messages = match fields.get("messages") {
        Some(Value::Array(messages)) => messages,
        _ => return Err(format!("step {id_message}: messages must be an array")),
    };

    let messages: Vec<InstructionMessage> = raw_messages
        .iter()
        .enumerate()
        .filter_map(|(position, raw)| match parse_message(raw) {
            Ok(message) => Some(message),
            Err(reason) => {
                warn!(step = %id_message, position, %reason, "Skipping instruction message");
                None
            }
        })
        .collect();

    if messages.is_empty() {
        return Err(format!("step {id_message}: no usable messages"));
    }

    Ok(InstructionPlan {
        id_message,
        reasoning_length,
        messages,
    })
}

fn parse_message(raw: &Value) -> std::result::Result<InstructionMessage, String> {
    let text = raw.get("text_message");
    let tools = raw.get("tool_call");

    match (text, tools) {
        (Some(text), None) => {
            let length = text
                .get("length")
                .and_then(Value::as_u64)
                .ok_or("text_message.length must be a non-negative integer")?;
            Ok(InstructionMessage::Text {
                length: bounded_length(length).map_err(|e| format!("text_message.{e}"))?,
            })
        }
        (None, Some(Value::Array(raw_calls))) => {
            let calls = raw_calls
                .iter()
                .map(parse_tool_call)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if calls.is_empty() {
                return Err("tool_call list is empty".into());
            }
            Ok(InstructionMessage::ToolCalls { calls })
        }
        (None, Some(_)) => Err("tool_call must be an array".into()),
        (Some(_), Some(_)) => Err("message has both text_message and tool_call".into()),
        (None, None) => Err("message has neither text_message nor tool_call".into()),
    }
}

fn bounded_length(length: u64) -> std::result::Result<usize, String> {
    if length > MAX_LENGTH {
        return Err(format!("length {length} exceeds the limit of {MAX_LENGTH}"));
    }
    Ok(length as usize)
}

fn parse_tool_call(raw: &Value) -> std::result::Result<InstructionToolCall, String> {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or("tool call is missing a name")?;
    let args = match raw.get("args") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(args @ Value::Object(_)) => args.clone(),
        Some(_) => return Err(format!("tool call {name}: args must be an object")),
    };
    Ok(InstructionToolCall {
        name: name.to_string(),
        args_json: args.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> InstructionsConfig {
        InstructionsConfig::default()
    }

    fn wrap(payload: &str) -> String {
        format!("please run this <instructions>{payload}</instructions> thanks")
    }

    #[test]
    fn test_no_markers_is_none() {
        assert!(parse_instructions("just chatting", &markers()).unwrap().is_none());
    }

    #[test]
    fn test_missing_end_marker_is_none() {
        let text = "<instructions>{\"id_message\":\"A\"";
        assert!(parse_instructions(text, &markers()).unwrap().is_none());
    }

    #[test]
    fn test_legacy_single_step() {
        let text = wrap(r#"{"id_message":"SINGLE","messages":[{"text_message":{"length":3}}]}"#);
        let chain = parse_instructions(&text, &markers()).unwrap().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.steps[0].id_message, "SINGLE");
        assert_eq!(chain.steps[0].reasoning_length, None);
        assert_eq!(
            chain.steps[0].messages,
            vec![InstructionMessage::Text { length: 3 }]
        );
    }

    #[test]
    fn test_chain_with_reasoning_and_tools() {
        let text = wrap(
            r#"{"instruction_chain":[
                {"id_message":"A","reasoning":{"length":7},"messages":[
                    {"text_message":{"length":2}},
                    {"tool_call":[{"name":"echo","args":{"text":"hi"}}]}
                ]},
                {"id_message":"B","messages":[{"text_message":{"length":3}}]}
            ]}"#,
        );
        let chain = parse_instructions(&text, &markers()).unwrap().unwrap();
        assert_eq!(chain.len(), 2);
        let first = chain.step(0).unwrap();
        assert_eq!(first.reasoning_length, Some(7));
        assert!(first.has_tool_calls());
        match &first.messages[1] {
            InstructionMessage::ToolCalls { calls } => {
                assert_eq!(calls[0].name, "echo");
                assert_eq!(calls[0].args_json, r#"{"text":"hi"}"#);
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
        assert_eq!(chain.step(1).unwrap().id_message, "B");
    }

    #[test]
    fn test_empty_chain_is_none() {
        let text = wrap(r#"{"instruction_chain":[]}"#);
        assert!(parse_instructions(&text, &markers()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let text = wrap(r#"{"instruction_chain": [ {"id_message": "A", }"#);
        let err = parse_instructions(&text, &markers()).unwrap_err();
        assert!(matches!(err, MockingbirdError::MalformedInstruction(_)));
    }

    #[test]
    fn test_invalid_step_dropped_from_longer_chain() {
        let text = wrap(
            r#"{"instruction_chain":[
                {"id_message":"EMPTY","messages":[]},
                {"id_message":"OK","messages":[{"text_message":{"length":1}}]}
            ]}"#,
        );
        let chain = parse_instructions(&text, &markers()).unwrap().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.steps[0].id_message, "OK");
    }

    #[test]
    fn test_only_step_invalid_fails() {
        let text = wrap(r#"{"instruction_chain":[{"id_message":"EMPTY","messages":[]}]}"#);
        assert!(matches!(
            parse_instructions(&text, &markers()),
            Err(MockingbirdError::MalformedInstruction(_))
        ));

        let legacy = wrap(r#"{"id_message":"EMPTY","messages":[{"unknown":{}}]}"#);
        assert!(parse_instructions(&legacy, &markers()).is_err());
    }

    #[test]
    fn test_chain_with_no_usable_step_fails() {
        let text = wrap(
            r#"{"instruction_chain":[
                {"id_message":"E1","messages":[]},
                {"id_message":"E2","messages":[{"text_message":{}}]},
                {"messages":[{"text_message":{"length":1}}]}
            ]}"#,
        );
        assert!(matches!(
            parse_instructions(&text, &markers()),
            Err(MockingbirdError::MalformedInstruction(_))
        ));
    }

    #[test]
    fn test_oversized_lengths_are_rejected() {
        let text = wrap(
            r#"{"id_message":"H","messages":[{"text_message":{"length":1000000000000000}}]}"#,
        );
        assert!(matches!(
            parse_instructions(&text, &markers()),
            Err(MockingbirdError::MalformedInstruction(_))
        ));

        let reasoning = wrap(&format!(
            r#"{{"id_message":"R","reasoning":{{"length":{}}},"messages":[{{"text_message":{{"length":1}}}}]}}"#,
            MAX_LENGTH + 1
        ));
        assert!(matches!(
            parse_instructions(&reasoning, &markers()),
            Err(MockingbirdError::MalformedInstruction(_))
        ));

        let at_limit = wrap(&format!(
            r#"{{"id_message":"L","messages":[{{"text_message":{{"length":{MAX_LENGTH}}}}}]}}"#
        ));
        let chain = parse_instructions(&at_limit, &markers()).unwrap().unwrap();
        assert_eq!(
            chain.steps[0].messages,
            vec![InstructionMessage::Text {
                length: MAX_LENGTH as usize
            }]
        );
    }

    #[test]
    fn test_message_with_both_variants_is_skipped() {
        let text = wrap(
            r#"{"id_message":"A","messages":[
                {"text_message":{"length":1},"tool_call":[{"name":"echo","args":{}}]},
                {"text_message":{"length":2}}
            ]}"#,
        );
        let chain = parse_instructions(&text, &markers()).unwrap().unwrap();
        assert_eq!(
            chain.steps[0].messages,
            vec![InstructionMessage::Text { length: 2 }]
        );
    }

    #[test]
    fn test_custom_markers() {
        let markers = InstructionsConfig {
            start_marker: "[[plan]]".into(),
            end_marker: "[[/plan]]".into(),
        };
        let text = r#"[[plan]]{"id_message":"X","messages":[{"text_message":{"length":1}}]}[[/plan]]"#;
        let chain = parse_instructions(text, &markers).unwrap().unwrap();
        assert_eq!(chain.steps[0].id_message, "X");
    }

    #[test]
    fn test_markup_round_trip() {
        let text = wrap(
            r#"{"instruction_chain":[
                {"id_message":"A","reasoning":{"length":4},"messages":[
                    {"tool_call":[{"name":"lookup","args":{"q":"rust","limit":2,"nested":{"b":1,"a":[1,2]}}}]},
                    {"text_message":{"length":5}}
                ]},
                {"id_message":"B","messages":[{"text_message":{"length":0}}]}
            ]}"#,
        );
        let chain = parse_instructions(&text, &markers()).unwrap().unwrap();
        let rendered = chain.to_markup(&markers());
        let reparsed = parse_instructions(&rendered, &markers()).unwrap().unwrap();
        assert_eq!(reparsed, chain);
    }
}
