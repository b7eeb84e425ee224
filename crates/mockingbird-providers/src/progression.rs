//! Conversation progression — which instruction step runs next.
//!
//! Progression is recomputed from the history on every turn: the newest user
//! message carrying an instruction chain is the active chain, and the number
//! of assistant entries after it selects the step. Nothing is cached, so the
//! same history prefix always selects the same step.

use tracing::debug;

use mockingbird_core::config::InstructionsConfig;
use mockingbird_core::error::Result;
use mockingbird_core::session::HistoryEntry;
use mockingbird_core::types::Role;

use crate::instructions::{InstructionChain, InstructionPlan, parse_instructions};

/// Outcome of analyzing a conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progression {
    /// The step to run now, if the active chain is not exhausted.
    pub step: Option<InstructionPlan>,
    /// Zero-based position of `step` within the chain.
    pub step_index: Option<usize>,
    /// Assistant entries after the active chain's message.
    pub assistant_responses: usize,
    /// Length of the active chain (0 when none was found).
    pub chain_len: usize,
    /// History position of the user message carrying the active chain.
    pub chain_position: Option<usize>,
}

impl Progression {
    fn none() -> Self {
        Self {
            step: None,
            step_index: None,
            assistant_responses: 0,
            chain_len: 0,
            chain_position: None,
        }
    }

    /// A chain was found but every step already ran.
    pub fn is_exhausted(&self) -> bool {
        self.chain_position.is_some() && self.step.is_none()
    }

    pub fn has_chain(&self) -> bool {
        self.chain_position.is_some()
    }
}

/// Find the active chain: the newest user entry with parseable instructions.
fn find_active_chain(
    history: &[HistoryEntry],
    markers: &InstructionsConfig,
) -> Result<Option<(usize, InstructionChain)>> {
    for (position, entry) in history.iter().enumerate().rev() {
        let Some(text) = entry.user_text() else {
            continue;
        };
        if let Some(chain) = parse_instructions(text, markers)? {
            return Ok(Some((position, chain)));
        }
    }
    Ok(None)
}

/// Analyze the history and select the next step.
///
/// Only assistant entries advance progression; user and tool entries are
/// ignored. A malformed payload in the scanned user messages fails the
/// whole analysis.
pub fn analyze(history: &[HistoryEntry], markers: &InstructionsConfig) -> Result<Progression> {
    let Some((position, chain)) = find_active_chain(history, markers)? else {
        debug!("No instruction chain in history");
        return Ok(Progression::none());
    };

    let assistant_responses = history[position + 1..]
        .iter()
        .filter(|e| e.role() == Role::Assistant)
        .count();

    let step_index = (assistant_responses < chain.len()).then_some(assistant_responses);
    let step = step_index.and_then(|i| chain.step(i).cloned());

    debug!(
        chain_position = position,
        chain_len = chain.len(),
        assistant_responses,
        ?step_index,
        "Analyzed conversation progression"
    );

    Ok(Progression {
        step,
        step_index,
        assistant_responses,
        chain_len: chain.len(),
        chain_position: Some(position),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockingbird_core::error::MockingbirdError;
    use mockingbird_core::types::{AssistantMessage, FinalizedMessage, ToolCallResult};

    fn markers() -> InstructionsConfig {
        InstructionsConfig::default()
    }

    fn chain_message(ids: &[&str]) -> HistoryEntry {
        let steps: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"id_message":"{id}","messages":[{{"text_message":{{"length":2}}}}]}}"#))
            .collect();
        HistoryEntry::user(format!(
            "<instructions>{{\"instruction_chain\":[{}]}}</instructions>",
            steps.join(",")
        ))
    }

    fn assistant() -> HistoryEntry {
        HistoryEntry::assistant(AssistantMessage::Single(FinalizedMessage::Text {
            text: "reply".into(),
        }))
    }

    fn tool() -> HistoryEntry {
        HistoryEntry::tool(&ToolCallResult {
            tool_call_id: "call_1".into(),
            result: "ok".into(),
            is_error: false,
        })
    }

    #[test]
    fn test_no_chain() {
        let history = vec![HistoryEntry::user("hi"), assistant()];
        let progression = analyze(&history, &markers()).unwrap();
        assert!(progression.step.is_none());
        assert_eq!(progression.assistant_responses, 0);
        assert!(!progression.has_chain());
        assert!(!progression.is_exhausted());
    }

    #[test]
    fn test_each_prior_count_selects_matching_step() {
        let ids = ["A", "B", "C"];
        for k in 0..=4 {
            let mut history = vec![chain_message(&ids)];
            for _ in 0..k {
                history.push(assistant());
            }
            let progression = analyze(&history, &markers()).unwrap();
            assert_eq!(progression.assistant_responses, k);
            if k < ids.len() {
                assert_eq!(progression.step_index, Some(k));
                assert_eq!(progression.step.unwrap().id_message, ids[k]);
            } else {
                assert!(progression.is_exhausted());
            }
        }
    }

    #[test]
    fn test_user_and_tool_entries_do_not_count() {
        let plain = vec![chain_message(&["A", "B", "C"]), assistant()];
        let interleaved = vec![
            chain_message(&["A", "B", "C"]),
            tool(),
            HistoryEntry::user("more"),
            assistant(),
            tool(),
            tool(),
            HistoryEntry::user("again"),
        ];
        let a = analyze(&plain, &markers()).unwrap();
        let b = analyze(&interleaved, &markers()).unwrap();
        assert_eq!(a.assistant_responses, b.assistant_responses);
        assert_eq!(a.step, b.step);
    }

    #[test]
    fn test_newer_chain_resets_count() {
        let history = vec![
            chain_message(&["OLD1", "OLD2"]),
            assistant(),
            assistant(),
            chain_message(&["NEW1", "NEW2"]),
        ];
        let progression = analyze(&history, &markers()).unwrap();
        assert_eq!(progression.assistant_responses, 0);
        assert_eq!(progression.chain_position, Some(3));
        assert_eq!(progression.step.unwrap().id_message, "NEW1");
    }

    #[test]
    fn test_entries_before_chain_ignored() {
        let history = vec![assistant(), assistant(), chain_message(&["A", "B"]), assistant()];
        let progression = analyze(&history, &markers()).unwrap();
        assert_eq!(progression.step.unwrap().id_message, "B");
    }

    #[test]
    fn test_malformed_newest_chain_fails() {
        let history = vec![
            chain_message(&["A"]),
            HistoryEntry::user("<instructions>{not json</instructions>"),
        ];
        assert!(matches!(
            analyze(&history, &markers()),
            Err(MockingbirdError::MalformedInstruction(_))
        ));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let history = vec![chain_message(&["A", "B"]), assistant(), tool()];
        let first = analyze(&history, &markers()).unwrap();
        let second = analyze(&history, &markers()).unwrap();
        assert_eq!(first, second);
    }
}
