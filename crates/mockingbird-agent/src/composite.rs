//! Composite message building.

use mockingbird_core::types::{AssistantMessage, CompositeMessage, FinalizedMessage, Role};

/// Wrap a turn's finalized messages into the single history unit for the turn.
///
/// One message stays unwrapped. Several become a composite in the order
/// given, which is the order they were first observed.
pub fn build_assistant_message(
    generation_id: &str,
    mut messages: Vec<FinalizedMessage>,
) -> Option<AssistantMessage> {
    match messages.len() {
        0 => None,
        1 => messages.pop().map(AssistantMessage::Single),
        _ => Some(AssistantMessage::Composite(CompositeMessage {
            role: Role::Assistant,
            generation_id: generation_id.to_string(),
            ordered_inner: messages,
        })),
    }
}
