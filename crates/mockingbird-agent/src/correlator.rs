//! Tool-result correlation.
//!
//! One correlator exists per in-flight turn and is owned by the task that
//! drives the turn, so call observations and result arrivals are applied one
//! at a time. Results may arrive before their call is known; those are held
//! and released the moment the call id is observed.

use std::collections::HashMap;

use tracing::{debug, warn};

use mockingbird_core::types::ToolCallResult;

use crate::aggregator::MessageKey;

/// Outcome of delivering a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The call is known; attach the result to this message.
    Attached { key: MessageKey, result: ToolCallResult },
    /// The call has not been observed yet; the result is held.
    Held,
}

#[derive(Debug, Default)]
pub struct ToolResultCorrelator {
    known: HashMap<String, MessageKey>,
    pending: HashMap<String, ToolCallResult>,
}

impl ToolResultCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a call id belongs to a message.
    ///
    /// Returns a held result for that id, if one arrived early.
    pub fn observe_call(&mut self, id: &str, key: &MessageKey) -> Option<ToolCallResult> {
        self.known
            .entry(id.to_string())
            .or_insert_with(|| key.clone());
        let held = self.pending.remove(id);
        if held.is_some() {
            debug!(tool_call_id = id, "Releasing early tool result");
        }
        held
    }

    /// Deliver a result from either the executor or an external source.
    pub fn deliver(&mut self, result: ToolCallResult) -> Delivery {
        if let Some(key) = self.known.get(&result.tool_call_id) {
            return Delivery::Attached {
                key: key.clone(),
                result,
            };
        }
        debug!(tool_call_id = %result.tool_call_id, "Holding result for unseen call");
        if let Some(previous) = self.pending.insert(result.tool_call_id.clone(), result) {
            warn!(tool_call_id = %previous.tool_call_id, "Replacing held tool result");
        }
        Delivery::Held
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// End the turn, returning results whose call never appeared.
    pub fn finish(self) -> Vec<ToolCallResult> {
        let mut orphans: Vec<ToolCallResult> = self.pending.into_values().collect();
        orphans.sort_by(|a, b| a.tool_call_id.cmp(&b.tool_call_id));
        for orphan in &orphans {
            warn!(tool_call_id = %orphan.tool_call_id, "Orphaned tool result");
        }
        orphans
    }
}
