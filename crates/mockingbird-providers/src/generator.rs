//! Stream generator — turns one resolved turn script into paced fragments.
//!
//! Fragment planning is a pure function of the script, the stream config and
//! a seed derived from the triggering user message. Words are drawn lazily
//! while the plan is walked, so a turn is never held in memory whole.
//! Emission checks the cancellation token before every write and sleeps for
//! the configured delay between fragments.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use mockingbird_core::config::StreamConfig;
use mockingbird_core::error::{MockingbirdError, Result};
use mockingbird_core::types::{FinishReason, StreamChunkEvent, ToolCallUpdate};

use crate::instructions::{InstructionMessage, InstructionPlan, InstructionToolCall};
use crate::progression::Progression;

/// Text streamed once an instruction chain has run out of steps.
pub const COMPLETION_TEXT: &str =
    "All scripted steps are complete. There is nothing left to run in this instruction chain.";

const FILLER_VOCABULARY: &[&str] = &[
    "amber", "birch", "cobalt", "delta", "ember", "fjord", "granite", "harbor", "indigo",
    "juniper", "kestrel", "lantern", "meadow", "nectar", "orbit", "pebble", "quartz", "river",
    "saffron", "tundra", "umber", "velvet", "willow", "xenon", "yarrow", "zephyr", "anchor",
    "beacon", "canyon", "dune", "echo", "falcon", "glacier", "horizon", "island", "jasper",
    "kelp", "lagoon", "mistral", "nova",
];

/// Default responses carry between MIN and MIN + SPAN - 1 filler words.
const MIN_DEFAULT_WORDS: u64 = 5;
const DEFAULT_WORD_SPAN: u64 = 100;

const REASONING_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// What a turn should stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnScript {
    /// Run one step of the active instruction chain.
    Step { index: usize, plan: InstructionPlan },
    /// The active chain ran out of steps.
    Exhausted { assistant_responses: usize },
    /// No instructions found; stream filler.
    Default,
}

impl TurnScript {
    pub fn from_progression(progression: Progression) -> Self {
        let has_chain = progression.has_chain();
        match (progression.step_index, progression.step) {
            (Some(index), Some(plan)) => TurnScript::Step { index, plan },
            _ if has_chain => TurnScript::Exhausted {
                assistant_responses: progression.assistant_responses,
            },
            _ => TurnScript::Default,
        }
    }

    /// The step's identifying marker, if a step runs.
    pub fn marker(&self) -> Option<&str> {
        match self {
            TurnScript::Step { plan, .. } => Some(&plan.id_message),
            _ => None,
        }
    }
}

/// Stable seed derived from the triggering user message.
pub fn seed_for(message: &str) -> u64 {
    let digest = Sha256::digest(message.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Filler word count for the default response, in `[5, 104]`.
pub fn default_word_count(seed: u64) -> usize {
    (MIN_DEFAULT_WORDS + seed % DEFAULT_WORD_SPAN) as usize
}

/// Deterministic filler words for a seed.
pub fn filler_words(seed: u64, count: usize) -> Vec<&'static str> {
    FillerWords::new(seed, count).collect()
}

/// Filler words drawn one at a time, so long requests never materialize.
struct FillerWords {
    rng: StdRng,
    remaining: usize,
}

impl FillerWords {
    fn new(seed: u64, count: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: count,
        }
    }
}

impl Iterator for FillerWords {
    type Item = &'static str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(FILLER_VOCABULARY[self.rng.random_range(0..FILLER_VOCABULARY.len())])
    }
}

/// Split argument JSON into at most `parts` non-empty pieces on char boundaries.
pub fn split_arguments(arguments: &str, parts: usize) -> Vec<&str> {
    let parts = parts.max(1);
    let len = arguments.len();
    let mut pieces = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 1..=parts {
        let mut end = if part == parts { len } else { len * part / parts };
        while end < len && !arguments.is_char_boundary(end) {
            end += 1;
        }
        if end > start {
            pieces.push(&arguments[start..end]);
            start = end;
        }
    }
    pieces
}

type WordSource = Box<dyn Iterator<Item = &'static str> + Send>;

enum Segment {
    Marker(String),
    Words {
        words: WordSource,
        per_chunk: usize,
        reasoning: bool,
    },
    Ready(VecDeque<StreamChunkEvent>),
}

/// The fragments of one choice, produced on demand and ending with `Done`.
///
/// Only markers and tool-call fragments are prepared up front; word groups
/// are drawn as the plan is iterated.
pub struct FragmentPlan {
    choice: u32,
    segments: VecDeque<Segment>,
    text_started: bool,
    reasoning_started: bool,
    finished: bool,
}

impl FragmentPlan {
    fn new(choice: u32) -> Self {
        Self {
            choice,
            segments: VecDeque::new(),
            text_started: false,
            reasoning_started: false,
            finished: false,
        }
    }

    fn push_marker(&mut self, marker: &str) {
        self.segments.push_back(Segment::Marker(marker.to_string()));
    }

    fn push_words(&mut self, words: WordSource, per_chunk: usize, reasoning: bool) {
        self.segments.push_back(Segment::Words {
            words,
            per_chunk: per_chunk.max(1),
            reasoning,
        });
    }

    fn push_tool_call(&mut self, index: u32, id: String, call: &InstructionToolCall, parts: usize) {
        let mut events = VecDeque::new();
        events.push_back(StreamChunkEvent::ToolCallUpdateDelta {
            choice: self.choice,
            update: ToolCallUpdate {
                index,
                id: Some(id.clone()),
                name: Some(call.name.clone()),
                arguments: Some(String::new()),
            },
        });
        for piece in split_arguments(&call.args_json, parts) {
            events.push_back(StreamChunkEvent::ToolCallUpdateDelta {
                choice: self.choice,
                update: ToolCallUpdate {
                    index,
                    id: Some(id.clone()),
                    name: None,
                    arguments: Some(piece.to_string()),
                },
            });
        }
        self.segments.push_back(Segment::Ready(events));
    }

    fn text(&mut self, piece: String) -> StreamChunkEvent {
        let text = if self.text_started {
            format!(" {piece}")
        } else {
            piece
        };
        self.text_started = true;
        StreamChunkEvent::TextDelta {
            choice: self.choice,
            text,
        }
    }

    fn reasoning(&mut self, piece: String) -> StreamChunkEvent {
        let text = if self.reasoning_started {
            format!(" {piece}")
        } else {
            piece
        };
        self.reasoning_started = true;
        StreamChunkEvent::ReasoningDelta {
            choice: self.choice,
            text,
        }
    }
}

impl Iterator for FragmentPlan {
    type Item = StreamChunkEvent;

    fn next(&mut self) -> Option<StreamChunkEvent> {
        loop {
            let Some(segment) = self.segments.front_mut() else {
                if self.finished {
                    return None;
                }
                self.finished = true;
                return Some(StreamChunkEvent::Done {
                    choice: self.choice,
                    finish_reason: FinishReason::Stop,
                });
            };

            match segment {
                Segment::Marker(marker) => {
                    let marker = std::mem::take(marker);
                    self.segments.pop_front();
                    return Some(self.text(marker));
                }
                Segment::Words {
                    words,
                    per_chunk,
                    reasoning,
                } => {
                    let group: Vec<&str> = words.by_ref().take(*per_chunk).collect();
                    if group.is_empty() {
                        self.segments.pop_front();
                        continue;
                    }
                    let piece = group.join(" ");
                    let is_reasoning = *reasoning;
                    return Some(if is_reasoning {
                        self.reasoning(piece)
                    } else {
                        self.text(piece)
                    });
                }
                Segment::Ready(events) => match events.pop_front() {
                    Some(event) => return Some(event),
                    None => {
                        self.segments.pop_front();
                    }
                },
            }
        }
    }
}

/// Produces the fragment sequence for a turn.
#[derive(Debug, Clone)]
pub struct StreamGenerator {
    config: StreamConfig,
}

impl StreamGenerator {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Lay out a turn without generating its words yet.
    pub fn plan(&self, script: &TurnScript, seed: u64) -> FragmentPlan {
        let mut plan = FragmentPlan::new(0);
        let per_chunk = self.config.words_per_chunk;

        match script {
            TurnScript::Step { index, plan: step } => {
                if let Some(length) = step.reasoning_length.filter(|l| *l > 0) {
                    plan.push_words(
                        Box::new(FillerWords::new(seed ^ REASONING_SEED_SALT, length)),
                        self.config.reasoning_words_per_chunk,
                        true,
                    );
                }
                let mut call_index = 0u32;
                for (position, message) in step.messages.iter().enumerate() {
                    match message {
                        InstructionMessage::Text { length } => {
                            plan.push_marker(&step.id_message);
                            plan.push_words(
                                Box::new(FillerWords::new(
                                    seed.wrapping_add(position as u64),
                                    *length,
                                )),
                                per_chunk,
                                false,
                            );
                            plan.push_marker(&step.id_message);
                        }
                        InstructionMessage::ToolCalls { calls } => {
                            for call in calls {
                                let id =
                                    format!("call_{:08x}_{}_{}", seed as u32, index, call_index);
                                plan.push_tool_call(
                                    call_index,
                                    id,
                                    call,
                                    self.config.argument_fragments,
                                );
                                call_index += 1;
                            }
                        }
                    }
                }
            }
            TurnScript::Exhausted { .. } => {
                plan.push_words(Box::new(COMPLETION_TEXT.split_whitespace()), per_chunk, false);
            }
            TurnScript::Default => {
                plan.push_words(
                    Box::new(FillerWords::new(seed, default_word_count(seed))),
                    per_chunk,
                    false,
                );
            }
        }

        plan
    }

    /// Every fragment of a turn, ending with `Done`.
    pub fn fragments(&self, script: &TurnScript, seed: u64) -> Vec<StreamChunkEvent> {
        self.plan(script, seed).collect()
    }

    /// Send fragments in order, pacing between them.
    ///
    /// Returns the number of fragments written. On cancellation nothing more
    /// is written (in particular no `Done`) and `Cancelled` is returned.
    pub async fn emit<I>(
        &self,
        fragments: I,
        tx: &mpsc::UnboundedSender<StreamChunkEvent>,
        cancel: &CancellationToken,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = StreamChunkEvent>,
    {
        let delay = self.config.chunk_delay();
        let mut written = 0;

        for fragment in fragments {
            if written > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(written, "Generation cancelled while pacing");
                        return Err(MockingbirdError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                debug!(written, "Generation cancelled");
                return Err(MockingbirdError::Cancelled);
            }
            trace!(?fragment, "Emitting fragment");
            if tx.send(fragment).is_err() {
                return Err(MockingbirdError::Transport(
                    "fragment receiver dropped".into(),
                ));
            }
            written += 1;
        }

        Ok(written)
    }

    /// Emit on a background task, returning the fragment receiver.
    pub fn spawn<I>(
        self,
        fragments: I,
        cancel: CancellationToken,
    ) -> (
        mpsc::UnboundedReceiver<StreamChunkEvent>,
        JoinHandle<Result<usize>>,
    )
    where
        I: IntoIterator<Item = StreamChunkEvent> + Send + 'static,
        I::IntoIter: Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.emit(fragments, &tx, &cancel).await });
        (rx, handle)
    }
}
