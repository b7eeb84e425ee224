//! Wire-level tests: history in, SSE bytes out.

use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use mockingbird_core::config::{InstructionsConfig, StreamConfig};
use mockingbird_core::error::MockingbirdError;
use mockingbird_core::session::HistoryEntry;
use mockingbird_core::types::{AssistantMessage, FinalizedMessage, StreamChunkEvent};
use mockingbird_providers::generator::COMPLETION_TEXT;
use mockingbird_providers::instructions::parse_instructions;
use mockingbird_providers::sse::{SseEncoder, decode_wire_stream, encode_stream, new_stream_id};
use mockingbird_providers::{CompletionRequest, LlmProvider, ScriptedProvider, TurnScript};

fn provider(config: StreamConfig) -> ScriptedProvider {
    ScriptedProvider::new(config, InstructionsConfig::default())
}

fn reply() -> HistoryEntry {
    HistoryEntry::assistant(AssistantMessage::Single(FinalizedMessage::Text {
        text: "earlier reply".into(),
    }))
}

fn two_step_chain() -> HistoryEntry {
    HistoryEntry::user(
        r#"run this <instructions>{"instruction_chain":[
            {"id_message":"STEP_A","messages":[{"text_message":{"length":2}}]},
            {"id_message":"STEP_B","messages":[{"text_message":{"length":3}}]}
        ]}</instructions>"#,
    )
}

async fn wire_for(
    provider: &ScriptedProvider,
    history: Vec<HistoryEntry>,
    cancel: CancellationToken,
) -> mockingbird_core::error::Result<String> {
    let request = CompletionRequest {
        model: "mockingbird-scripted".into(),
        history,
    };
    let turn = provider.stream(&request, cancel).await?;
    let encoder = SseEncoder::new(new_stream_id(), &request.model);
    let frames: Vec<Bytes> = encode_stream(turn.chunks, encoder).collect().await;
    Ok(String::from_utf8(frames.concat()).unwrap())
}

async fn decoded_text(wire: &str) -> String {
    let source = tokio_stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from(
        wire.to_string(),
    ))]);
    let fragments: Vec<_> = decode_wire_stream(source).collect().await;
    fragments
        .into_iter()
        .map(|f| f.unwrap().event)
        .filter_map(|event| match event {
            StreamChunkEvent::TextDelta { text, .. } => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn single_step_text_only_streams_marker_and_three_words() {
    let history = vec![HistoryEntry::user(
        r#"<instructions>{"id_message":"SINGLE","messages":[{"text_message":{"length":3}}]}</instructions>"#,
    )];
    let wire = wire_for(&provider(StreamConfig::default()), history, CancellationToken::new())
        .await
        .unwrap();

    assert!(wire.ends_with("data: [DONE]\n\n"));
    assert!(wire.contains(r#""finishReason":"stop""#));

    let text = decoded_text(&wire).await;
    let words: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(words.first(), Some(&"SINGLE"));
    assert_eq!(words.last(), Some(&"SINGLE"));
    let filler: Vec<&&str> = words.iter().filter(|w| **w != "SINGLE").collect();
    assert_eq!(filler.len(), 3);
}

#[tokio::test]
async fn two_step_chain_progresses_with_assistant_count() {
    let provider = provider(StreamConfig::default());

    let first = wire_for(&provider, vec![two_step_chain()], CancellationToken::new())
        .await
        .unwrap();
    let first = decoded_text(&first).await;
    assert!(first.contains("STEP_A"));
    assert!(!first.contains("STEP_B"));

    let second = wire_for(
        &provider,
        vec![two_step_chain(), reply()],
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let second = decoded_text(&second).await;
    assert!(second.contains("STEP_B"));
    assert!(!second.contains("STEP_A"));
}

#[tokio::test]
async fn exhausted_chain_streams_completion_text() {
    let history = vec![
        HistoryEntry::user(
            r#"<instructions>{"instruction_chain":[{"id_message":"ONLY","messages":[{"text_message":{"length":4}}]}]}</instructions>"#,
        ),
        reply(),
    ];
    let wire = wire_for(&provider(StreamConfig::default()), history, CancellationToken::new())
        .await
        .unwrap();
    let text = decoded_text(&wire).await;
    assert!(!text.contains("ONLY"));
    assert_eq!(text, COMPLETION_TEXT);
    assert!(wire.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn malformed_payload_fails_the_request() {
    let history = vec![HistoryEntry::user(
        r#"<instructions>{"instruction_chain": [ {"id_message": </instructions>"#,
    )];
    let result = wire_for(&provider(StreamConfig::default()), history, CancellationToken::new()).await;
    assert!(matches!(result, Err(MockingbirdError::MalformedInstruction(_))));
}

#[tokio::test]
async fn default_response_is_deterministic_per_message() {
    let provider = provider(StreamConfig::default());
    let history = || vec![HistoryEntry::user("tell me something")];

    let a = decoded_text(
        &wire_for(&provider, history(), CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;
    let b = decoded_text(
        &wire_for(&provider, history(), CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(a, b);
    let count = a.split_whitespace().count();
    assert!((5..=104).contains(&count));
}

#[tokio::test]
async fn cancelled_turn_has_no_sentinel_and_decodes_as_truncated() {
    let provider = provider(StreamConfig {
        chunk_delay_ms: 20,
        words_per_chunk: 1,
        ..StreamConfig::default()
    });
    let request = CompletionRequest {
        model: "mockingbird-scripted".into(),
        history: vec![HistoryEntry::user(
            r#"<instructions>{"id_message":"SLOW","messages":[{"text_message":{"length":50}}]}</instructions>"#,
        )],
    };
    let cancel = CancellationToken::new();
    let turn = provider.stream(&request, cancel.clone()).await.unwrap();
    let mut frames = Box::pin(encode_stream(
        turn.chunks,
        SseEncoder::new(new_stream_id(), &request.model),
    ));

    let mut wire = Vec::new();
    if let Some(frame) = frames.next().await {
        wire.extend_from_slice(&frame);
    }
    cancel.cancel();
    while let Some(frame) = frames.next().await {
        wire.extend_from_slice(&frame);
    }

    let wire = String::from_utf8(wire).unwrap();
    assert!(!wire.contains("[DONE]"));
    assert!(!wire.contains("finishReason\":\"stop"));

    let source = tokio_stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from(wire))]);
    let decoded: Vec<_> = decode_wire_stream(source).collect().await;
    assert!(matches!(
        decoded.last(),
        Some(Err(MockingbirdError::StreamTruncated))
    ));
}

#[test]
fn rendered_chain_reparses_to_the_same_plan() {
    let markers = InstructionsConfig::default();
    let text = r#"<instructions>{"instruction_chain":[
        {"id_message":"R1","reasoning":{"length":7},"messages":[
            {"text_message":{"length":2}},
            {"tool_call":[{"name":"echo","args":{"text":"hi","n":[1,2]}}]}
        ]},
        {"id_message":"R2","messages":[{"text_message":{"length":9}}]}
    ]}</instructions>"#;
    let chain = parse_instructions(text, &markers).unwrap().unwrap();
    let rendered = chain.to_markup(&markers);
    let reparsed = parse_instructions(&rendered, &markers).unwrap().unwrap();
    assert_eq!(chain, reparsed);
}

#[test]
fn select_reports_exhaustion() {
    let provider = provider(StreamConfig::default());
    let (script, _) = provider
        .select(&[two_step_chain(), reply(), reply(), reply()])
        .unwrap();
    assert_eq!(
        script,
        TurnScript::Exhausted {
            assistant_responses: 3
        }
    );
}
