//! Tests for the SSE frame decoder.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use toolgate::api::FrameDecoder;
use toolgate::types::{StreamFrame, TurnEvent};

use crate::common::sse_body;

fn decode_all(chunks: &[&[u8]]) -> (Vec<StreamFrame>, u64) {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        frames.extend(decoder.push(chunk));
    }
    decoder.finish();
    (frames, decoder.discarded())
}

fn turn_body() -> String {
    sse_body(&[
        ("session", json!({"session_id": "s1"})),
        ("token", json!({"text": "Hi"})),
        ("tool_start", json!({"tool": "search", "args": {"q": "naïve café"}})),
        ("tool_result", json!({"tool": "search", "result": "2 hits", "elapsed_ms": 4.2})),
        ("token", json!({"text": " there"})),
        ("done", json!({"session_id": "s1", "message_count": 2})),
    ])
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_full_turn_decodes_in_order() {
    let body = turn_body();
    let (frames, discarded) = decode_all(&[body.as_bytes()]);

    let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
    assert_eq!(
        events,
        vec!["session", "token", "tool_start", "tool_result", "token", "done"]
    );
    assert_eq!(discarded, 0);
}

#[test]
fn test_corrupt_frame_between_good_ones() {
    let body = format!(
        "{}event: token\ndata: {{\"text\": oops}}\n\n{}",
        sse_body(&[("token", json!({"text": "a"}))]),
        sse_body(&[("token", json!({"text": "b"}))]),
    );
    let (frames, discarded) = decode_all(&[body.as_bytes()]);

    let texts: Vec<_> = frames
        .iter()
        .filter_map(TurnEvent::from_frame)
        .filter_map(|e| e.text().map(str::to_string))
        .collect();
    assert_eq!(texts, vec!["a", "b"]);
    assert_eq!(discarded, 1);
}

#[test]
fn test_event_without_data_is_discarded() {
    let (frames, discarded) = decode_all(&[b"event: done\n\n".as_slice()]);
    assert!(frames.is_empty());
    assert_eq!(discarded, 1);
}

#[test]
fn test_blank_lines_alone_produce_nothing() {
    let (frames, discarded) = decode_all(&[b"\n\n\r\n".as_slice()]);
    assert!(frames.is_empty());
    assert_eq!(discarded, 0);
}

#[test]
fn test_id_and_retry_fields_ignored() {
    let (frames, _) = decode_all(&[b"id: 7\nretry: 1000\nevent: token\ndata: {\"text\":\"x\"}\n\n".as_slice()]);
    assert_eq!(frames, vec![StreamFrame::new("token", json!({"text": "x"}))]);
}

#[test]
fn test_byte_at_a_time() {
    let body = turn_body();
    let chunks: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
    let (frames, _) = decode_all(&chunks);
    assert_eq!(frames.len(), 6);
    assert_eq!(frames[2].data["args"]["q"], "naïve café");
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Splitting the body at arbitrary byte offsets never changes the frames.
    #[test]
    fn prop_chunking_is_transparent(cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12)) {
        let body = turn_body();
        let bytes = body.as_bytes();
        let (expected, _) = decode_all(&[bytes]);

        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
        offsets.sort_unstable();
        offsets.dedup();

        let mut chunks = Vec::new();
        let mut start = 0;
        for offset in offsets {
            chunks.push(&bytes[start..offset]);
            start = offset;
        }
        chunks.push(&bytes[start..]);

        let (frames, discarded) = decode_all(&chunks);
        prop_assert_eq!(frames, expected);
        prop_assert_eq!(discarded, 0);
    }
}
