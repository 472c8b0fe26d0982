// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Typed view of the Amazon Q event-stream payloads the gateway consumes.

use qrelay_eventstream::Event;
use serde_json::Value;

/// A tool use delivered whole (non-incremental), as carried by
/// `codeReferenceEvent`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseRef {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// One upstream event after JSON decoding.
///
/// `toolUseEvent` input arrives as ordered string fragments; the final
/// fragment for a call carries `stop: true`.  Consumers concatenate the
/// fragments and parse the result as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum QEvent {
    /// `assistantResponseEvent` — a plain text delta.
    Text { content: String },
    /// `toolUseEvent` — an incremental tool-call fragment.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: String,
        stop: bool,
    },
    /// `codeReferenceEvent` — tool uses in their non-stream shape.
    CodeReference { tool_uses: Vec<ToolUseRef> },
    /// Anything else: kept for logging, ignored by the multiplexer.
    Other { event_type: String },
}

/// Decode one framed event into the typed vocabulary.
///
/// Returns `None` for frames without an `:event-type` header or with an
/// unparseable payload — the stream keeps flowing; one bad frame is not
/// worth tearing down a live response.
pub fn parse_upstream_event(event: &Event) -> Option<QEvent> {
    let event_type = event.event_type()?;
    let payload: Value = event.payload_json().ok()?;

    let parsed = match event_type {
        "assistantResponseEvent" => QEvent::Text {
            content: payload["content"].as_str().unwrap_or("").to_string(),
        },
        "toolUseEvent" => QEvent::ToolUse {
            tool_use_id: payload["toolUseId"].as_str().unwrap_or("").to_string(),
            name: payload["name"].as_str().unwrap_or("").to_string(),
            input: payload["input"].as_str().unwrap_or("").to_string(),
            stop: payload["stop"].as_bool().unwrap_or(false),
        },
        "codeReferenceEvent" => {
            let tool_uses = payload["toolUses"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|tu| ToolUseRef {
                            tool_use_id: tu["toolUseId"].as_str().unwrap_or("").to_string(),
                            name: tu["name"].as_str().unwrap_or("").to_string(),
                            input: tu.get("input").cloned().unwrap_or(Value::Null),
                        })
                        .collect()
                })
                .unwrap_or_default();
            QEvent::CodeReference { tool_uses }
        }
        other => QEvent::Other {
            event_type: other.to_string(),
        },
    };
    Some(parsed)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use qrelay_eventstream::{encode_event, FrameDecoder};
    use serde_json::json;

    fn decode_one(event_type: &str, payload: serde_json::Value) -> QEvent {
        let frame = encode_event(event_type, &payload);
        let mut dec = FrameDecoder::new();
        let events = dec.feed(&frame).unwrap();
        parse_upstream_event(&events[0]).unwrap()
    }

    #[test]
    fn text_event_decodes_content() {
        let ev = decode_one("assistantResponseEvent", json!({ "content": "hi" }));
        assert_eq!(ev, QEvent::Text { content: "hi".into() });
    }

    #[test]
    fn tool_use_event_decodes_fragment() {
        let ev = decode_one(
            "toolUseEvent",
            json!({ "toolUseId": "t1", "name": "search", "input": "{\"q\":", "stop": false }),
        );
        assert_eq!(
            ev,
            QEvent::ToolUse {
                tool_use_id: "t1".into(),
                name: "search".into(),
                input: "{\"q\":".into(),
                stop: false,
            }
        );
    }

    #[test]
    fn tool_use_stop_flag_is_read() {
        let ev = decode_one(
            "toolUseEvent",
            json!({ "toolUseId": "t1", "name": "search", "input": "\"x\"}", "stop": true }),
        );
        assert!(matches!(ev, QEvent::ToolUse { stop: true, .. }));
    }

    #[test]
    fn code_reference_event_decodes_whole_tool_uses() {
        let ev = decode_one(
            "codeReferenceEvent",
            json!({ "toolUses": [{ "toolUseId": "a", "name": "fmt", "input": {"f": 1} }] }),
        );
        match ev {
            QEvent::CodeReference { tool_uses } => {
                assert_eq!(tool_uses.len(), 1);
                assert_eq!(tool_uses[0].name, "fmt");
                assert_eq!(tool_uses[0].input, json!({"f": 1}));
            }
            other => panic!("expected CodeReference, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_other() {
        let ev = decode_one("meteringEvent", json!({}));
        assert_eq!(ev, QEvent::Other { event_type: "meteringEvent".into() });
    }

    #[test]
    fn frame_without_event_type_is_skipped() {
        let frame = qrelay_eventstream::encode_frame(&[], b"{}");
        let mut dec = FrameDecoder::new();
        let events = dec.feed(&frame).unwrap();
        assert!(parse_upstream_event(&events[0]).is_none());
    }
}
