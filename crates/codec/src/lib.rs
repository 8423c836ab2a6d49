//! Codec adapter for the upstream agent protocol.
//!
//! The upstream service exchanges binary messages: a request packet on the
//! way in, event frames inside SSE `data:` payloads on the way out. This
//! crate converts between those bytes and a name-keyed [`Value`] tree, driven
//! by static message descriptors for the two message types the proxy uses.
//!
//! A third entry point, [`decode_unknown`], parses bytes without a schema
//! into maps keyed by decimal field numbers. Some tool-result payloads embed
//! nested task-list data this way, and the translator inspects them by field
//! number.

mod schema;
mod value;
mod wire;

pub use value::Value;

use thiserror::Error;

/// Message type name for outbound request packets.
pub const REQUEST_MESSAGE: &str = "agent.v1.Request";

/// Message type name for inbound event frames.
pub const RESPONSE_EVENT_MESSAGE: &str = "agent.v1.ResponseEvent";

/// Codec failures. Frame-level callers treat any of these as "skip the
/// frame"; packet encoding treats them as fatal for the request.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message type name is not part of the schema.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The value shape does not match the field it is assigned to.
    #[error("field '{field}' expects {expected}")]
    FieldMismatch {
        /// Field name as written in the tree.
        field: &'static str,
        /// Human-readable expected shape.
        expected: &'static str,
    },

    /// The byte stream ended in the middle of a tag, varint or payload.
    #[error("truncated message")]
    Truncated,

    /// A tag carried a wire type this codec does not understand.
    #[error("invalid wire type {0}")]
    InvalidWireType(u8),

    /// A length-delimited field expected to hold UTF-8 text did not.
    #[error("invalid utf-8 in field payload")]
    InvalidUtf8,

    /// An embedded JSON payload failed to parse or serialize.
    #[error("embedded json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a value tree as the named message type.
pub fn encode(value: &Value, message_type: &str) -> Result<Vec<u8>, CodecError> {
    let descriptor = schema::lookup(message_type).ok_or_else(|| CodecError::UnknownMessageType(message_type.to_owned()))?;

    let mut buf = Vec::with_capacity(256);
    wire::encode_message(value, descriptor, &mut buf)?;

    Ok(buf)
}

/// Decode bytes as the named message type into a name-keyed value tree.
pub fn decode(bytes: &[u8], message_type: &str) -> Result<Value, CodecError> {
    let descriptor = schema::lookup(message_type).ok_or_else(|| CodecError::UnknownMessageType(message_type.to_owned()))?;

    wire::decode_message(bytes, descriptor)
}

/// Decode bytes without a schema into a tree keyed by decimal field numbers.
///
/// Length-delimited payloads are tried as nested messages first, then UTF-8
/// text, then raw bytes. Repeated occurrences of a tag accumulate into a
/// list.
pub fn decode_unknown(bytes: &[u8]) -> Result<Value, CodecError> {
    wire::decode_untyped(bytes, 0).ok_or(CodecError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Value {
        Value::object([
            (
                "task_context",
                Value::object([
                    (
                        "tasks",
                        Value::List(vec![Value::object([
                            ("id", "task-1".into()),
                            ("description", "".into()),
                            ("status", Value::object([("in_progress", Value::object([]))])),
                            (
                                "messages",
                                Value::List(vec![
                                    Value::object([
                                        ("id", "m1".into()),
                                        ("task_id", "task-1".into()),
                                        ("user_query", Value::object([("query", "hello there".into())])),
                                    ]),
                                    Value::object([
                                        ("id", "m2".into()),
                                        ("task_id", "task-1".into()),
                                        ("agent_output", Value::object([("text", "hi".into())])),
                                    ]),
                                ]),
                            ),
                        ])]),
                    ),
                    ("active_task_id", "task-1".into()),
                ]),
            ),
            (
                "input",
                Value::object([(
                    "user_inputs",
                    Value::object([(
                        "inputs",
                        Value::List(vec![Value::object([(
                            "user_query",
                            Value::object([
                                ("query", "what now?".into()),
                                (
                                    "referenced_attachments",
                                    Value::Map(
                                        [(
                                            "SYSTEM_PROMPT".to_owned(),
                                            Value::object([("plain_text", "be nice".into())]),
                                        )]
                                        .into_iter()
                                        .collect(),
                                    ),
                                ),
                            ]),
                        )])]),
                    )]),
                )]),
            ),
            (
                "settings",
                Value::object([
                    (
                        "model_config",
                        Value::object([("base", "claude-4.1-opus".into()), ("coding", "auto".into())]),
                    ),
                    ("rules_enabled", false.into()),
                    ("supported_tools", Value::List(vec![9i64.into()])),
                ]),
            ),
            (
                "mcp_context",
                Value::object([(
                    "tools",
                    Value::List(vec![Value::object([
                        ("name", "Bash".into()),
                        ("description", "run a command".into()),
                        (
                            "input_schema",
                            Value::from_json(&serde_json::json!({
                                "type": "object",
                                "properties": {"command": {"type": "string"}}
                            })),
                        ),
                    ])]),
                )]),
            ),
        ])
    }

    #[test]
    fn request_round_trips() {
        let packet = sample_request();
        let bytes = encode(&packet, REQUEST_MESSAGE).unwrap();
        let decoded = decode(&bytes, REQUEST_MESSAGE).unwrap();

        let query = decoded
            .get("input")
            .and_then(|v| v.get("user_inputs"))
            .and_then(|v| v.get("inputs"))
            .and_then(Value::as_list)
            .and_then(|l| l.first())
            .and_then(|v| v.get("user_query"))
            .and_then(|v| v.get("query"))
            .and_then(Value::as_text);
        assert_eq!(query, Some("what now?"));

        let attachment = decoded
            .get("input")
            .and_then(|v| v.get("user_inputs"))
            .and_then(|v| v.get("inputs"))
            .and_then(Value::as_list)
            .and_then(|l| l.first())
            .and_then(|v| v.get("user_query"))
            .and_then(|v| v.get("referenced_attachments"))
            .and_then(|v| v.get("SYSTEM_PROMPT"))
            .and_then(|v| v.get("plain_text"))
            .and_then(Value::as_text);
        assert_eq!(attachment, Some("be nice"));

        let schema = decoded
            .get("mcp_context")
            .and_then(|v| v.get("tools"))
            .and_then(Value::as_list)
            .and_then(|l| l.first())
            .and_then(|v| v.get("input_schema"))
            .map(Value::to_json);
        assert_eq!(
            schema,
            Some(serde_json::json!({
                "type": "object",
                "properties": {"command": {"type": "string"}}
            }))
        );

        // Repeated fields always decode as lists, even with one element.
        assert!(
            decoded
                .get("task_context")
                .and_then(|v| v.get("tasks"))
                .map(|v| v.as_list().is_some())
                .unwrap_or(false)
        );
    }

    #[test]
    fn response_event_round_trips() {
        let event = Value::object([(
            "finished",
            Value::object([
                ("context_window_info", Value::object([("context_window_usage", 0.25f64.into())])),
                ("internal_error", Value::object([("message", "tool_call:{read_files:{}}".into())])),
            ]),
        )]);

        let bytes = encode(&event, RESPONSE_EVENT_MESSAGE).unwrap();
        let decoded = decode(&bytes, RESPONSE_EVENT_MESSAGE).unwrap();

        let usage = decoded
            .get("finished")
            .and_then(|v| v.get("context_window_info"))
            .and_then(|v| v.get("context_window_usage"))
            .and_then(Value::as_f64);
        assert_eq!(usage, Some(0.25));

        let message = decoded
            .get("finished")
            .and_then(|v| v.get("internal_error"))
            .and_then(|v| v.get("message"))
            .and_then(Value::as_text);
        assert_eq!(message, Some("tool_call:{read_files:{}}"));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = encode(&Value::object([]), "agent.v1.Nope").unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessageType(_)));
    }
}
