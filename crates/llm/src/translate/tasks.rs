//! Embedded task-list extraction.
//!
//! Some tool-result frames smuggle the upstream's task tracker inside
//! `server.serialized_result`: URL-safe base64 wrapping schemaless binary.
//! When the decoded tree carries the task container keys, the lists are
//! surfaced to the client as a synthesized `TodoWrite` tool call.

use base64::Engine;
use codec::Value;
use serde::Serialize;

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct Todo {
    pub content: String,
    pub status: &'static str,
    #[serde(rename = "activeForm")]
    pub active_form: String,
}

#[derive(Debug, Serialize)]
struct TodoArgs {
    todos: Vec<Todo>,
}

/// Decode a serialized tool result and extract its task lists, if any.
///
/// Returns the `TodoWrite` arguments as a JSON string. `None` means the
/// payload holds no task data; callers fall back to treating the bytes as
/// plain text.
pub(crate) fn extract_todo_args(serialized: &str) -> Option<String> {
    let padding = (4 - serialized.len() % 4) % 4;
    let padded = format!("{serialized}{}", "=".repeat(padding));

    let bytes = base64::engine::general_purpose::URL_SAFE.decode(padded).ok()?;
    let decoded = codec::decode_unknown(&bytes).ok()?;

    // Task data lives under field 11 or 9, wrapped once more under field 1.
    let container = decoded
        .get("11")
        .or_else(|| decoded.get("9"))?
        .get("1")
        .filter(|v| v.is_map())?;

    let mut todos = Vec::new();

    // Field 1: pending tasks; field 2: completed tasks. Each task's
    // description sits at field 2.
    for task in container.get("1").map(repeated_items).unwrap_or_default() {
        if task.get("1").is_some() {
            let content = task.get("2").and_then(Value::as_text).unwrap_or_default().to_owned();

            todos.push(Todo {
                active_form: format!("Working on {content}"),
                content,
                status: "pending",
            });
        }
    }

    for task in container.get("2").map(repeated_items).unwrap_or_default() {
        if task.get("1").is_some() {
            let content = task.get("2").and_then(Value::as_text).unwrap_or_default().to_owned();

            todos.push(Todo {
                active_form: format!("Completed {content}"),
                content,
                status: "completed",
            });
        }
    }

    serde_json::to_string(&TodoArgs { todos }).ok()
}

/// A repeated field decodes as a list only when it occurred more than once.
fn repeated_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::List(items) => items.iter().collect(),
        Value::Map(_) => vec![value],
        _ => Vec::new(),
    }
}

/// UTF-8 fallback for payloads that carry no task data.
pub(crate) fn decode_as_text(serialized: &str) -> Option<String> {
    let padding = (4 - serialized.len() % 4) % 4;
    let padded = format!("{serialized}{}", "=".repeat(padding));

    let bytes = base64::engine::general_purpose::URL_SAFE.decode(padded).ok()?;

    String::from_utf8(bytes).ok()
}
