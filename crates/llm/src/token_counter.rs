//! Token accounting.
//!
//! Counts are estimates: the upstream does not expose its tokenizer, so
//! strings are measured with a cl100k encoder and prompt usage prefers the
//! context-window ratio the upstream reports on completion.

use std::sync::OnceLock;

use codec::Value;
use tiktoken_rs::CoreBPE;

fn encoder() -> &'static CoreBPE {
    static ENCODER: OnceLock<CoreBPE> = OnceLock::new();

    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k encoder data is bundled"))
}

/// Token count of a string; zero for empty input.
pub(crate) fn count_text(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    encoder().encode_with_special_tokens(text).len()
}

/// Context window for a model. Known Claude families run 200k; everything
/// else gets a conservative default.
pub(crate) fn context_window(model: &str) -> u32 {
    let model = model.to_lowercase();

    if model.contains("claude-3") || model.contains("claude-4") {
        200_000
    } else {
        100_000
    }
}

/// Estimate the token count of a whole request packet: final inputs with
/// their referenced attachments, the task history, and the tool definitions.
pub(crate) fn count_packet(packet: &Value) -> usize {
    let mut total = 0;

    if let Some(inputs) = packet
        .get("input")
        .and_then(|v| v.get("user_inputs"))
        .and_then(|v| v.get("inputs"))
        .and_then(Value::as_list)
    {
        for input in inputs {
            if let Some(user_query) = input.get("user_query") {
                if let Some(query) = user_query.get("query").and_then(Value::as_text) {
                    total += count_text(query);
                }

                if let Some(attachments) = user_query.get("referenced_attachments").and_then(Value::as_map) {
                    for attachment in attachments.values() {
                        for key in ["plain_text", "text"] {
                            if let Some(text) = attachment.get(key).and_then(Value::as_text) {
                                total += count_text(text);
                            }
                        }
                    }
                }
            }

            if let Some(result) = input.get("tool_call_result") {
                total += count_json_tokens(result);
            }
        }
    }

    for message in task_messages(packet) {
        if let Some(text) = message.get("agent_output").and_then(|v| v.get("text")).and_then(Value::as_text) {
            total += count_text(text);
        }

        if let Some(query) = message.get("user_query").and_then(|v| v.get("query")).and_then(Value::as_text) {
            total += count_text(query);
        }

        if let Some(call) = message.get("tool_call") {
            total += count_json_tokens(call);
        }

        if let Some(result) = message.get("tool_call_result") {
            total += count_json_tokens(result);
        }
    }

    if let Some(tools) = packet.get("mcp_context").and_then(|v| v.get("tools")) {
        total += count_json_tokens(tools);
    }

    // Structural overhead: separators, roles, framing.
    total + 10
}

fn task_messages(packet: &Value) -> Vec<&Value> {
    let Some(task_context) = packet.get("task_context") else {
        return Vec::new();
    };

    if let Some(messages) = task_context.get("messages").and_then(Value::as_list) {
        return messages.iter().collect();
    }

    task_context
        .get("tasks")
        .and_then(Value::as_list)
        .map(|tasks| {
            tasks
                .iter()
                .filter_map(|task| task.get("messages").and_then(Value::as_list))
                .flatten()
                .collect()
        })
        .unwrap_or_default()
}

fn count_json_tokens(value: &Value) -> usize {
    serde_json::to_string(value).map(|json| count_text(&json)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_scale_with_text_length() {
        let short = count_text("hello");
        let long = count_text(&"hello world, this is a longer sentence. ".repeat(20));

        assert!(short >= 1);
        assert!(long > short * 10);
    }

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_text(""), 0);
    }

    #[test]
    fn known_model_windows() {
        assert_eq!(context_window("claude-4.1-opus"), 200_000);
        assert_eq!(context_window("Claude-3-5-Sonnet"), 200_000);
        assert_eq!(context_window("gpt-5"), 100_000);
    }

    #[test]
    fn packet_estimate_covers_inputs_history_and_tools() {
        let packet = Value::object([
            (
                "input",
                Value::object([(
                    "user_inputs",
                    Value::object([(
                        "inputs",
                        Value::List(vec![Value::object([(
                            "user_query",
                            Value::object([
                                ("query", "how do I sort a vector?".into()),
                                (
                                    "referenced_attachments",
                                    Value::Map(
                                        [(
                                            "SYSTEM_PROMPT".to_owned(),
                                            Value::object([("plain_text", "you are a helpful assistant".into())]),
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
                "task_context",
                Value::object([(
                    "tasks",
                    Value::List(vec![Value::object([(
                        "messages",
                        Value::List(vec![Value::object([(
                            "agent_output",
                            Value::object([("text", "previous answer".into())]),
                        )])]),
                    )])]),
                )]),
            ),
        ])
        ;

        let with_history = count_packet(&packet);

        let bare = Value::object([]);
        let floor = count_packet(&bare);

        assert!(with_history > floor);
        assert_eq!(floor, 10);
    }
}
