//! Typed view over decoded upstream frames.
//!
//! Frames arrive as dynamic trees whose keys mix snake_case and camelCase
//! depending on which upstream component produced them, so every lookup
//! goes through the alias-tolerant getter.

use codec::Value;

/// One decoded upstream frame. A single frame can carry several of these
/// parts at once; they are processed in declaration order.
#[derive(Debug, Clone, Default)]
pub struct UpstreamEvent {
    pub init: Option<Init>,
    pub actions: Vec<Action>,
    /// Set by `update_task_description`: the upstream summarized and dropped
    /// earlier context.
    pub task_description: Option<String>,
    pub finished: Option<Finished>,
}

#[derive(Debug, Clone)]
pub struct Init {
    pub conversation_id: Option<String>,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Streaming text delta on an existing assistant message.
    AppendContent { text: String },
    /// Full new messages, possibly containing tool calls or results.
    AddMessages { messages: Vec<TaskMessage> },
    /// A new task opened with initial messages.
    CreateTask { texts: Vec<String> },
    /// In-place replacement of a message's text.
    UpdateTaskMessage { text: String },
    /// Task summary text.
    UpdateTaskSummary { summary: String },
}

#[derive(Debug, Clone, Default)]
pub struct TaskMessage {
    pub text: Option<String>,
    pub tool_call: Option<ToolCallEvent>,
    pub tool_result: Option<ToolResultEvent>,
}

#[derive(Debug, Clone)]
pub struct ToolCallEvent {
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolResultEvent {
    pub tool_call_id: Option<String>,
    /// URL-safe base64 of an opaque binary payload.
    pub serialized_result: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Finished {
    /// Fraction of the model's context window consumed, 0..1.
    pub context_window_usage: Option<f64>,
    /// Recoverable restricted-tool failure; carries the raw error message.
    pub internal_error: Option<String>,
    /// Recoverable transient unavailability.
    pub llm_unavailable: bool,
}

impl UpstreamEvent {
    pub fn from_value(value: &Value) -> Self {
        let init = value.get_any(&["init"]).map(|init| Init {
            conversation_id: text_at(init, &["conversation_id", "conversationId"]),
            task_id: text_at(init, &["task_id", "taskId"]),
        });

        let actions = value
            .get_any(&["client_actions", "clientActions"])
            .and_then(|ca| ca.get_any(&["actions", "Actions"]))
            .and_then(Value::as_list)
            .map(|actions| actions.iter().filter_map(parse_action).collect())
            .unwrap_or_default();

        let task_description = value
            .get_any(&["update_task_description", "updateTaskDescription"])
            .and_then(|update| text_at(update, &["description"]));

        let finished = value.get_any(&["finished"]).map(parse_finished);

        Self {
            init,
            actions,
            task_description,
            finished,
        }
    }
}

fn parse_action(action: &Value) -> Option<Action> {
    if let Some(append) = action.get_any(&["append_to_message_content", "appendToMessageContent"]) {
        let text = append
            .get_any(&["message"])
            .and_then(agent_output_text)
            .unwrap_or_default();

        return Some(Action::AppendContent { text });
    }

    if let Some(add) = action.get_any(&["add_messages_to_task", "addMessagesToTask"]) {
        let messages = add
            .get_any(&["messages"])
            .and_then(Value::as_list)
            .map(|messages| messages.iter().map(parse_task_message).collect())
            .unwrap_or_default();

        return Some(Action::AddMessages { messages });
    }

    if let Some(create) = action.get_any(&["create_task", "createTask"]) {
        let texts = create
            .get_any(&["task"])
            .and_then(|task| task.get_any(&["messages"]))
            .and_then(Value::as_list)
            .map(|messages| messages.iter().filter_map(agent_output_text).collect())
            .unwrap_or_default();

        return Some(Action::CreateTask { texts });
    }

    if let Some(update) = action.get_any(&["update_task_message", "updateTaskMessage"]) {
        let text = update
            .get_any(&["message"])
            .and_then(agent_output_text)
            .unwrap_or_default();

        return Some(Action::UpdateTaskMessage { text });
    }

    if let Some(update) = action.get_any(&["update_task_summary", "updateTaskSummary"]) {
        let summary = text_at(update, &["summary"]).unwrap_or_default();

        return Some(Action::UpdateTaskSummary { summary });
    }

    log::debug!("ignoring unknown upstream action");
    None
}

fn parse_task_message(message: &Value) -> TaskMessage {
    let text = agent_output_text(message);

    let tool_call = message.get_any(&["tool_call", "toolCall"]).map(|call| {
        let mcp = call.get_any(&["call_mcp_tool", "callMcpTool"]);

        ToolCallEvent {
            tool_call_id: text_at(call, &["tool_call_id", "toolCallId"]),
            name: mcp.and_then(|m| text_at(m, &["name"])),
            args: mcp
                .and_then(|m| m.get_any(&["args"]))
                .map(Value::to_json)
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        }
    });

    let tool_result = message
        .get_any(&["tool_call_result", "toolCallResult"])
        .map(|result| ToolResultEvent {
            tool_call_id: text_at(result, &["tool_call_id", "toolCallId"]),
            serialized_result: result
                .get_any(&["server"])
                .and_then(|server| text_at(server, &["serialized_result", "serializedResult"])),
        });

    TaskMessage {
        text,
        tool_call,
        tool_result,
    }
}

fn parse_finished(finished: &Value) -> Finished {
    let context_window_usage = finished
        .get_any(&["context_window_info", "contextWindowInfo"])
        .and_then(|info| match info {
            Value::Map(_) => info
                .get_any(&["context_window_usage", "contextWindowUsage", "used", "ratio"])
                .and_then(Value::as_f64),
            other => other.as_f64(),
        });

    let internal_error = finished
        .get_any(&["internal_error", "internalError"])
        .map(|error| text_at(error, &["message"]).unwrap_or_else(|| "Unknown internal error".to_owned()));

    let llm_unavailable = finished.get_any(&["llm_unavailable", "llmUnavailable"]).is_some();

    Finished {
        context_window_usage,
        internal_error,
        llm_unavailable,
    }
}

fn agent_output_text(message: &Value) -> Option<String> {
    message
        .get_any(&["agent_output", "agentOutput"])
        .and_then(|output| text_at(output, &["text"]))
        .filter(|text| !text.is_empty())
}

fn text_at(value: &Value, keys: &[&str]) -> Option<String> {
    value.get_any(keys).and_then(Value::as_text).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_aliases() {
        let frame = Value::object([(
            "clientActions",
            Value::object([(
                "actions",
                Value::List(vec![Value::object([(
                    "appendToMessageContent",
                    Value::object([(
                        "message",
                        Value::object([("agentOutput", Value::object([("text", "hi".into())]))]),
                    )]),
                )])]),
            )]),
        )]);

        let event = UpstreamEvent::from_value(&frame);

        assert!(matches!(&event.actions[0], Action::AppendContent { text } if text == "hi"));
    }

    #[test]
    fn parses_finished_with_ratio_map_or_scalar() {
        let as_map = Value::object([(
            "finished",
            Value::object([(
                "context_window_info",
                Value::object([("context_window_usage", 0.45f64.into())]),
            )]),
        )]);
        let as_scalar = Value::object([("finished", Value::object([("context_window_info", 0.25f64.into())]))]);

        assert_eq!(
            UpstreamEvent::from_value(&as_map).finished.unwrap().context_window_usage,
            Some(0.45)
        );
        assert_eq!(
            UpstreamEvent::from_value(&as_scalar)
                .finished
                .unwrap()
                .context_window_usage,
            Some(0.25)
        );
    }

    #[test]
    fn parses_tool_call_message() {
        let frame = Value::object([(
            "client_actions",
            Value::object([(
                "actions",
                Value::List(vec![Value::object([(
                    "add_messages_to_task",
                    Value::object([(
                        "messages",
                        Value::List(vec![Value::object([(
                            "tool_call",
                            Value::object([
                                ("tool_call_id", "c1".into()),
                                (
                                    "call_mcp_tool",
                                    Value::object([
                                        ("name", "Bash".into()),
                                        ("args", Value::object([("command", "ls".into())])),
                                    ]),
                                ),
                            ]),
                        )])]),
                    )]),
                )])]),
            )]),
        )]);

        let event = UpstreamEvent::from_value(&frame);

        let Action::AddMessages { messages } = &event.actions[0] else {
            panic!("expected AddMessages");
        };

        let call = messages[0].tool_call.as_ref().unwrap();
        assert_eq!(call.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(call.name.as_deref(), Some("Bash"));
        assert_eq!(call.args["command"], "ls");
    }

    #[test]
    fn llm_unavailable_flag_is_detected() {
        let frame = Value::object([("finished", Value::object([("llm_unavailable", Value::object([]))]))]);
        assert!(UpstreamEvent::from_value(&frame).finished.unwrap().llm_unavailable);
    }
}
