//! Conversion between the Anthropic Messages shape and the internal OpenAI
//! shape.

use serde_json::Value;

use super::{
    anthropic::{
        AnthropicChatRequest, AnthropicChatResponse, AnthropicContent, AnthropicUsage, ContentBlockParam,
        ResponseBlock, stop_reason_for,
    },
    openai::{
        ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, ContentSegment, FunctionDef,
        MessageContent, Tool, ToolCall,
    },
};

/// Convert an Anthropic Messages request into the internal OpenAI shape.
///
/// Tool results embedded in user messages become `tool` role messages,
/// assistant `tool_use` blocks become `tool_calls`, and base64 image sources
/// become `image_url` data URLs.
pub fn chat_request_from_anthropic(request: AnthropicChatRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.to_text();

        if !text.is_empty() {
            messages.push(ChatMessage::text(ChatRole::System, text));
        }
    }

    for message in &request.messages {
        match (message.role.as_str(), &message.content) {
            ("user" | "assistant", AnthropicContent::Text(text)) => {
                let role = if message.role == "user" {
                    ChatRole::User
                } else {
                    ChatRole::Assistant
                };

                messages.push(ChatMessage::text(role, text.clone()));
            }
            ("user", AnthropicContent::Blocks(blocks)) => {
                convert_user_blocks(blocks, &mut messages);
            }
            ("assistant", AnthropicContent::Blocks(blocks)) => {
                convert_assistant_blocks(blocks, &mut messages);
            }
            (other, _) => {
                log::warn!("dropping message with unsupported role '{other}'");
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| Tool {
                tool_type: "function".to_owned(),
                function: FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone().or_else(|| Some(String::new())),
                    parameters: tool.input_schema.clone().or_else(|| Some(Value::Object(Default::default()))),
                },
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = request.tool_choice.as_ref().map(convert_tool_choice);

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        tools,
        tool_choice,
    }
}

fn convert_user_blocks(blocks: &[ContentBlockParam], messages: &mut Vec<ChatMessage>) {
    // Tool results first: they answer the preceding assistant turn.
    for block in blocks {
        if let ContentBlockParam::ToolResult {
            tool_use_id, content, ..
        } = block
        {
            messages.push(ChatMessage::tool_result(
                tool_use_id.clone(),
                tool_result_text(content.as_ref()),
            ));
        }
    }

    let mut segments = Vec::new();

    for block in blocks {
        match block {
            ContentBlockParam::Text { text } if !text.is_empty() => {
                segments.push(ContentSegment::text(text.clone()));
            }
            ContentBlockParam::Image { source } => {
                let url = image_source_url(source);
                let mut extra = serde_json::Map::new();
                extra.insert("image_url".to_owned(), serde_json::json!({ "url": url }));

                segments.push(ContentSegment {
                    segment_type: Some("image_url".to_owned()),
                    text: None,
                    extra,
                });
            }
            _ => {}
        }
    }

    match segments.len() {
        0 => {}
        1 if segments[0].is_text() => {
            let text = segments[0].text.clone().unwrap_or_default();
            messages.push(ChatMessage::text(ChatRole::User, text));
        }
        _ => {
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: Some(MessageContent::Segments(segments)),
                tool_call_id: None,
                tool_calls: None,
                name: None,
            });
        }
    }
}

fn convert_assistant_blocks(blocks: &[ContentBlockParam], messages: &mut Vec<ChatMessage>) {
    let text = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlockParam::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let tool_calls: Vec<ToolCall> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlockParam::ToolUse { id, name, input } => Some(ToolCall::function(
                id.clone(),
                name.clone(),
                serde_json::to_string(input).unwrap_or_else(|_| "{}".to_owned()),
            )),
            _ => None,
        })
        .collect();

    messages.push(ChatMessage {
        role: ChatRole::Assistant,
        content: Some(MessageContent::Text(text)),
        tool_call_id: None,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        name: None,
    });
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text.clone()),
                    Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("text") => {
                        map.get("text").and_then(Value::as_str).map(str::to_owned)
                    }
                    _ => None,
                })
                .collect();

            if parts.is_empty() {
                serde_json::to_string(content.unwrap_or(&Value::Null)).unwrap_or_default()
            } else {
                parts.join("\n")
            }
        }
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn image_source_url(source: &Value) -> String {
    match source.get("type").and_then(Value::as_str) {
        Some("base64") => {
            let media_type = source.get("media_type").and_then(Value::as_str).unwrap_or("image/jpeg");
            let data = source.get("data").and_then(Value::as_str).unwrap_or_default();
            format!("data:{media_type};base64,{data}")
        }
        _ => source.get("url").and_then(Value::as_str).unwrap_or_default().to_owned(),
    }
}

fn convert_tool_choice(choice: &Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("tool") => serde_json::json!({
            "type": "function",
            "function": { "name": choice.get("name").cloned().unwrap_or(Value::Null) }
        }),
        Some(other) => Value::String(other.to_owned()),
        None => choice.clone(),
    }
}

/// Convert an internal OpenAI response into the Anthropic Messages shape.
pub fn anthropic_response_from_openai(response: &ChatCompletionResponse) -> AnthropicChatResponse {
    let mut content = Vec::new();

    let choice = response.choices.first();

    if let Some(choice) = choice {
        let text = choice.message.content_text();

        if !text.is_empty() {
            content.push(ResponseBlock::Text { text });
        }

        for call in choice.message.tool_calls.iter().flatten() {
            let input: Value = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| Value::Object(Default::default()));

            content.push(ResponseBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
    }

    let stop_reason = choice.map(|c| stop_reason_for(c.finish_reason).to_owned());

    AnthropicChatResponse {
        id: response.id.clone(),
        response_type: "message".to_owned(),
        role: "assistant".to_owned(),
        model: response.model.clone(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
        },
    }
}
