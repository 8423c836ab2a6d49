//! Non-streaming completion path: collect the whole upstream exchange, with
//! the same one-shot recovery the streaming driver performs.

use std::sync::Arc;

use codec::Value;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    messages::openai::{
        ChatChoice, ChatCompletionResponse, ChatMessage, ChatRole, FinishReason, MessageContent, ObjectType,
        ToolCall, Usage,
    },
    recovery,
    server::BridgeServer,
    token_counter,
    translate::openai::ChunkContext,
    upstream::{collect_events, events::{Action, UpstreamEvent}},
};

pub(crate) async fn run(server: &Arc<BridgeServer>, packet: Value, ctx: &ChunkContext) -> Result<ChatCompletionResponse> {
    let input_tokens = token_counter::count_packet(&packet);

    let mut events = collect_events(server.source().as_ref(), &packet).await?;

    // One recovery retry when the collected exchange ended in a recoverable
    // failure: rebuild the packet with the matching hint and re-post.
    if let Some(retry_packet) = recovery_packet(&packet, &events) {
        log::info!("non-streaming exchange hit a recoverable error, retrying once");

        match collect_events(server.source().as_ref(), &retry_packet).await {
            Ok(retried) => events = retried,
            Err(e) => log::warn!("non-streaming recovery retry failed: {e}"),
        }
    }

    for event in &events {
        if let Some(init) = &event.init {
            server.remember_continuity(init).await;
        }
    }

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for event in &events {
        for action in &event.actions {
            match action {
                Action::AppendContent { text: delta } => text.push_str(delta),
                Action::AddMessages { messages } => {
                    for message in messages {
                        if let Some(call) = &message.tool_call
                            && let Some(name) = call.name.as_deref()
                            && !name.is_empty()
                        {
                            let arguments = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_owned());
                            let id = call
                                .tool_call_id
                                .clone()
                                .unwrap_or_else(|| Uuid::new_v4().to_string());

                            tool_calls.push(ToolCall::function(id, name, arguments));
                        } else if let Some(delta) = &message.text {
                            text.push_str(delta);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let (message, finish_reason) = if tool_calls.is_empty() {
        (ChatMessage::text(ChatRole::Assistant, text.clone()), FinishReason::Stop)
    } else {
        (
            ChatMessage {
                role: ChatRole::Assistant,
                content: Some(MessageContent::Text(String::new())),
                tool_call_id: None,
                tool_calls: Some(tool_calls),
                name: None,
            },
            FinishReason::ToolCalls,
        )
    };

    let completion_tokens = if finish_reason == FinishReason::Stop {
        token_counter::count_text(&text).max(1) as u32
    } else {
        1
    };

    Ok(ChatCompletionResponse {
        id: ctx.completion_id.clone(),
        object: ObjectType::ChatCompletion,
        created: ctx.created,
        model: ctx.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: Usage::new(input_tokens as u32, completion_tokens),
    })
}

/// Build the recovery packet when the collected events carry a recoverable
/// failure; `None` when the exchange finished cleanly.
fn recovery_packet(packet: &Value, events: &[UpstreamEvent]) -> Option<Value> {
    let finished = events.iter().rev().find_map(|event| event.finished.as_ref())?;

    let mut retry_packet = packet.clone();

    let changed = if let Some(message) = &finished.internal_error {
        let tool_name = crate::translate::openai::extract_tool_name(message);

        recovery::append_recovery_hint(
            &mut retry_packet,
            &recovery::internal_tool_hint(tool_name.as_deref()),
            &["[system auto-recovery]"],
        )
    } else if finished.llm_unavailable {
        recovery::append_recovery_hint(
            &mut retry_packet,
            recovery::llm_unavailable_hint(),
            &["continue task", "[auto-recovery]"],
        )
    } else {
        return None;
    };

    // Retry even when the hint was already present; the failure itself
    // warrants the second attempt.
    let _ = changed;

    Some(retry_packet)
}
