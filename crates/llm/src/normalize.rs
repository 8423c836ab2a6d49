//! Message-history normalization.
//!
//! Public-API histories arrive in whatever order the client accumulated
//! them: tool results separated from their calls by user interruptions,
//! assistant turns carrying several calls at once, results with empty
//! bodies. The upstream protocol wants strict adjacency: every tool call
//! immediately followed by its result. Normalization runs in two passes:
//! reorder first, then clean whatever could not be repaired.

use std::collections::{HashMap, HashSet};

use crate::messages::openai::{ChatMessage, ChatRole, MessageContent, ToolCall};

const EMPTY_RESULT_PLACEHOLDER: &str = "No content";

/// Full normalization: reorder for adjacency, then drop or repair
/// incomplete tool-call sequences. Never fails; structurally impossible
/// inputs are logged and passed through for the assembler to handle.
pub(crate) fn normalize_history(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    clean_incomplete_tool_calls(reorder_for_adjacency(history))
}

/// Pass A: expand multi-part messages and move every tool result directly
/// behind the assistant call it answers.
///
/// The last user or tool message is the request's final input. When that
/// final input is itself one of the tool results being moved, its assistant
/// message and result are deferred to the end so the final position is
/// preserved.
pub(crate) fn reorder_for_adjacency(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if history.is_empty() {
        return history;
    }

    let expanded = expand_messages(history);

    // Identify the final input: last tool result, unless a user message
    // comes later.
    let mut last_input_tool_id: Option<String> = None;

    for message in expanded.iter().rev() {
        match message.role {
            ChatRole::Tool => {
                if let Some(id) = &message.tool_call_id {
                    last_input_tool_id = Some(id.clone());
                    break;
                }
            }
            ChatRole::User => break,
            _ => {}
        }
    }

    let mut results_by_id: HashMap<String, ChatMessage> = HashMap::new();
    let mut assistant_call_ids: HashSet<String> = HashSet::new();

    for message in &expanded {
        if message.role == ChatRole::Tool
            && let Some(id) = &message.tool_call_id
            && !results_by_id.contains_key(id)
        {
            results_by_id.insert(id.clone(), message.clone());
        }

        if message.role == ChatRole::Assistant {
            for call in message.tool_calls.iter().flatten() {
                if !call.id.is_empty() {
                    assistant_call_ids.insert(call.id.clone());
                }
            }
        }
    }

    let mut result: Vec<ChatMessage> = Vec::with_capacity(expanded.len());
    let mut trailing_assistant: Option<ChatMessage> = None;

    for message in expanded {
        match message.role {
            ChatRole::Tool => {
                // Unmatched results stay inline; matched ones are re-emitted
                // behind their assistant call.
                let unmatched = message
                    .tool_call_id
                    .as_ref()
                    .is_none_or(|id| !assistant_call_ids.contains(id));

                if unmatched {
                    if let Some(id) = &message.tool_call_id {
                        results_by_id.remove(id);
                    }
                    result.push(message);
                }
            }
            ChatRole::Assistant if message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) => {
                let ids: Vec<String> = message
                    .tool_calls
                    .iter()
                    .flatten()
                    .filter(|call| !call.id.is_empty())
                    .map(|call| call.id.clone())
                    .collect();

                let is_trailing = last_input_tool_id
                    .as_ref()
                    .is_some_and(|last| ids.iter().any(|id| id == last));

                if is_trailing {
                    if trailing_assistant.is_none() {
                        trailing_assistant = Some(message);
                    }
                    continue;
                }

                result.push(message);

                for id in ids {
                    if let Some(tool_result) = results_by_id.remove(&id) {
                        result.push(tool_result);
                    }
                }
            }
            _ => result.push(message),
        }
    }

    if let (Some(assistant), Some(last_id)) = (trailing_assistant, last_input_tool_id) {
        result.push(assistant);

        if let Some(tool_result) = results_by_id.remove(&last_id) {
            result.push(tool_result);
        }
    }

    result
}

fn expand_messages(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut expanded = Vec::with_capacity(history.len());

    for message in history {
        match message.role {
            ChatRole::User => {
                let multi_segment = matches!(&message.content, Some(MessageContent::Segments(s)) if s.len() > 1);

                if multi_segment {
                    for segment in message.content.as_ref().map(MessageContent::segments).unwrap_or_default() {
                        if segment.is_text() {
                            expanded.push(ChatMessage::text(ChatRole::User, segment.text.clone().unwrap_or_default()));
                        } else {
                            expanded.push(ChatMessage {
                                role: ChatRole::User,
                                content: Some(MessageContent::Segments(vec![segment])),
                                tool_call_id: None,
                                tool_calls: None,
                                name: None,
                            });
                        }
                    }
                } else {
                    expanded.push(message);
                }
            }
            ChatRole::Assistant if message.tool_calls.as_ref().is_some_and(|calls| calls.len() > 1) => {
                let text = message.content_text();

                if !text.is_empty() {
                    expanded.push(ChatMessage::text(ChatRole::Assistant, text));
                }

                for call in message.tool_calls.into_iter().flatten() {
                    expanded.push(ChatMessage::assistant_with_tool_calls("", vec![call]));
                }
            }
            _ => expanded.push(message),
        }
    }

    expanded
}

/// Pass B: repair interrupted tool-call sequences.
///
/// Matching results with empty bodies are rewritten to a placeholder, calls
/// without any result are removed from their assistant message, and orphan
/// results without a preceding call are dropped. The relative order of
/// unrelated messages is preserved.
pub(crate) fn clean_incomplete_tool_calls(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let mut fixed: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(current) = iter.next() {
        if current.role == ChatRole::Assistant && current.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
            let expected: HashSet<String> = current
                .tool_calls
                .iter()
                .flatten()
                .filter(|call| !call.id.is_empty())
                .map(|call| call.id.clone())
                .collect();

            fixed.push(current);

            let mut tool_results: Vec<ChatMessage> = Vec::new();
            let mut found: HashSet<String> = HashSet::new();
            let mut interrupted: Vec<ChatMessage> = Vec::new();

            while let Some(next) = iter.peek() {
                match next.role {
                    ChatRole::Tool if next.tool_call_id.is_some() => {
                        let next = iter.next().expect("peeked");
                        let id = next.tool_call_id.clone().unwrap_or_default();

                        if expected.contains(&id) {
                            found.insert(id);
                        }
                        tool_results.push(fill_empty_result(next));
                    }
                    ChatRole::User | ChatRole::System => {
                        interrupted.push(iter.next().expect("peeked"));
                    }
                    _ => break,
                }
            }

            let missing: HashSet<&String> = expected.iter().filter(|id| !found.contains(*id)).collect();

            if !missing.is_empty() {
                log::warn!("removing {} tool call(s) without results", missing.len());

                let assistant = fixed.last_mut().expect("assistant just pushed");

                let valid_calls: Vec<ToolCall> = assistant
                    .tool_calls
                    .iter()
                    .flatten()
                    .filter(|call| !missing.contains(&call.id))
                    .cloned()
                    .collect();

                if !valid_calls.is_empty() {
                    assistant.tool_calls = Some(valid_calls);
                } else if assistant.has_content() {
                    assistant.tool_calls = None;
                } else {
                    fixed.pop();
                }

                tool_results.retain(|result| {
                    result
                        .tool_call_id
                        .as_ref()
                        .is_some_and(|id| found.contains(id))
                });
            }

            fixed.extend(tool_results);
            fixed.extend(interrupted);
        } else if current.role == ChatRole::Tool {
            // A result outside any collection window: keep only when a
            // preceding assistant call matches it.
            let matches_prior_call = current.tool_call_id.as_ref().is_some_and(|id| {
                for prior in fixed.iter().rev() {
                    if prior.role == ChatRole::Assistant {
                        return prior
                            .tool_calls
                            .iter()
                            .flatten()
                            .any(|call| &call.id == id);
                    }
                }
                false
            });

            if matches_prior_call {
                fixed.push(fill_empty_result(current));
            } else {
                log::warn!(
                    "dropping orphan tool result {:?}",
                    current.tool_call_id.as_deref().unwrap_or("<missing id>")
                );
            }
        } else {
            fixed.push(current);
        }
    }

    fixed
}

fn fill_empty_result(message: ChatMessage) -> ChatMessage {
    let empty = message.content_text().trim().is_empty();

    if empty {
        ChatMessage::tool_result(
            message.tool_call_id.clone().unwrap_or_default(),
            EMPTY_RESULT_PLACEHOLDER,
        )
    } else {
        message
    }
}
