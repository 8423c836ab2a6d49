//! Upstream event stream to OpenAI chat-completion chunks.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use super::{Interrupt, tasks};
use crate::{
    messages::openai::{ChatCompletionChunk, FinishReason, Usage},
    token_counter,
    upstream::events::{Action, Finished, TaskMessage, UpstreamEvent},
};

/// Identity of one streamed completion, shared by every chunk of the
/// response including recovery retries.
#[derive(Debug, Clone)]
pub(crate) struct ChunkContext {
    pub completion_id: String,
    pub created: u64,
    pub model: String,
}

impl ChunkContext {
    pub(crate) fn new(model: String) -> Self {
        Self {
            completion_id: Uuid::new_v4().to_string(),
            created: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            model,
        }
    }

    pub(crate) fn text_chunk(&self, text: impl Into<String>) -> ChatCompletionChunk {
        ChatCompletionChunk::text(&self.completion_id, self.created, &self.model, text)
    }

    pub(crate) fn finish_chunk(&self, reason: FinishReason, usage: Usage) -> ChatCompletionChunk {
        ChatCompletionChunk::finish(&self.completion_id, self.created, &self.model, reason, usage)
    }

    pub(crate) fn role_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::role_opening(&self.completion_id, self.created, &self.model)
    }

    pub(crate) fn fatal_chunk(&self, message: impl Into<String>) -> ChatCompletionChunk {
        ChatCompletionChunk::fatal(&self.completion_id, self.created, &self.model, message)
    }
}

/// State machine turning upstream events into OpenAI chunks.
///
/// One instance covers one upstream attempt; the recovery driver creates a
/// fresh one per retry while keeping the same [`ChunkContext`].
pub(crate) struct OpenAiTranslator {
    ctx: ChunkContext,
    /// Pre-computed packet estimate, used when the upstream reports no
    /// context-window ratio.
    input_tokens: usize,
    tool_calls_emitted: bool,
    output_text: String,
}

impl OpenAiTranslator {
    pub(crate) fn new(ctx: ChunkContext, input_tokens: usize) -> Self {
        Self {
            ctx,
            input_tokens,
            tool_calls_emitted: false,
            output_text: String::new(),
        }
    }

    /// Translate one upstream event, appending any resulting chunks.
    ///
    /// A recoverable upstream failure surfaces as an [`Interrupt`] after the
    /// event's earlier parts have been flushed.
    pub(crate) fn process(&mut self, event: &UpstreamEvent, out: &mut Vec<ChatCompletionChunk>) -> Result<(), Interrupt> {
        for action in &event.actions {
            match action {
                Action::AppendContent { text } => self.push_text(text, out),
                Action::AddMessages { messages } => {
                    for message in messages {
                        self.push_task_message(message, out);
                    }
                }
                Action::CreateTask { texts } => {
                    for text in texts {
                        self.push_text(text, out);
                    }
                }
                Action::UpdateTaskMessage { text } => self.push_text(text, out),
                Action::UpdateTaskSummary { summary } => self.push_text(summary, out),
            }
        }

        if let Some(description) = &event.task_description {
            log::info!("upstream reset its context, notifying the client");
            let notice = context_reset_notice(description);
            self.push_text(&notice, out);
        }

        if let Some(finished) = &event.finished {
            self.finish(finished, out)?;
        }

        Ok(())
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<ChatCompletionChunk>) {
        if text.is_empty() {
            return;
        }

        self.output_text.push_str(text);
        out.push(self.ctx.text_chunk(text));
    }

    fn push_task_message(&mut self, message: &TaskMessage, out: &mut Vec<ChatCompletionChunk>) {
        if let Some(result) = &message.tool_result {
            let Some(tool_call_id) = result.tool_call_id.as_deref() else {
                return;
            };

            let Some(serialized) = result.serialized_result.as_deref() else {
                return;
            };

            if let Some(args) = tasks::extract_todo_args(serialized) {
                out.push(ChatCompletionChunk::tool_call(
                    &self.ctx.completion_id,
                    self.ctx.created,
                    &self.ctx.model,
                    tool_call_id,
                    "TodoWrite",
                    &args,
                ));
            } else if let Some(text) = tasks::decode_as_text(serialized) {
                // Plain tool output is informational only; nothing is
                // emitted for it.
                log::debug!("tool result for {tool_call_id}: {} bytes of text", text.len());
            }

            return;
        }

        if let Some(call) = &message.tool_call
            && let Some(name) = call.name.as_deref()
            && !name.is_empty()
        {
            let arguments = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_owned());
            let call_id = call
                .tool_call_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            out.push(ChatCompletionChunk::tool_call(
                &self.ctx.completion_id,
                self.ctx.created,
                &self.ctx.model,
                &call_id,
                name,
                &arguments,
            ));

            self.tool_calls_emitted = true;
            return;
        }

        if let Some(text) = &message.text {
            self.push_text(text, out);
        }
    }

    fn finish(&mut self, finished: &Finished, out: &mut Vec<ChatCompletionChunk>) -> Result<(), Interrupt> {
        if let Some(message) = &finished.internal_error {
            log::error!("upstream reported internal_error: {message}");

            return Err(Interrupt::InternalTool {
                tool_name: extract_tool_name(message),
                message: message.clone(),
            });
        }

        if finished.llm_unavailable {
            log::error!("upstream reported llm_unavailable");
            return Err(Interrupt::LlmUnavailable);
        }

        let completion_tokens = token_counter::count_text(&self.output_text).max(1) as u32;

        let prompt_tokens = match finished.context_window_usage.filter(|ratio| *ratio > 0.0) {
            Some(ratio) => {
                let window = token_counter::context_window(&self.ctx.model);
                let tokens = (ratio * f64::from(window)).round() as u32;

                log::info!(
                    "token accounting: context usage {ratio:.3} of {window} -> prompt_tokens {tokens}"
                );

                tokens
            }
            None if self.input_tokens > 0 => self.input_tokens as u32,
            None => 1000,
        };

        let reason = if self.tool_calls_emitted {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };

        out.push(self.ctx.finish_chunk(reason, Usage::new(prompt_tokens, completion_tokens)));

        Ok(())
    }
}

/// Pull the offending tool name out of an upstream internal error message.
pub(crate) fn extract_tool_name(message: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();

    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"tool_call:\{[^}]*?(\w+):\{\}").expect("tool name pattern is valid")
    });

    pattern
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_owned())
}

/// User-visible notice for an upstream context reset, carrying over any
/// pending-task section from the dropped task description.
fn context_reset_notice(description: &str) -> String {
    let section_after = |marker: &str| -> Option<String> {
        let (_, rest) = description.split_once(marker)?;
        Some(rest.split("\n\n").next().unwrap_or(rest).trim().to_owned())
    };

    const ADVICE: &str = "\n\n⚠️ To avoid another reset, compact the conversation (e.g. `/compact`) \
                          or continue in a fresh one.";

    if let Some(tasks) = section_after("Pending Tasks:") {
        format!(
            "\n\n📋 **Context has been reset. Pending tasks:**\n{tasks}{ADVICE}\n\n\
             💡 Please continue the previous work or restate the outstanding task."
        )
    } else if let Some(step) = section_after("Optional Next Step:") {
        format!(
            "\n\n📋 **Context has been reset. Suggested next step:**\n{step}{ADVICE}\n\n\
             💡 Please continue the previous work or restate the outstanding task."
        )
    } else {
        format!(
            "\n\n📋 **Context has been reset.**{ADVICE}\n\n\
             💡 The conversation grew too long and was reset automatically. \
             Restate any unfinished work to continue."
        )
    }
}
