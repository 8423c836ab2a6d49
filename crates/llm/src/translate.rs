//! Streaming translation: upstream events to OpenAI chunks, OpenAI chunks
//! to Anthropic SSE events.

pub(crate) mod anthropic;
pub(crate) mod openai;
mod tasks;

/// Recoverable in-stream failures. These are not request errors: the
/// recovery driver catches them, mutates the request packet with a recovery
/// hint, and re-drives the upstream exchange once per kind.
#[derive(Debug, Clone)]
pub(crate) enum Interrupt {
    /// The upstream aborted because the model reached for a restricted
    /// tool. The tool name is extracted from the error message when
    /// recognizable.
    InternalTool {
        tool_name: Option<String>,
        message: String,
    },
    /// The backing model was transiently unavailable.
    LlmUnavailable,
}
