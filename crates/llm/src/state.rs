//! Conversation continuity state.
//!
//! The upstream assigns a conversation id and a task id on the first
//! exchange; echoing them back on later requests keeps multi-turn context
//! alive. The values are advisory: a stale or missing id only costs
//! continuity, never correctness, so readers take a cheap snapshot and
//! writers update best-effort.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct Continuity {
    pub conversation_id: Option<String>,
    pub baseline_task_id: Option<String>,
    /// Stable id for the server preamble message.
    pub tool_message_id: String,
    /// Stable id for the server preamble tool call.
    pub tool_call_id: String,
}

impl Default for Continuity {
    fn default() -> Self {
        Self {
            conversation_id: None,
            baseline_task_id: None,
            tool_message_id: Uuid::new_v4().to_string(),
            tool_call_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Continuity {
    pub(crate) fn snapshot(&self) -> ContinuitySnapshot {
        ContinuitySnapshot {
            conversation_id: self.conversation_id.clone(),
            baseline_task_id: self.baseline_task_id.clone(),
            tool_message_id: self.tool_message_id.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

/// Point-in-time copy handed to the request assembler.
#[derive(Debug, Clone)]
pub(crate) struct ContinuitySnapshot {
    pub conversation_id: Option<String>,
    pub baseline_task_id: Option<String>,
    pub tool_message_id: String,
    pub tool_call_id: String,
}
