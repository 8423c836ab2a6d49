//! OpenAI Chat Completions wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: either plain text or an ordered list of typed segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Segments(Vec<ContentSegment>),
}

/// One segment of a multi-part message. Non-text segments (images) keep
/// their payload in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSegment {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub segment_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segment_type: Some("text".to_owned()),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.segment_type.as_deref() == Some("text") || (self.segment_type.is_none() && self.text.is_some())
    }
}

impl MessageContent {
    /// Normalize to a segment list: plain text becomes a single text segment.
    pub fn segments(&self) -> Vec<ContentSegment> {
        match self {
            MessageContent::Text(text) => vec![ContentSegment::text(text.clone())],
            MessageContent::Segments(segments) => segments.clone(),
        }
    }

    /// Concatenation of all text segments.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Segments(segments) => segments
                .iter()
                .filter(|s| s.is_text())
                .filter_map(|s| s.text.as_deref())
                .collect(),
        }
    }
}

/// One unit of public-API history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// References the assistant tool-call being answered; tool role only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_call_id: None,
            tool_calls: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
            name: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(MessageContent::Text(content.into())),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
            name: None,
        }
    }

    /// Concatenated text content; empty when there is none.
    pub fn content_text(&self) -> String {
        self.content.as_ref().map(MessageContent::to_text).unwrap_or_default()
    }

    /// Whether the message has any content, text or otherwise.
    pub fn has_content(&self) -> bool {
        match &self.content {
            None => false,
            Some(MessageContent::Text(text)) => !text.is_empty(),
            Some(MessageContent::Segments(segments)) => !segments.is_empty(),
        }
    }
}

/// A tool call issued by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub call_type: ToolCallType,

    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: ToolCallType::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    #[default]
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON-encoded string.
    #[serde(default)]
    pub arguments: String,
}

/// A caller-supplied tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,

    pub function: FunctionDef,
}

fn default_tool_type() -> String {
    "function".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: Option<bool>,

    #[serde(default)]
    pub tools: Option<Vec<Tool>>,

    #[serde(default)]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "model")]
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Non-streaming completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

/// One streamed completion chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: MessageDelta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<ToolCallType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamError {
    pub message: String,
}

impl ChatCompletionChunk {
    fn base(id: &str, created: u64, model: &str) -> Self {
        Self {
            id: id.to_owned(),
            object: ObjectType::ChatCompletionChunk,
            created,
            model: model.to_owned(),
            choices: Vec::new(),
            usage: None,
            error: None,
        }
    }

    fn with_delta(id: &str, created: u64, model: &str, delta: MessageDelta) -> Self {
        let mut chunk = Self::base(id, created, model);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: None,
        });
        chunk
    }

    /// Opening chunk establishing the assistant role.
    pub fn role_opening(id: &str, created: u64, model: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            MessageDelta {
                role: Some(ChatRole::Assistant),
                ..Default::default()
            },
        )
    }

    /// Incremental text content.
    pub fn text(id: &str, created: u64, model: &str, content: impl Into<String>) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            MessageDelta {
                content: Some(content.into()),
                ..Default::default()
            },
        )
    }

    /// A complete tool call delivered as a single chunk.
    pub fn tool_call(id: &str, created: u64, model: &str, call_id: &str, name: &str, arguments: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            MessageDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: Some(call_id.to_owned()),
                    call_type: Some(ToolCallType::Function),
                    function: Some(FunctionDelta {
                        name: Some(name.to_owned()),
                        arguments: Some(arguments.to_owned()),
                    }),
                }]),
                ..Default::default()
            },
        )
    }

    /// Terminating chunk carrying the finish reason and usage.
    pub fn finish(id: &str, created: u64, model: &str, reason: FinishReason, usage: Usage) -> Self {
        let mut chunk = Self::base(id, created, model);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: MessageDelta::default(),
            finish_reason: Some(reason),
        });
        chunk.usage = Some(usage);
        chunk
    }

    /// Fatal error chunk ending the stream.
    pub fn fatal(id: &str, created: u64, model: &str, message: impl Into<String>) -> Self {
        let mut chunk = Self::base(id, created, model);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: MessageDelta::default(),
            finish_reason: Some(FinishReason::Error),
        });
        chunk.error = Some(StreamError { message: message.into() });
        chunk
    }

    /// Concatenated content of this chunk's first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    /// Finish reason of this chunk's first choice, if any.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first()?.finish_reason
    }
}

/// `GET /v1/models` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: ObjectType,
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: ObjectType,
    pub created: u64,
    pub owned_by: String,
}
