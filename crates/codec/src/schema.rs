//! Static message descriptors for the two upstream message types.
//!
//! The upstream protocol is not published as a schema file, so the field
//! layout lives here as data: field name, field number, and kind. Arbitrary
//! JSON subtrees (tool arguments, tool input schemas) ride as
//! length-delimited JSON text.

pub(crate) struct MessageDescriptor {
    pub(crate) fields: &'static [Field],
}

pub(crate) struct Field {
    pub(crate) number: u32,
    pub(crate) name: &'static str,
    pub(crate) kind: Kind,
    pub(crate) repeated: bool,
}

pub(crate) enum Kind {
    Text,
    Bool,
    Int,
    Float,
    Bytes,
    Json,
    Message(&'static MessageDescriptor),
    /// map<string, M>: repeated entries of {1: key, 2: M}.
    Map(&'static MessageDescriptor),
}

const fn field(number: u32, name: &'static str, kind: Kind) -> Field {
    Field {
        number,
        name,
        kind,
        repeated: false,
    }
}

const fn repeated(number: u32, name: &'static str, kind: Kind) -> Field {
    Field {
        number,
        name,
        kind,
        repeated: true,
    }
}

static EMPTY: MessageDescriptor = MessageDescriptor { fields: &[] };

static ATTACHMENT: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "plain_text", Kind::Text)],
};

static USER_QUERY: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "query", Kind::Text),
        field(2, "referenced_attachments", Kind::Map(&ATTACHMENT)),
    ],
};

static AGENT_OUTPUT: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "text", Kind::Text)],
};

static CALL_MCP_TOOL: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "name", Kind::Text), field(2, "args", Kind::Json)],
};

static SERVER_CALL: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "payload", Kind::Bytes)],
};

static TOOL_CALL: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "tool_call_id", Kind::Text),
        field(2, "call_mcp_tool", Kind::Message(&CALL_MCP_TOOL)),
        field(3, "server", Kind::Message(&SERVER_CALL)),
    ],
};

static RESULT_TEXT: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "text", Kind::Text)],
};

static RESULT_CHUNK: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "text", Kind::Message(&RESULT_TEXT))],
};

static MCP_TOOL_SUCCESS: MessageDescriptor = MessageDescriptor {
    fields: &[repeated(1, "results", Kind::Message(&RESULT_CHUNK))],
};

static MCP_TOOL_FAILURE: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "message", Kind::Text)],
};

static CALL_MCP_TOOL_RESULT: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "success", Kind::Message(&MCP_TOOL_SUCCESS)),
        field(2, "error", Kind::Message(&MCP_TOOL_FAILURE)),
    ],
};

static SERVER_RESULT: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "serialized_result", Kind::Text)],
};

static TOOL_CALL_RESULT: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "tool_call_id", Kind::Text),
        field(2, "call_mcp_tool", Kind::Message(&CALL_MCP_TOOL_RESULT)),
        field(3, "server", Kind::Message(&SERVER_RESULT)),
    ],
};

static TASK_MESSAGE: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "id", Kind::Text),
        field(2, "task_id", Kind::Text),
        field(3, "user_query", Kind::Message(&USER_QUERY)),
        field(4, "agent_output", Kind::Message(&AGENT_OUTPUT)),
        field(5, "tool_call", Kind::Message(&TOOL_CALL)),
        field(6, "tool_call_result", Kind::Message(&TOOL_CALL_RESULT)),
    ],
};

static TASK_STATUS: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "in_progress", Kind::Message(&EMPTY)),
        field(2, "done", Kind::Message(&EMPTY)),
    ],
};

static TASK: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "id", Kind::Text),
        field(2, "description", Kind::Text),
        field(3, "status", Kind::Message(&TASK_STATUS)),
        repeated(4, "messages", Kind::Message(&TASK_MESSAGE)),
    ],
};

static TASK_CONTEXT: MessageDescriptor = MessageDescriptor {
    fields: &[
        repeated(1, "tasks", Kind::Message(&TASK)),
        field(2, "active_task_id", Kind::Text),
    ],
};

static INPUT_ITEM: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "user_query", Kind::Message(&USER_QUERY)),
        field(2, "tool_call_result", Kind::Message(&TOOL_CALL_RESULT)),
    ],
};

static USER_INPUTS: MessageDescriptor = MessageDescriptor {
    fields: &[repeated(1, "inputs", Kind::Message(&INPUT_ITEM))],
};

static INPUT: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "context", Kind::Message(&EMPTY)),
        field(2, "user_inputs", Kind::Message(&USER_INPUTS)),
    ],
};

static MODEL_CONFIG: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "base", Kind::Text),
        field(2, "planning", Kind::Text),
        field(3, "coding", Kind::Text),
    ],
};

static SETTINGS: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "model_config", Kind::Message(&MODEL_CONFIG)),
        field(2, "rules_enabled", Kind::Bool),
        field(3, "web_context_retrieval_enabled", Kind::Bool),
        field(4, "supports_parallel_tool_calls", Kind::Bool),
        field(5, "planning_enabled", Kind::Bool),
        field(6, "supports_todos_ui", Kind::Bool),
        repeated(7, "supported_tools", Kind::Int),
    ],
};

static LOGGING_METADATA: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "is_autodetected_user_query", Kind::Bool),
        field(2, "entrypoint", Kind::Text),
    ],
};

static METADATA: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "logging", Kind::Message(&LOGGING_METADATA)),
        field(2, "conversation_id", Kind::Text),
    ],
};

static TOOL_DEF: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "name", Kind::Text),
        field(2, "description", Kind::Text),
        field(3, "input_schema", Kind::Json),
    ],
};

static MCP_CONTEXT: MessageDescriptor = MessageDescriptor {
    fields: &[repeated(1, "tools", Kind::Message(&TOOL_DEF))],
};

static REQUEST: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "task_context", Kind::Message(&TASK_CONTEXT)),
        field(2, "input", Kind::Message(&INPUT)),
        field(3, "settings", Kind::Message(&SETTINGS)),
        field(4, "metadata", Kind::Message(&METADATA)),
        field(5, "mcp_context", Kind::Message(&MCP_CONTEXT)),
    ],
};

static INIT: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "conversation_id", Kind::Text), field(2, "task_id", Kind::Text)],
};

static CREATE_TASK: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "task", Kind::Message(&TASK))],
};

static ADD_MESSAGES_TO_TASK: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "task_id", Kind::Text),
        repeated(2, "messages", Kind::Message(&TASK_MESSAGE)),
    ],
};

static APPEND_TO_MESSAGE_CONTENT: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "message_id", Kind::Text),
        field(2, "message", Kind::Message(&TASK_MESSAGE)),
    ],
};

static UPDATE_TASK_MESSAGE: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "task_id", Kind::Text),
        field(2, "message", Kind::Message(&TASK_MESSAGE)),
    ],
};

static UPDATE_TASK_SUMMARY: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "task_id", Kind::Text), field(2, "summary", Kind::Text)],
};

static ACTION: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "create_task", Kind::Message(&CREATE_TASK)),
        field(2, "add_messages_to_task", Kind::Message(&ADD_MESSAGES_TO_TASK)),
        field(3, "append_to_message_content", Kind::Message(&APPEND_TO_MESSAGE_CONTENT)),
        field(4, "update_task_message", Kind::Message(&UPDATE_TASK_MESSAGE)),
        field(5, "update_task_summary", Kind::Message(&UPDATE_TASK_SUMMARY)),
    ],
};

static CLIENT_ACTIONS: MessageDescriptor = MessageDescriptor {
    fields: &[repeated(1, "actions", Kind::Message(&ACTION))],
};

static REQUEST_COST: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "credits_used", Kind::Float)],
};

static CONTEXT_WINDOW_INFO: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "context_window_usage", Kind::Float)],
};

static INTERNAL_ERROR: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "message", Kind::Text)],
};

static FINISHED: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "request_cost", Kind::Message(&REQUEST_COST)),
        field(2, "context_window_info", Kind::Message(&CONTEXT_WINDOW_INFO)),
        field(3, "internal_error", Kind::Message(&INTERNAL_ERROR)),
        field(4, "llm_unavailable", Kind::Message(&EMPTY)),
    ],
};

static UPDATE_TASK_DESCRIPTION: MessageDescriptor = MessageDescriptor {
    fields: &[field(1, "task_id", Kind::Text), field(2, "description", Kind::Text)],
};

static RESPONSE_EVENT: MessageDescriptor = MessageDescriptor {
    fields: &[
        field(1, "init", Kind::Message(&INIT)),
        field(2, "client_actions", Kind::Message(&CLIENT_ACTIONS)),
        field(3, "finished", Kind::Message(&FINISHED)),
        field(4, "update_task_description", Kind::Message(&UPDATE_TASK_DESCRIPTION)),
    ],
};

pub(crate) fn lookup(message_type: &str) -> Option<&'static MessageDescriptor> {
    match message_type {
        crate::REQUEST_MESSAGE => Some(&REQUEST),
        crate::RESPONSE_EVENT_MESSAGE => Some(&RESPONSE_EVENT),
        _ => None,
    }
}
