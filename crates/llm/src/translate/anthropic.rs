//! OpenAI chunk stream to Anthropic SSE events.
//!
//! A state machine over content blocks: an optional text block, then any
//! number of tool-use blocks, each opened with `content_block_start` and
//! closed with `content_block_stop` at a monotonically increasing index.

use crate::messages::{
    anthropic::{
        AnthropicUsage, BlockDelta, MessageDeltaData, ResponseBlock, StreamErrorData, StreamEvent,
        StreamMessageStart, stop_reason_for,
    },
    openai::ChatCompletionChunk,
};

pub(crate) struct AnthropicTranslator {
    message_id: String,
    model: String,
    content_index: u32,
    has_text_content: bool,
    has_tool_calls: bool,
    completed: bool,
    usage: AnthropicUsage,
}

impl AnthropicTranslator {
    pub(crate) fn new(model: String) -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self {
            message_id: format!("msg_{millis}"),
            model,
            content_index: 0,
            has_text_content: false,
            has_tool_calls: false,
            completed: false,
            usage: AnthropicUsage::default(),
        }
    }

    /// The `message_start` event opening the stream.
    pub(crate) fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: StreamMessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_owned(),
                role: "assistant".to_owned(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage::default(),
            },
        }
    }

    /// Translate one OpenAI chunk. Once the message has stopped, later
    /// input is ignored.
    pub(crate) fn process(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.completed {
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some(error) = &chunk.error {
            events.push(StreamEvent::Error {
                error: StreamErrorData {
                    error_type: "api_error".to_owned(),
                    message: error.message.clone(),
                },
            });
            // The stream still terminates the regular way so clients that
            // only watch for message_stop are not left hanging.
            events.push(StreamEvent::MessageStop);
            self.completed = true;

            return events;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        // The opening role chunk is already covered by message_start.
        if choice.delta.role.is_some() && !self.has_text_content && !self.has_tool_calls {
            return events;
        }

        if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
            if !self.has_text_content {
                events.push(StreamEvent::ContentBlockStart {
                    index: self.content_index,
                    content_block: ResponseBlock::Text { text: String::new() },
                });
                self.has_text_content = true;
            }

            events.push(StreamEvent::ContentBlockDelta {
                index: self.content_index,
                delta: BlockDelta::TextDelta { text: text.to_owned() },
            });
        }

        for call in choice.delta.tool_calls.iter().flatten() {
            let name = call.function.as_ref().and_then(|f| f.name.as_deref());

            if let (Some(id), Some(name)) = (call.id.as_deref(), name) {
                if self.has_text_content {
                    events.push(StreamEvent::ContentBlockStop {
                        index: self.content_index,
                    });
                    self.content_index += 1;
                    self.has_text_content = false;
                }

                // Close a still-open tool block before starting the next
                // one; every start gets exactly one stop.
                if self.has_tool_calls {
                    events.push(StreamEvent::ContentBlockStop {
                        index: self.content_index,
                    });
                    self.content_index += 1;
                }

                events.push(StreamEvent::ContentBlockStart {
                    index: self.content_index,
                    content_block: ResponseBlock::ToolUse {
                        id: id.to_owned(),
                        name: name.to_owned(),
                        input: serde_json::Value::Object(Default::default()),
                    },
                });
                self.has_tool_calls = true;
            }

            if self.has_tool_calls
                && let Some(arguments) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .filter(|a| !a.is_empty())
            {
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.content_index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: arguments.to_owned(),
                    },
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            if let Some(usage) = &chunk.usage {
                self.usage = AnthropicUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                };
            }

            if self.has_text_content || self.has_tool_calls {
                events.push(StreamEvent::ContentBlockStop {
                    index: self.content_index,
                });
            }

            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaData {
                    stop_reason: Some(stop_reason_for(reason).to_owned()),
                    stop_sequence: None,
                },
                usage: self.usage,
            });

            events.push(StreamEvent::MessageStop);
            self.completed = true;
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::openai::{FinishReason, Usage};

    const ID: &str = "cmpl-1";
    const MODEL: &str = "claude-4-sonnet";

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn text_round_trip_produces_the_standard_sequence() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        let mut events = vec![translator.message_start()];
        events.extend(translator.process(&ChatCompletionChunk::role_opening(ID, 0, MODEL)));
        events.extend(translator.process(&ChatCompletionChunk::text(ID, 0, MODEL, "hello")));
        events.extend(translator.process(&ChatCompletionChunk::finish(
            ID,
            0,
            MODEL,
            FinishReason::Stop,
            Usage::new(10, 2),
        )));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let StreamEvent::MessageDelta { delta, usage } = &events[4] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn tool_call_after_text_closes_the_text_block_and_bumps_the_index() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        let mut events = Vec::new();
        events.extend(translator.process(&ChatCompletionChunk::text(ID, 0, MODEL, "let me check")));
        events.extend(translator.process(&ChatCompletionChunk::tool_call(
            ID,
            0,
            MODEL,
            "c1",
            "Bash",
            r#"{"command":"ls"}"#,
        )));
        events.extend(translator.process(&ChatCompletionChunk::finish(
            ID,
            0,
            MODEL,
            FinishReason::ToolCalls,
            Usage::new(1, 1),
        )));

        assert_eq!(
            names(&events),
            vec![
                "content_block_start",  // text, index 0
                "content_block_delta",  // text_delta
                "content_block_stop",   // index 0
                "content_block_start",  // tool_use, index 1
                "content_block_delta",  // input_json_delta
                "content_block_stop",   // index 1
                "message_delta",
                "message_stop",
            ]
        );

        let StreamEvent::ContentBlockStart { index, content_block } = &events[3] else {
            panic!("expected tool_use block start");
        };
        assert_eq!(*index, 1);
        assert!(matches!(content_block, ResponseBlock::ToolUse { name, .. } if name == "Bash"));

        let StreamEvent::ContentBlockDelta { delta, .. } = &events[4] else {
            panic!("expected input_json_delta");
        };
        assert!(matches!(delta, BlockDelta::InputJsonDelta { partial_json } if partial_json.contains("ls")));

        let StreamEvent::MessageDelta { delta, .. } = &events[6] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn consecutive_tool_calls_use_increasing_indices() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        let first = translator.process(&ChatCompletionChunk::tool_call(ID, 0, MODEL, "c1", "Read", "{}"));
        let second = translator.process(&ChatCompletionChunk::tool_call(ID, 0, MODEL, "c2", "Write", "{}"));

        let StreamEvent::ContentBlockStart { index: first_index, .. } = &first[0] else {
            panic!("expected block start");
        };
        assert_eq!(*first_index, 0);

        // The open block closes before the next one starts.
        assert_eq!(names(&second)[..2], ["content_block_stop", "content_block_start"]);

        let StreamEvent::ContentBlockStart { index: second_index, .. } = &second[1] else {
            panic!("expected block start");
        };
        assert_eq!(*second_index, 1);
    }

    #[test]
    fn events_after_message_stop_are_ignored() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        translator.process(&ChatCompletionChunk::finish(ID, 0, MODEL, FinishReason::Stop, Usage::new(1, 1)));
        let late = translator.process(&ChatCompletionChunk::text(ID, 0, MODEL, "too late"));

        assert!(late.is_empty());
    }

    #[test]
    fn fatal_chunks_become_error_events() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        let events = translator.process(&ChatCompletionChunk::fatal(ID, 0, MODEL, "upstream went away"));

        assert_eq!(names(&events), vec!["error", "message_stop"]);

        let StreamEvent::Error { error } = &events[0] else {
            panic!("expected error event");
        };
        assert_eq!(error.error_type, "api_error");
        assert_eq!(error.message, "upstream went away");
    }

    #[test]
    fn every_block_start_is_matched_by_a_stop_before_message_delta() {
        let mut translator = AnthropicTranslator::new(MODEL.to_owned());

        let mut events = Vec::new();
        events.extend(translator.process(&ChatCompletionChunk::text(ID, 0, MODEL, "a")));
        events.extend(translator.process(&ChatCompletionChunk::tool_call(ID, 0, MODEL, "c1", "Read", "{}")));
        events.extend(translator.process(&ChatCompletionChunk::tool_call(ID, 0, MODEL, "c2", "Write", "{}")));
        events.extend(translator.process(&ChatCompletionChunk::finish(
            ID,
            0,
            MODEL,
            FinishReason::ToolCalls,
            Usage::new(1, 1),
        )));

        let mut open: Vec<u32> = Vec::new();
        let mut last_index: Option<u32> = None;

        for event in &events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    if let Some(last) = last_index {
                        assert!(*index > last, "indices must increase monotonically");
                    }
                    last_index = Some(*index);
                    open.push(*index);
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open.pop(), Some(*index));
                }
                StreamEvent::MessageDelta { .. } => {
                    assert!(open.is_empty(), "all blocks must close before message_delta");
                }
                _ => {}
            }
        }
    }
}
