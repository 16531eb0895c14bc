use std::collections::BTreeMap;

use relay_protocol::anthropic::response::{ContentBlock, MessageType, ResponseRole, StopReason};
use relay_protocol::anthropic::stream::{
    ContentDelta, MessageDeltaBody, StreamEvent, StreamMessage, StreamUsage,
};
use relay_protocol::openai::response::CompletionUsage;
use relay_protocol::openai::stream::{ChatCompletionsChunk, ToolCallChunk};

use crate::response::map_finish_reason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(u32),
    Thinking(u32),
}

/// Rewrites an OpenAI Chat Completions SSE stream into an Anthropic Messages
/// SSE stream, one chunk at a time.
///
/// Per block the output holds the ordering contract: one
/// `content_block_start`, any number of `content_block_delta`s, one
/// `content_block_stop`; indices strictly increase from 0. The first
/// `finish_reason` closes open blocks; `message_delta` + `message_stop` go
/// out once the final usage chunk arrives (or on [`Self::finish`]).
#[derive(Debug)]
pub struct StreamConverter {
    original_model: String,
    message_started: bool,
    finished: bool,
    pending_stop: Option<StopReason>,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    tool_blocks: BTreeMap<i64, u32>,
    last_usage: Option<StreamUsage>,
}

impl StreamConverter {
    pub fn new(original_model: impl Into<String>) -> Self {
        Self {
            original_model: original_model.into(),
            message_started: false,
            finished: false,
            pending_stop: None,
            next_block_index: 0,
            open_block: None,
            tool_blocks: BTreeMap::new(),
            last_usage: None,
        }
    }

    pub fn transform_chunk(&mut self, chunk: &ChatCompletionsChunk) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            let id = if chunk.id.is_empty() {
                "unknown".to_string()
            } else {
                chunk.id.clone()
            };
            events.push(StreamEvent::MessageStart {
                message: StreamMessage {
                    id,
                    r#type: MessageType::Message,
                    role: ResponseRole::Assistant,
                    content: Vec::new(),
                    model: self.original_model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: StreamUsage::default(),
                },
            });
        }

        let choice = chunk.choices.first();

        if let Some(choice) = choice {
            if let Some(thinking) = choice.delta.reasoning_text()
                && !thinking.is_empty()
            {
                let index = self.ensure_thinking_block(&mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::ThinkingDelta {
                        thinking: thinking.to_string(),
                    },
                });
            }

            if let Some(text) = choice.delta.content.as_ref().filter(|text| !text.is_empty()) {
                let index = self.ensure_text_block(&mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta { text: text.clone() },
                });
            }

            for call in choice.delta.tool_calls.iter().flatten() {
                self.emit_tool_call(call, &mut events);
            }
        }

        if let Some(usage) = chunk.usage.as_ref() {
            self.last_usage = Some(map_usage(usage));
        }

        if let Some(reason) = choice.and_then(|choice| choice.finish_reason.as_deref())
            && self.pending_stop.is_none()
        {
            self.close_open_blocks(&mut events);
            self.pending_stop = Some(map_finish_reason(Some(reason)));
        }

        if chunk.usage.is_some()
            && let Some(reason) = self.pending_stop
        {
            self.emit_stop(reason, &mut events);
        }

        events
    }

    /// End of the upstream stream. Closes anything still open and emits the
    /// terminal events when no trailing usage chunk delivered them.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.message_started || self.finished {
            return events;
        }
        self.close_open_blocks(&mut events);
        let reason = self.pending_stop.unwrap_or(StopReason::EndTurn);
        self.emit_stop(reason, &mut events);
        events
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(OpenBlock::Text(index)) = self.open_block {
            return index;
        }
        self.close_open_blocks_of_kind(events);
        let index = self.allocate_index();
        self.open_block = Some(OpenBlock::Text(index));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        });
        index
    }

    fn ensure_thinking_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(OpenBlock::Thinking(index)) = self.open_block {
            return index;
        }
        self.close_open_blocks_of_kind(events);
        let index = self.allocate_index();
        self.open_block = Some(OpenBlock::Thinking(index));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
        });
        index
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk, events: &mut Vec<StreamEvent>) {
        let index = match self.tool_blocks.get(&call.index) {
            Some(index) => *index,
            None => {
                // A tool call beginning ends any running text/thinking block.
                self.close_open_blocks_of_kind(events);
                let index = self.allocate_index();
                self.tool_blocks.insert(call.index, index);
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolcall-{}", call.index));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
                index
            }
        };

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_ref())
            .filter(|arguments| !arguments.is_empty())
        {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: arguments.clone(),
                },
            });
        }
    }

    fn allocate_index(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn close_open_blocks_of_kind(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(OpenBlock::Text(index) | OpenBlock::Thinking(index)) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_open_blocks_of_kind(events);
        let tool_blocks = std::mem::take(&mut self.tool_blocks);
        for (_, index) in tool_blocks {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn emit_stop(&mut self, reason: StopReason, events: &mut Vec<StreamEvent>) {
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason),
                stop_sequence: None,
            },
            usage: self.last_usage.clone().unwrap_or_default(),
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
    }
}

fn map_usage(usage: &CompletionUsage) -> StreamUsage {
    let cached = usage.cached_tokens();
    StreamUsage {
        input_tokens: Some(usage.prompt_tokens.saturating_sub(cached)),
        output_tokens: Some(usage.completion_tokens),
        cache_read_input_tokens: Some(cached),
    }
}
