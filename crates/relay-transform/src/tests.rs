use serde_json::json;

use relay_protocol::anthropic::request::MessagesRequest;
use relay_protocol::anthropic::response::{ContentBlock, StopReason};
use relay_protocol::anthropic::stream::{ContentDelta, StreamEvent};
use relay_protocol::openai::request::{
    ChatMessage, ReasoningEffort, SystemContent, ToolChoiceMode, ToolChoiceOption, UserContent,
    UserContentPart,
};
use relay_protocol::openai::response::ChatCompletionsResponse;
use relay_protocol::openai::stream::ChatCompletionsChunk;

use super::*;

fn messages_request(value: serde_json::Value) -> MessagesRequest {
    serde_json::from_value(value).expect("request fixture")
}

fn openai_response(value: serde_json::Value) -> ChatCompletionsResponse {
    serde_json::from_value(value).expect("response fixture")
}

fn chunk(value: serde_json::Value) -> ChatCompletionsChunk {
    serde_json::from_value(value).expect("chunk fixture")
}

#[test]
fn messages_path_is_rewritten_to_chat_completions() {
    let request = messages_request(json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let out = convert_request(request.clone(), "/v1/messages");
    assert_eq!(out.new_path, "/chat/completions");
    assert_eq!(out.original_path, "/v1/messages");

    let out = convert_request(request.clone(), "/messages");
    assert_eq!(out.new_path, "/chat/completions");

    let out = convert_request(request, "/v1/messages/count_tokens");
    assert_eq!(out.new_path, "/v1/messages/count_tokens");
}

#[test]
fn tool_result_splits_into_tool_message_then_user_message() {
    // Seed scenario: one tool_result plus one text block, with one tool.
    let request = messages_request(json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 16,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
                {"type": "text", "text": "hi"}
            ]
        }],
        "tools": [{"name": "s", "description": "d", "input_schema": {"q": {"type": "string"}}}]
    }));

    let out = convert_request(request, "/v1/messages");
    assert_eq!(out.new_path, "/chat/completions");
    assert_eq!(out.request.messages.len(), 2);

    match &out.request.messages[0] {
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => {
            assert_eq!(tool_call_id, "t1");
            assert_eq!(content, "ok");
        }
        other => panic!("expected tool message, got {other:?}"),
    }
    match &out.request.messages[1] {
        ChatMessage::User {
            content: UserContent::Parts(parts),
        } => {
            assert_eq!(parts.len(), 1);
            assert!(
                matches!(&parts[0], UserContentPart::Text { text, .. } if text == "hi")
            );
        }
        other => panic!("expected user message, got {other:?}"),
    }

    let tools = out.request.tools.expect("tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].function.name, "s");
    assert_eq!(tools[0].function.description.as_deref(), Some("d"));
    assert_eq!(
        tools[0].function.parameters,
        json!({"q": {"type": "string"}})
    );
}

#[test]
fn structured_tool_result_content_is_json_serialized() {
    let request = messages_request(json!({
        "model": "m",
        "messages": [{
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "t2", "content": [{"type": "text", "text": "a"}]}
            ]
        }]
    }));
    let out = convert_request(request, "/v1/messages");
    match &out.request.messages[0] {
        ChatMessage::Tool { content, .. } => {
            assert_eq!(
                serde_json::from_str::<serde_json::Value>(content).unwrap(),
                json!([{"type": "text", "text": "a"}])
            );
        }
        other => panic!("expected tool message, got {other:?}"),
    }
}

#[test]
fn empty_user_messages_follow_the_drop_rules() {
    // Plain empty string stays an empty user message.
    let request = messages_request(json!({
        "model": "m",
        "messages": [{"role": "user", "content": ""}]
    }));
    let out = convert_request(request, "/v1/messages");
    assert!(matches!(
        &out.request.messages[0],
        ChatMessage::User { content: UserContent::Text(text) } if text.is_empty()
    ));

    // An empty blocks array is explicitly empty too, not droppable.
    let request = messages_request(json!({
        "model": "m",
        "messages": [{"role": "user", "content": []}]
    }));
    let out = convert_request(request, "/v1/messages");
    assert_eq!(out.request.messages.len(), 1);
    assert!(matches!(
        &out.request.messages[0],
        ChatMessage::User { content: UserContent::Text(text) } if text.is_empty()
    ));

    // Blocks that fully split away leave nothing behind.
    let request = messages_request(json!({
        "model": "m",
        "messages": [{
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]
        }]
    }));
    let out = convert_request(request, "/v1/messages");
    assert_eq!(out.request.messages.len(), 1);
    assert!(matches!(&out.request.messages[0], ChatMessage::Tool { .. }));
}

#[test]
fn image_blocks_become_image_url_parts() {
    let request = messages_request(json!({
        "model": "m",
        "messages": [{
            "role": "user",
            "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}},
                {"type": "image", "source": {"type": "url", "url": "https://x.test/a.png"}}
            ]
        }]
    }));
    let out = convert_request(request, "/v1/messages");
    match &out.request.messages[0] {
        ChatMessage::User {
            content: UserContent::Parts(parts),
        } => {
            assert!(matches!(
                &parts[0],
                UserContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,QUJD"
            ));
            assert!(matches!(
                &parts[1],
                UserContentPart::ImageUrl { image_url } if image_url.url == "https://x.test/a.png"
            ));
        }
        other => panic!("expected user message, got {other:?}"),
    }
}

#[test]
fn system_array_form_preserves_cache_control() {
    let request = messages_request(json!({
        "model": "m",
        "system": [
            {"type": "text", "text": "a", "cache_control": {"type": "ephemeral"}},
            {"type": "text", "text": "b"}
        ],
        "messages": []
    }));
    let out = convert_request(request, "/v1/messages");
    match &out.request.messages[0] {
        ChatMessage::System {
            content: SystemContent::Parts(parts),
        } => {
            assert_eq!(parts.len(), 2);
            assert_eq!(parts[0].cache_control, Some(json!({"type": "ephemeral"})));
            assert!(parts[1].cache_control.is_none());
        }
        other => panic!("expected system message, got {other:?}"),
    }
}

#[test]
fn assistant_text_joins_and_tool_use_becomes_tool_calls() {
    let request = messages_request(json!({
        "model": "m",
        "messages": [{
            "role": "assistant",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
                {"type": "tool_use", "id": "tu1", "name": "search", "input": {"q": "rust"}}
            ]
        }]
    }));
    let out = convert_request(request, "/v1/messages");
    match &out.request.messages[0] {
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            assert_eq!(content.as_deref(), Some("first\nsecond"));
            let calls = tool_calls.as_ref().expect("tool calls");
            assert_eq!(calls[0].id, "tu1");
            assert_eq!(calls[0].function.name, "search");
            assert_eq!(calls[0].function.arguments, "{\"q\":\"rust\"}");
            assert!(calls[0].extra_content.is_none());
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
}

#[test]
fn gemini_target_attaches_thought_signature_and_skips_reasoning() {
    let request = messages_request(json!({
        "model": "gemini-2.0-flash",
        "thinking": {"type": "enabled", "budget_tokens": 512},
        "messages": [{
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "hm", "signature": "sig-1"},
                {"type": "tool_use", "id": "tu1", "name": "f", "input": {}}
            ]
        }]
    }));
    let out = convert_request(request, "/v1/messages");
    assert!(out.request.reasoning.is_none());
    match &out.request.messages[0] {
        ChatMessage::Assistant { tool_calls, .. } => {
            let call = &tool_calls.as_ref().unwrap()[0];
            let signature = call
                .extra_content
                .as_ref()
                .and_then(|extra| extra.google.as_ref())
                .and_then(|google| google.thought_signature.as_deref());
            assert_eq!(signature, Some("sig-1"));
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
}

#[test]
fn reasoning_effort_follows_budget_boundaries() {
    let effort = |budget: serde_json::Value| {
        let mut thinking = json!({"type": "enabled"});
        if !budget.is_null() {
            thinking["budget_tokens"] = budget;
        }
        let request = messages_request(json!({
            "model": "gpt-4o",
            "thinking": thinking,
            "messages": []
        }));
        convert_request(request, "/v1/messages")
            .request
            .reasoning
            .expect("reasoning")
            .effort
    };

    assert_eq!(effort(json!(1024)), ReasoningEffort::Low);
    assert_eq!(effort(json!(1025)), ReasoningEffort::Medium);
    assert_eq!(effort(json!(8192)), ReasoningEffort::Medium);
    assert_eq!(effort(json!(8193)), ReasoningEffort::High);
    assert_eq!(effort(serde_json::Value::Null), ReasoningEffort::Medium);
}

#[test]
fn tool_choice_modes_map_across() {
    let choice = |value: serde_json::Value| {
        let request = messages_request(json!({
            "model": "m",
            "tool_choice": value,
            "messages": []
        }));
        convert_request(request, "/v1/messages").request.tool_choice
    };

    assert_eq!(
        choice(json!({"type": "auto"})),
        Some(ToolChoiceOption::Mode(ToolChoiceMode::Auto))
    );
    assert_eq!(
        choice(json!({"type": "any"})),
        Some(ToolChoiceOption::Mode(ToolChoiceMode::Auto))
    );
    assert_eq!(
        choice(json!({"type": "none"})),
        Some(ToolChoiceOption::Mode(ToolChoiceMode::None))
    );
    match choice(json!({"type": "tool", "name": "pick_me"})) {
        Some(ToolChoiceOption::NamedTool(named)) => {
            assert_eq!(named.function.name, "pick_me");
        }
        other => panic!("expected named tool choice, got {other:?}"),
    }
}

#[test]
fn stop_sequences_become_stop_array() {
    let request = messages_request(json!({
        "model": "m",
        "stop_sequences": ["END", "STOP"],
        "messages": []
    }));
    let out = convert_request(request, "/v1/messages");
    assert_eq!(
        out.request.stop,
        Some(vec!["END".to_string(), "STOP".to_string()])
    );
}

#[test]
fn unary_response_round_trips_model_and_tool_ids() {
    let request = messages_request(json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "go"}],
        "tools": [{"name": "s", "input_schema": {}}]
    }));
    let converted = convert_request(request, "/v1/messages");
    assert_eq!(converted.request.model, "claude-3-5-sonnet-20241022");

    // A recorded upstream answer for the converted request.
    let response = openai_response(json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "let me check",
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "s", "arguments": "{\"q\":\"x\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {
            "prompt_tokens": 120,
            "completion_tokens": 30,
            "prompt_tokens_details": {"cached_tokens": 20}
        }
    }));

    let out = convert_response(&response, "claude-3-5-sonnet-20241022");
    assert_eq!(out.id, "chatcmpl-1");
    assert_eq!(out.model, "claude-3-5-sonnet-20241022");
    assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(out.usage.input_tokens, 100);
    assert_eq!(out.usage.output_tokens, 30);
    assert_eq!(out.usage.cache_read_input_tokens, 20);

    assert_eq!(out.content.len(), 2);
    assert!(matches!(
        &out.content[0],
        ContentBlock::Text { text } if text == "let me check"
    ));
    match &out.content[1] {
        ContentBlock::ToolUse { id, name, input } => {
            assert_eq!(id, "call_9");
            assert_eq!(name, "s");
            assert_eq!(input, &json!({"q": "x"}));
        }
        other => panic!("expected tool_use, got {other:?}"),
    }
}

#[test]
fn unparseable_tool_arguments_are_wrapped_not_dropped() {
    let response = openai_response(json!({
        "id": "r",
        "choices": [{
            "message": {
                "tool_calls": [
                    {"id": "a", "type": "function", "function": {"name": "f", "arguments": "{broken"}},
                    {"id": "b", "type": "function", "function": {"name": "g", "arguments": ""}}
                ]
            },
            "finish_reason": "tool_calls"
        }]
    }));
    let out = convert_response(&response, "m");
    match &out.content[0] {
        ContentBlock::ToolUse { input, .. } => {
            assert_eq!(input, &json!({"text": "{broken"}));
        }
        other => panic!("expected tool_use, got {other:?}"),
    }
    match &out.content[1] {
        ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
        other => panic!("expected tool_use, got {other:?}"),
    }
}

#[test]
fn thinking_signature_is_lifted_from_tool_call_extra_content() {
    let response = openai_response(json!({
        "id": "r",
        "choices": [{
            "message": {
                "content": "done",
                "tool_calls": [{
                    "id": "a",
                    "type": "function",
                    "function": {"name": "f", "arguments": "{}"},
                    "extra_content": {"google": {"thought_signature": "sig-x"}}
                }]
            },
            "finish_reason": "stop"
        }]
    }));
    let out = convert_response(&response, "m");
    assert!(matches!(
        &out.content[0],
        ContentBlock::Thinking { signature, thinking } if signature == "sig-x" && thinking.is_empty()
    ));
}

#[test]
fn annotations_emit_server_tool_use_and_search_results() {
    let response = openai_response(json!({
        "id": "r",
        "choices": [{
            "message": {
                "content": "cited",
                "annotations": [
                    {"type": "url_citation", "url_citation": {"url": "https://a.test", "title": "A"}},
                    {"type": "other"}
                ]
            },
            "finish_reason": "stop"
        }]
    }));
    let out = convert_response(&response, "m");
    assert_eq!(out.content.len(), 3);
    let ContentBlock::ServerToolUse { id, name, input } = &out.content[1] else {
        panic!("expected server_tool_use");
    };
    assert!(id.starts_with("srvtoolu_"));
    assert_eq!(name, "web_search");
    assert_eq!(input, &json!({"query": ""}));
    let ContentBlock::WebSearchToolResult {
        tool_use_id,
        content,
    } = &out.content[2]
    else {
        panic!("expected web_search_tool_result");
    };
    assert_eq!(tool_use_id, id);
    assert_eq!(content.len(), 1);
    assert_eq!(content[0].url, "https://a.test");
    assert_eq!(content[0].title, "A");
}

#[test]
fn finish_reason_mapping_covers_unknowns() {
    let stop_for = |reason: serde_json::Value| {
        let response = openai_response(json!({
            "id": "r",
            "choices": [{"message": {"content": "x"}, "finish_reason": reason}]
        }));
        convert_response(&response, "m").stop_reason
    };
    assert_eq!(stop_for(json!("stop")), Some(StopReason::EndTurn));
    assert_eq!(stop_for(json!("")), Some(StopReason::EndTurn));
    assert_eq!(stop_for(json!("who_knows")), Some(StopReason::EndTurn));
    assert_eq!(stop_for(json!("length")), Some(StopReason::MaxTokens));
    assert_eq!(stop_for(json!("tool_calls")), Some(StopReason::ToolUse));
    assert_eq!(
        stop_for(json!("content_filter")),
        Some(StopReason::StopSequence)
    );
}

// ---- streaming ----

fn assert_block_ordering(events: &[StreamEvent]) {
    use std::collections::BTreeSet;
    let mut started = BTreeSet::new();
    let mut stopped = BTreeSet::new();
    let mut last_started: Option<u32> = None;
    for event in events {
        match event {
            StreamEvent::ContentBlockStart { index, .. } => {
                assert!(started.insert(*index), "duplicate start for {index}");
                match last_started {
                    None => assert_eq!(*index, 0, "first block index must be 0"),
                    Some(previous) => {
                        assert_eq!(*index, previous + 1, "indices must be consecutive")
                    }
                }
                last_started = Some(*index);
            }
            StreamEvent::ContentBlockDelta { index, .. } => {
                assert!(started.contains(index), "delta before start for {index}");
                assert!(!stopped.contains(index), "delta after stop for {index}");
            }
            StreamEvent::ContentBlockStop { index } => {
                assert!(started.contains(index), "stop before start for {index}");
                assert!(stopped.insert(*index), "duplicate stop for {index}");
            }
            _ => {}
        }
    }
    assert_eq!(started, stopped, "every started block must be stopped");
}

#[test]
fn stream_text_then_tool_call_keeps_ordering_invariant() {
    let mut converter = StreamConverter::new("claude-3-5-sonnet-20241022");
    let mut events = Vec::new();

    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [{"delta": {"role": "assistant", "content": "Hel"}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [{"delta": {"content": "lo"}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [{"delta": {"tool_calls": [{
            "index": 0,
            "id": "call_1",
            "function": {"name": "s", "arguments": "{\"q\":"}
        }]}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [{"delta": {"tool_calls": [{
            "index": 0,
            "function": {"arguments": "\"x\"}"}
        }]}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "chatcmpl-7",
        "choices": [],
        "usage": {"prompt_tokens": 10, "completion_tokens": 4}
    }))));
    events.extend(converter.finish());

    assert_block_ordering(&events);

    // message_start carries the originally requested model.
    let StreamEvent::MessageStart { message } = &events[0] else {
        panic!("expected message_start first");
    };
    assert_eq!(message.model, "claude-3-5-sonnet-20241022");
    assert_eq!(message.id, "chatcmpl-7");

    // Tool block opens with upstream id and name.
    let tool_start = events.iter().find_map(|event| match event {
        StreamEvent::ContentBlockStart {
            content_block: ContentBlock::ToolUse { id, name, .. },
            index,
        } => Some((*index, id.clone(), name.clone())),
        _ => None,
    });
    assert_eq!(tool_start, Some((1, "call_1".to_string(), "s".to_string())));

    // Aggregated arguments parse as JSON.
    let aggregated: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&aggregated).unwrap(),
        json!({"q": "x"})
    );

    // Terminal events: one message_delta with mapped stop reason and usage,
    // then message_stop, exactly once.
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::MessageDelta { delta, usage } => Some((delta, usage)),
            _ => None,
        })
        .collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].0.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(deltas[0].1.input_tokens, Some(10));
    assert_eq!(deltas[0].1.output_tokens, Some(4));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, StreamEvent::MessageStop))
            .count(),
        1
    );
}

#[test]
fn stream_thinking_deltas_open_a_thinking_block() {
    let mut converter = StreamConverter::new("m");
    let mut events = Vec::new();
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "c",
        "choices": [{"delta": {"reasoning_content": "mull"}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "c",
        "choices": [{"delta": {"content": "answer"}}]
    }))));
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "c",
        "choices": [{"delta": {}, "finish_reason": "stop"}]
    }))));
    events.extend(converter.finish());

    assert_block_ordering(&events);
    assert!(matches!(
        events[1],
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Thinking { .. }
        }
    ));
    assert!(events.iter().any(|event| matches!(
        event,
        StreamEvent::ContentBlockDelta {
            delta: ContentDelta::ThinkingDelta { thinking },
            ..
        } if thinking == "mull"
    )));
    // Thinking block closes before the text block opens.
    let stop0 = events
        .iter()
        .position(|event| matches!(event, StreamEvent::ContentBlockStop { index: 0 }))
        .unwrap();
    let start1 = events
        .iter()
        .position(|event| matches!(event, StreamEvent::ContentBlockStart { index: 1, .. }))
        .unwrap();
    assert!(stop0 < start1);
}

#[test]
fn stream_without_usage_chunk_still_terminates_on_finish() {
    let mut converter = StreamConverter::new("m");
    let mut events = Vec::new();
    events.extend(converter.transform_chunk(&chunk(json!({
        "id": "c",
        "choices": [{"delta": {"content": "hi"}, "finish_reason": "length"}]
    }))));
    events.extend(converter.finish());

    assert_block_ordering(&events);
    let stop_reason = events.iter().find_map(|event| match event {
        StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
        _ => None,
    });
    assert_eq!(stop_reason, Some(StopReason::MaxTokens));
    assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));

    // finish() is idempotent once the stream terminated.
    assert!(converter.finish().is_empty());
}

#[test]
fn stream_tool_call_without_id_synthesizes_one() {
    let mut converter = StreamConverter::new("m");
    let events = converter.transform_chunk(&chunk(json!({
        "id": "c",
        "choices": [{"delta": {"tool_calls": [{"index": 2, "function": {"arguments": "{}"}}]}}]
    })));
    assert!(events.iter().any(|event| matches!(
        event,
        StreamEvent::ContentBlockStart {
            content_block: ContentBlock::ToolUse { id, name, .. },
            ..
        } if id == "toolcall-2" && name == "tool"
    )));
}
