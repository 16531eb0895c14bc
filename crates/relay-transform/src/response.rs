use relay_protocol::anthropic::response::{
    ContentBlock, MessageType, MessagesResponse, ResponseRole, StopReason, Usage,
    WebSearchResult, WebSearchResultType,
};
use relay_protocol::openai::response::{
    ChatCompletionsResponse, CompletionUsage, ResponseMessage,
};
use relay_protocol::openai::request::ToolCall;

/// Convert a buffered OpenAI Chat Completions response into an Anthropic
/// Messages response. `original_model` is the model name the client asked
/// for, echoed back regardless of any model mapping applied on the way out.
pub fn convert_response(
    response: &ChatCompletionsResponse,
    original_model: &str,
) -> MessagesResponse {
    let message = response
        .choices
        .first()
        .map(|choice| &choice.message)
        .cloned()
        .unwrap_or_default();
    let finish_reason = response
        .choices
        .first()
        .and_then(|choice| choice.finish_reason.as_deref());

    let content = map_content(&message);

    MessagesResponse {
        id: response.id.clone(),
        r#type: MessageType::Message,
        role: ResponseRole::Assistant,
        content,
        model: original_model.to_string(),
        stop_reason: Some(map_finish_reason(finish_reason)),
        stop_sequence: None,
        usage: map_usage(response.usage.as_ref()),
    }
}

fn map_content(message: &ResponseMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(block) = map_thinking(message) {
        blocks.push(block);
    }

    if let Some(text) = message.content.as_ref().filter(|text| !text.is_empty()) {
        blocks.push(ContentBlock::Text { text: text.clone() });
    }

    for call in message.tool_calls.iter().flatten() {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: parse_tool_arguments(&call.function.arguments),
        });
    }

    if let Some(annotations) = message
        .annotations
        .as_ref()
        .filter(|annotations| !annotations.is_empty())
    {
        let tool_use_id = format!("srvtoolu_{}", uuid::Uuid::new_v4().simple());
        blocks.push(ContentBlock::ServerToolUse {
            id: tool_use_id.clone(),
            name: "web_search".to_string(),
            input: serde_json::json!({ "query": "" }),
        });
        let results = annotations
            .iter()
            .filter_map(|annotation| annotation.url_citation.as_ref())
            .map(|citation| WebSearchResult {
                r#type: WebSearchResultType::WebSearchResult,
                url: citation.url.clone(),
                title: citation.title.clone(),
            })
            .collect();
        blocks.push(ContentBlock::WebSearchToolResult {
            tool_use_id,
            content: results,
        });
    }

    blocks
}

fn map_thinking(message: &ResponseMessage) -> Option<ContentBlock> {
    let signature = message
        .thinking
        .as_ref()
        .and_then(|thinking| thinking.signature.clone())
        .or_else(|| {
            message
                .tool_calls
                .iter()
                .flatten()
                .find_map(tool_call_thought_signature)
        })?;
    let thinking = message
        .thinking
        .as_ref()
        .and_then(|thinking| thinking.content.clone())
        .unwrap_or_default();
    Some(ContentBlock::Thinking {
        thinking,
        signature,
    })
}

fn tool_call_thought_signature(call: &ToolCall) -> Option<String> {
    call.extra_content
        .as_ref()
        .and_then(|extra| extra.google.as_ref())
        .and_then(|google| google.thought_signature.clone())
        .or_else(|| call.function.thought_signature.clone())
}

/// Tool arguments arrive as a JSON string. An unparseable string is wrapped
/// rather than dropped so the receiver still sees what the model produced.
pub(crate) fn parse_tool_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| serde_json::json!({ "text": arguments }))
}

pub(crate) fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        Some("content_filter") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

fn map_usage(usage: Option<&CompletionUsage>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    let cached = usage.cached_tokens();
    Usage {
        input_tokens: usage.prompt_tokens.saturating_sub(cached),
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: cached,
    }
}
