use relay_protocol::anthropic::request::{
    ContentBlockParam, ImageSource, MessageContent, MessageRole, MessagesRequest,
    SystemPrompt, ThinkingConfig, ToolChoice, ToolDef, ToolResultContent,
};
use relay_protocol::openai::request::{
    ChatCompletionsRequest, ChatMessage, FunctionDefinition, GoogleExtraContent, ImageUrl,
    NamedToolChoice, NamedToolChoiceFunction, Reasoning, ReasoningEffort, SystemContent, TextPart,
    TextPartType, ToolCall, ToolCallExtraContent, ToolCallFunction, ToolCallType, ToolChoiceMode,
    ToolChoiceOption, ToolDefinition, ToolDefinitionType, UserContent, UserContentPart,
};

use crate::is_gemini_model;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedRequest {
    pub original_path: String,
    pub new_path: String,
    pub request: ChatCompletionsRequest,
}

/// Convert an Anthropic Messages request into an OpenAI Chat Completions
/// request. The path is rewritten only for the exact Messages endpoints;
/// everything else keeps its path.
pub fn convert_request(request: MessagesRequest, path: &str) -> ConvertedRequest {
    let new_path = if path == "/v1/messages" || path == "/messages" {
        "/chat/completions".to_string()
    } else {
        path.to_string()
    };

    let gemini = is_gemini_model(&request.model);

    let mut messages = Vec::new();
    if let Some(system) = map_system(request.system) {
        messages.push(system);
    }
    for message in &request.messages {
        match message.role {
            MessageRole::User => messages.extend(map_user_message(&message.content)),
            MessageRole::Assistant => messages.push(map_assistant_message(&message.content, gemini)),
        }
    }

    let reasoning = map_reasoning(request.thinking.as_ref(), gemini);

    let converted = ChatCompletionsRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stop: request.stop_sequences,
        tools: map_tools(request.tools),
        tool_choice: map_tool_choice(request.tool_choice),
        reasoning,
        extra: Default::default(),
    };

    ConvertedRequest {
        original_path: path.to_string(),
        new_path,
        request: converted,
    }
}

fn map_system(system: Option<SystemPrompt>) -> Option<ChatMessage> {
    let content = match system? {
        SystemPrompt::Text(text) => SystemContent::Text(text),
        SystemPrompt::Blocks(blocks) => SystemContent::Parts(
            blocks
                .into_iter()
                .map(|block| TextPart {
                    r#type: TextPartType::Text,
                    text: block.text,
                    cache_control: block.cache_control,
                })
                .collect(),
        ),
    };
    Some(ChatMessage::System { content })
}

fn map_user_message(content: &MessageContent) -> Vec<ChatMessage> {
    let blocks = match content {
        // A plain string stays a plain string, even when empty.
        MessageContent::Text(text) => {
            return vec![ChatMessage::User {
                content: UserContent::Text(text.clone()),
            }];
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    // An empty blocks array is still an explicitly empty message; it keeps
    // its turn just like the empty-string form above.
    if blocks.is_empty() {
        return vec![ChatMessage::User {
            content: UserContent::Text(String::new()),
        }];
    }

    let mut output = Vec::new();
    let mut parts = Vec::new();

    for block in blocks {
        match block {
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => output.push(ChatMessage::Tool {
                tool_call_id: tool_use_id.clone(),
                content: serialize_tool_result(content.as_ref()),
            }),
            ContentBlockParam::Text {
                text,
                cache_control,
            } => parts.push(UserContentPart::Text {
                text: text.clone(),
                cache_control: cache_control.clone(),
            }),
            ContentBlockParam::Image { source } => parts.push(UserContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_url(source),
                },
            }),
            // Assistant-only blocks inside a user turn have no Chat
            // Completions counterpart.
            ContentBlockParam::ToolUse { .. }
            | ContentBlockParam::Thinking { .. }
            | ContentBlockParam::RedactedThinking { .. } => {}
        }
    }

    // No content left after splitting out tool results: drop the message.
    if !parts.is_empty() {
        output.push(ChatMessage::User {
            content: UserContent::Parts(parts),
        });
    }
    output
}

fn serialize_tool_result(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Structured(value)) => {
            serde_json::to_string(value).unwrap_or_default()
        }
        None => String::new(),
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        ImageSource::Url { url } => url.clone(),
    }
}

fn map_assistant_message(content: &MessageContent, gemini: bool) -> ChatMessage {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut pending_signature: Option<String> = None;

    match content {
        MessageContent::Text(text) => texts.push(text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlockParam::Text { text, .. } => texts.push(text.clone()),
                    ContentBlockParam::Thinking { signature, .. } => {
                        pending_signature = signature.clone();
                    }
                    ContentBlockParam::ToolUse { id, name, input } => {
                        let extra_content = if gemini {
                            pending_signature.take().map(|thought_signature| {
                                ToolCallExtraContent {
                                    google: Some(GoogleExtraContent {
                                        thought_signature: Some(thought_signature),
                                    }),
                                }
                            })
                        } else {
                            None
                        };
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            r#type: ToolCallType::Function,
                            function: ToolCallFunction {
                                name: name.clone(),
                                arguments: serde_json::to_string(input)
                                    .unwrap_or_else(|_| "{}".to_string()),
                                thought_signature: None,
                            },
                            extra_content,
                        });
                    }
                    ContentBlockParam::Image { .. }
                    | ContentBlockParam::ToolResult { .. }
                    | ContentBlockParam::RedactedThinking { .. } => {}
                }
            }
        }
    }

    ChatMessage::Assistant {
        content: if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    }
}

fn map_tools(tools: Option<Vec<ToolDef>>) -> Option<Vec<ToolDefinition>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .into_iter()
            .map(|tool| ToolDefinition {
                r#type: ToolDefinitionType::Function,
                function: FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                },
            })
            .collect(),
    )
}

fn map_tool_choice(choice: Option<ToolChoice>) -> Option<ToolChoiceOption> {
    Some(match choice? {
        // Chat Completions has no "any"; "auto" is the closest admissible mode.
        ToolChoice::Auto | ToolChoice::Any => ToolChoiceOption::Mode(ToolChoiceMode::Auto),
        ToolChoice::None => ToolChoiceOption::Mode(ToolChoiceMode::None),
        ToolChoice::Tool { name } => ToolChoiceOption::NamedTool(NamedToolChoice {
            r#type: ToolCallType::Function,
            function: NamedToolChoiceFunction { name },
        }),
    })
}

fn map_reasoning(thinking: Option<&ThinkingConfig>, gemini: bool) -> Option<Reasoning> {
    if gemini {
        return None;
    }
    match thinking? {
        ThinkingConfig::Enabled { budget_tokens } => {
            let effort = match budget_tokens {
                Some(budget) if *budget <= 1024 => ReasoningEffort::Low,
                Some(budget) if *budget <= 8192 => ReasoningEffort::Medium,
                Some(_) => ReasoningEffort::High,
                None => ReasoningEffort::Medium,
            };
            Some(Reasoning {
                enabled: true,
                effort,
            })
        }
        ThinkingConfig::Disabled => None,
    }
}
