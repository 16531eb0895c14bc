use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use relay_common::{RelayError, RelayResult};
use relay_protocol::anthropic::request::MessagesRequest;
use relay_protocol::openai::response::ChatCompletionsResponse;
use relay_protocol::openai::stream::ChatCompletionsChunk;
use relay_protocol::sse::{SseEvent, SseParser, encode_event};
use relay_queue::{ProxyResult, TaskExecutor};
use relay_transform::{StreamConverter, convert_request, convert_response};

use crate::config::{ProviderMode, ProviderType};
use crate::task::{RelayTask, ResponseHead};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};

/// Performs the single upstream attempt for an admitted task: header
/// rewrite, optional format conversion, the upstream exchange, and the
/// streamed or buffered reply, all bound to the task's cancellation handle.
pub struct RelayExecutor {
    client: Arc<dyn UpstreamClient>,
}

impl RelayExecutor {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

impl TaskExecutor for RelayExecutor {
    type Task = RelayTask;

    fn execute(
        &self,
        task: Arc<RelayTask>,
    ) -> Pin<Box<dyn Future<Output = RelayResult<ProxyResult>> + Send>> {
        let client = self.client.clone();
        Box::pin(async move { run(client, task).await })
    }
}

struct PreparedRequest {
    path: String,
    body: Option<Bytes>,
    /// Set when the body was translated to the Chat Completions dialect.
    converted: bool,
    /// Model name as the client sent it, when mapping or conversion touched
    /// the body.
    original_model: Option<String>,
}

async fn run(client: Arc<dyn UpstreamClient>, task: Arc<RelayTask>) -> RelayResult<ProxyResult> {
    let started = Instant::now();

    let prepared = prepare_request(&task)?;
    let request = UpstreamRequest {
        method: task.method,
        url: format!("{}{}", task.provider.base_url, prepared.path),
        headers: build_headers(&task),
        body: prepared.body.clone(),
    };

    tracing::debug!(
        task = %task.id,
        provider = %task.provider.id,
        url = %request.url,
        converted = prepared.converted,
        "dispatching upstream"
    );

    let response = tokio::select! {
        _ = task.cancel_token().cancelled() => return Err(cancel_error(&task)),
        response = client.send(request) => response?,
    };

    if response.is_event_stream() {
        stream_response(&task, response, &prepared, started).await
    } else {
        buffered_response(&task, response, &prepared, started).await
    }
}

/// Model mapping and, for OpenAI-typed providers on the Messages endpoints,
/// the Anthropic→OpenAI body conversion with the path rewrite.
fn prepare_request(task: &RelayTask) -> RelayResult<PreparedRequest> {
    let unchanged = PreparedRequest {
        path: task.path.clone(),
        body: (!task.body.is_empty()).then(|| task.body.clone()),
        converted: false,
        original_model: None,
    };

    if task.body.is_empty() {
        return Ok(unchanged);
    }

    let messages_path = task.path == "/v1/messages" || task.path == "/messages";
    if task.provider.provider_type == ProviderType::Openai && messages_path {
        let mut parsed: MessagesRequest = serde_json::from_slice(&task.body)
            .map_err(|_| RelayError::ConverterInvalid {
                field: "request body".to_string(),
            })?;
        let original_model = parsed.model.clone();
        if let Some(mapped) = task
            .provider
            .resolve_model(&parsed.model, parsed.has_image_content())
        {
            parsed.model = mapped.to_string();
        }
        let converted = convert_request(parsed, &task.path);
        let body = serde_json::to_vec(&converted.request)
            .map_err(|_| RelayError::ConverterInvalid {
                field: "request body".to_string(),
            })?;
        return Ok(PreparedRequest {
            path: converted.new_path,
            body: Some(Bytes::from(body)),
            converted: true,
            original_model: Some(original_model),
        });
    }

    // Anthropic-typed providers still get model mapping, applied to the raw
    // JSON so unknown shapes pass through untouched.
    if task.provider.model_map.is_empty() && task.provider.vl_model_map.is_empty() {
        return Ok(unchanged);
    }
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&task.body) else {
        return Ok(unchanged);
    };
    let Some(model) = value.get("model").and_then(|model| model.as_str()) else {
        return Ok(unchanged);
    };
    let model = model.to_string();
    let Some(mapped) = task.provider.resolve_model(&model, value_has_image(&value)) else {
        return Ok(unchanged);
    };
    value["model"] = serde_json::Value::String(mapped.to_string());
    let body = serde_json::to_vec(&value).map_err(|_| RelayError::ConverterInvalid {
        field: "request body".to_string(),
    })?;
    Ok(PreparedRequest {
        path: task.path.clone(),
        body: Some(Bytes::from(body)),
        converted: false,
        original_model: Some(model),
    })
}

fn value_has_image(value: &serde_json::Value) -> bool {
    let Some(messages) = value.get("messages").and_then(|messages| messages.as_array()) else {
        return false;
    };
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(|content| content.as_array())
            .map(|blocks| {
                blocks.iter().any(|block| {
                    block.get("type").and_then(|kind| kind.as_str()) == Some("image")
                })
            })
            .unwrap_or(false)
    })
}

/// Rebuild outbound headers: hop-by-hop and framing headers dropped, caller
/// auth stripped and replaced in inject mode, `accept-encoding: identity`
/// always, provider statics last.
fn build_headers(task: &RelayTask) -> Vec<(String, String)> {
    let provider = &task.provider;
    let mut out = Vec::new();

    for (name, value) in &task.headers {
        let name = name.to_ascii_lowercase();
        if matches!(
            name.as_str(),
            "host" | "content-length" | "accept-encoding" | "connection" | "transfer-encoding"
        ) {
            continue;
        }
        if provider.mode == ProviderMode::Inject && is_auth_header(&name, &provider.auth_header) {
            continue;
        }
        out.push((name, value.clone()));
    }

    out.push(("accept-encoding".to_string(), "identity".to_string()));

    if provider.mode == ProviderMode::Inject
        && let Some(api_key) = &provider.api_key
    {
        out.push((provider.auth_header.clone(), auth_value(&provider.auth_header, api_key)));
    }

    for (name, value) in &provider.headers {
        out.retain(|(existing, _)| existing != name);
        out.push((name.clone(), value.clone()));
    }

    out
}

fn is_auth_header(name: &str, provider_auth_header: &str) -> bool {
    name == "authorization" || name == "x-api-key" || name == provider_auth_header
}

fn auth_value(header: &str, api_key: &str) -> String {
    if header == "authorization" && !api_key.to_ascii_lowercase().starts_with("bearer ") {
        format!("Bearer {api_key}")
    } else {
        api_key.to_string()
    }
}

fn cancel_error(task: &RelayTask) -> RelayError {
    RelayError::cancelled(
        task.cancelled_reason()
            .unwrap_or_else(|| "cancelled".to_string()),
    )
}

async fn buffered_response(
    task: &RelayTask,
    response: UpstreamResponse,
    prepared: &PreparedRequest,
    started: Instant,
) -> RelayResult<ProxyResult> {
    let UpstreamResponse {
        status,
        mut headers,
        body,
    } = response;
    let bytes = match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            // A non-SSE body surfaced as a stream: accumulate it.
            let mut buffer = Vec::new();
            while let Some(chunk) = rx.recv().await {
                buffer.extend_from_slice(&chunk?);
            }
            Bytes::from(buffer)
        }
    };

    let success = (200..300).contains(&status);
    let bytes = if prepared.converted && success {
        let parsed: ChatCompletionsResponse =
            serde_json::from_slice(&bytes).map_err(|_| RelayError::ConverterInvalid {
                field: "response body".to_string(),
            })?;
        let original_model = prepared.original_model.as_deref().unwrap_or_default();
        let message = convert_response(&parsed, original_model);
        let body = serde_json::to_vec(&message).map_err(|_| RelayError::ConverterInvalid {
            field: "response body".to_string(),
        })?;
        set_header(&mut headers, "content-type", "application/json");
        Bytes::from(body)
    } else if success && !prepared.converted {
        restore_model(bytes, prepared.original_model.as_deref())
    } else {
        bytes
    };

    Ok(ProxyResult {
        status,
        headers,
        body: Some(bytes),
        streamed: false,
        duration: started.elapsed(),
    })
}

/// Patch the mapped model name back to what the client asked for. Best
/// effort: anything that is not a JSON object with a model field passes
/// through unchanged.
fn restore_model(bytes: Bytes, original_model: Option<&str>) -> Bytes {
    let Some(original) = original_model else {
        return bytes;
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return bytes;
    };
    if value.get("model").is_none() {
        return bytes;
    }
    value["model"] = serde_json::Value::String(original.to_string());
    match serde_json::to_vec(&value) {
        Ok(patched) => Bytes::from(patched),
        Err(_) => bytes,
    }
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

async fn stream_response(
    task: &RelayTask,
    response: UpstreamResponse,
    prepared: &PreparedRequest,
    started: Instant,
) -> RelayResult<ProxyResult> {
    let UpstreamResponse {
        status,
        headers,
        body,
    } = response;
    let UpstreamBody::Stream(mut rx) = body else {
        return Err(RelayError::UpstreamNetwork {
            cause: "expected a stream body".to_string(),
        });
    };

    task.sink.send_head(ResponseHead {
        status,
        headers: headers.clone(),
    });

    let mut rewriter = prepared.converted.then(|| {
        SseRewriter::new(
            prepared
                .original_model
                .clone()
                .unwrap_or_default(),
        )
    });

    loop {
        let chunk = tokio::select! {
            _ = task.cancel_token().cancelled() => return Err(cancel_error(task)),
            // Dropping `rx` on this path aborts the upstream connection.
            _ = task.sink.closed() => return Err(RelayError::ClientDisconnected),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        // A mid-stream timeout or read error fails the task; a bare close
        // is a clean upstream finish.
        let chunk = chunk?;

        match &mut rewriter {
            None => {
                if task.sink.send_chunk(chunk).await.is_err() {
                    return Err(RelayError::ClientDisconnected);
                }
            }
            Some(rewriter) => {
                for out in rewriter.push(&chunk) {
                    if task.sink.send_chunk(out).await.is_err() {
                        return Err(RelayError::ClientDisconnected);
                    }
                }
            }
        }
    }

    if let Some(rewriter) = &mut rewriter {
        for out in rewriter.finish() {
            if task.sink.send_chunk(out).await.is_err() {
                return Err(RelayError::ClientDisconnected);
            }
        }
    }

    Ok(ProxyResult {
        status,
        headers,
        body: None,
        streamed: true,
        duration: started.elapsed(),
    })
}

/// OpenAI SSE in, Anthropic SSE out. Wraps the stateless stream converter
/// with SSE framing on both sides.
struct SseRewriter {
    parser: SseParser,
    converter: StreamConverter,
    done: bool,
}

impl SseRewriter {
    fn new(original_model: String) -> Self {
        Self {
            parser: SseParser::new(),
            converter: StreamConverter::new(original_model),
            done: false,
        }
    }

    fn push(&mut self, chunk: &Bytes) -> Vec<Bytes> {
        let events = self.parser.push_bytes(chunk);
        self.rewrite(events)
    }

    fn finish(&mut self) -> Vec<Bytes> {
        let events = self.parser.finish();
        let mut out = self.rewrite(events);
        if !self.done {
            out.extend(encode_events(self.converter.finish()));
            self.done = true;
        }
        out
    }

    fn rewrite(&mut self, events: Vec<SseEvent>) -> Vec<Bytes> {
        let mut out = Vec::new();
        for event in events {
            if self.done {
                break;
            }
            if event.is_done() {
                out.extend(encode_events(self.converter.finish()));
                self.done = true;
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<ChatCompletionsChunk>(&event.data) else {
                // Keep-alive comments and unknown payloads are dropped, not
                // forwarded half-translated.
                continue;
            };
            out.extend(encode_events(self.converter.transform_chunk(&chunk)));
        }
        out
    }
}

fn encode_events(
    events: Vec<relay_protocol::anthropic::stream::StreamEvent>,
) -> Vec<Bytes> {
    events
        .into_iter()
        .filter_map(|event| {
            let data = serde_json::to_string(&event).ok()?;
            Some(encode_event(Some(event.event_name()), &data))
        })
        .collect()
}
