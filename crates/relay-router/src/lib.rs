//! HTTP front end: accepts inbound client traffic on a catch-all route,
//! consults the router and queue selector, submits tasks, and translates
//! results (buffered, streamed, or failed) back to the client.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

use relay_common::{ErrorBody, RelayError};
use relay_core::{
    ClientSink, HttpMethod, QueueSelector, RelayState, RelayTask, ResponseHead, RouteAction,
};
use relay_queue::{ProxyResult, QueueStats};

#[derive(Clone)]
pub struct RelayService {
    pub state: Arc<RelayState>,
    pub selector: Arc<QueueSelector>,
}

pub fn relay_router(service: RelayService) -> Router {
    Router::new()
        .route("/relay/_stats", get(queue_stats))
        .fallback(handle)
        .with_state(service)
}

#[derive(Serialize)]
struct QueueStatsEntry {
    name: String,
    #[serde(flatten)]
    stats: QueueStats,
}

async fn queue_stats(State(service): State<RelayService>) -> Response {
    let entries: Vec<QueueStatsEntry> = service
        .selector
        .managers()
        .iter()
        .map(|manager| QueueStatsEntry {
            name: manager.name().to_string(),
            stats: manager.stats(),
        })
        .collect();
    axum::Json(entries).into_response()
}

async fn handle(
    State(service): State<RelayService>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    // Block rules short-circuit before any queue is involved.
    let provider = match service.state.config().rules.action(&path) {
        RouteAction::Block { status, body } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, body).into_response();
        }
        RouteAction::Passthrough => service.state.passthrough_provider(),
        RouteAction::Proxy => match service.state.current_provider() {
            Some(provider) => provider,
            None => {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody {
                        error: "no provider selected".to_string(),
                        code: None,
                    },
                );
            }
        },
    };

    let Some(method) = HttpMethod::parse(method.as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let priority = header_priority(&headers);

    let (sink, mut head_rx, body_rx) = ClientSink::channel(32);
    let task = RelayTask::new(
        method,
        path.clone(),
        headers_to_vec(&headers),
        body,
        provider,
        priority,
        None,
        sink,
    );

    let manager = service.selector.select(&path).clone();

    // Client disconnect while the task is still queued cancels it; for a
    // settled task this is a no-op.
    {
        let manager = manager.clone();
        let task = task.clone();
        tokio::spawn(async move {
            task.sink.closed().await;
            manager.cancel_task(&task.id, "Client disconnected");
        });
    }

    let mut submit = tokio::spawn({
        let manager = manager.clone();
        let task = task.clone();
        async move { manager.submit(task).await }
    });

    tokio::select! {
        head = &mut head_rx => match head {
            // Upstream started streaming: forward head and pipe the body.
            // The submit handle keeps driving in the background.
            Ok(head) => streaming_response(head, body_rx),
            // Sink dropped without a head; the result tells the story.
            Err(_) => buffered_outcome((&mut submit).await),
        },
        result = &mut submit => buffered_outcome(result),
    }
}

fn buffered_outcome(
    result: Result<Result<ProxyResult, RelayError>, tokio::task::JoinError>,
) -> Response {
    match result {
        Ok(Ok(outcome)) => buffered_response(outcome),
        Ok(Err(err)) => relay_error_response(&err),
        Err(join_err) => {
            tracing::error!(error = %join_err, "task driver panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn buffered_response(outcome: ProxyResult) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers) = builder.headers_mut() {
        append_headers(headers, &outcome.headers, false);
    }
    builder
        .body(Body::from(outcome.body.unwrap_or_default()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn streaming_response(head: ResponseHead, body_rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK));
    if let Some(headers) = builder.headers_mut() {
        append_headers(headers, &head.headers, true);
    }
    let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn relay_error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, ErrorBody::from_error(err))
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, axum::Json(body)).into_response()
}

fn append_headers(target: &mut HeaderMap, headers: &[(String, String)], streaming: bool) {
    for (name, value) in headers {
        // Hyper computes framing itself; hop-by-hop headers never forward.
        if is_hop_by_hop_or_framing_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.append(name, value);
        }
    }
    if streaming && is_event_stream(target) {
        // Hint intermediaries not to buffer SSE.
        target
            .entry(header::CACHE_CONTROL)
            .or_insert(HeaderValue::from_static("no-cache"));
        target
            .entry(HeaderName::from_static("x-accel-buffering"))
            .or_insert(HeaderValue::from_static("no"));
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn header_priority(headers: &HeaderMap) -> i32 {
    headers
        .get("x-relay-priority")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}
