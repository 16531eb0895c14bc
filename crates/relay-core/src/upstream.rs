use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use relay_common::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// Streamed bodies deliver `Err` as a terminal item when the upstream dies
/// mid-stream, so consumers can tell a clean end from a timeout or a read
/// error. The channel closes after the sentinel.
#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, RelayError>>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn is_event_stream(&self) -> bool {
        header_value(&self.headers, "content-type")
            .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// One upstream attempt. Implementations must surface body bytes as a
/// stream when the response is an event stream, and abort the connection
/// when the returned receiver or future is dropped.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, RelayError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Socket-level bound once a request is running; also the idle bound
    /// between stream chunks.
    pub socket_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_millis(crate::config::DEFAULT_SOCKET_TIMEOUT_MS),
        }
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: wreq::Client,
    socket_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.socket_timeout)
            .build()?;
        Ok(Self {
            client,
            socket_timeout: config.socket_timeout,
        })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, RelayError>> + Send + 'a>> {
        Box::pin(async move {
            let method = http_method_to_wreq(request.method);
            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_wreq_error)?;
            let status = response.status().as_u16();
            let headers = headers_from_wreq(response.headers());

            let is_event_stream = header_value(&headers, "content-type")
                .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
                .unwrap_or(false);
            if !is_event_stream {
                let body = response.bytes().await.map_err(map_wreq_error)?;
                return Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            // Bridge the byte stream through a channel; dropping the
            // receiver tears down the forwarding task and with it the
            // upstream connection. A timeout or read error is reported as a
            // terminal `Err` item, never as a silent close.
            let (tx, rx) = mpsc::channel::<Result<Bytes, RelayError>>(16);
            let idle_timeout = self.socket_timeout;
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                loop {
                    let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                    let item = match next {
                        Ok(item) => item,
                        Err(_) => {
                            let _ = tx.send(Err(RelayError::UpstreamTimeout)).await;
                            break;
                        }
                    };
                    let Some(item) = item else {
                        // Upstream finished cleanly.
                        break;
                    };
                    match item {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(map_wreq_error(err))).await;
                            break;
                        }
                    }
                }
            });

            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> wreq::Method {
    match method {
        HttpMethod::Get => wreq::Method::GET,
        HttpMethod::Post => wreq::Method::POST,
        HttpMethod::Put => wreq::Method::PUT,
        HttpMethod::Patch => wreq::Method::PATCH,
        HttpMethod::Delete => wreq::Method::DELETE,
        HttpMethod::Head => wreq::Method::HEAD,
        HttpMethod::Options => wreq::Method::OPTIONS,
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> RelayError {
    if err.is_timeout() {
        return RelayError::UpstreamTimeout;
    }
    RelayError::UpstreamNetwork {
        cause: err.to_string(),
    }
}
