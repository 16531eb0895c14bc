use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use relay_queue::QueueTask;

use crate::config::Provider;
use crate::upstream::HttpMethod;

/// Response head delivered to the client before a stream starts flowing.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// The executor's back-channel to the client connection. The front end owns
/// the receiving halves; only the executor writes, and only until the task
/// resolves. A failed chunk send means the client went away.
#[derive(Debug)]
pub struct ClientSink {
    head: Mutex<Option<oneshot::Sender<ResponseHead>>>,
    body: mpsc::Sender<Bytes>,
}

impl ClientSink {
    pub fn channel(
        buffer: usize,
    ) -> (Self, oneshot::Receiver<ResponseHead>, mpsc::Receiver<Bytes>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(buffer);
        (
            Self {
                head: Mutex::new(Some(head_tx)),
                body: body_tx,
            },
            head_rx,
            body_rx,
        )
    }

    /// First call wins; later calls are no-ops.
    pub fn send_head(&self, head: ResponseHead) {
        if let Some(tx) = self.head.lock().expect("sink head poisoned").take() {
            let _ = tx.send(head);
        }
    }

    pub async fn send_chunk(&self, chunk: Bytes) -> Result<(), ()> {
        self.body.send(chunk).await.map_err(|_| ())
    }

    /// Resolves when the client side dropped its receivers.
    pub async fn closed(&self) {
        self.body.closed().await
    }
}

/// One inbound request from admission to resolution.
pub struct RelayTask {
    pub id: String,
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub provider: Arc<Provider>,
    pub priority: i32,
    pub timeout_override_ms: Option<u64>,
    pub created_at: SystemTime,
    pub sink: ClientSink,
    cancelled: AtomicBool,
    cancelled_reason: Mutex<Option<String>>,
    cancel_token: CancellationToken,
}

impl RelayTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: HttpMethod,
        path: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
        provider: Arc<Provider>,
        priority: i32,
        timeout_override_ms: Option<u64>,
        sink: ClientSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            headers,
            body,
            provider,
            priority,
            timeout_override_ms,
            created_at: SystemTime::now(),
            sink,
            cancelled: AtomicBool::new(false),
            cancelled_reason: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancelled_reason(&self) -> Option<String> {
        self.cancelled_reason
            .lock()
            .expect("task reason poisoned")
            .clone()
    }

    /// Target URL for this task: provider base plus the request path.
    pub fn target_url(&self) -> String {
        format!("{}{}", self.provider.base_url, self.path)
    }
}

impl QueueTask for RelayTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn timeout_override_ms(&self) -> Option<u64> {
        self.timeout_override_ms
    }

    fn cancel(&self, reason: &str) {
        self.cancelled.store(true, Ordering::SeqCst);
        *self
            .cancelled_reason
            .lock()
            .expect("task reason poisoned") = Some(reason.to_string());
        self.cancel_token.cancel();
    }
}
