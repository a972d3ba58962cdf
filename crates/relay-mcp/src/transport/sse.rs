//! SSE transport: outbound frames over HTTP POST, inbound frames on a
//! persistent event stream.

use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{RelayError, Result};
use reqwest_eventsource::{Event, EventSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Transport;
use crate::config::resolve_env_value;
use crate::types::{JsonRpcResponse, OutboundMessage};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;
const OPEN_WAIT: Duration = Duration::from_secs(2);
const OPEN_POLL: Duration = Duration::from_millis(50);

/// Transport over a persistent SSE stream plus an HTTP message endpoint.
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    tx: Mutex<mpsc::Sender<JsonRpcResponse>>,
    rx: Mutex<mpsc::Receiver<JsonRpcResponse>>,
    alive: Arc<AtomicBool>,
    /// Endpoint announced by the server's `endpoint` event, when present.
    messages_url: Arc<RwLock<Option<String>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl SseTransport {
    /// Open the event stream and wait briefly for the connection to settle.
    pub async fn connect(
        url: impl Into<String>,
        headers: HashMap<String, String>,
        timeout_ms: u64,
    ) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(RelayError::Config(format!(
                "SSE URL must be http(s), got '{url}'"
            )));
        }

        let http = build_http_client(&headers, timeout_ms)?;
        let alive = Arc::new(AtomicBool::new(false));
        let messages_url = Arc::new(RwLock::new(None));

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let handle = start_listener(
            &http,
            &url,
            tx.clone(),
            Arc::clone(&alive),
            Arc::clone(&messages_url),
        );

        let transport = Self {
            url,
            headers,
            http,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            alive,
            messages_url,
            listener: Mutex::new(Some(handle)),
        };
        transport.wait_for_open().await;
        Ok(transport)
    }

    async fn wait_for_open(&self) {
        let deadline = tokio::time::Instant::now() + OPEN_WAIT;
        while !self.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(OPEN_POLL).await;
        }
        if !self.is_alive() {
            warn!(url = %self.url, "SSE stream not open yet — continuing anyway");
        }
    }

    async fn post_target(&self) -> String {
        match self.messages_url.read().await.as_ref() {
            Some(url) => url.clone(),
            None => format!("{}/messages", self.url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let target = self.post_target().await;
        let response = self
            .http
            .post(&target)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                self.alive.store(false, Ordering::Relaxed);
                RelayError::Transport(format!("POST to {target} failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "provider returned HTTP {status} from {target}"
            )));
        }

        // Some servers answer inline instead of on the event stream; route
        // those through the same channel so correlation stays in one place.
        if let Ok(body) = response.text().await {
            if let Ok(reply) = serde_json::from_str::<JsonRpcResponse>(&body) {
                if reply.id.is_some() {
                    let _ = self.tx.lock().await.send(reply).await;
                }
            }
        }
        Ok(())
    }

    async fn receive_one(&self) -> Result<JsonRpcResponse> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            self.alive.store(false, Ordering::Relaxed);
            RelayError::Transport(format!("SSE stream to {} closed", self.url))
        })
    }

    async fn reconnect(&self) -> Result<()> {
        info!(url = %self.url, "reopening SSE stream");
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let handle = start_listener(
            &self.http,
            &self.url,
            tx.clone(),
            Arc::clone(&self.alive),
            Arc::clone(&self.messages_url),
        );
        *self.tx.lock().await = tx;
        *self.rx.lock().await = rx;
        *self.listener.lock().await = Some(handle);

        self.wait_for_open().await;
        if self.is_alive() {
            Ok(())
        } else {
            Err(RelayError::Transport(format!(
                "SSE stream to {} did not reopen",
                self.url
            )))
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

fn build_http_client(headers: &HashMap<String, String>, timeout_ms: u64) -> Result<reqwest::Client> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let resolved = resolve_env_value(value);
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| RelayError::Config(format!("invalid header name '{key}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(&resolved)
            .map_err(|e| RelayError::Config(format!("invalid header value for '{key}': {e}")))?;
        default_headers.insert(name, value);
    }

    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .default_headers(default_headers)
        .build()
        .map_err(|e| RelayError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Spawn the event-stream reader. Frames arrive as `message` events; an
/// `endpoint` event announces where outbound POSTs should go.
fn start_listener(
    http: &reqwest::Client,
    url: &str,
    tx: mpsc::Sender<JsonRpcResponse>,
    alive: Arc<AtomicBool>,
    messages_url: Arc<RwLock<Option<String>>>,
) -> JoinHandle<()> {
    let sse_url = if url.ends_with("/sse") {
        url.to_string()
    } else {
        format!("{}/sse", url.trim_end_matches('/'))
    };
    let base_url = url.trim_end_matches('/').to_string();
    let request = http.get(&sse_url);

    tokio::spawn(async move {
        let mut stream = match EventSource::new(request) {
            Ok(stream) => stream,
            Err(e) => {
                error!(url = %sse_url, error = %e, "failed to open SSE stream");
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Open) => {
                    info!(url = %sse_url, "SSE stream open");
                    alive.store(true, Ordering::Relaxed);
                }
                Ok(Event::Message(msg)) => {
                    if msg.event == "endpoint" {
                        let endpoint = format!("{base_url}{}", msg.data);
                        debug!(endpoint = %endpoint, "discovered messages endpoint");
                        *messages_url.write().await = Some(endpoint);
                    } else if msg.event == "message" || msg.event.is_empty() {
                        match serde_json::from_str::<JsonRpcResponse>(&msg.data) {
                            Ok(response) => {
                                if tx.send(response).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "SSE payload was not JSON-RPC — skipped");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %sse_url, error = %e, "SSE stream error");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
        alive.store(false, Ordering::Relaxed);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let err = SseTransport::connect("ftp://example.com", HashMap::new(), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn invalid_header_names_are_config_errors() {
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_string(), "x".to_string());
        let err = build_http_client(&headers, 1_000).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
