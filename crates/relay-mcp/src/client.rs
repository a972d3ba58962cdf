//! Protocol client for one provider: handshake, discovery, id-correlated
//! request/reply, and the bounded auto-restart policy.

use relay_core::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Transport;
use crate::types::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    McpToolDef, OutboundMessage, ResourceReadResult, ResourcesListResult, ToolCallResult,
};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// One reconnect attempt per client lifetime; the second consecutive
/// transport failure is terminal.
const MAX_RESTARTS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
    Failed,
}

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Client for a single MCP provider.
pub struct McpClient {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    timeout: Duration,
    auto_restart: bool,
    restart_count: AtomicU32,
    state: RwLock<ClientState>,
    last_error: RwLock<Option<String>>,
    has_resources: AtomicBool,
    tools_cache: RwLock<Vec<McpToolDef>>,
    demux: Mutex<Option<JoinHandle<()>>>,
    /// Serializes reconnect attempts: concurrent callers that find a dead
    /// transport queue here instead of each consuming the restart budget.
    restart_gate: Mutex<()>,
}

impl McpClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        auto_restart: bool,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            timeout,
            auto_restart,
            restart_count: AtomicU32::new(0),
            state: RwLock::new(ClientState::Uninitialized),
            last_error: RwLock::new(None),
            has_resources: AtomicBool::new(false),
            tools_cache: RwLock::new(Vec::new()),
            demux: Mutex::new(None),
            restart_gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_resources(&self) -> bool {
        self.has_resources.load(Ordering::Relaxed)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Why this client last failed, if it has.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Ready with a live transport underneath.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Ready && self.transport.is_alive()
    }

    /// Perform the capability handshake. Valid once, from `Uninitialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        {
            let mut state = self.state.write().await;
            match *state {
                ClientState::Uninitialized => *state = ClientState::Handshaking,
                ClientState::Closed => {
                    return Err(RelayError::ProviderUnavailable(self.name.clone()))
                }
                other => {
                    return Err(RelayError::Protocol(format!(
                        "initialize called in state {other:?}"
                    )))
                }
            }
        }

        self.ensure_demux().await;

        match self.handshake().await {
            Ok(result) => {
                *self.state.write().await = ClientState::Ready;
                info!(
                    server = %self.name,
                    protocol = %result.protocol_version,
                    resources = self.has_resources(),
                    "MCP client ready"
                );
                Ok(result)
            }
            Err(e) => {
                *self.state.write().await = ClientState::Failed;
                *self.last_error.write().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "relay-agent",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        let response = match self.request("initialize", Some(params)).await {
            Ok(response) => response,
            Err(e @ RelayError::Timeout(_)) => return Err(e),
            Err(e) => return Err(RelayError::Handshake(e.to_string())),
        };

        if let Some(error) = response.error {
            return Err(RelayError::Handshake(error.to_string()));
        }
        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| RelayError::Handshake("empty initialize result".into()))?,
        )
        .map_err(|e| RelayError::Handshake(format!("malformed initialize result: {e}")))?;

        if result.protocol_version.is_empty() {
            return Err(RelayError::Handshake(
                "provider reported no protocol version".into(),
            ));
        }
        self.has_resources.store(
            result.capabilities.resources.is_some(),
            Ordering::Relaxed,
        );

        // Fire and forget; some servers never acknowledge notifications.
        let notification =
            JsonRpcNotification::new("notifications/initialized", Some(json!({})));
        if let Err(e) = self
            .transport
            .send(OutboundMessage::Notification(notification))
            .await
        {
            debug!(server = %self.name, error = %e, "initialized notification not delivered");
        }

        Ok(result)
    }

    /// Spawn the demultiplexer if it is not already running. It matches each
    /// inbound reply to its pending slot by id; replies with no matching
    /// entry (late replies after a timeout, duplicates) are discarded. When
    /// the transport fails, every outstanding request is resolved with
    /// `TransportLost` instead of hanging.
    async fn ensure_demux(&self) {
        let mut demux = self.demux.lock().await;
        if demux.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let name = self.name.clone();

        *demux = Some(tokio::spawn(async move {
            loop {
                match transport.receive_one().await {
                    Ok(response) => {
                        let Some(id) = response.id else {
                            debug!(server = %name, "uncorrelated message discarded");
                            continue;
                        };
                        match pending.lock().await.remove(&id) {
                            Some(slot) => {
                                let _ = slot.send(response);
                            }
                            None => {
                                debug!(server = %name, id, "reply with no pending request discarded");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server = %name, error = %e, "transport stream ended");
                        let mut pending = pending.lock().await;
                        for (_, slot) in pending.drain() {
                            // Dropping the sender resolves the waiter with
                            // TransportLost.
                            drop(slot);
                        }
                        break;
                    }
                }
            }
        }));
    }

    /// Send one request and await its correlated reply. Multiple requests may
    /// be in flight at once; replies are matched by id regardless of arrival
    /// order. A timed-out entry is evicted so a late reply cannot resolve the
    /// wrong waiter.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self
            .transport
            .send(OutboundMessage::Request(request))
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::TransportLost),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RelayError::Timeout(self.timeout))
            }
        }
    }

    /// List tools advertised by the provider. Valid only in `Ready`.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.ensure_ready().await?;
        self.list_tools_inner().await
    }

    async fn list_tools_inner(&self) -> Result<Vec<McpToolDef>> {
        let response = self.request("tools/list", None).await?;
        let result: ListToolsResult = decode_result(response, "tools/list")?;
        *self.tools_cache.write().await = result.tools.clone();
        Ok(result.tools)
    }

    /// Call a tool. A JSON-RPC error from the provider surfaces as a
    /// tool-level error, not a client fault.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        self.ensure_ready().await?;

        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request("tools/call", Some(params)).await?;
        if let Some(error) = response.error {
            return Err(RelayError::ToolExecution {
                tool: name.to_string(),
                message: error.to_string(),
            });
        }
        let result: ToolCallResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| RelayError::Protocol("tools/call returned no result".into()))?,
        )
        .map_err(|e| RelayError::Protocol(format!("malformed tools/call result: {e}")))?;
        Ok(result)
    }

    pub async fn list_resources(&self) -> Result<ResourcesListResult> {
        self.ensure_ready().await?;
        let response = self.request("resources/list", None).await?;
        decode_result(response, "resources/list")
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        self.ensure_ready().await?;
        let response = self
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        decode_result(response, "resources/read")
    }

    /// Gate every operation on `Ready`. A dead transport under a `Ready`
    /// client triggers the one-shot reconnect; in-flight calls at the moment
    /// of the crash have already been failed with `TransportLost` and are
    /// not replayed.
    async fn ensure_ready(&self) -> Result<()> {
        let state = *self.state.read().await;
        match state {
            ClientState::Ready => {
                if self.transport.is_alive() {
                    Ok(())
                } else {
                    self.try_restart().await
                }
            }
            ClientState::Closed | ClientState::Failed => {
                Err(RelayError::ProviderUnavailable(self.name.clone()))
            }
            ClientState::Uninitialized | ClientState::Handshaking => Err(RelayError::Protocol(
                format!("client '{}' is not ready", self.name),
            )),
        }
    }

    async fn try_restart(&self) -> Result<()> {
        let _gate = self.restart_gate.lock().await;

        // A concurrent caller may have finished (or failed) the reconnect
        // while we waited for the gate; only one attempt runs per crash.
        match *self.state.read().await {
            ClientState::Ready if self.transport.is_alive() => return Ok(()),
            ClientState::Closed | ClientState::Failed => {
                return Err(RelayError::ProviderUnavailable(self.name.clone()));
            }
            _ => {}
        }

        if !self.auto_restart || self.restart_count.load(Ordering::SeqCst) >= MAX_RESTARTS {
            let reason = if self.auto_restart {
                "transport lost and restart budget exhausted"
            } else {
                "transport lost and auto-restart is disabled"
            };
            *self.state.write().await = ClientState::Failed;
            *self.last_error.write().await = Some(reason.to_string());
            return Err(RelayError::ProviderUnavailable(self.name.clone()));
        }
        self.restart_count.fetch_add(1, Ordering::SeqCst);

        warn!(server = %self.name, "transport lost — attempting one reconnect");

        if let Err(e) = self.transport.reconnect().await {
            *self.state.write().await = ClientState::Failed;
            *self.last_error.write().await = Some(e.to_string());
            return Err(e);
        }

        *self.state.write().await = ClientState::Uninitialized;
        self.initialize().await?;

        let before = self.tools_cache.read().await.len();
        let tools = self.list_tools_inner().await?;
        if tools.len() != before {
            warn!(
                server = %self.name,
                before,
                after = tools.len(),
                "tool list changed across restart"
            );
        }
        info!(server = %self.name, tools = tools.len(), "provider reconnected");
        Ok(())
    }

    /// Close the client and release the transport. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ClientState::Closed {
                return Ok(());
            }
            *state = ClientState::Closed;
        }
        if let Some(handle) = self.demux.lock().await.take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
        self.transport.shutdown().await
    }
}

fn decode_result<T: DeserializeOwned>(response: JsonRpcResponse, method: &str) -> Result<T> {
    if let Some(error) = response.error {
        return Err(RelayError::Protocol(format!("{method} failed: {error}")));
    }
    let result = response
        .result
        .ok_or_else(|| RelayError::Protocol(format!("{method} returned no result")))?;
    serde_json::from_value(result)
        .map_err(|e| RelayError::Protocol(format!("malformed {method} result: {e}")))
}
