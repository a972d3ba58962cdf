//! Provider supervision: builds clients over transports, aggregates bridged
//! tools into the shared registry, and tracks per-provider health.

use relay_core::Result;
use relay_tools::{Tool, ToolRegistry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bridge::{McpBridgedTool, McpListResourcesTool, McpReadResourceTool};
use crate::client::McpClient;
use crate::config::{McpConfig, McpServerConfig, ServerEndpoint};
use crate::transport::{SseTransport, StdioTransport, Transport};

/// Per-provider health, readable at any time without provider I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub server: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub restart_count: u32,
}

/// Owns every provider's client and transport. Bridged tools hold shared
/// references to clients, but lifetime control stays here.
pub struct McpManager {
    providers: RwLock<HashMap<String, Arc<McpClient>>>,
    health: RwLock<HashMap<String, HealthRecord>>,
}

impl McpManager {
    /// Connect every enabled provider and register its bridged tools.
    ///
    /// Each provider is initialized inside its own error boundary: one that
    /// fails to spawn, handshake, or discover is recorded as unhealthy and
    /// skipped, never blocking the others. Partial success is the normal
    /// outcome, so this never fails as a whole.
    pub async fn create_tools(config: &McpConfig, registry: &ToolRegistry) -> Self {
        let manager = Self {
            providers: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
        };

        for (name, server_config) in config.enabled_servers() {
            match connect_provider(name, server_config).await {
                Ok((client, tools)) => {
                    if let Err(reason) = register_provider_tools(registry, &tools) {
                        warn!(server = name, %reason, "provider skipped");
                        let _ = client.shutdown().await;
                        manager.record_failure(name, reason).await;
                        continue;
                    }
                    info!(server = name, tools = tools.len(), "MCP provider connected");
                    manager.health.write().await.insert(
                        name.to_string(),
                        HealthRecord {
                            server: name.to_string(),
                            connected: true,
                            last_error: None,
                            restart_count: 0,
                        },
                    );
                    manager
                        .providers
                        .write()
                        .await
                        .insert(name.to_string(), client);
                }
                Err(e) => {
                    warn!(server = name, error = %e, "MCP provider failed to connect — skipping");
                    manager.record_failure(name, e.to_string()).await;
                }
            }
        }

        let health = manager.health.read().await;
        let connected = health.values().filter(|record| record.connected).count();
        if !health.is_empty() {
            info!(connected, total = health.len(), "MCP startup complete");
        }
        drop(health);

        manager
    }

    async fn record_failure(&self, name: &str, reason: String) {
        self.health.write().await.insert(
            name.to_string(),
            HealthRecord {
                server: name.to_string(),
                connected: false,
                last_error: Some(reason),
                restart_count: 0,
            },
        );
    }

    /// Point-in-time health snapshot, refreshed from the live clients.
    /// Never waits on provider I/O.
    pub async fn health_status(&self) -> Vec<HealthRecord> {
        let providers = self.providers.read().await;
        let mut records: Vec<HealthRecord> =
            self.health.read().await.values().cloned().collect();
        for record in &mut records {
            if let Some(client) = providers.get(&record.server) {
                record.connected = client.is_connected().await;
                record.restart_count = client.restart_count();
                // A client that failed after startup knows why; the startup
                // snapshot does not.
                if let Some(error) = client.last_error().await {
                    record.last_error = Some(error);
                }
            }
        }
        records.sort_by(|a, b| a.server.cmp(&b.server));
        records
    }

    /// Shut down every live provider. Best-effort: individual failures are
    /// logged, not propagated, and re-running this is a no-op.
    pub async fn shutdown_all(&self) {
        let providers = self.providers.read().await;
        for (name, client) in providers.iter() {
            if let Err(e) = client.shutdown().await {
                warn!(server = %name, error = %e, "provider shutdown error");
            }
        }
        drop(providers);

        let mut health = self.health.write().await;
        for record in health.values_mut() {
            record.connected = false;
        }
    }
}

/// Build the transport and client for one provider, run the handshake, and
/// bridge its discovered capabilities.
async fn connect_provider(
    name: &str,
    config: &McpServerConfig,
) -> Result<(Arc<McpClient>, Vec<Arc<dyn Tool>>)> {
    let transport: Arc<dyn Transport> = match &config.endpoint {
        ServerEndpoint::Stdio { command, args, env } => Arc::new(StdioTransport::spawn(
            command.clone(),
            args.clone(),
            env.clone(),
        )?),
        ServerEndpoint::Sse { url, headers } => Arc::new(
            SseTransport::connect(url.clone(), headers.clone(), config.timeout_ms).await?,
        ),
    };

    let client = Arc::new(McpClient::new(
        name,
        transport,
        Duration::from_millis(config.timeout_ms),
        config.auto_restart,
    ));

    if let Err(e) = client.initialize().await {
        let _ = client.shutdown().await;
        return Err(e);
    }

    let defs = match client.list_tools().await {
        Ok(defs) => defs,
        Err(e) => {
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for def in defs {
        tools.push(Arc::new(McpBridgedTool::new(name, def, Arc::clone(&client))));
    }
    if config.resources && client.has_resources() {
        tools.push(Arc::new(McpListResourcesTool::new(name, Arc::clone(&client))));
        tools.push(Arc::new(McpReadResourceTool::new(name, Arc::clone(&client))));
    }

    Ok((client, tools))
}

/// Register a provider's tools all-or-nothing. A name that collides with an
/// existing registry entry (or repeats within the provider) rejects the
/// whole provider rather than silently overwriting anything.
fn register_provider_tools(
    registry: &ToolRegistry,
    tools: &[Arc<dyn Tool>],
) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for tool in tools {
        let name = tool.name();
        if registry.contains(name) || !seen.insert(name.to_string()) {
            return Err(format!("tool name collision on '{name}'"));
        }
    }
    for (index, tool) in tools.iter().enumerate() {
        if let Err(e) = registry.register_arc(Arc::clone(tool)) {
            for registered in &tools[..index] {
                registry.unregister(registered.name());
            }
            return Err(e.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEndpoint;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    /// Minimal scripted MCP server: answers initialize, tools/list, and an
    /// echo tools/call with fixed ids matching the client's monotonic
    /// counter for that exact call sequence.
    const FAKE_SERVER: &str = r#"
while read line; do
  case "$line" in
    *tools/call*) echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"{\"text\":\"hi\"}"}]}}' ;;
    *tools/list*) echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo the input"}]}}' ;;
    *initialize\"*) echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}' ;;
  esac
done
"#;

    /// Like [`FAKE_SERVER`] but the process exits right after discovery, so
    /// the first tool call finds a dead transport.
    const ONE_SHOT_SERVER: &str = r#"
while read line; do
  case "$line" in
    *tools/list*) echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo the input"}]}}'; exit 0 ;;
    *initialize\"*) echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}' ;;
  esac
done
"#;

    fn scripted_server() -> McpServerConfig {
        McpServerConfig {
            endpoint: ServerEndpoint::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), FAKE_SERVER.into()],
                env: StdHashMap::new(),
            },
            timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn broken_server() -> McpServerConfig {
        McpServerConfig {
            endpoint: ServerEndpoint::Stdio {
                command: "false".into(),
                args: vec![],
                env: StdHashMap::new(),
            },
            timeout_ms: 500,
            ..Default::default()
        }
    }

    fn config_of(servers: Vec<(&str, McpServerConfig)>) -> McpConfig {
        McpConfig {
            enabled: true,
            servers: servers
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
        }
    }

    #[tokio::test]
    async fn disabled_config_yields_no_tools() {
        let registry = ToolRegistry::new();
        let config = McpConfig::default();
        let manager = McpManager::create_tools(&config, &registry).await;
        assert!(registry.is_empty());
        assert!(manager.health_status().await.is_empty());
    }

    #[tokio::test]
    async fn partial_success_is_the_normal_outcome() {
        let registry = ToolRegistry::new();
        let config = config_of(vec![
            ("alpha", scripted_server()),
            ("broken", broken_server()),
        ]);

        let manager = McpManager::create_tools(&config, &registry).await;

        assert!(registry.contains("mcp__alpha__echo"));

        let health = manager.health_status().await;
        assert_eq!(health.len(), 2);
        let alpha = health.iter().find(|r| r.server == "alpha").unwrap();
        let broken = health.iter().find(|r| r.server == "broken").unwrap();
        assert!(alpha.connected);
        assert!(alpha.last_error.is_none());
        assert!(!broken.connected);
        assert!(broken.last_error.is_some());

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn bridged_echo_round_trips_through_the_registry() {
        let registry = ToolRegistry::new();
        let config = config_of(vec![("alpha", scripted_server())]);
        let manager = McpManager::create_tools(&config, &registry).await;

        let tool = registry.get("mcp__alpha__echo").expect("bridged tool");
        let output = tool.execute(json!({"text": "hi"})).await.unwrap();
        assert_eq!(output, json!({"text": "hi"}));

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn colliding_provider_is_skipped_not_overwritten() {
        use async_trait::async_trait;
        use relay_core::Result;
        use serde_json::Value;

        struct Squatter;

        #[async_trait]
        impl Tool for Squatter {
            fn name(&self) -> &str {
                "mcp__alpha__echo"
            }
            fn description(&self) -> &str {
                "occupies the bridged name"
            }
            fn schema(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _args: Value) -> Result<Value> {
                Ok(json!("built-in"))
            }
        }

        let registry = ToolRegistry::new();
        registry.register(Squatter).unwrap();

        let config = config_of(vec![("alpha", scripted_server())]);
        let manager = McpManager::create_tools(&config, &registry).await;

        // The built-in keeps its slot and the provider is reported unhealthy.
        let tool = registry.get("mcp__alpha__echo").unwrap();
        assert_eq!(tool.execute(json!({})).await.unwrap(), json!("built-in"));

        let health = manager.health_status().await;
        let alpha = health.iter().find(|r| r.server == "alpha").unwrap();
        assert!(!alpha.connected);
        assert!(alpha.last_error.as_deref().unwrap().contains("collision"));
    }

    #[tokio::test]
    async fn exhausted_provider_reports_its_failure_reason() {
        let registry = ToolRegistry::new();
        let server = McpServerConfig {
            endpoint: ServerEndpoint::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), ONE_SHOT_SERVER.into()],
                env: StdHashMap::new(),
            },
            timeout_ms: 2_000,
            auto_restart: false,
            ..Default::default()
        };
        let config = config_of(vec![("alpha", server)]);
        let manager = McpManager::create_tools(&config, &registry).await;
        assert!(registry.contains("mcp__alpha__echo"));

        // Give the exit time to reach the reader task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tool = registry.get("mcp__alpha__echo").unwrap();
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            relay_core::RelayError::ProviderUnavailable(_)
        ));

        let health = manager.health_status().await;
        let alpha = health.iter().find(|r| r.server == "alpha").unwrap();
        assert!(!alpha.connected);
        assert!(alpha
            .last_error
            .as_deref()
            .unwrap()
            .contains("auto-restart is disabled"));
    }

    #[tokio::test]
    async fn shutdown_all_is_idempotent() {
        let registry = ToolRegistry::new();
        let config = config_of(vec![("alpha", scripted_server())]);
        let manager = McpManager::create_tools(&config, &registry).await;

        manager.shutdown_all().await;
        manager.shutdown_all().await;

        let health = manager.health_status().await;
        assert!(health.iter().all(|record| !record.connected));

        // Invoking a bridged tool after shutdown reports unavailability.
        let tool = registry.get("mcp__alpha__echo").unwrap();
        let err = tool.execute(json!({"text": "hi"})).await.unwrap_err();
        assert!(matches!(
            err,
            relay_core::RelayError::ProviderUnavailable(_)
        ));
    }
}
