//! Provider configuration: transport endpoint, timeouts, restart policy.

use relay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Top-level MCP configuration: a master switch plus named providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Load configuration from a YAML file.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading MCP configuration");

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            RelayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        serde_yaml::from_str(&content).map_err(|e| {
            RelayError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Providers that should be brought up: none when the master switch is
    /// off, otherwise every server not marked disabled. Sorted by name so
    /// startup order is deterministic.
    pub fn enabled_servers(&self) -> Vec<(&str, &McpServerConfig)> {
        if !self.enabled {
            return Vec::new();
        }
        let mut servers: Vec<(&str, &McpServerConfig)> = self
            .servers
            .iter()
            .filter(|(_, config)| !config.disabled)
            .map(|(name, config)| (name.as_str(), config))
            .collect();
        servers.sort_by_key(|(name, _)| *name);
        servers
    }
}

/// Configuration for a single provider. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub endpoint: ServerEndpoint,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub disabled: bool,

    /// Reconnect at most once after a transport failure.
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,

    /// Expose synthetic resource tools when the provider advertises them.
    #[serde(default = "default_resources")]
    pub resources: bool,
}

/// How to reach the provider: a spawned subprocess or an SSE endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerEndpoint {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_auto_restart() -> bool {
    true
}

fn default_resources() -> bool {
    true
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            endpoint: ServerEndpoint::Stdio {
                command: String::new(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            timeout_ms: default_timeout_ms(),
            disabled: false,
            auto_restart: default_auto_restart(),
            resources: default_resources(),
        }
    }
}

/// Resolve `${VAR}` and `${VAR:-default}` references in config values.
/// Applied to subprocess environment values and SSE header values.
pub(crate) fn resolve_env_value(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let inner = &value[2..value.len() - 1];
        if let Some((var_name, default)) = inner.split_once(":-") {
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        } else {
            std::env::var(inner).unwrap_or_else(|_| value.to_string())
        }
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stdio_config_parses_with_defaults() {
        let yaml = r#"
enabled: true
servers:
  filesystem:
    transport: stdio
    command: npx
    args: ["@modelcontextprotocol/server-filesystem", "--stdio"]
    env:
      WORKSPACE: "/tmp"
"#;
        let config: McpConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.enabled);
        let server = &config.servers["filesystem"];
        assert_eq!(server.timeout_ms, 30_000);
        assert!(server.auto_restart);
        assert!(!server.disabled);
        match &server.endpoint {
            ServerEndpoint::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env["WORKSPACE"], "/tmp");
            }
            other => panic!("expected stdio endpoint, got {other:?}"),
        }
    }

    #[test]
    fn sse_config_parses() {
        let yaml = r#"
enabled: true
servers:
  github:
    transport: sse
    url: http://localhost:8080
    headers:
      Authorization: Bearer token123
    timeout_ms: 60000
    auto_restart: false
"#;
        let config: McpConfig = serde_yaml::from_str(yaml).unwrap();
        let server = &config.servers["github"];
        assert_eq!(server.timeout_ms, 60_000);
        assert!(!server.auto_restart);
        match &server.endpoint {
            ServerEndpoint::Sse { url, headers } => {
                assert_eq!(url, "http://localhost:8080");
                assert_eq!(headers["Authorization"], "Bearer token123");
            }
            other => panic!("expected sse endpoint, got {other:?}"),
        }
    }

    #[test]
    fn disabled_master_switch_yields_no_servers() {
        let yaml = r#"
servers:
  filesystem:
    transport: stdio
    command: echo
"#;
        let config: McpConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.enabled);
        assert!(config.enabled_servers().is_empty());
    }

    #[test]
    fn disabled_servers_are_filtered_and_order_is_stable() {
        let yaml = r#"
enabled: true
servers:
  zeta:
    transport: stdio
    command: echo
  alpha:
    transport: stdio
    command: echo
  gone:
    transport: stdio
    command: echo
    disabled: true
"#;
        let config: McpConfig = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&str> = config
            .enabled_servers()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn load_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enabled: [not a bool").unwrap();

        let err = McpConfig::load_from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn env_substitution_with_default() {
        std::env::remove_var("RELAY_TEST_MISSING");
        assert_eq!(
            resolve_env_value("${RELAY_TEST_MISSING:-fallback}"),
            "fallback"
        );
        assert_eq!(resolve_env_value("literal"), "literal");
    }
}
