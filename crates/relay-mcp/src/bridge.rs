//! Bridged tools: each remote capability exposed as a uniform `Tool`.

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use relay_tools::Tool;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::client::McpClient;
use crate::types::{McpContent, McpToolDef};

/// Namespace prefix for every bridged tool.
pub const TOOL_PREFIX: &str = "mcp";

/// Globally-unique identity for a bridged tool: `mcp__<provider>__<tool>`.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{TOOL_PREFIX}__{server}__{tool}")
}

/// Join text content items and decode a lone JSON payload when the provider
/// sent one; otherwise hand back plain text.
fn decode_content(items: &[McpContent]) -> Value {
    let joined = items
        .iter()
        .filter_map(|item| item.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::from_str(&joined).unwrap_or(Value::String(joined))
}

fn error_payload(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": message.into() })
}

/// One remote tool wrapped as an invocable `Tool`. Holds a non-owning
/// reference to the provider's client; the manager owns the client lifetime.
pub struct McpBridgedTool {
    qualified_name: String,
    description: String,
    input_schema: Value,
    remote_name: String,
    client: Arc<McpClient>,
}

impl McpBridgedTool {
    pub fn new(server: &str, def: McpToolDef, client: Arc<McpClient>) -> Self {
        let description = def
            .description
            .unwrap_or_else(|| format!("MCP tool '{}' from provider '{server}'", def.name));
        let input_schema = def
            .input_schema
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

        Self {
            qualified_name: qualified_name(server, &def.name),
            description,
            input_schema,
            remote_name: def.name,
            client,
        }
    }
}

#[async_trait]
impl Tool for McpBridgedTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        match self.client.call_tool(&self.remote_name, args).await {
            Ok(result) => {
                let decoded = decode_content(&result.content);
                if result.is_error {
                    // A tool-level failure is ordinary, reportable output.
                    Ok(error_payload(match decoded {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }))
                } else {
                    Ok(decoded)
                }
            }
            Err(e @ RelayError::ProviderUnavailable(_)) => Err(e),
            Err(e) => Ok(error_payload(e.to_string())),
        }
    }
}

/// Synthetic tool: list the provider's resource catalog.
pub struct McpListResourcesTool {
    qualified_name: String,
    description: String,
    client: Arc<McpClient>,
}

impl McpListResourcesTool {
    pub fn new(server: &str, client: Arc<McpClient>) -> Self {
        Self {
            qualified_name: qualified_name(server, "list_resources"),
            description: format!("List available resources on MCP provider '{server}'"),
            client,
        }
    }
}

#[async_trait]
impl Tool for McpListResourcesTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value) -> Result<Value> {
        match self.client.list_resources().await {
            Ok(result) => Ok(serde_json::to_value(result.resources)?),
            Err(e @ RelayError::ProviderUnavailable(_)) => Err(e),
            Err(e) => Ok(error_payload(e.to_string())),
        }
    }
}

/// Synthetic tool: read one resource by URI.
pub struct McpReadResourceTool {
    qualified_name: String,
    description: String,
    client: Arc<McpClient>,
}

impl McpReadResourceTool {
    pub fn new(server: &str, client: Arc<McpClient>) -> Self {
        Self {
            qualified_name: qualified_name(server, "read_resource"),
            description: format!("Read a resource by URI from MCP provider '{server}'"),
            client,
        }
    }
}

#[async_trait]
impl Tool for McpReadResourceTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "uri": {
                    "type": "string",
                    "description": "The URI of the resource to read"
                }
            },
            "required": ["uri"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let uri = args.get("uri").and_then(Value::as_str).unwrap_or_default();
        if uri.is_empty() {
            return Ok(error_payload("missing required parameter: uri"));
        }

        match self.client.read_resource(uri).await {
            Ok(result) => Ok(decode_content(&result.contents)),
            Err(e @ RelayError::ProviderUnavailable(_)) => Err(e),
            Err(e) => Ok(error_payload(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_namespaced_per_provider() {
        assert_eq!(qualified_name("alpha", "echo"), "mcp__alpha__echo");
        assert_ne!(qualified_name("alpha", "echo"), qualified_name("beta", "echo"));
    }

    #[test]
    fn decode_content_parses_json_payloads() {
        let items = vec![McpContent::text(r#"{"text":"hi"}"#)];
        assert_eq!(decode_content(&items), json!({"text": "hi"}));
    }

    #[test]
    fn decode_content_falls_back_to_joined_text() {
        let items = vec![McpContent::text("line one"), McpContent::text("line two")];
        assert_eq!(
            decode_content(&items),
            Value::String("line one\nline two".into())
        );
    }
}
