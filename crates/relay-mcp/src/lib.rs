//! MCP protocol bridge: connects external tool providers over subprocess or
//! SSE transports and exposes their capabilities as registry tools.
//!
//! Layering, bottom up: [`transport`] moves framed bytes, [`client`] speaks
//! JSON-RPC and owns the per-provider lifecycle, [`bridge`] wraps remote
//! tools behind the local `Tool` trait, and [`manager`] supervises the whole
//! set of providers.

pub mod bridge;
pub mod client;
pub mod config;
pub mod manager;
pub mod transport;
pub mod types;

pub use bridge::{qualified_name, McpBridgedTool, McpListResourcesTool, McpReadResourceTool};
pub use client::{ClientState, McpClient};
pub use config::{McpConfig, McpServerConfig, ServerEndpoint};
pub use manager::{HealthRecord, McpManager};
pub use transport::{SseTransport, StdioTransport, Transport};
