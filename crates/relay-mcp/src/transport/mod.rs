//! Byte-level connection to one provider: subprocess pipes or an SSE stream.

use async_trait::async_trait;
use relay_core::Result;
use std::fmt::Debug;

use crate::types::{JsonRpcResponse, OutboundMessage};

pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Transport contract shared by the subprocess and network variants.
///
/// Failures are never swallowed here: a broken stream surfaces as an error
/// from `send` or `receive_one`, and the owning client decides between
/// restart and permanent failure.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Write one framed message.
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Await the next complete framed response. Fails when the underlying
    /// process exits or the connection drops.
    async fn receive_one(&self) -> Result<JsonRpcResponse>;

    /// Tear down and re-establish the process/connection.
    async fn reconnect(&self) -> Result<()>;

    fn is_alive(&self) -> bool;

    /// Release the underlying process/socket. Safe to call repeatedly.
    async fn shutdown(&self) -> Result<()>;
}
