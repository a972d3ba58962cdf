use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport lost before a reply arrived")]
    TransportLost,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider '{0}' is unavailable")]
    ProviderUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model provider error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Outcome of one executed tool call: either the decoded output value or an
/// error message. Tool errors are reportable results, not loop failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolCallOutput {
    Ok { value: Value },
    Err { message: String },
}

impl ToolCallOutput {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolCallOutput::Ok { .. })
    }

    /// Render the output as the string that goes back to the model.
    pub fn as_model_text(&self) -> String {
        match self {
            ToolCallOutput::Ok {
                value: Value::String(s),
            } => s.clone(),
            ToolCallOutput::Ok { value } => value.to_string(),
            ToolCallOutput::Err { message } => {
                serde_json::json!({ "error": message }).to_string()
            }
        }
    }
}

/// Immutable record of one tool call made during a loop run. Collected only
/// when the caller opts in by passing a recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: Value,
    pub output: ToolCallOutput,
    pub duration: Duration,
    pub turn_index: usize,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_output_renders_strings_verbatim() {
        let output = ToolCallOutput::Ok {
            value: Value::String("plain text".into()),
        };
        assert_eq!(output.as_model_text(), "plain text");
    }

    #[test]
    fn tool_output_renders_structured_payloads_as_json() {
        let output = ToolCallOutput::Ok {
            value: json!({"text": "hi"}),
        };
        assert_eq!(output.as_model_text(), r#"{"text":"hi"}"#);
    }

    #[test]
    fn tool_error_renders_as_error_marker() {
        let output = ToolCallOutput::Err {
            message: "boom".into(),
        };
        assert_eq!(output.as_model_text(), r#"{"error":"boom"}"#);
        assert!(!output.is_ok());
    }

    #[test]
    fn chat_message_round_trips() {
        let msg = ChatMessage::assistant_tool_calls(vec![ToolCallRequest {
            id: "call-1".into(),
            name: "search".into(),
            arguments: json!({"query": "rust"}),
        }]);
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ChatMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.role, Role::Assistant);
        assert_eq!(decoded.tool_calls.len(), 1);
        assert_eq!(decoded.tool_calls[0].name, "search");
    }
}
