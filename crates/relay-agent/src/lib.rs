//! The tool-call loop: drives a model provider across turns, executing the
//! tools it requests until it produces a final answer or hits a limit.
//!
//! The model is a black box behind [`ModelProvider`]; this crate owns the
//! conversation state, concurrent tool execution, and the stop conditions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use relay_core::{
    ChatMessage, RelayError, Result, ToolCallOutput, ToolCallRecord, ToolCallRequest,
};
use relay_tools::ToolRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tool advertisement handed to the provider on every turn.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Everything the provider sees for one turn: the conversation so far and
/// the tools it may request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// What the model decided to do with a turn.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    FinalAnswer(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// The model side of the loop. Implementations wrap whatever inference API
/// is in use; the loop never sees past this trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn next_turn(&self, request: ModelRequest) -> Result<ModelTurn>;
}

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Upper bound on model turns per run.
    pub max_turns: usize,
    /// Wall-clock budget for a whole run.
    pub run_timeout: Duration,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            run_timeout: Duration::from_secs(120),
        }
    }
}

/// How a run ended. Only provider and infrastructure faults surface as
/// errors; exhausting a budget is an ordinary outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Completed { answer: String, turns: usize },
    TurnLimit { turns: usize },
    TimedOut,
}

pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    /// Drive the loop to one of its stop conditions.
    ///
    /// Pass a recorder to collect a [`ToolCallRecord`] per executed call;
    /// with `None` the loop keeps no history beyond the conversation itself.
    /// A provider error aborts the run: the loop cannot continue a
    /// conversation it can no longer advance.
    pub async fn run(
        &self,
        mut conversation: Vec<ChatMessage>,
        mut recorder: Option<&mut Vec<ToolCallRecord>>,
    ) -> Result<LoopOutcome> {
        let run_id = Uuid::new_v4();
        info!(%run_id, tools = self.registry.len(), "starting agent run");

        for turn_index in 0..self.config.max_turns {
            let request = ModelRequest {
                messages: conversation.clone(),
                tools: self.tool_specs(),
            };

            match self.provider.next_turn(request).await? {
                ModelTurn::FinalAnswer(answer) => {
                    let turns = turn_index + 1;
                    info!(%run_id, turns, "run completed");
                    return Ok(LoopOutcome::Completed { answer, turns });
                }
                ModelTurn::ToolCalls(calls) => {
                    if calls.is_empty() {
                        return Err(RelayError::Model(
                            "provider requested a tool round with no calls".into(),
                        ));
                    }
                    debug!(%run_id, turn_index, calls = calls.len(), "executing tool round");

                    conversation.push(ChatMessage::assistant_tool_calls(calls.clone()));
                    let outputs = self
                        .execute_round(&calls, turn_index, recorder.as_deref_mut())
                        .await;
                    for output in outputs {
                        conversation.push(ChatMessage::tool(output.as_model_text()));
                    }
                }
            }
        }

        warn!(%run_id, max_turns = self.config.max_turns, "turn limit reached");
        Ok(LoopOutcome::TurnLimit {
            turns: self.config.max_turns,
        })
    }

    /// Like [`run`](Self::run), under the configured wall-clock budget.
    /// Cancellation is abrupt: tool calls in flight at the deadline are
    /// dropped, and records already collected stay in the recorder.
    pub async fn run_with_timeout(
        &self,
        conversation: Vec<ChatMessage>,
        recorder: Option<&mut Vec<ToolCallRecord>>,
    ) -> Result<LoopOutcome> {
        match tokio::time::timeout(self.config.run_timeout, self.run(conversation, recorder))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(budget = ?self.config.run_timeout, "agent run timed out");
                Ok(LoopOutcome::TimedOut)
            }
        }
    }

    /// Execute one round of tool calls concurrently. Outputs come back in
    /// request order no matter which call finishes first, so the tool
    /// messages always line up with the requests that produced them.
    async fn execute_round(
        &self,
        calls: &[ToolCallRequest],
        turn_index: usize,
        recorder: Option<&mut Vec<ToolCallRecord>>,
    ) -> Vec<ToolCallOutput> {
        let results = join_all(calls.iter().map(|call| self.execute_one(call))).await;

        if let Some(records) = recorder {
            for (call, (output, duration, started_at)) in calls.iter().zip(&results) {
                records.push(ToolCallRecord {
                    tool_name: call.name.clone(),
                    input: call.arguments.clone(),
                    output: output.clone(),
                    duration: *duration,
                    turn_index,
                    started_at: *started_at,
                });
            }
        }

        results.into_iter().map(|(output, _, _)| output).collect()
    }

    /// Run one call. Tool failures (including a name the registry does not
    /// know) become reportable outputs, never loop errors.
    async fn execute_one(
        &self,
        call: &ToolCallRequest,
    ) -> (ToolCallOutput, Duration, DateTime<Utc>) {
        let started_at = Utc::now();
        let start = Instant::now();

        let output = match self.registry.get(&call.name) {
            Some(tool) => match tool.execute(call.arguments.clone()).await {
                Ok(value) => ToolCallOutput::Ok { value },
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool call failed");
                    ToolCallOutput::Err {
                        message: e.to_string(),
                    }
                }
            },
            None => {
                warn!(tool = %call.name, "model requested an unknown tool");
                ToolCallOutput::Err {
                    message: format!("unknown tool '{}'", call.name),
                }
            }
        };

        (output, start.elapsed(), started_at)
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .registry
            .get_all()
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}
