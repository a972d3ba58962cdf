//! Subprocess transport: newline-delimited JSON frames over stdin/stdout.

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::Transport;
use crate::config::resolve_env_value;
use crate::types::{JsonRpcResponse, OutboundMessage};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;
const EXIT_GRACE: Duration = Duration::from_secs(3);

/// Transport over a spawned subprocess. The spawn arguments are retained so
/// the owning client can ask for a reconnect after a crash.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    rx: Mutex<mpsc::Receiver<JsonRpcResponse>>,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

impl StdioTransport {
    /// Spawn the provider process and start draining its output streams.
    pub fn spawn(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<Self> {
        let command = command.into();
        let alive = Arc::new(AtomicBool::new(true));
        let (child, stdin, rx) = spawn_child(&command, &args, &env, Arc::clone(&alive))?;

        Ok(Self {
            command,
            args,
            env,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            rx: Mutex::new(rx),
            alive,
        })
    }

    async fn stop_process(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            // Stdin is closed, so a well-behaved server exits on its own.
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(command = %self.command, %status, "provider process exited"),
                _ => {
                    warn!(command = %self.command, "provider process did not exit — killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(RelayError::Transport("process stdin is closed".into()));
        };

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            self.alive.store(false, Ordering::Relaxed);
            return Err(RelayError::Transport(format!(
                "write to provider stdin failed: {e}"
            )));
        }
        Ok(())
    }

    async fn receive_one(&self) -> Result<JsonRpcResponse> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            self.alive.store(false, Ordering::Relaxed);
            RelayError::Transport(format!("provider '{}' closed its output stream", self.command))
        })
    }

    async fn reconnect(&self) -> Result<()> {
        info!(command = %self.command, "respawning provider process");
        self.stop_process().await;

        let (child, stdin, rx) = spawn_child(&self.command, &self.args, &self.env, Arc::clone(&self.alive))?;
        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *self.rx.lock().await = rx;
        self.alive.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        self.stop_process().await;
        Ok(())
    }
}

/// Spawn the child and the reader tasks that frame its output. The reader
/// parses one JSON-RPC message per line and skips anything else (log noise,
/// notifications without ids are handled downstream).
fn spawn_child(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    alive: Arc<AtomicBool>,
) -> Result<(Child, ChildStdin, mpsc::Receiver<JsonRpcResponse>)> {
    info!(command, ?args, "spawning MCP provider");

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in env {
        cmd.env(key, resolve_env_value(value));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| RelayError::Transport(format!("failed to spawn '{command}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RelayError::Transport("no stdin on provider process".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayError::Transport("no stdout on provider process".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RelayError::Transport("no stderr on provider process".into()))?;

    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

    let command_owned = command.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!(command = %command_owned, "provider stdout closed (EOF)");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                        Ok(response) => {
                            if tx.send(response).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            debug!(command = %command_owned, line = trimmed, "non-JSON-RPC output skipped");
                        }
                    }
                }
                Err(e) => {
                    warn!(command = %command_owned, error = %e, "error reading provider stdout");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        debug!(stderr = trimmed, "provider stderr");
                    }
                }
            }
        }
    });

    Ok((child, stdin, rx))
}
