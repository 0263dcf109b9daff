//! Terminal tool — execute shell commands with timeout and cancellation

use crate::tool::{ParamKind, ParamSchema, ParamSpec, Tool, ToolOutput};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Commands whose first token is outright refused.
const DENIED_COMMANDS: &[&str] = &[
    "rm", "del", "format", "fdisk", "dd", "shutdown", "reboot", "kill", "killall", "sudo",
    "su", "chmod", "chown",
];

#[derive(Debug)]
pub struct TerminalTool {
    workspace_root: PathBuf,
    default_timeout_secs: u64,
}

impl TerminalTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            default_timeout_secs: 30,
        }
    }

    fn check_denied(command: &str) -> Option<ToolOutput> {
        let first = command.split_whitespace().next().unwrap_or_default();
        if DENIED_COMMANDS.contains(&first) {
            return Some(ToolOutput::failure(format!(
                "command '{}' is not allowed for security reasons",
                first
            )));
        }
        None
    }

    fn resolve_args(&self, args: &Map<String, Value>) -> Result<(String, u64, PathBuf), ToolOutput> {
        let command = match args.get("command").and_then(Value::as_str) {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return Err(ToolOutput::failure("missing required parameter: command")),
        };
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs)
            .min(600);
        let cwd = match args.get("working_dir").and_then(Value::as_str) {
            Some(dir) => self.workspace_root.join(dir),
            None => self.workspace_root.clone(),
        };
        Ok((command, timeout_secs, cwd))
    }
}

#[async_trait::async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Execute a shell command and capture stdout, stderr and the exit code. \
         Use for file listings, git, system inspection. Destructive commands \
         are refused."
    }

    fn parameters_schema(&self) -> ParamSchema {
        let mut schema = ParamSchema::new();
        schema.insert(
            "command".to_string(),
            ParamSpec::required(ParamKind::String, "The shell command to execute"),
        );
        schema.insert(
            "timeout".to_string(),
            ParamSpec::optional(ParamKind::Integer, "Timeout in seconds (default 30, max 600)"),
        );
        schema.insert(
            "working_dir".to_string(),
            ParamSpec::optional(ParamKind::String, "Working directory relative to the workspace"),
        );
        schema
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>) -> ToolOutput {
        let (command, timeout_secs, cwd) = match self.resolve_args(&args) {
            Ok(v) => v,
            Err(failure) => return failure,
        };
        if let Some(denied) = Self::check_denied(&command) {
            return denied;
        }

        debug!("terminal: {}", &command[..command.len().min(120)]);

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            Command::new("sh").arg("-c").arg(&command).current_dir(&cwd).output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolOutput::failure(format!("failed to execute: {}", e)),
            Err(_) => {
                return ToolOutput::failure(format!("command timed out after {}s", timeout_secs))
            }
        };

        format_output(&output)
    }

    /// Cancellable execution: spawn with kill_on_drop and race against the
    /// token so the child dies the moment the step is cancelled.
    async fn execute_cancellable(
        &self,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolOutput {
        let (command, timeout_secs, cwd) = match self.resolve_args(&args) {
            Ok(v) => v,
            Err(failure) => return failure,
        };
        if let Some(denied) = Self::check_denied(&command) {
            return denied;
        }

        debug!("terminal (cancellable): {}", &command[..command.len().min(120)]);

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolOutput::failure(format!("failed to spawn: {}", e)),
        };

        let timeout = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = read_pipe(child.stdout.take()).await;
                        let stderr = read_pipe(child.stderr.take()).await;
                        let output = std::process::Output {
                            status,
                            stdout: stdout.into_bytes(),
                            stderr: stderr.into_bytes(),
                        };
                        format_output(&output)
                    }
                    Ok(Err(e)) => ToolOutput::failure(format!("failed to wait: {}", e)),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolOutput::failure(format!("command timed out after {}s", timeout_secs))
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                ToolOutput::failure("cancelled")
            }
        }
    }
}

async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        }
        None => String::new(),
    }
}

const MAX_OUTPUT: usize = 30_000;

fn cap(s: &str) -> String {
    if s.len() > MAX_OUTPUT {
        format!("{}\n... [truncated, {} total chars]", &s[..MAX_OUTPUT], s.len())
    } else {
        s.to_string()
    }
}

fn format_output(output: &std::process::Output) -> ToolOutput {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    let data = json!({
        "stdout": cap(stdout.trim()),
        "stderr": cap(stderr.trim()),
        "exit_code": exit_code,
    });

    if output.status.success() {
        ToolOutput::success(data)
    } else {
        ToolOutput::failure(format!(
            "exit code {}: {}",
            exit_code,
            cap(stderr.trim())
        ))
    }
}
