//! Code tool — execute a Python snippet in a subprocess sandbox

use crate::tool::{ParamKind, ParamSchema, ParamSpec, Tool, ToolOutput};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_OUTPUT: usize = 10_000;

#[derive(Debug)]
pub struct CodeTool {
    interpreter: String,
    default_timeout_secs: u64,
}

impl CodeTool {
    pub fn new() -> Self {
        Self {
            interpreter: "python3".to_string(),
            default_timeout_secs: 30,
        }
    }

    async fn run(&self, code: &str, timeout_secs: u64, cancel: CancellationToken) -> ToolOutput {
        debug!("code: {} bytes of python", code.len());

        let mut child = match Command::new(&self.interpreter)
            .arg("-")
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolOutput::failure(format!("failed to spawn interpreter: {}", e)),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(code.as_bytes()).await {
                return ToolOutput::failure(format!("failed to write code: {}", e));
            }
            drop(stdin);
        }

        let timeout = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => {
                        let stdout = String::from_utf8_lossy(&output.stdout);
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        let exit_code = output.status.code().unwrap_or(-1);
                        if output.status.success() {
                            ToolOutput::success(json!({
                                "stdout": cap(stdout.trim()),
                                "stderr": cap(stderr.trim()),
                                "exit_code": exit_code,
                            }))
                        } else {
                            ToolOutput::failure(format!("exit code {}: {}", exit_code, cap(stderr.trim())))
                        }
                    }
                    Ok(Err(e)) => ToolOutput::failure(format!("failed to wait: {}", e)),
                    Err(_) => ToolOutput::failure(format!("execution timed out after {}s", timeout_secs)),
                }
            }
            _ = cancel.cancelled() => {
                ToolOutput::failure("cancelled")
            }
        }
    }
}

impl Default for CodeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &str {
        "code"
    }

    fn description(&self) -> &str {
        "Execute a Python 3 snippet and capture its output. The generic \
         fallback for tasks no specialized tool covers."
    }

    fn parameters_schema(&self) -> ParamSchema {
        let mut schema = ParamSchema::new();
        schema.insert(
            "code".to_string(),
            ParamSpec::required(ParamKind::String, "Python source to execute"),
        );
        schema.insert(
            "timeout".to_string(),
            ParamSpec::optional(ParamKind::Integer, "Timeout in seconds (default 30, max 600)"),
        );
        schema
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>) -> ToolOutput {
        self.execute_cancellable(args, CancellationToken::new()).await
    }

    async fn execute_cancellable(
        &self,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolOutput {
        let code = match args.get("code").and_then(Value::as_str) {
            Some(c) if !c.trim().is_empty() => c,
            _ => return ToolOutput::failure("missing required parameter: code"),
        };
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs)
            .min(600);

        self.run(code, timeout_secs, cancel).await
    }
}

fn cap(s: &str) -> String {
    if s.len() > MAX_OUTPUT {
        format!("{}\n... [truncated, {} total chars]", &s[..MAX_OUTPUT], s.len())
    } else {
        s.to_string()
    }
}
