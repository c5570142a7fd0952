use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use cairn_types::{CairnError, Outcome, Result};

use crate::capabilities::{required_str, substitute};
use crate::definition::{CapabilityKind, StepSpec};
use crate::registry::{Capability, CapabilityInput};

/// Output kept on a failed outcome's message.
const MAX_MESSAGE_BYTES: usize = 4096;

#[derive(Debug, Default, Deserialize)]
struct ShellParams {
    #[serde(default, with = "optional_duration")]
    timeout: Option<Duration>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    retry_on_nonzero: bool,
}

mod optional_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "cairn_types::duration_serde")] Duration);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
    }
}

// ---------------------------------------------------------------------------
// ShellCapability: runs a command through `sh -c`
// ---------------------------------------------------------------------------

pub struct ShellCapability {
    default_timeout: Duration,
}

impl ShellCapability {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for ShellCapability {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Capability for ShellCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Shell
    }

    async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
        let command = match required_str(step, input, "command") {
            Ok(command) => command,
            Err(outcome) => return Ok(outcome),
        };
        let mut shell_params = serde_json::Map::new();
        for key in ["timeout", "workdir", "retry_on_nonzero"] {
            if let Some(v) = step.param(key) {
                shell_params.insert(key.to_string(), substitute(v, &input.context));
            }
        }
        let params: ShellParams = serde_json::from_value(serde_json::Value::Object(shell_params))
            .map_err(|e| CairnError::InvalidParameters {
                step: step.name.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(step = %step.name, command = %command, attempt = input.attempt, "Executing shell command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &params.workdir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(Outcome::fail(format!("failed to spawn command: {e}"))),
        };

        let timeout = params.timeout.unwrap_or(self.default_timeout);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(Outcome::fail(format!("command execution failed: {e}"))),
            Err(_) => {
                tracing::warn!(step = %step.name, timeout_ms = timeout.as_millis() as u64, "Shell command timed out");
                return Ok(CairnError::CapabilityTimeout {
                    step: step.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            step = %step.name,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Shell command completed"
        );

        if output.status.success() {
            return Ok(Outcome::success(serde_json::json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            })));
        }

        let message = truncate(&format!("command exited with code {exit_code}: {stderr}"));
        Ok(Outcome::Failed {
            kind: cairn_types::FailureKind::Capability,
            message,
            retryable: params.retry_on_nonzero,
            detail: Some(serde_json::json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            })),
        })
    }
}

/// Cut at a char boundary at or before [`MAX_MESSAGE_BYTES`].
fn truncate(s: &str) -> String {
    if s.len() <= MAX_MESSAGE_BYTES {
        return s.trim_end().to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_MESSAGE_BYTES)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &s[..cut])
}
