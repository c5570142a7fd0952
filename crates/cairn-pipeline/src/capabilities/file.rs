use async_trait::async_trait;

use cairn_types::{Outcome, Result};

use crate::capabilities::{required_str, substitute};
use crate::definition::{CapabilityKind, StepSpec};
use crate::registry::{Capability, CapabilityInput};

/// Map an I/O error to a failed outcome. Only interrupted or would-block
/// errors are worth retrying.
fn io_failure(action: &str, path: &str, err: std::io::Error) -> Outcome {
    let message = format!("failed to {action} '{path}': {err}");
    match err.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            Outcome::retryable(message)
        }
        _ => Outcome::fail(message),
    }
}

// ---------------------------------------------------------------------------
// ReadFileCapability
// ---------------------------------------------------------------------------

/// Reads `params.path` as UTF-8 text.
pub struct ReadFileCapability;

#[async_trait]
impl Capability for ReadFileCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ReadFile
    }

    async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
        let path = match required_str(step, input, "path") {
            Ok(path) => path,
            Err(outcome) => return Ok(outcome),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                tracing::debug!(step = %step.name, path = %path, bytes = content.len(), "Read file");
                Ok(Outcome::success(content))
            }
            Err(e) => Ok(io_failure("read", &path, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteFileCapability
// ---------------------------------------------------------------------------

/// Writes `params.content` to `params.path`, creating parent directories.
///
/// Non-string content is written as pretty-printed JSON.
pub struct WriteFileCapability;

#[async_trait]
impl Capability for WriteFileCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::WriteFile
    }

    async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
        let path = match required_str(step, input, "path") {
            Ok(path) => path,
            Err(outcome) => return Ok(outcome),
        };
        let content = match step.param("content").map(|v| substitute(v, &input.context)) {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => serde_json::to_string_pretty(&other)?,
            None => String::new(),
        };

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(io_failure("create directory for", &path, e));
                }
            }
        }
        match tokio::fs::write(&path, content.as_bytes()).await {
            Ok(()) => {
                tracing::debug!(step = %step.name, path = %path, bytes = content.len(), "Wrote file");
                Ok(Outcome::success(serde_json::json!({
                    "path": path,
                    "bytes": content.len(),
                })))
            }
            Err(e) => Ok(io_failure("write", &path, e)),
        }
    }
}
