//! Adapters for the outside world: source download and platform upload.
//!
//! Both are driven through configurable command-line tools so the daemon
//! carries no platform SDK.

pub mod fetcher;
pub mod publisher;

use std::collections::BTreeMap;

use tokio::process::Command;
use tracing::debug;

use crate::config::ToolCommand;
use crate::error::ToolError;

pub use fetcher::{CommandFetcher, SourceFetcher, source_url};
pub use publisher::{CommandPublisher, PublishReceipt, Publisher, VideoSubmission};

const STDERR_TAIL: usize = 500;

/// Runs `tool` with its placeholders filled from `vars` and returns stdout.
pub async fn run_tool(
    tool: &ToolCommand,
    vars: &BTreeMap<&str, String>,
) -> Result<String, ToolError> {
    let args = tool.render_args(vars);
    debug!(program = %tool.program, ?args, "running tool");
    let output = Command::new(&tool.program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            program: tool.program.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        return Err(ToolError::Failed {
            program: tool.program.clone(),
            code: output.status.code(),
            stderr: stderr[tail_start..].to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
