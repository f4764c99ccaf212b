use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::run_tool;
use crate::config::ToolCommand;
use crate::error::ToolError;

/// Everything the primary publication needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSubmission {
    pub video: PathBuf,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub cover: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Platform identifier of the published video.
    pub id: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_video(&self, submission: &VideoSubmission)
    -> Result<PublishReceipt, ToolError>;

    async fn publish_caption(&self, id: &str, file: &Path, lang: &str) -> Result<(), ToolError>;
}

pub struct CommandPublisher {
    video_tool: ToolCommand,
    caption_tool: ToolCommand,
}

impl CommandPublisher {
    pub fn new(video_tool: ToolCommand, caption_tool: ToolCommand) -> Self {
        Self {
            video_tool,
            caption_tool,
        }
    }
}

/// The upload tool prints the platform id on its last non-empty stdout line.
fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish_video(
        &self,
        submission: &VideoSubmission,
    ) -> Result<PublishReceipt, ToolError> {
        let mut vars = BTreeMap::new();
        vars.insert("video", submission.video.display().to_string());
        vars.insert("title", submission.title.clone());
        vars.insert("description", submission.description.clone());
        vars.insert("tags", submission.tags.join(","));
        vars.insert(
            "cover",
            submission
                .cover
                .as_ref()
                .map(|c| c.display().to_string())
                .unwrap_or_default(),
        );
        let stdout = run_tool(&self.video_tool, &vars).await?;
        let id = last_line(&stdout).ok_or_else(|| {
            ToolError::Output(format!(
                "{} printed no video id",
                self.video_tool.program
            ))
        })?;
        Ok(PublishReceipt { id })
    }

    async fn publish_caption(&self, id: &str, file: &Path, lang: &str) -> Result<(), ToolError> {
        let mut vars = BTreeMap::new();
        vars.insert("id", id.to_string());
        vars.insert("file", file.display().to_string());
        vars.insert("lang", lang.to_string());
        run_tool(&self.caption_tool, &vars).await.map(|_| ())
    }
}
