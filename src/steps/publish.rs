use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::external::{Publisher, VideoSubmission};
use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome};
use crate::store::WorkUnit;
use crate::workspace::Workspace;

use super::metadata::truncate_title;
use super::{PUBLISH_PRIMARY, PUBLISH_SECONDARY};

const DEFAULT_DESCRIPTION: &str = "Automatically published video";

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Uploads the video with the best available title and description.
pub struct PublishPrimary {
    publisher: Arc<dyn Publisher>,
    unit: WorkUnit,
    workspace: Workspace,
}

impl PublishPrimary {
    pub fn new(publisher: Arc<dyn Publisher>, unit: WorkUnit, workspace: Workspace) -> Self {
        Self {
            publisher,
            unit,
            workspace,
        }
    }

    /// Generated metadata first, then the unit's own fields, then defaults.
    fn submission(&self, ctx: &PipelineContext, video: PathBuf) -> VideoSubmission {
        let unit = &self.unit;
        let meta = ctx.metadata.as_ref();

        let title = non_blank(meta.map(|m| m.title.as_str()))
            .or(non_blank(unit.generated_title.as_deref()))
            .or(non_blank(Some(unit.title.as_str())))
            .unwrap_or(&unit.source_ref);
        let description = non_blank(meta.map(|m| m.description.as_str()))
            .or(non_blank(unit.generated_description.as_deref()))
            .or(non_blank(Some(unit.description.as_str())))
            .unwrap_or(DEFAULT_DESCRIPTION);
        let tags = match meta.filter(|m| !m.tags.is_empty()) {
            Some(m) => m.tags.clone(),
            None => unit
                .generated_tags
                .as_deref()
                .unwrap_or("")
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        };

        VideoSubmission {
            video,
            title: truncate_title(title),
            description: description.to_string(),
            tags,
            cover: ctx.cover_image.clone(),
        }
    }
}

#[async_trait]
impl Step for PublishPrimary {
    fn name(&self) -> &str {
        PUBLISH_PRIMARY
    }

    fn reads(&self) -> &'static [ContextKey] {
        &[ContextKey::SourceVideo]
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::PrimaryPublishId]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let video = match ctx.source_video.clone() {
            Some(video) => video,
            None => self
                .workspace
                .find_video()
                .await?
                .ok_or_else(|| StepError::Business("no video file to publish".to_string()))?,
        };
        let submission = self.submission(ctx, video);
        info!(unit = %self.unit.source_ref, title = %submission.title, "publishing video");

        let receipt = self.publisher.publish_video(&submission).await?;
        if receipt.id.trim().is_empty() {
            return Err(StepError::Business(
                "publisher returned an empty id".to_string(),
            ));
        }
        info!(unit = %self.unit.source_ref, id = %receipt.id, "video published");
        ctx.primary_publish_id = Some(receipt.id);
        Ok(StepOutcome::Completed)
    }
}

/// Attaches caption tracks to the already published video.
pub struct PublishSecondary {
    publisher: Arc<dyn Publisher>,
    unit: WorkUnit,
    workspace: Workspace,
    caption_language: String,
    source_caption_language: String,
}

impl PublishSecondary {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        unit: WorkUnit,
        workspace: Workspace,
        caption_language: &str,
        source_caption_language: &str,
    ) -> Self {
        Self {
            publisher,
            unit,
            workspace,
            caption_language: caption_language.to_string(),
            source_caption_language: source_caption_language.to_string(),
        }
    }

    async fn caption_files(&self) -> Vec<(PathBuf, &str)> {
        let candidates = [
            (
                self.workspace.translated_subtitles(),
                self.caption_language.as_str(),
            ),
            (
                self.workspace.source_subtitles(),
                self.source_caption_language.as_str(),
            ),
        ];
        let mut found = Vec::new();
        for (path, lang) in candidates {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                found.push((path, lang));
            }
        }
        found
    }
}

#[async_trait]
impl Step for PublishSecondary {
    fn name(&self) -> &str {
        PUBLISH_SECONDARY
    }

    fn reads(&self) -> &'static [ContextKey] {
        &[ContextKey::PrimaryPublishId]
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::CaptionsUploaded]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let id = non_blank(ctx.primary_publish_id.as_deref())
            .or(self.unit.publish_id())
            .map(str::to_string)
            .ok_or_else(|| StepError::Business("no primary publication id".to_string()))?;

        let files = self.caption_files().await;
        if files.is_empty() {
            return Ok(StepOutcome::skipped("no caption files"));
        }

        let mut uploaded = 0;
        for (path, lang) in &files {
            match self.publisher.publish_caption(&id, path, lang).await {
                Ok(()) => {
                    info!(unit = %self.unit.source_ref, id = %id, lang, "caption uploaded");
                    uploaded += 1;
                }
                Err(e) => warn!(unit = %self.unit.source_ref, lang, error = %e, "caption upload failed"),
            }
        }
        if uploaded == 0 {
            return Err(StepError::System(format!(
                "all {} caption uploads failed",
                files.len()
            )));
        }
        ctx.captions_uploaded = Some(uploaded);
        Ok(StepOutcome::Completed)
    }
}
