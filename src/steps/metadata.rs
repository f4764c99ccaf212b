use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::llm::ChatProvider;
use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome, VideoMetadata};
use crate::store::{Store, WorkUnit};
use crate::translate::srt;
use crate::workspace::Workspace;

use super::GENERATE_METADATA;

const EXCERPT_CHARS: usize = 1000;
const MAX_TITLE_CHARS: usize = 80;
const DEFAULT_DESCRIPTION: &str = "Video with subtitles";

const SYSTEM_PROMPT: &str = "You are a video content analyst. You write engaging titles, \
descriptions and tags from subtitle transcripts.";

/// Asks the model for a title, description and tags based on the subtitles.
///
/// Never fails the unit: any problem falls back to the unit's own title and
/// description.
pub struct GenerateMetadata {
    provider: Arc<dyn ChatProvider>,
    store: Store,
    unit: WorkUnit,
    workspace: Workspace,
    language: String,
}

impl GenerateMetadata {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        store: Store,
        unit: WorkUnit,
        workspace: Workspace,
        language: &str,
    ) -> Self {
        Self {
            provider,
            store,
            unit,
            workspace,
            language: language.to_string(),
        }
    }

    fn fallback(&self) -> VideoMetadata {
        let title = if self.unit.title.trim().is_empty() {
            self.unit.source_ref.clone()
        } else {
            truncate_title(&self.unit.title)
        };
        let description = if self.unit.description.trim().is_empty() {
            DEFAULT_DESCRIPTION.to_string()
        } else {
            self.unit.description.clone()
        };
        VideoMetadata {
            title,
            description,
            tags: Vec::new(),
        }
    }

    async fn transcript(&self, ctx: &PipelineContext) -> Option<String> {
        let path = ctx
            .translated_subtitles
            .as_ref()
            .or(ctx.source_subtitles.as_ref())?;
        let content = tokio::fs::read_to_string(path).await.ok()?;
        let text = srt::parse(&content)
            .into_iter()
            .map(|e| e.text.replace('\n', " "))
            .collect::<Vec<_>>()
            .join(" ");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn prompt(&self, excerpt: &str) -> String {
        format!(
            "Based on the following video subtitles, write an engaging title, a detailed \
description and 3-5 tags.\n\nSubtitles:\n{excerpt}\n\nRequirements:\n\
1. The title is concise and at most 30 words.\n\
2. The description is 200-300 words and covers the main points.\n\
3. Write everything in {lang}.\n\
4. Reply with JSON only: {{\"title\": \"...\", \"description\": \"...\", \"tags\": [\"...\"]}}",
            lang = self.language
        )
    }

    async fn generate(&self, transcript: &str) -> Result<VideoMetadata, String> {
        let reply = self
            .provider
            .chat(SYSTEM_PROMPT, &self.prompt(&excerpt(transcript)))
            .await
            .map_err(|e| e.to_string())?;
        let mut metadata = parse_metadata(&reply)?;
        metadata.title = truncate_title(&metadata.title);
        Ok(metadata)
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Parses the model's JSON reply, tolerating a surrounding code fence.
pub fn parse_metadata(reply: &str) -> Result<VideoMetadata, String> {
    let mut body = reply.trim();
    for fence in ["```json", "```"] {
        if let Some(rest) = body.strip_prefix(fence) {
            body = rest.strip_suffix("```").unwrap_or(rest).trim();
            break;
        }
    }
    let metadata: VideoMetadata =
        serde_json::from_str(body).map_err(|e| format!("unparseable metadata: {e}"))?;
    if metadata.title.trim().is_empty() {
        return Err("generated title is empty".to_string());
    }
    Ok(metadata)
}

/// Titles longer than 80 characters are cut to 77 plus `...`.
pub fn truncate_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let kept: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{kept}...")
}

#[async_trait]
impl Step for GenerateMetadata {
    fn name(&self) -> &str {
        GENERATE_METADATA
    }

    fn reads(&self) -> &'static [ContextKey] {
        &[ContextKey::TranslatedSubtitles]
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::Metadata]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let unit_ref = self.unit.source_ref.as_str();
        let Some(transcript) = self.transcript(ctx).await else {
            warn!(unit = unit_ref, "no subtitles to describe, using unit metadata");
            ctx.metadata = Some(self.fallback());
            return Ok(StepOutcome::Completed);
        };

        let metadata = match self.generate(&transcript).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(unit = unit_ref, error = %e, "metadata generation failed, using unit metadata");
                ctx.metadata = Some(self.fallback());
                return Ok(StepOutcome::Completed);
            }
        };

        match serde_json::to_vec_pretty(&metadata) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(self.workspace.metadata_file(), json).await {
                    warn!(unit = unit_ref, error = %e, "failed to write meta.json");
                }
            }
            Err(e) => warn!(unit = unit_ref, error = %e, "failed to encode meta.json"),
        }
        if let Err(e) = self.store.save_generated_metadata(
            unit_ref,
            &metadata.title,
            &metadata.description,
            &metadata.tags.join(","),
        ) {
            warn!(unit = unit_ref, error = %e, "failed to save generated metadata");
        }

        info!(unit = unit_ref, title = %metadata.title, tags = ?metadata.tags, "generated metadata");
        ctx.metadata = Some(metadata);
        Ok(StepOutcome::Completed)
    }
}
