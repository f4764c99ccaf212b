use async_trait::async_trait;

use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome};
use crate::store::WorkUnit;
use crate::translate::srt;
use crate::workspace::Workspace;

use super::GENERATE_SUBTITLES;

/// Writes the cues captured at submission as an SRT file.
pub struct GenerateSubtitles {
    unit: WorkUnit,
    workspace: Workspace,
}

impl GenerateSubtitles {
    pub fn new(unit: WorkUnit, workspace: Workspace) -> Self {
        Self { unit, workspace }
    }
}

#[async_trait]
impl Step for GenerateSubtitles {
    fn name(&self) -> &str {
        GENERATE_SUBTITLES
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::SourceSubtitles, ContextKey::SubtitleCount]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let entries = srt::entries_from_cues(&self.unit.subtitles);
        if entries.is_empty() {
            return Ok(StepOutcome::skipped("unit has no captured subtitles"));
        }

        self.workspace.prepare().await?;
        let path = self.workspace.source_subtitles();
        tokio::fs::write(&path, srt::render(&entries)).await?;

        ctx.source_subtitles = Some(path);
        ctx.subtitle_count = Some(entries.len());
        Ok(StepOutcome::Completed)
    }
}
