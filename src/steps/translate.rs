use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome};
use crate::translate::{BatchTranslator, SubtitleEntry, SubtitleValidator, srt};
use crate::workspace::Workspace;

use super::TRANSLATE_SUBTITLES;

/// Translates the source SRT, repairs weak entries and writes the result
/// next to it with the original timings.
pub struct TranslateSubtitles {
    translator: BatchTranslator,
    validator: Arc<SubtitleValidator>,
    workspace: Workspace,
    allow_placeholders: bool,
}

impl TranslateSubtitles {
    pub fn new(
        translator: BatchTranslator,
        validator: Arc<SubtitleValidator>,
        workspace: Workspace,
        allow_placeholders: bool,
    ) -> Self {
        Self {
            translator,
            validator,
            workspace,
            allow_placeholders,
        }
    }
}

#[async_trait]
impl Step for TranslateSubtitles {
    fn name(&self) -> &str {
        TRANSLATE_SUBTITLES
    }

    fn reads(&self) -> &'static [ContextKey] {
        &[ContextKey::SourceSubtitles]
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[
            ContextKey::TranslatedSubtitles,
            ContextKey::TranslatedCount,
            ContextKey::Validation,
        ]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let Some(source_path) = ctx.source_subtitles.clone() else {
            return Ok(StepOutcome::skipped("no source subtitles"));
        };
        let entries = srt::parse(&tokio::fs::read_to_string(&source_path).await?);
        if entries.is_empty() {
            return Ok(StepOutcome::skipped("source subtitles are empty"));
        }

        let sources: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
        let mut translated = self.translator.translate(&sources).await?;
        let summary = self
            .validator
            .validate_and_repair(&sources, &mut translated)
            .await;

        if !summary.is_clean() {
            if !self.allow_placeholders {
                return Err(StepError::Business(format!(
                    "{} of {} entries could not be translated",
                    summary.missing, summary.total
                )));
            }
            warn!(
                missing = summary.missing,
                total = summary.total,
                "keeping placeholders in translation"
            );
        }

        let output: Vec<SubtitleEntry> = entries
            .into_iter()
            .zip(translated)
            .map(|(entry, text)| SubtitleEntry { text, ..entry })
            .collect();
        let path = self.workspace.translated_subtitles();
        tokio::fs::write(&path, srt::render(&output)).await?;
        info!(entries = output.len(), fixed = summary.fixed, "wrote translated subtitles");

        ctx.translated_subtitles = Some(path);
        ctx.translated_count = Some(output.len());
        ctx.validation = Some(summary);
        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::ChatProvider;
    use crate::translate::batch::test_support::EchoProvider;

    const SOURCE: &str = "1\n00:00:01,000 --> 00:00:02,000\nHello\n\n2\n00:00:03,000 --> 00:00:04,500\nHow are you\n\n";

    fn step(provider: Arc<dyn ChatProvider>, dir: &std::path::Path, allow: bool) -> TranslateSubtitles {
        TranslateSubtitles::new(
            BatchTranslator::new(Arc::clone(&provider), 25, 2, "Simplified Chinese"),
            Arc::new(SubtitleValidator::new(provider, "Simplified Chinese", 10, Duration::ZERO)),
            Workspace::at(dir),
            allow,
        )
    }

    #[tokio::test]
    async fn translates_and_keeps_timings() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.srt");
        std::fs::write(&source, SOURCE).unwrap();
        let mut ctx = PipelineContext {
            source_subtitles: Some(source),
            ..PipelineContext::default()
        };

        let step = step(Arc::new(EchoProvider::default()), dir.path(), true);
        assert_eq!(step.execute(&mut ctx).await.unwrap(), StepOutcome::Completed);

        assert_eq!(ctx.translated_count, Some(2));
        assert!(ctx.validation.as_ref().unwrap().is_clean());
        let written = std::fs::read_to_string(dir.path().join("translated.srt")).unwrap();
        let parsed = srt::parse(&written);
        assert_eq!(parsed[0].text, "zh:Hello");
        assert_eq!(parsed[1].start, "00:00:03,000");
        assert_eq!(parsed[1].end, "00:00:04,500");
    }

    #[tokio::test]
    async fn skips_without_source_subtitles() {
        let dir = tempfile::tempdir().unwrap();
        let step = step(Arc::new(EchoProvider::default()), dir.path(), true);
        let outcome = step.execute(&mut PipelineContext::default()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn provider_failure_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.srt");
        std::fs::write(&source, SOURCE).unwrap();
        let mut ctx = PipelineContext {
            source_subtitles: Some(source),
            ..PipelineContext::default()
        };
        let provider = EchoProvider {
            fail_on: Some("Hello".into()),
            ..EchoProvider::default()
        };

        let err = step(Arc::new(provider), dir.path(), true)
            .execute(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::System(_)));
        assert!(ctx.translated_subtitles.is_none());
    }
}
