//! The concrete media pipeline: seven steps in a fixed order.

mod cover;
mod fetch_source;
mod metadata;
mod publish;
mod subtitles;
mod translate;

use std::sync::Arc;
use std::time::Duration;

use crate::config::RelayConfig;
use crate::external::{Publisher, SourceFetcher};
use crate::llm::{ChatProvider, LlmError};
use crate::pipeline::{PipelineFactory, Step};
use crate::store::{StepDefinition, StepPhase, Store, WorkUnit};
use crate::translate::{BatchTranslator, SubtitleValidator};
use crate::workspace::Workspace;

pub use cover::FetchCover;
pub use fetch_source::FetchSource;
pub use metadata::{GenerateMetadata, parse_metadata, truncate_title};
pub use publish::{PublishPrimary, PublishSecondary};
pub use subtitles::GenerateSubtitles;
pub use translate::TranslateSubtitles;

pub const FETCH_SOURCE: &str = "fetch_source";
pub const GENERATE_SUBTITLES: &str = "generate_subtitles";
pub const FETCH_COVER: &str = "fetch_cover";
pub const TRANSLATE_SUBTITLES: &str = "translate_subtitles";
pub const GENERATE_METADATA: &str = "generate_metadata";
pub const PUBLISH_PRIMARY: &str = "publish_primary";
pub const PUBLISH_SECONDARY: &str = "publish_secondary";

const fn def(name: &'static str, order: u32, phase: StepPhase) -> StepDefinition {
    StepDefinition {
        name,
        order,
        can_retry: true,
        phase,
    }
}

pub const STEP_DEFINITIONS: [StepDefinition; 7] = [
    def(FETCH_SOURCE, 1, StepPhase::Ingest),
    def(GENERATE_SUBTITLES, 2, StepPhase::Ingest),
    def(FETCH_COVER, 3, StepPhase::Ingest),
    def(TRANSLATE_SUBTITLES, 4, StepPhase::Ingest),
    def(GENERATE_METADATA, 5, StepPhase::Ingest),
    def(PUBLISH_PRIMARY, 6, StepPhase::Publish),
    def(PUBLISH_SECONDARY, 7, StepPhase::Publish),
];

/// Builds the production steps from shared services.
pub struct MediaPipeline {
    store: Store,
    fetcher: Arc<dyn SourceFetcher>,
    publisher: Arc<dyn Publisher>,
    provider: Arc<dyn ChatProvider>,
    translator: BatchTranslator,
    validator: Arc<SubtitleValidator>,
    http: reqwest::Client,
    cover_templates: Vec<String>,
    target_language: String,
    caption_language: String,
    source_caption_language: String,
    allow_placeholders: bool,
}

impl MediaPipeline {
    pub fn new(
        config: &RelayConfig,
        store: Store,
        fetcher: Arc<dyn SourceFetcher>,
        publisher: Arc<dyn Publisher>,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.cover.timeout_secs))
            .build()?;
        Ok(Self {
            store,
            fetcher,
            publisher,
            translator: BatchTranslator::from_config(Arc::clone(&provider), &config.translation),
            validator: Arc::new(SubtitleValidator::from_config(
                Arc::clone(&provider),
                &config.translation,
            )),
            provider,
            http,
            cover_templates: config.cover.url_templates.clone(),
            target_language: config.translation.target_language.clone(),
            caption_language: config.translation.caption_language.clone(),
            source_caption_language: config.translation.source_caption_language.clone(),
            allow_placeholders: config.translation.allow_placeholders,
        })
    }
}

impl PipelineFactory for MediaPipeline {
    fn definitions(&self) -> &[StepDefinition] {
        &STEP_DEFINITIONS
    }

    fn step(&self, name: &str, unit: &WorkUnit, workspace: &Workspace) -> Option<Box<dyn Step>> {
        let ws = workspace.clone();
        let step: Box<dyn Step> = match name {
            FETCH_SOURCE => Box::new(FetchSource::new(
                Arc::clone(&self.fetcher),
                unit.clone(),
                ws,
            )),
            GENERATE_SUBTITLES => Box::new(GenerateSubtitles::new(unit.clone(), ws)),
            FETCH_COVER => Box::new(FetchCover::new(
                self.http.clone(),
                self.cover_templates.clone(),
                &unit.source_ref,
                ws,
            )),
            TRANSLATE_SUBTITLES => Box::new(TranslateSubtitles::new(
                self.translator.clone(),
                Arc::clone(&self.validator),
                ws,
                self.allow_placeholders,
            )),
            GENERATE_METADATA => Box::new(GenerateMetadata::new(
                Arc::clone(&self.provider),
                self.store.clone(),
                unit.clone(),
                ws,
                &self.target_language,
            )),
            PUBLISH_PRIMARY => Box::new(PublishPrimary::new(
                Arc::clone(&self.publisher),
                unit.clone(),
                ws,
            )),
            PUBLISH_SECONDARY => Box::new(PublishSecondary::new(
                Arc::clone(&self.publisher),
                unit.clone(),
                ws,
                &self.caption_language,
                &self.source_caption_language,
            )),
            _ => return None,
        };
        Some(step)
    }
}
