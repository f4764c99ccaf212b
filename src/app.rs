//! Wires configuration, storage and services together for each command.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::external::{CommandFetcher, CommandPublisher};
use crate::llm::{ChatProvider, OpenAiClient};
use crate::scheduler::{IngestScheduler, PublishPhase, PublishScheduler};
use crate::steps::MediaPipeline;
use crate::store::{CaptionCue, LifecycleStatus, NewUnit, StepPhase, StepRecord, Store, WorkUnit};
use crate::tracker::{StepProgress, StepTracker};
use crate::translate::{BatchTranslator, SubtitleEntry, SubtitleValidator, ValidationSummary, srt};

pub struct App {
    config: RelayConfig,
    tracker: StepTracker,
}

impl App {
    pub fn open(config: RelayConfig) -> Result<Self, RelayError> {
        let store = Store::open(&config.database_path)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: RelayConfig, store: Store) -> Self {
        Self {
            config,
            tracker: StepTracker::new(store),
        }
    }

    fn store(&self) -> &Store {
        self.tracker.store()
    }

    fn provider(&self) -> Result<Arc<dyn ChatProvider>, RelayError> {
        if self.config.llm.api_key.trim().is_empty() {
            return Err(RelayError::Config(
                "llm.api_key is not set (or VIDRELAY_LLM_API_KEY)".to_string(),
            ));
        }
        Ok(Arc::new(OpenAiClient::from_config(&self.config.llm)?))
    }

    fn pipeline(&self) -> Result<Arc<MediaPipeline>, RelayError> {
        let tools = &self.config.tools;
        let pipeline = MediaPipeline::new(
            &self.config,
            self.store().clone(),
            Arc::new(CommandFetcher::new(tools.fetch.clone())),
            Arc::new(CommandPublisher::new(
                tools.publish_video.clone(),
                tools.publish_captions.clone(),
            )),
            self.provider()?,
        )?;
        Ok(Arc::new(pipeline))
    }

    fn publish_scheduler(&self) -> Result<PublishScheduler, RelayError> {
        Ok(PublishScheduler::new(
            self.tracker.clone(),
            self.pipeline()?,
            self.config.work_dir.clone(),
            self.config.publish.clone(),
        ))
    }

    /// Returns the stored unit and whether it was newly created.
    pub fn submit(&self, unit: NewUnit) -> Result<(WorkUnit, bool), RelayError> {
        let (stored, created) = self.store().submit_unit(&unit, chrono::Utc::now())?;
        if created {
            info!(unit = %stored.source_ref, cues = stored.subtitles.len(), "unit submitted");
        }
        Ok((stored, created))
    }

    pub fn load_cues(path: &Path) -> Result<Vec<CaptionCue>, RelayError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn units(&self) -> Result<Vec<WorkUnit>, RelayError> {
        Ok(self.store().list_units(None)?)
    }

    pub fn unit_status(
        &self,
        unit_ref: &str,
    ) -> Result<(WorkUnit, Vec<StepRecord>, StepProgress), RelayError> {
        let unit = self
            .store()
            .get_unit(unit_ref)?
            .ok_or_else(|| RelayError::UnitNotFound(unit_ref.to_string()))?;
        let steps = self.tracker.steps(unit_ref)?;
        let progress = self.tracker.progress(unit_ref)?;
        Ok((unit, steps, progress))
    }

    /// Resets one ingest step so the next ingestion tick re-runs it.
    pub fn retry(&self, unit_ref: &str, step: &str) -> Result<(), RelayError> {
        let unit = self
            .store()
            .get_unit(unit_ref)?
            .ok_or_else(|| RelayError::UnitNotFound(unit_ref.to_string()))?;
        let invalid = |reason: &str| RelayError::InvalidState {
            unit_ref: unit_ref.to_string(),
            status: unit.status.to_string(),
            reason: reason.to_string(),
        };
        if unit.status == LifecycleStatus::Processing {
            return Err(invalid("unit is being processed"));
        }

        let record = self
            .tracker
            .step(unit_ref, step)?
            .ok_or_else(|| RelayError::StepNotFound {
                unit_ref: unit_ref.to_string(),
                step: step.to_string(),
            })?;
        if !record.can_retry {
            return Err(invalid("step cannot be retried"));
        }
        if record.phase == StepPhase::Publish {
            return Err(invalid("publish steps are re-run with `publish`"));
        }

        self.tracker.reset_step(unit_ref, step)?;
        info!(unit = unit_ref, step, "step reset for retry");
        Ok(())
    }

    pub async fn publish(
        &self,
        unit_ref: &str,
        phase: PublishPhase,
    ) -> Result<LifecycleStatus, RelayError> {
        self.publish_scheduler()?.publish_now(unit_ref, phase).await
    }

    /// Runs both schedulers until Ctrl-C.
    pub async fn run(&self) -> Result<(), RelayError> {
        let pipeline = self.pipeline()?;
        let ingest = Arc::new(IngestScheduler::new(
            self.tracker.clone(),
            pipeline.clone(),
            self.config.work_dir.clone(),
            Duration::from_secs(self.config.ingest.interval_secs),
        ));
        let publish = Arc::new(PublishScheduler::new(
            self.tracker.clone(),
            pipeline,
            self.config.work_dir.clone(),
            self.config.publish.clone(),
        ));

        ingest.recover()?;
        publish.recover()?;
        info!(
            database = %self.config.database_path.display(),
            work_dir = %self.config.work_dir.display(),
            "vidrelay running"
        );

        tokio::select! {
            _ = Arc::clone(&ingest).run() => {}
            _ = Arc::clone(&publish).run() => {}
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown requested");
            }
        }
        Ok(())
    }

    /// Translates an SRT file outside the pipeline.
    pub async fn translate_file(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<ValidationSummary, RelayError> {
        let provider = self.provider()?;
        let entries = srt::parse(&tokio::fs::read_to_string(input).await?);
        let sources: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();

        let translator = BatchTranslator::from_config(Arc::clone(&provider), &self.config.translation);
        let mut translated = translator.translate(&sources).await?;
        let validator = SubtitleValidator::from_config(provider, &self.config.translation);
        let summary = validator.validate_and_repair(&sources, &mut translated).await;

        let output_entries: Vec<SubtitleEntry> = entries
            .into_iter()
            .zip(translated)
            .map(|(entry, text)| SubtitleEntry { text, ..entry })
            .collect();
        tokio::fs::write(output, srt::render(&output_entries)).await?;
        Ok(summary)
    }
}
