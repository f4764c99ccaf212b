use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use tracing::{debug, error, info, warn};

use super::{SingleFlight, run_single_step};
use crate::config::PublishConfig;
use crate::error::{RelayError, StoreError};
use crate::pipeline::{PipelineContext, PipelineFactory};
use crate::steps::{PUBLISH_PRIMARY, PUBLISH_SECONDARY};
use crate::store::{LifecycleStatus, WorkUnit};
use crate::tracker::StepTracker;

/// The two publication phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PublishPhase {
    Primary,
    Secondary,
}

/// What one phase of a publication tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The previous publication of this phase is too recent.
    CoolingDown,
    /// Nothing eligible.
    Idle,
    Published {
        unit_ref: String,
        status: LifecycleStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTick {
    Busy,
    Ran {
        primary: PhaseOutcome,
        secondary: PhaseOutcome,
    },
}

pub struct PublishScheduler {
    tracker: StepTracker,
    factory: Arc<dyn PipelineFactory>,
    work_dir: PathBuf,
    config: PublishConfig,
    flight: SingleFlight,
}

impl PublishScheduler {
    pub fn new(
        tracker: StepTracker,
        factory: Arc<dyn PipelineFactory>,
        work_dir: PathBuf,
        config: PublishConfig,
    ) -> Self {
        Self {
            tracker,
            factory,
            work_dir,
            config,
            flight: SingleFlight::new(),
        }
    }

    /// Settles units a crash left mid-publication. Must run before the
    /// first tick.
    pub fn recover(&self) -> Result<usize, RelayError> {
        let failed = self.tracker.store().fail_interrupted_publications()?;
        if failed > 0 {
            warn!(units = failed, "publications interrupted by a restart marked failed");
        }
        Ok(failed)
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            interval_secs = self.config.interval_secs,
            "publication scheduler started"
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                match scheduler.tick().await {
                    Ok(outcome) => debug!(?outcome, "publication tick finished"),
                    Err(e) => error!(error = %e, "publication tick failed"),
                }
            });
        }
    }

    pub async fn tick(&self) -> Result<PublishTick, RelayError> {
        self.tick_at(Utc::now()).await
    }

    /// One tick evaluated at `now`: at most one primary and one secondary
    /// publication.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<PublishTick, RelayError> {
        let Some(_flight) = self.flight.try_acquire() else {
            debug!("publication tick skipped, previous tick still running");
            return Ok(PublishTick::Busy);
        };
        let store = self.tracker.store();

        // PRIMARY
        let primary = if !cooled_down(
            store.latest_primary_publication()?,
            now,
            self.config.primary_cooldown(),
        ) {
            PhaseOutcome::CoolingDown
        } else {
            match store.oldest_unit_with_status(LifecycleStatus::Ready)? {
                None => PhaseOutcome::Idle,
                Some(unit) => self
                    .primary(&unit, LifecycleStatus::Ready, now)
                    .await?
                    .map_or(PhaseOutcome::Idle, |status| PhaseOutcome::Published {
                        unit_ref: unit.source_ref.clone(),
                        status,
                    }),
            }
        };

        // SECONDARY: only after the primary has had time to settle
        let secondary = if !cooled_down(
            store.latest_secondary_publication()?,
            now,
            self.config.secondary_cooldown(),
        ) {
            PhaseOutcome::CoolingDown
        } else {
            let cutoff = now - self.config.secondary_delay();
            match store.oldest_primary_published_before(cutoff)? {
                None => PhaseOutcome::Idle,
                Some(unit) => self
                    .secondary(&unit, LifecycleStatus::PrimaryPublished, now)
                    .await?
                    .map_or(PhaseOutcome::Idle, |status| PhaseOutcome::Published {
                        unit_ref: unit.source_ref.clone(),
                        status,
                    }),
            }
        };

        Ok(PublishTick::Ran { primary, secondary })
    }

    /// Publishes one phase immediately, ignoring cooldowns and the secondary
    /// delay. The allowed source statuses and the primary identifier
    /// requirement still apply.
    pub async fn publish_now(
        &self,
        unit_ref: &str,
        phase: PublishPhase,
    ) -> Result<LifecycleStatus, RelayError> {
        let _flight = self.flight.try_acquire().ok_or(RelayError::Busy)?;
        let unit = self
            .tracker
            .store()
            .get_unit(unit_ref)?
            .ok_or_else(|| RelayError::UnitNotFound(unit_ref.to_string()))?;
        let invalid = |reason: &str| RelayError::InvalidState {
            unit_ref: unit_ref.to_string(),
            status: unit.status.to_string(),
            reason: reason.to_string(),
        };

        let now = Utc::now();
        let outcome = match phase {
            PublishPhase::Primary => {
                if !matches!(
                    unit.status,
                    LifecycleStatus::Ready | LifecycleStatus::PrimaryPublishFailed
                ) {
                    return Err(invalid("primary publication needs a ready unit"));
                }
                self.primary(&unit, unit.status, now).await?
            }
            PublishPhase::Secondary => {
                if !matches!(
                    unit.status,
                    LifecycleStatus::PrimaryPublished | LifecycleStatus::SecondaryPublishFailed
                ) {
                    return Err(invalid("secondary publication needs a primary publication"));
                }
                if unit.publish_id().is_none() {
                    return Err(invalid("no primary publication id"));
                }
                self.secondary(&unit, unit.status, now).await?
            }
        };
        outcome.ok_or_else(|| invalid("status changed concurrently"))
    }

    /// Runs `step` and returns its context with the completion time on the
    /// clock of `started_at`. A store failure while running the step counts
    /// as a step failure so the unit still leaves its publishing status.
    async fn run_step(
        &self,
        unit: &WorkUnit,
        step: &str,
        started_at: DateTime<Utc>,
    ) -> (PipelineContext, DateTime<Utc>) {
        let started = Instant::now();
        let ctx = match run_single_step(
            &self.tracker,
            self.factory.as_ref(),
            &self.work_dir,
            unit,
            step,
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => PipelineContext {
                error: Some(format!("{step}: {e}")),
                ..PipelineContext::default()
            },
        };
        let elapsed = chrono::Duration::from_std(started.elapsed()).unwrap_or(chrono::Duration::zero());
        (ctx, started_at + elapsed)
    }

    /// `from` → publishing-primary → primary-published, or
    /// primary-published-failed. `None` if the unit was no longer in `from`.
    /// The publication is stamped when the upload finishes, not when it starts.
    async fn primary(
        &self,
        unit: &WorkUnit,
        from: LifecycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleStatus>, StoreError> {
        let store = self.tracker.store();
        let unit_ref = unit.source_ref.as_str();
        if !store.compare_and_set_status(unit_ref, from, LifecycleStatus::PublishingPrimary)? {
            return Ok(None);
        }
        info!(unit = unit_ref, "publishing primary");

        let (ctx, finished_at) = self.run_step(unit, PUBLISH_PRIMARY, now).await;

        let id = ctx
            .primary_publish_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        match (&ctx.error, id) {
            (None, Some(id)) => {
                store.record_primary_publication(unit_ref, id, finished_at)?;
                info!(unit = unit_ref, id, "primary published");
                Ok(Some(LifecycleStatus::PrimaryPublished))
            }
            (error, _) => {
                warn!(
                    unit = unit_ref,
                    error = error.as_deref().unwrap_or("empty publish id"),
                    "primary publication failed"
                );
                store.compare_and_set_status(
                    unit_ref,
                    LifecycleStatus::PublishingPrimary,
                    LifecycleStatus::PrimaryPublishFailed,
                )?;
                Ok(Some(LifecycleStatus::PrimaryPublishFailed))
            }
        }
    }

    /// `from` → publishing-secondary → fully-published, or
    /// secondary-published-failed.
    async fn secondary(
        &self,
        unit: &WorkUnit,
        from: LifecycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleStatus>, StoreError> {
        let store = self.tracker.store();
        let unit_ref = unit.source_ref.as_str();
        if !store.compare_and_set_status(unit_ref, from, LifecycleStatus::PublishingSecondary)? {
            return Ok(None);
        }
        info!(unit = unit_ref, "publishing secondary");

        let (ctx, finished_at) = self.run_step(unit, PUBLISH_SECONDARY, now).await;

        match &ctx.error {
            None => {
                store.record_secondary_publication(unit_ref, finished_at)?;
                info!(unit = unit_ref, "fully published");
                Ok(Some(LifecycleStatus::FullyPublished))
            }
            Some(error) => {
                warn!(unit = unit_ref, %error, "secondary publication failed");
                store.compare_and_set_status(
                    unit_ref,
                    LifecycleStatus::PublishingSecondary,
                    LifecycleStatus::SecondaryPublishFailed,
                )?;
                Ok(Some(LifecycleStatus::SecondaryPublishFailed))
            }
        }
    }
}

/// True when nothing was published yet or the last publication is at least
/// `cooldown` old.
fn cooled_down(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
    last.is_none_or(|at| now - at >= cooldown)
}
