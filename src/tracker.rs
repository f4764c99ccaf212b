//! Durable per-unit, per-step execution records.
//!
//! [`StepTracker`] is the only writer of step rows. Every status change is a
//! single atomic UPDATE; the bulk startup reset and step initialisation run
//! in transactions. Errors are returned to the caller, which logs them and
//! carries on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::pipeline::PipelineContext;
use crate::store::{StartupReset, StepDefinition, StepRecord, StepStatus, Store};

/// Summary of how far a unit's steps have progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    pub total: usize,
    /// Completed or skipped.
    pub completed: usize,
    pub failed: usize,
    /// The running step, else the first pending one.
    pub current_step: Option<String>,
    pub percent: u8,
}

/// Step bookkeeping over the shared [`Store`]. Cloning shares the connection.
#[derive(Clone)]
pub struct StepTracker {
    store: Store,
}

impl StepTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Creates a pending record for every definition that has none.
    /// Calling it again for the same unit changes nothing.
    pub fn initialize_steps(
        &self,
        unit_ref: &str,
        definitions: &[StepDefinition],
    ) -> Result<usize, StoreError> {
        let created = self
            .store
            .insert_steps_if_absent(unit_ref, definitions, Utc::now())?;
        if created > 0 {
            debug!(unit = unit_ref, created, "initialized step records");
        }
        Ok(created)
    }

    /// Moves a step to `status`, stamping its start or end time.
    pub fn update_status(
        &self,
        unit_ref: &str,
        step: &str,
        status: StepStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_status_at(unit_ref, step, status, error, Utc::now())
    }

    /// `running` stamps the start time; completed, failed and skipped stamp
    /// the end time and duration. An error message is only kept for `failed`.
    pub fn update_status_at(
        &self,
        unit_ref: &str,
        step: &str,
        status: StepStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug!(unit = unit_ref, step, %status, "step status");
        match status {
            StepStatus::Pending => self.store.mark_step_pending(unit_ref, step),
            StepStatus::Running => self.store.mark_step_running(unit_ref, step, now),
            StepStatus::Failed => self
                .store
                .mark_step_finished(unit_ref, step, status, error, now),
            StepStatus::Completed | StepStatus::Skipped => self
                .store
                .mark_step_finished(unit_ref, step, status, None, now),
        }
    }

    /// Stores a snapshot of the context. A snapshot that cannot be serialized
    /// is stored empty so the step itself still succeeds.
    pub fn update_result(
        &self,
        unit_ref: &str,
        step: &str,
        context: &PipelineContext,
    ) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(context).unwrap_or_else(|e| {
            warn!(unit = unit_ref, step, error = %e, "failed to serialize step result");
            String::new()
        });
        self.store.set_step_result(unit_ref, step, &snapshot)
    }

    /// Back to pending with timestamps, error and snapshot cleared.
    pub fn reset_step(&self, unit_ref: &str, step: &str) -> Result<(), StoreError> {
        self.store.reset_step(unit_ref, step)
    }

    /// Running steps become pending and processing units become
    /// pending-ingestion, in one transaction.
    pub fn reset_all_running_on_startup(&self) -> Result<StartupReset, StoreError> {
        self.store.reset_running_on_startup()
    }

    /// Pending ingest steps of units past their first attempt whose earlier
    /// ingest steps are all done, oldest unit first.
    pub fn pending_retry_steps(&self) -> Result<Vec<StepRecord>, StoreError> {
        self.store.pending_retry_steps()
    }

    pub fn steps(&self, unit_ref: &str) -> Result<Vec<StepRecord>, StoreError> {
        self.store.steps_for_unit(unit_ref)
    }

    pub fn step(&self, unit_ref: &str, step: &str) -> Result<Option<StepRecord>, StoreError> {
        self.store.get_step(unit_ref, step)
    }

    /// Rebuilds a context from the snapshots of completed and skipped steps,
    /// in order. Unreadable snapshots are skipped.
    pub fn hydrate_context(&self, unit_ref: &str) -> Result<PipelineContext, StoreError> {
        let mut context = PipelineContext::default();
        for record in self.steps(unit_ref)? {
            if !record.status.is_done() {
                continue;
            }
            let Some(data) = record.result_data.as_deref().filter(|d| !d.is_empty()) else {
                continue;
            };
            match serde_json::from_str::<PipelineContext>(data) {
                Ok(snapshot) => context.absorb(snapshot),
                Err(e) => warn!(
                    unit = unit_ref,
                    step = %record.step_name,
                    error = %e,
                    "ignoring unreadable step snapshot"
                ),
            }
        }
        Ok(context)
    }

    pub fn progress(&self, unit_ref: &str) -> Result<StepProgress, StoreError> {
        let steps = self.steps(unit_ref)?;
        let total = steps.len();
        let completed = steps.iter().filter(|s| s.status.is_done()).count();
        let failed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let current_step = steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .or_else(|| steps.iter().find(|s| s.status == StepStatus::Pending))
            .map(|s| s.step_name.clone());
        let percent = if total == 0 {
            0
        } else {
            (completed * 100 / total) as u8
        };
        Ok(StepProgress {
            total,
            completed,
            failed,
            current_step,
            percent,
        })
    }
}
