use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{STEP_COLUMNS, Store, step_from_row, to_millis};
use crate::error::StoreError;
use crate::store::{LifecycleStatus, StepDefinition, StepPhase, StepRecord, StepStatus};

fn not_found(unit_ref: &str, step: &str) -> StoreError {
    StoreError::StepNotFound {
        unit_ref: unit_ref.to_string(),
        step: step.to_string(),
    }
}

impl Store {
    /// Inserts a pending record for every definition not already present.
    /// Returns how many were created.
    pub fn insert_steps_if_absent(
        &self,
        unit_ref: &str,
        definitions: &[StepDefinition],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut created = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO steps
                     (unit_ref, step_name, step_order, phase, status, can_retry, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for def in definitions {
                created += stmt.execute(params![
                    unit_ref,
                    def.name,
                    def.order,
                    def.phase,
                    StepStatus::Pending,
                    def.can_retry,
                    to_millis(now)
                ])?;
            }
        }
        tx.commit()?;
        Ok(created)
    }

    pub fn steps_for_unit(&self, unit_ref: &str) -> Result<Vec<StepRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps s WHERE s.unit_ref = ?1 ORDER BY s.step_order"
        ))?;
        let steps = stmt
            .query_map(params![unit_ref], step_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    pub fn get_step(&self, unit_ref: &str, step: &str) -> Result<Option<StepRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps s WHERE s.unit_ref = ?1 AND s.step_name = ?2"
                ),
                params![unit_ref, step],
                step_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn mark_step_running(
        &self,
        unit_ref: &str,
        step: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps
             SET status = ?1, start_time = ?2, end_time = NULL, duration_ms = NULL,
                 error_message = NULL
             WHERE unit_ref = ?3 AND step_name = ?4",
            params![StepStatus::Running, to_millis(now), unit_ref, step],
        )?;
        if changed == 0 {
            return Err(not_found(unit_ref, step));
        }
        Ok(())
    }

    /// Terminal transition: stamps the end time and derives the duration from
    /// the stored start time (zero when the step never started).
    pub fn mark_step_finished(
        &self,
        unit_ref: &str,
        step: &str,
        status: StepStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps
             SET status = ?1,
                 end_time = ?2,
                 duration_ms = CASE WHEN start_time IS NULL THEN 0 ELSE ?2 - start_time END,
                 error_message = COALESCE(?3, error_message)
             WHERE unit_ref = ?4 AND step_name = ?5",
            params![status, to_millis(now), error, unit_ref, step],
        )?;
        if changed == 0 {
            return Err(not_found(unit_ref, step));
        }
        Ok(())
    }

    pub fn mark_step_pending(&self, unit_ref: &str, step: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps SET status = ?1 WHERE unit_ref = ?2 AND step_name = ?3",
            params![StepStatus::Pending, unit_ref, step],
        )?;
        if changed == 0 {
            return Err(not_found(unit_ref, step));
        }
        Ok(())
    }

    pub fn set_step_result(
        &self,
        unit_ref: &str,
        step: &str,
        result_data: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps SET result_data = ?1 WHERE unit_ref = ?2 AND step_name = ?3",
            params![result_data, unit_ref, step],
        )?;
        if changed == 0 {
            return Err(not_found(unit_ref, step));
        }
        Ok(())
    }

    /// Back to pending with timestamps, duration, error and result cleared.
    pub fn reset_step(&self, unit_ref: &str, step: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE steps
             SET status = ?1, start_time = NULL, end_time = NULL, duration_ms = NULL,
                 error_message = NULL, result_data = NULL
             WHERE unit_ref = ?2 AND step_name = ?3",
            params![StepStatus::Pending, unit_ref, step],
        )?;
        if changed == 0 {
            return Err(not_found(unit_ref, step));
        }
        Ok(())
    }

    /// Pending ingest steps that are ready to be retried.
    ///
    /// Only units that already went through a first attempt qualify (not
    /// pending-ingestion, not processing), and only steps whose earlier
    /// ingest steps are all completed or skipped. Oldest unit first.
    pub fn pending_retry_steps(&self) -> Result<Vec<StepRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS}
             FROM steps s JOIN units u ON u.source_ref = s.unit_ref
             WHERE s.status = ?1
               AND s.phase = ?2
               AND u.status NOT IN (?3, ?4)
               AND NOT EXISTS (
                   SELECT 1 FROM steps e
                   WHERE e.unit_ref = s.unit_ref
                     AND e.phase = ?2
                     AND e.step_order < s.step_order
                     AND e.status NOT IN (?5, ?6)
               )
             ORDER BY u.created_at, u.id, s.step_order"
        ))?;
        let steps = stmt
            .query_map(
                params![
                    StepStatus::Pending,
                    StepPhase::Ingest,
                    LifecycleStatus::PendingIngestion,
                    LifecycleStatus::Processing,
                    StepStatus::Completed,
                    StepStatus::Skipped
                ],
                step_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{INGEST, submit};
    use super::*;
    use chrono::Duration;

    fn store_with_unit(source_ref: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        submit(&store, source_ref);
        store
            .insert_steps_if_absent(source_ref, INGEST, Utc::now())
            .unwrap();
        store
    }

    #[test]
    fn insert_steps_is_idempotent() {
        let store = store_with_unit("a");
        assert_eq!(
            store.insert_steps_if_absent("a", INGEST, Utc::now()).unwrap(),
            0
        );
        let steps = store.steps_for_unit("a").unwrap();
        assert_eq!(steps.len(), INGEST.len());
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(steps[3].phase, StepPhase::Publish);
    }

    #[test]
    fn finished_step_records_duration_and_error() {
        let store = store_with_unit("a");
        let start = Utc::now();
        store.mark_step_running("a", "first", start).unwrap();
        store
            .mark_step_finished(
                "a",
                "first",
                StepStatus::Failed,
                Some("boom"),
                start + Duration::milliseconds(1500),
            )
            .unwrap();

        let step = store.get_step("a", "first").unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.duration_ms, Some(1500));
        assert_eq!(step.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn finishing_an_unstarted_step_has_zero_duration() {
        let store = store_with_unit("a");
        store
            .mark_step_finished("a", "second", StepStatus::Skipped, None, Utc::now())
            .unwrap();
        let step = store.get_step("a", "second").unwrap().unwrap();
        assert_eq!(step.duration_ms, Some(0));
        assert!(step.end_time.is_some());
    }

    #[test]
    fn missing_step_is_reported() {
        let store = store_with_unit("a");
        let err = store.mark_step_running("a", "nope", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::StepNotFound { .. }));
    }

    #[test]
    fn reset_clears_everything() {
        let store = store_with_unit("a");
        let now = Utc::now();
        store.mark_step_running("a", "first", now).unwrap();
        store.set_step_result("a", "first", "{\"k\":1}").unwrap();
        store
            .mark_step_finished("a", "first", StepStatus::Failed, Some("x"), now)
            .unwrap();
        store.reset_step("a", "first").unwrap();

        let step = store.get_step("a", "first").unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.start_time.is_none());
        assert!(step.end_time.is_none());
        assert!(step.duration_ms.is_none());
        assert!(step.error_message.is_none());
        assert!(step.result_data.is_none());
    }

    #[test]
    fn retry_candidates_skip_fresh_units_and_blocked_steps() {
        let store = store_with_unit("fresh");
        submit(&store, "failed");
        let now = Utc::now();
        store.insert_steps_if_absent("failed", INGEST, now).unwrap();
        store
            .compare_and_set_status(
                "failed",
                LifecycleStatus::PendingIngestion,
                LifecycleStatus::Failed,
            )
            .unwrap();
        store
            .mark_step_finished("failed", "first", StepStatus::Completed, None, now)
            .unwrap();
        store
            .mark_step_finished("failed", "second", StepStatus::Failed, Some("x"), now)
            .unwrap();

        // second failed, third blocked behind it, fresh unit not eligible.
        assert!(store.pending_retry_steps().unwrap().is_empty());

        store.reset_step("failed", "second").unwrap();
        let retry = store.pending_retry_steps().unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].unit_ref, "failed");
        assert_eq!(retry[0].step_name, "second");
    }

    #[test]
    fn publish_steps_are_never_retry_candidates() {
        let store = store_with_unit("a");
        let now = Utc::now();
        store
            .compare_and_set_status("a", LifecycleStatus::PendingIngestion, LifecycleStatus::Ready)
            .unwrap();
        for step in ["first", "second", "third"] {
            store
                .mark_step_finished("a", step, StepStatus::Completed, None, now)
                .unwrap();
        }
        assert!(store.pending_retry_steps().unwrap().is_empty());
    }
}
