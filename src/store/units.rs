use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Store, UNIT_COLUMNS, to_millis, unit_from_row};
use crate::error::StoreError;
use crate::store::{LifecycleStatus, NewUnit, WorkUnit};

impl Store {
    /// Create-if-absent keyed by `source_ref`. Returns the stored unit and
    /// whether this call created it.
    pub fn submit_unit(
        &self,
        unit: &NewUnit,
        now: DateTime<Utc>,
    ) -> Result<(WorkUnit, bool), StoreError> {
        let subtitles = serde_json::to_string(&unit.subtitles)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let created = tx.execute(
            "INSERT OR IGNORE INTO units
                 (source_ref, url, title, description, subtitles, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                unit.source_ref,
                unit.url,
                unit.title,
                unit.description,
                subtitles,
                LifecycleStatus::PendingIngestion,
                to_millis(now)
            ],
        )? == 1;
        let stored = tx.query_row(
            &format!("SELECT {UNIT_COLUMNS} FROM units WHERE source_ref = ?1"),
            params![unit.source_ref],
            unit_from_row,
        )?;
        tx.commit()?;
        Ok((stored, created))
    }

    pub fn get_unit(&self, source_ref: &str) -> Result<Option<WorkUnit>, StoreError> {
        let conn = self.lock()?;
        let unit = conn
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM units WHERE source_ref = ?1"),
                params![source_ref],
                unit_from_row,
            )
            .optional()?;
        Ok(unit)
    }

    pub fn require_unit(&self, source_ref: &str) -> Result<WorkUnit, StoreError> {
        self.get_unit(source_ref)?
            .ok_or_else(|| StoreError::UnitNotFound(source_ref.to_string()))
    }

    /// All units, oldest first, optionally filtered by status.
    pub fn list_units(
        &self,
        status: Option<LifecycleStatus>,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM units
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, id"
        ))?;
        let units = stmt
            .query_map(params![status], unit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    pub fn oldest_unit_with_status(
        &self,
        status: LifecycleStatus,
    ) -> Result<Option<WorkUnit>, StoreError> {
        let conn = self.lock()?;
        let unit = conn
            .query_row(
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM units WHERE status = ?1
                     ORDER BY created_at, id LIMIT 1"
                ),
                params![status],
                unit_from_row,
            )
            .optional()?;
        Ok(unit)
    }

    /// Oldest primary-published unit with a non-empty platform id whose
    /// primary publication happened at or before `cutoff`.
    pub fn oldest_primary_published_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<WorkUnit>, StoreError> {
        let conn = self.lock()?;
        let unit = conn
            .query_row(
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM units
                     WHERE status = ?1
                       AND TRIM(COALESCE(primary_publish_id, '')) <> ''
                       AND primary_published_at IS NOT NULL
                       AND primary_published_at <= ?2
                     ORDER BY created_at, id LIMIT 1"
                ),
                params![LifecycleStatus::PrimaryPublished, to_millis(cutoff)],
                unit_from_row,
            )
            .optional()?;
        Ok(unit)
    }

    /// Moves a unit from `expected` to `next` in one conditional UPDATE.
    /// Returns false when the unit was not in `expected`.
    pub fn compare_and_set_status(
        &self,
        source_ref: &str,
        expected: LifecycleStatus,
        next: LifecycleStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE units SET status = ?1, updated_at = ?2
             WHERE source_ref = ?3 AND status = ?4",
            params![next, to_millis(Utc::now()), source_ref, expected],
        )?;
        Ok(changed == 1)
    }

    /// publishing-primary → primary-published, recording the platform id and time.
    pub fn record_primary_publication(
        &self,
        source_ref: &str,
        publish_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE units
             SET status = ?1, primary_publish_id = ?2, primary_published_at = ?3, updated_at = ?3
             WHERE source_ref = ?4 AND status = ?5",
            params![
                LifecycleStatus::PrimaryPublished,
                publish_id,
                to_millis(at),
                source_ref,
                LifecycleStatus::PublishingPrimary
            ],
        )?;
        Ok(changed == 1)
    }

    /// publishing-secondary → fully-published, recording the time.
    pub fn record_secondary_publication(
        &self,
        source_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE units
             SET status = ?1, secondary_published_at = ?2, updated_at = ?2
             WHERE source_ref = ?3 AND status = ?4",
            params![
                LifecycleStatus::FullyPublished,
                to_millis(at),
                source_ref,
                LifecycleStatus::PublishingSecondary
            ],
        )?;
        Ok(changed == 1)
    }

    /// Moves units left in a publishing status by a crash to the matching
    /// failed status. Whether the platform accepted the upload is unknown,
    /// so they wait for a manual re-trigger instead of publishing twice.
    pub fn fail_interrupted_publications(&self) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let now = to_millis(Utc::now());
        let tx = conn.transaction()?;
        let mut changed = 0;
        for (from, to) in [
            (
                LifecycleStatus::PublishingPrimary,
                LifecycleStatus::PrimaryPublishFailed,
            ),
            (
                LifecycleStatus::PublishingSecondary,
                LifecycleStatus::SecondaryPublishFailed,
            ),
        ] {
            changed += tx.execute(
                "UPDATE units SET status = ?1, updated_at = ?2 WHERE status = ?3",
                params![to, now, from],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn latest_primary_publication(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.latest_timestamp("primary_published_at")
    }

    pub fn latest_secondary_publication(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.latest_timestamp("secondary_published_at")
    }

    fn latest_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let ms: Option<i64> =
            conn.query_row(&format!("SELECT MAX({column}) FROM units"), [], |row| {
                row.get(0)
            })?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Persists LLM-generated metadata. Does not touch the lifecycle status.
    pub fn save_generated_metadata(
        &self,
        source_ref: &str,
        title: &str,
        description: &str,
        tags: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE units
             SET generated_title = ?1, generated_description = ?2, generated_tags = ?3,
                 updated_at = ?4
             WHERE source_ref = ?5",
            params![title, description, tags, to_millis(Utc::now()), source_ref],
        )?;
        if changed == 0 {
            return Err(StoreError::UnitNotFound(source_ref.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::submit;
    use super::*;
    use crate::store::CaptionCue;
    use chrono::Duration;

    #[test]
    fn submit_is_create_if_absent() {
        let store = Store::open_in_memory().unwrap();
        let mut unit = NewUnit::new("dQw4w9WgXcQ");
        unit.title = "First".into();
        unit.subtitles = vec![CaptionCue {
            text: "hello".into(),
            offset: 1.5,
            duration: 2.0,
            lang: "en".into(),
        }];

        let (stored, created) = store.submit_unit(&unit, Utc::now()).unwrap();
        assert!(created);
        assert_eq!(stored.status, LifecycleStatus::PendingIngestion);
        assert_eq!(stored.subtitles.len(), 1);

        unit.title = "Second".into();
        let (again, created) = store.submit_unit(&unit, Utc::now()).unwrap();
        assert!(!created);
        assert_eq!(again.title, "First");
        assert_eq!(again.id, stored.id);
    }

    #[test]
    fn compare_and_set_requires_expected_status() {
        let store = Store::open_in_memory().unwrap();
        submit(&store, "a");

        assert!(
            !store
                .compare_and_set_status("a", LifecycleStatus::Ready, LifecycleStatus::Failed)
                .unwrap()
        );
        assert!(
            store
                .compare_and_set_status(
                    "a",
                    LifecycleStatus::PendingIngestion,
                    LifecycleStatus::Processing
                )
                .unwrap()
        );
        assert_eq!(
            store.require_unit("a").unwrap().status,
            LifecycleStatus::Processing
        );
        assert!(matches!(
            store.require_unit("missing"),
            Err(StoreError::UnitNotFound(_))
        ));
    }

    #[test]
    fn oldest_unit_respects_submission_order() {
        let store = Store::open_in_memory().unwrap();
        let base = Utc::now();
        store
            .submit_unit(&NewUnit::new("late"), base + Duration::seconds(5))
            .unwrap();
        store.submit_unit(&NewUnit::new("early"), base).unwrap();

        let oldest = store
            .oldest_unit_with_status(LifecycleStatus::PendingIngestion)
            .unwrap()
            .unwrap();
        assert_eq!(oldest.source_ref, "early");
        assert!(
            store
                .oldest_unit_with_status(LifecycleStatus::Ready)
                .unwrap()
                .is_none()
        );
        assert_eq!(store.list_units(None).unwrap().len(), 2);
    }

    #[test]
    fn primary_publication_gates_secondary_candidates() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        submit(&store, "a");
        store
            .compare_and_set_status(
                "a",
                LifecycleStatus::PendingIngestion,
                LifecycleStatus::PublishingPrimary,
            )
            .unwrap();
        assert!(store.record_primary_publication("a", "BV1abc", now).unwrap());

        let unit = store.require_unit("a").unwrap();
        assert_eq!(unit.status, LifecycleStatus::PrimaryPublished);
        assert_eq!(unit.publish_id(), Some("BV1abc"));
        assert_eq!(
            store.latest_primary_publication().unwrap().map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        assert!(
            store
                .oldest_primary_published_before(now - Duration::seconds(1))
                .unwrap()
                .is_none()
        );
        let due = store.oldest_primary_published_before(now).unwrap().unwrap();
        assert_eq!(due.source_ref, "a");
    }

    #[test]
    fn blank_publish_id_is_never_a_secondary_candidate() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        submit(&store, "a");
        store
            .compare_and_set_status(
                "a",
                LifecycleStatus::PendingIngestion,
                LifecycleStatus::PublishingPrimary,
            )
            .unwrap();
        store.record_primary_publication("a", " ", now).unwrap();
        assert!(
            store
                .oldest_primary_published_before(now + Duration::hours(2))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn save_generated_metadata_keeps_status() {
        let store = Store::open_in_memory().unwrap();
        submit(&store, "a");
        store
            .save_generated_metadata("a", "Title", "Desc", "one,two")
            .unwrap();
        let unit = store.require_unit("a").unwrap();
        assert_eq!(unit.generated_title.as_deref(), Some("Title"));
        assert_eq!(unit.generated_tags.as_deref(), Some("one,two"));
        assert_eq!(unit.status, LifecycleStatus::PendingIngestion);
        assert!(store.save_generated_metadata("nope", "", "", "").is_err());
    }

    #[test]
    fn interrupted_publications_become_failed() {
        let store = Store::open_in_memory().unwrap();
        submit(&store, "a");
        submit(&store, "b");
        submit(&store, "c");
        store
            .compare_and_set_status("a", LifecycleStatus::PendingIngestion, LifecycleStatus::PublishingPrimary)
            .unwrap();
        store
            .compare_and_set_status("b", LifecycleStatus::PendingIngestion, LifecycleStatus::PublishingSecondary)
            .unwrap();

        assert_eq!(store.fail_interrupted_publications().unwrap(), 2);
        let status = |r: &str| store.require_unit(r).unwrap().status;
        assert_eq!(status("a"), LifecycleStatus::PrimaryPublishFailed);
        assert_eq!(status("b"), LifecycleStatus::SecondaryPublishFailed);
        assert_eq!(status("c"), LifecycleStatus::PendingIngestion);
    }
}
