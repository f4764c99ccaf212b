//! Persisted entities: work units, their lifecycle codes, and per-step records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Where a unit sits in its ingest/publish lifecycle.
///
/// Persisted as the short opaque code returned by [`LifecycleStatus::code`];
/// [`fmt::Display`] gives the readable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleStatus {
    PendingIngestion,
    Processing,
    Ready,
    Failed,
    PublishingPrimary,
    PrimaryPublishFailed,
    PrimaryPublished,
    PublishingSecondary,
    SecondaryPublishFailed,
    FullyPublished,
}

impl LifecycleStatus {
    pub const ALL: [LifecycleStatus; 10] = [
        LifecycleStatus::PendingIngestion,
        LifecycleStatus::Processing,
        LifecycleStatus::Ready,
        LifecycleStatus::Failed,
        LifecycleStatus::PublishingPrimary,
        LifecycleStatus::PrimaryPublishFailed,
        LifecycleStatus::PrimaryPublished,
        LifecycleStatus::PublishingSecondary,
        LifecycleStatus::SecondaryPublishFailed,
        LifecycleStatus::FullyPublished,
    ];

    pub fn code(self) -> &'static str {
        match self {
            LifecycleStatus::PendingIngestion => "001",
            LifecycleStatus::Processing => "002",
            LifecycleStatus::Ready => "200",
            LifecycleStatus::Failed => "999",
            LifecycleStatus::PublishingPrimary => "201",
            LifecycleStatus::PrimaryPublishFailed => "299",
            LifecycleStatus::PrimaryPublished => "300",
            LifecycleStatus::PublishingSecondary => "301",
            LifecycleStatus::SecondaryPublishFailed => "399",
            LifecycleStatus::FullyPublished => "400",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            LifecycleStatus::PendingIngestion => "pending-ingestion",
            LifecycleStatus::Processing => "processing",
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Failed => "failed",
            LifecycleStatus::PublishingPrimary => "publishing-primary",
            LifecycleStatus::PrimaryPublishFailed => "primary-published-failed",
            LifecycleStatus::PrimaryPublished => "primary-published",
            LifecycleStatus::PublishingSecondary => "publishing-secondary",
            LifecycleStatus::SecondaryPublishFailed => "secondary-published-failed",
            LifecycleStatus::FullyPublished => "fully-published",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ToSql for LifecycleStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for LifecycleStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        Self::from_code(code)
            .ok_or_else(|| FromSqlError::Other(format!("unknown lifecycle code {code}").into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Completed or skipped: the step needs no further execution.
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status {other}")),
        }
    }
}

impl ToSql for StepStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StepStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Which scheduler owns a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Ingest,
    Publish,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Ingest => "ingest",
            StepPhase::Publish => "publish",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for StepPhase {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StepPhase {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "ingest" => Ok(StepPhase::Ingest),
            "publish" => Ok(StepPhase::Publish),
            other => Err(FromSqlError::Other(format!("unknown phase {other}").into())),
        }
    }
}

/// Static description of one step in the fixed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub name: &'static str,
    /// Execution order within the whole topology.
    pub order: u32,
    pub can_retry: bool,
    pub phase: StepPhase,
}

/// A subtitle cue captured at submission time. Offsets are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionCue {
    pub text: String,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub lang: String,
}

/// What an operator submits. Creation is idempotent on `source_ref`.
#[derive(Debug, Clone, Default)]
pub struct NewUnit {
    pub source_ref: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub subtitles: Vec<CaptionCue>,
}

impl NewUnit {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            ..Self::default()
        }
    }
}

/// One video moving through ingestion and publication.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub id: i64,
    /// External reference (video id or URL). Unique.
    pub source_ref: String,
    /// Explicit download URL; empty means derive it from `source_ref`.
    pub url: String,
    pub title: String,
    pub description: String,
    /// Cues captured at submission, rendered to SRT during ingestion.
    pub subtitles: Vec<CaptionCue>,
    pub status: LifecycleStatus,
    // Written by metadata generation; tags are comma-joined.
    pub generated_title: Option<String>,
    pub generated_description: Option<String>,
    pub generated_tags: Option<String>,
    /// Platform id returned by the primary publication.
    pub primary_publish_id: Option<String>,
    /// When the primary upload finished. The secondary delay counts from here.
    pub primary_published_at: Option<DateTime<Utc>>,
    pub secondary_published_at: Option<DateTime<Utc>>,
    /// Also names the workspace date directory.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    /// The primary platform id, if one was recorded and is non-empty.
    pub fn publish_id(&self) -> Option<&str> {
        self.primary_publish_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }
}

/// Persisted execution state of one step of one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub unit_ref: String,
    pub step_name: String,
    /// Position in the fixed topology, starting at 1.
    pub step_order: u32,
    pub phase: StepPhase,
    pub status: StepStatus,
    /// Set when the step starts running.
    pub start_time: Option<DateTime<Utc>>,
    /// Set on completed, failed or skipped.
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time`, or 0 if the step never started.
    pub duration_ms: Option<i64>,
    /// Human-readable reason for the last failure.
    pub error_message: Option<String>,
    /// JSON snapshot of the pipeline context after the step.
    pub result_data: Option<String>,
    pub can_retry: bool,
    pub created_at: DateTime<Utc>,
}
