//! Post-translation checks and repair.
//!
//! Every translated entry is classified against its source line. Entries that
//! are missing or look incomplete are re-translated in small batches; a batch
//! that fails is logged and skipped so one bad call never loses the rest.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::batch::{MISSING_PLACEHOLDER, SEGMENT_DELIMITER, align_segments};
use crate::config::TranslationConfig;
use crate::llm::{ChatProvider, LlmError};

/// Filler for entries a repair call did not return.
pub const REPAIR_PLACEHOLDER: &str = "[repair failed]";

const MISSING_MARKERS: &[&str] = &[MISSING_PLACEHOLDER, REPAIR_PLACEHOLDER, "[MISSING]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Ok,
    Missing,
    Incomplete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    /// Entries still missing or incomplete after repair.
    pub missing: usize,
    pub fixed: usize,
}

impl ValidationSummary {
    pub fn is_clean(&self) -> bool {
        self.missing == 0
    }
}

/// Classifies one translated entry.
///
/// Missing: empty or carrying a placeholder. Incomplete: `???`, shorter than
/// two bytes, or an unchanged copy of a source line longer than ten bytes.
pub fn classify(source: &str, translated: &str) -> EntryStatus {
    let text = translated.trim();
    if text.is_empty() || MISSING_MARKERS.iter().any(|m| text.contains(m)) {
        return EntryStatus::Missing;
    }
    if text.contains("???") || text.len() < 2 {
        return EntryStatus::Incomplete;
    }
    let source = source.trim();
    if source.len() > 10 && source.eq_ignore_ascii_case(text) {
        return EntryStatus::Incomplete;
    }
    EntryStatus::Ok
}

pub struct SubtitleValidator {
    provider: Arc<dyn ChatProvider>,
    target_language: String,
    batch_size: usize,
    interval: Duration,
}

impl SubtitleValidator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        target_language: &str,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            target_language: target_language.to_string(),
            batch_size: batch_size.max(1),
            interval,
        }
    }

    pub fn from_config(provider: Arc<dyn ChatProvider>, config: &TranslationConfig) -> Self {
        Self::new(
            provider,
            &config.target_language,
            config.repair_batch_size,
            config.repair_interval(),
        )
    }

    /// Checks `translated` against `sources` and repairs problem entries in
    /// place. Never fails: unrepaired entries are reported in the summary.
    pub async fn validate_and_repair(
        &self,
        sources: &[String],
        translated: &mut [String],
    ) -> ValidationSummary {
        let source_of = |i: usize| sources.get(i).map(String::as_str).unwrap_or("");
        let problems: Vec<usize> = (0..translated.len())
            .filter(|&i| classify(source_of(i), &translated[i]) != EntryStatus::Ok)
            .collect();
        info!(
            total = translated.len(),
            problems = problems.len(),
            "validated translation"
        );

        let mut fixed = 0;
        let batches: Vec<&[usize]> = problems.chunks(self.batch_size).collect();
        for (n, batch) in batches.iter().enumerate() {
            let texts: Vec<String> = batch.iter().map(|&i| source_of(i).to_string()).collect();
            match self.repair_batch(&texts).await {
                Ok(repaired) => {
                    for (&i, candidate) in batch.iter().zip(repaired) {
                        if classify(source_of(i), &candidate) == EntryStatus::Ok {
                            translated[i] = candidate;
                            fixed += 1;
                        }
                    }
                }
                Err(e) => warn!(batch = n, error = %e, "repair batch failed, skipping"),
            }
            if n + 1 < batches.len() && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }

        let valid = (0..translated.len())
            .filter(|&i| classify(source_of(i), &translated[i]) == EntryStatus::Ok)
            .count();
        let summary = ValidationSummary {
            total: translated.len(),
            valid,
            missing: translated.len() - valid,
            fixed,
        };
        if summary.is_clean() {
            info!(fixed, "translation validated");
        } else {
            warn!(
                remaining = summary.missing,
                fixed, "translation still has unresolved entries"
            );
        }
        summary
    }

    async fn repair_batch(&self, sources: &[String]) -> Result<Vec<String>, LlmError> {
        let count = sources.len();
        let system = format!(
            "You are a professional video subtitle translator. The previous translation of \
             these {count} subtitle lines was missing or incomplete. Translate each line \
             again into complete, natural {language}.\n\
             Return exactly {count} translations, in order, separated by \
             {SEGMENT_DELIMITER}, with no numbering or notes.",
            language = self.target_language
        );
        let user = sources.join(&format!("\n{SEGMENT_DELIMITER}\n"));
        let reply = self.provider.chat(&system, &user).await?;
        let mut parts: Vec<String> = reply
            .split(SEGMENT_DELIMITER)
            .map(|p| p.trim().to_string())
            .collect();
        if parts.len() < count {
            parts.resize_with(count, || REPAIR_PLACEHOLDER.to_string());
        }
        Ok(align_segments(count, parts))
    }
}
