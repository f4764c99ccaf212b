//! Concurrent batch translation.
//!
//! Segments are cut into contiguous groups of at most `group_size`. Up to
//! `max_workers` tasks pull groups from a shared cursor, call the provider
//! once per group, and send `(group_index, result)` back on a channel. The
//! collector reassembles results by group index, so output order always
//! matches input order. The first failed group fails the whole batch and the
//! remaining workers are aborted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::TranslateError;
use crate::config::TranslationConfig;
use crate::llm::{ChatProvider, LlmError};

pub const SEGMENT_DELIMITER: &str = "###SENTENCE_BREAK###";

/// Filler for segments the provider did not return.
pub const MISSING_PLACEHOLDER: &str = "[translation missing]";

struct TranslationGroup {
    index: usize,
    segments: Vec<String>,
}

#[derive(Clone)]
pub struct BatchTranslator {
    provider: Arc<dyn ChatProvider>,
    group_size: usize,
    max_workers: usize,
    target_language: String,
}

impl BatchTranslator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        group_size: usize,
        max_workers: usize,
        target_language: &str,
    ) -> Self {
        Self {
            provider,
            group_size: group_size.max(1),
            max_workers: max_workers.max(1),
            target_language: target_language.to_string(),
        }
    }

    pub fn from_config(provider: Arc<dyn ChatProvider>, config: &TranslationConfig) -> Self {
        Self::new(
            provider,
            config.group_size,
            config.max_workers,
            &config.target_language,
        )
    }

    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        Arc::clone(&self.provider)
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    /// Translates `segments`, returning exactly one output per input, in order.
    pub async fn translate(&self, segments: &[String]) -> Result<Vec<String>, TranslateError> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let groups: Arc<Vec<TranslationGroup>> = Arc::new(
            segments
                .chunks(self.group_size)
                .enumerate()
                .map(|(index, chunk)| TranslationGroup {
                    index,
                    segments: chunk.to_vec(),
                })
                .collect(),
        );
        let group_count = groups.len();
        let workers = self.max_workers.min(group_count);
        info!(
            segments = segments.len(),
            groups = group_count,
            workers,
            "starting batch translation"
        );

        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<Vec<String>, LlmError>)>(group_count);
        let mut tasks = JoinSet::new();

        for worker in 0..workers {
            let groups = Arc::clone(&groups);
            let cursor = Arc::clone(&cursor);
            let tx = tx.clone();
            let provider = Arc::clone(&self.provider);
            let language = self.target_language.clone();
            tasks.spawn(async move {
                loop {
                    let next = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(group) = groups.get(next) else {
                        break;
                    };
                    debug!(worker, group = group.index, size = group.segments.len(), "translating group");
                    let result = translate_group(provider.as_ref(), &language, &group.segments).await;
                    let failed = result.is_err();
                    if tx.send((group.index, result)).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        // The channel closes once every worker has dropped its sender.
        drop(tx);

        let mut slots: Vec<Option<Vec<String>>> = vec![None; group_count];
        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(lines) => slots[index] = Some(lines),
                Err(source) => {
                    tasks.abort_all();
                    warn!(group = index, error = %source, "group translation failed");
                    return Err(TranslateError::Group {
                        group: index,
                        source,
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(TranslateError::Worker(e.to_string()));
            }
        }

        let mut translated = Vec::with_capacity(segments.len());
        for (index, slot) in slots.into_iter().enumerate() {
            translated.extend(slot.ok_or(TranslateError::MissingGroup(index))?);
        }
        Ok(translated)
    }
}

fn translation_prompt(language: &str, count: usize) -> String {
    format!(
        "You are a professional video subtitle translator. You will receive {count} \
         consecutive subtitle segments separated by the line {SEGMENT_DELIMITER}.\n\
         Translate every segment into natural, concise {language} suitable for on-screen \
         reading, keeping the tone and the context of neighbouring lines.\n\
         Return exactly {count} translations, in the same order, separated by \
         {SEGMENT_DELIMITER}. Return only the translated text: no numbering, no notes."
    )
}

async fn translate_group(
    provider: &dyn ChatProvider,
    language: &str,
    segments: &[String],
) -> Result<Vec<String>, LlmError> {
    let system = translation_prompt(language, segments.len());
    let user = segments.join(&format!("\n{SEGMENT_DELIMITER}\n"));
    let reply = provider.chat(&system, &user).await?;
    let parts = reply
        .split(SEGMENT_DELIMITER)
        .map(|part| part.trim().to_string())
        .collect();
    Ok(align_segments(segments.len(), parts))
}

/// Forces `parts` to exactly `expected` entries: missing ones become
/// [`MISSING_PLACEHOLDER`], extras are dropped. Never fails.
pub fn align_segments(expected: usize, mut parts: Vec<String>) -> Vec<String> {
    if parts.len() != expected {
        warn!(
            expected,
            actual = parts.len(),
            "translated segment count mismatch, aligning"
        );
        parts.resize_with(expected, || MISSING_PLACEHOLDER.to_string());
    }
    parts
}
