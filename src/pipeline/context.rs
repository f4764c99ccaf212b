use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::translate::ValidationSummary;

/// Title, description and tags used for the primary publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Names one typed slot of [`PipelineContext`]. Steps declare the slots they
/// read and write so a chain can be checked before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    SourceVideo,
    SourceSubtitles,
    SubtitleCount,
    CoverImage,
    TranslatedSubtitles,
    TranslatedCount,
    Validation,
    Metadata,
    PrimaryPublishId,
    CaptionsUploaded,
}

/// State shared by the steps of one chain run.
///
/// Snapshots of it are stored as step results and merged back with
/// [`PipelineContext::absorb`] when a unit is resumed. `error` is the
/// authoritative overall-failure signal and is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_video: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_subtitles: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_subtitles: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VideoMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_publish_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captions_uploaded: Option<usize>,
    #[serde(skip)]
    pub error: Option<String>,
}

fn take_some<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

impl PipelineContext {
    pub fn has(&self, key: ContextKey) -> bool {
        match key {
            ContextKey::SourceVideo => self.source_video.is_some(),
            ContextKey::SourceSubtitles => self.source_subtitles.is_some(),
            ContextKey::SubtitleCount => self.subtitle_count.is_some(),
            ContextKey::CoverImage => self.cover_image.is_some(),
            ContextKey::TranslatedSubtitles => self.translated_subtitles.is_some(),
            ContextKey::TranslatedCount => self.translated_count.is_some(),
            ContextKey::Validation => self.validation.is_some(),
            ContextKey::Metadata => self.metadata.is_some(),
            ContextKey::PrimaryPublishId => self.primary_publish_id.is_some(),
            ContextKey::CaptionsUploaded => self.captions_uploaded.is_some(),
        }
    }

    /// Overlays every populated slot of `other` onto `self`. `error` is left alone.
    pub fn absorb(&mut self, other: PipelineContext) {
        take_some(&mut self.source_video, other.source_video);
        take_some(&mut self.source_subtitles, other.source_subtitles);
        take_some(&mut self.subtitle_count, other.subtitle_count);
        take_some(&mut self.cover_image, other.cover_image);
        take_some(&mut self.translated_subtitles, other.translated_subtitles);
        take_some(&mut self.translated_count, other.translated_count);
        take_some(&mut self.validation, other.validation);
        take_some(&mut self.metadata, other.metadata);
        take_some(&mut self.primary_publish_id, other.primary_publish_id);
        take_some(&mut self.captions_uploaded, other.captions_uploaded);
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}
