//! Subtitle translation: SRT codec, concurrent group translation, and
//! post-translation validation with repair.

pub mod batch;
pub mod srt;
pub mod validator;

use thiserror::Error;

use crate::llm::LlmError;

pub use batch::{BatchTranslator, MISSING_PLACEHOLDER, SEGMENT_DELIMITER, align_segments};
pub use srt::SubtitleEntry;
pub use validator::{SubtitleValidator, ValidationSummary};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("group {group} failed: {source}")]
    Group {
        group: usize,
        #[source]
        source: LlmError,
    },

    #[error("translation worker failed: {0}")]
    Worker(String),

    #[error("no result for group {0}")]
    MissingGroup(usize),
}
