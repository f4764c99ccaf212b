//! Per-unit working directory: `<work_dir>/YYYY-MM-DD/<source ref>/`.

use std::io;
use std::path::{Path, PathBuf};

use crate::store::WorkUnit;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "flv", "mkv", "webm", "avi", "mov"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// The directory is derived from the unit's creation date, so it is
    /// stable across retries and restarts.
    pub fn for_unit(root: &Path, unit: &WorkUnit) -> Self {
        let day = unit.created_at.format("%Y-%m-%d").to_string();
        Self {
            dir: root.join(day).join(sanitize(&unit.source_ref)),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_subtitles(&self) -> PathBuf {
        self.dir.join("source.srt")
    }

    pub fn translated_subtitles(&self) -> PathBuf {
        self.dir.join("translated.srt")
    }

    pub fn cover_image(&self) -> PathBuf {
        self.dir.join("cover.jpg")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// First video file in the directory, by name.
    pub async fn find_video(&self) -> io::Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut videos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_video = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_video {
                videos.push(path);
            }
        }
        videos.sort();
        Ok(videos.into_iter().next())
    }
}

fn sanitize(source_ref: &str) -> String {
    let cleaned: String = source_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unit".to_string()
    } else {
        cleaned
    }
}
