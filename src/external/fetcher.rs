use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::run_tool;
use crate::config::ToolCommand;
use crate::error::ToolError;
use crate::store::WorkUnit;

/// Downloads a unit's source video into a directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, unit: &WorkUnit, dir: &Path) -> Result<(), ToolError>;
}

/// Where to download a unit from. An explicit URL wins; otherwise the
/// reference is read as a URL, an 11-character video id, or a `BV` id.
pub fn source_url(unit: &WorkUnit) -> String {
    if !unit.url.trim().is_empty() {
        return unit.url.trim().to_string();
    }
    let r = unit.source_ref.trim();
    if r.starts_with("http://") || r.starts_with("https://") {
        r.to_string()
    } else if r.starts_with("BV") && r.len() != 11 {
        format!("https://www.bilibili.com/video/{r}")
    } else {
        format!("https://www.youtube.com/watch?v={r}")
    }
}

pub struct CommandFetcher {
    tool: ToolCommand,
}

impl CommandFetcher {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl SourceFetcher for CommandFetcher {
    async fn fetch(&self, unit: &WorkUnit, dir: &Path) -> Result<(), ToolError> {
        let mut vars = BTreeMap::new();
        vars.insert("url", source_url(unit));
        vars.insert("dir", dir.display().to_string());
        vars.insert("ref", unit.source_ref.clone());
        run_tool(&self.tool, &vars).await.map(|_| ())
    }
}
