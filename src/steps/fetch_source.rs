use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::external::SourceFetcher;
use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome};
use crate::store::WorkUnit;
use crate::workspace::Workspace;

use super::FETCH_SOURCE;

/// Downloads the source video into the workspace. A video already present
/// from an earlier attempt is reused.
pub struct FetchSource {
    fetcher: Arc<dyn SourceFetcher>,
    unit: WorkUnit,
    workspace: Workspace,
}

impl FetchSource {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, unit: WorkUnit, workspace: Workspace) -> Self {
        Self {
            fetcher,
            unit,
            workspace,
        }
    }
}

#[async_trait]
impl Step for FetchSource {
    fn name(&self) -> &str {
        FETCH_SOURCE
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::SourceVideo]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let video = match self.workspace.find_video().await? {
            Some(existing) => {
                info!(unit = %self.unit.source_ref, video = %existing.display(), "reusing downloaded video");
                existing
            }
            None => {
                self.workspace.prepare().await?;
                self.fetcher.fetch(&self.unit, self.workspace.dir()).await?;
                self.workspace.find_video().await?.ok_or_else(|| {
                    StepError::Business(format!(
                        "no video file found in {} after download",
                        self.workspace.dir().display()
                    ))
                })?
            }
        };
        ctx.source_video = Some(video);
        Ok(StepOutcome::Completed)
    }
}
