use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::pipeline::{ContextKey, PipelineContext, Step, StepError, StepOutcome};
use crate::workspace::Workspace;

use super::FETCH_COVER;

/// Downloads a cover image by trying each URL template in order.
///
/// A unit without a cover can still be published, so running out of
/// templates skips the step instead of failing it.
pub struct FetchCover {
    http: reqwest::Client,
    urls: Vec<String>,
    workspace: Workspace,
}

impl FetchCover {
    pub fn new(
        http: reqwest::Client,
        templates: Vec<String>,
        source_ref: &str,
        workspace: Workspace,
    ) -> Self {
        let urls = templates
            .iter()
            .map(|t| t.replace("{ref}", source_ref))
            .collect();
        Self {
            http,
            urls,
            workspace,
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Step for FetchCover {
    fn name(&self) -> &str {
        FETCH_COVER
    }

    fn writes(&self) -> &'static [ContextKey] {
        &[ContextKey::CoverImage]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        let target = self.workspace.cover_image();
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            ctx.cover_image = Some(target);
            return Ok(StepOutcome::Completed);
        }

        for url in &self.urls {
            match self.download(url).await {
                Ok(bytes) if !bytes.is_empty() => {
                    self.workspace.prepare().await?;
                    tokio::fs::write(&target, &bytes).await?;
                    info!(url = %url, size = bytes.len(), "downloaded cover");
                    ctx.cover_image = Some(target);
                    return Ok(StepOutcome::Completed);
                }
                Ok(_) => debug!(url = %url, "cover response was empty"),
                Err(e) => debug!(url = %url, error = %e, "cover candidate failed"),
            }
        }

        warn!(candidates = self.urls.len(), "no cover image available");
        Ok(StepOutcome::skipped("no cover image available"))
    }
}
