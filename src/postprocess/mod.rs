//! Post-processing of retrieved artifacts: rename, summarize, organize.
//!
//! Runs once after an acquisition loop completes. Every step is idempotent:
//! documents already carrying the handled marker are not renamed again, an
//! existing report is never regenerated and moved files are gone from the
//! download directory.

mod naming;
mod organize;
mod reports;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::anthropic::{AnthropicError, MessageSender};
use crate::config::PostProcessConfig;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Collaborator invoked with the artifact directory after a run.
#[allow(async_fn_in_trait)]
pub trait PostProcessor {
    async fn process(&mut self, dir: &Path) -> anyhow::Result<PostProcessSummary>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostProcessSummary {
    pub renamed: usize,
    pub summarized: usize,
    pub moved: usize,
    /// Files that failed a step; they are left in place.
    pub failures: usize,
}

#[derive(Debug, Clone, Copy)]
enum Ask {
    Name,
    Report,
}

/// The concrete pipeline. Without a sender, names fall back to the original
/// stem plus the date and summaries are skipped.
pub struct ArtifactPipeline<M> {
    sender: Option<M>,
    marker: String,
    model: String,
    max_tokens: u32,
    request_delay: Duration,
    reports_dir: PathBuf,
    processed_dir: PathBuf,
    calls: u32,
}

impl<M: MessageSender> ArtifactPipeline<M> {
    pub fn new(
        sender: Option<M>,
        config: &PostProcessConfig,
        reports_dir: PathBuf,
        processed_dir: PathBuf,
    ) -> Self {
        Self {
            sender,
            marker: config.marker.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            request_delay: Duration::from_millis(config.request_delay_ms),
            reports_dir,
            processed_dir,
            calls: 0,
        }
    }

    /// PDFs directly inside `dir`, sorted by name.
    fn documents(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let mut docs = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            let is_pdf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
            if is_pdf && path.is_file() {
                docs.push(path);
            }
        }
        docs.sort();
        Ok(docs)
    }

    fn is_handled(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|n| naming::is_handled(&n.to_string_lossy(), &self.marker))
    }

    /// Paced model call with bounded retry on rate limiting. `None` without a sender.
    async fn ask(&mut self, what: Ask, bytes: &[u8]) -> Option<Result<String, AnthropicError>> {
        let Self {
            sender,
            model,
            max_tokens,
            request_delay,
            calls,
            ..
        } = self;
        let sender = sender.as_ref()?;

        let mut rate_limited = 0;
        loop {
            if *calls > 0 {
                sleep(*request_delay).await;
            }
            *calls += 1;
            let result = match what {
                Ask::Name => naming::propose_name(sender, model, *max_tokens, bytes).await,
                Ask::Report => reports::summarize(sender, model, *max_tokens, bytes).await,
            };
            match result {
                Err(AnthropicError::RateLimited { retry_after_ms })
                    if rate_limited < MAX_RATE_LIMIT_RETRIES =>
                {
                    rate_limited += 1;
                    warn!(retry_after_ms, "summarizer rate limited");
                    sleep(Duration::from_millis(retry_after_ms)).await;
                }
                other => return Some(other),
            }
        }
    }

    async fn rename_new(&mut self, dir: &Path, summary: &mut PostProcessSummary) -> anyhow::Result<()> {
        for doc in Self::documents(dir)? {
            if self.is_handled(&doc) {
                continue;
            }
            let stem = doc
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let proposed = if self.sender.is_some() {
                match std::fs::read(&doc) {
                    Ok(bytes) => self.ask(Ask::Name, &bytes).await,
                    Err(e) => {
                        warn!(file = %doc.display(), error = %e, "cannot read document");
                        summary.failures += 1;
                        continue;
                    }
                }
            } else {
                None
            };
            let name = match proposed {
                Some(Ok(name)) => name,
                Some(Err(e)) => {
                    warn!(file = %doc.display(), error = %e, "naming failed, using fallback");
                    naming::fallback_name(&stem, Local::now().date_naive())
                }
                None => naming::fallback_name(&stem, Local::now().date_naive()),
            };

            let Some(target) = naming::free_target(dir, &self.marker, &name) else {
                warn!(file = %doc.display(), name, "no free target name");
                summary.failures += 1;
                continue;
            };
            match std::fs::rename(&doc, &target) {
                Ok(()) => {
                    info!(from = %doc.display(), to = %target.display(), "renamed");
                    summary.renamed += 1;
                }
                Err(e) => {
                    warn!(file = %doc.display(), error = %e, "rename failed");
                    summary.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn write_reports(&mut self, dir: &Path, summary: &mut PostProcessSummary) -> anyhow::Result<()> {
        if self.sender.is_none() {
            debug!("no summarizer configured, skipping reports");
            return Ok(());
        }
        std::fs::create_dir_all(&self.reports_dir)
            .with_context(|| format!("creating {}", self.reports_dir.display()))?;

        for doc in Self::documents(dir)? {
            if !self.is_handled(&doc) {
                continue;
            }
            let report = reports::report_path(&self.reports_dir, &doc);
            if report.exists() {
                continue;
            }
            let bytes = match std::fs::read(&doc) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %doc.display(), error = %e, "cannot read document");
                    summary.failures += 1;
                    continue;
                }
            };
            match self.ask(Ask::Report, &bytes).await {
                Some(Ok(text)) => match std::fs::write(&report, text) {
                    Ok(()) => {
                        info!(report = %report.display(), "report written");
                        summary.summarized += 1;
                    }
                    Err(e) => {
                        warn!(report = %report.display(), error = %e, "cannot write report");
                        summary.failures += 1;
                    }
                },
                Some(Err(e)) => {
                    warn!(file = %doc.display(), error = %e, "summary failed");
                    summary.failures += 1;
                }
                None => {}
            }
        }
        Ok(())
    }

    fn organize(&self, dir: &Path, summary: &mut PostProcessSummary) -> anyhow::Result<()> {
        let now = Local::now().naive_local();
        for doc in Self::documents(dir)? {
            if !self.is_handled(&doc) {
                continue;
            }
            match organize::move_into(&doc, &self.processed_dir, now) {
                Ok(target) => {
                    debug!(to = %target.display(), "moved");
                    summary.moved += 1;
                }
                Err(e) => {
                    warn!(file = %doc.display(), error = %e, "move failed");
                    summary.failures += 1;
                }
            }
        }
        Ok(())
    }
}

impl<M: MessageSender> PostProcessor for ArtifactPipeline<M> {
    async fn process(&mut self, dir: &Path) -> anyhow::Result<PostProcessSummary> {
        let mut summary = PostProcessSummary::default();
        if !dir.is_dir() {
            info!(dir = %dir.display(), "nothing to post-process");
            return Ok(summary);
        }

        self.rename_new(dir, &mut summary).await?;
        self.write_reports(dir, &mut summary).await?;
        self.organize(dir, &mut summary)?;

        info!(
            renamed = summary.renamed,
            summarized = summary.summarized,
            moved = summary.moved,
            failures = summary.failures,
            "post-processing finished"
        );
        Ok(summary)
    }
}
