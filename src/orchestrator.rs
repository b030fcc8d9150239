use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactWatcher;
use crate::config::AcquisitionConfig;
use crate::health::{HealthMonitor, PassVerdict};
use crate::ledger::{AttemptLedger, LedgerStore};
use crate::postprocess::{PostProcessSummary, PostProcessor};
use crate::scanner::{ScanOutcome, WorkQueueScanner};
use crate::session::{Authenticator, SessionManager};
use crate::state_machine::{
    AbortReason, ItemKey, ItemTransition, PendingSet, RunEvent, RunMachine, RunState, StopReason,
    WorkItem,
};
use crate::surface::RemoteSurface;
use crate::ui::RunProgress;

/// Keys to acquire for one credential set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub account: String,
    pub keys: Vec<ItemKey>,
}

impl WorkRequest {
    pub fn new(account: impl Into<String>, keys: Vec<ItemKey>) -> Self {
        Self {
            account: account.into(),
            keys,
        }
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub account: String,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub passes: u32,
    pub requested: usize,
    /// Keys skipped up front because the ledger already has a fresh success.
    pub excluded: Vec<ItemKey>,
    pub finished: Vec<WorkItem>,
    /// Residual items, still pending when the run ended.
    pub pending: Vec<WorkItem>,
    pub stop_reason: Option<StopReason>,
    pub abort_reason: Option<AbortReason>,
    pub postprocess: Option<PostProcessSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

/// Drives one run: ledger pre-filter, the pass loop and post-processing.
pub struct AcquisitionOrchestrator<A, L, P> {
    config: AcquisitionConfig,
    sessions: SessionManager<A>,
    ledger: AttemptLedger<L>,
    postprocessor: P,
    health: HealthMonitor,
    scanner: WorkQueueScanner,
    watcher: ArtifactWatcher,
    cancel: Arc<AtomicBool>,
    progress: Option<RunProgress>,
}

impl<A, L, P> AcquisitionOrchestrator<A, L, P>
where
    L: LedgerStore,
    P: PostProcessor,
{
    pub fn new(config: AcquisitionConfig, auth: A, ledger: AttemptLedger<L>, postprocessor: P) -> Self {
        let sessions = SessionManager::new(
            auth,
            config.session.refresh_budget(),
            config.session.auth_retry.clone(),
        );
        let health = HealthMonitor::new(config.health.clone());
        let scanner = WorkQueueScanner::new(config.portal.signal_timeout(), config.run.rescan_attempts);
        let watcher = ArtifactWatcher::new(&config.download_dir, &config.artifact);
        Self {
            config,
            sessions,
            ledger,
            postprocessor,
            health,
            scanner,
            watcher,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Flag checked at the top of every pass; setting it aborts the run.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn ledger(&self) -> &AttemptLedger<L> {
        &self.ledger
    }

    pub async fn run<S>(&mut self, surface: &mut S, request: WorkRequest) -> RunReport
    where
        S: RemoteSurface,
        A: Authenticator<S>,
    {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        self.ledger.set_run_id(run_id.clone());
        self.health.reset();
        info!(run_id, account = %request.account, requested = request.keys.len(), "run started");

        let unsatisfied = self
            .ledger
            .filter_unsatisfied(&request.keys, self.config.ledger.freshness);
        let excluded: Vec<ItemKey> = request
            .keys
            .iter()
            .filter(|k| !unsatisfied.contains(*k))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !excluded.is_empty() {
            info!(count = excluded.len(), "keys already satisfied in the freshness window");
        }

        let mut pending = PendingSet::new(unsatisfied);
        let mut machine = RunMachine::new();
        let mut passes = 0;

        if pending.is_empty() {
            machine.apply(RunEvent::QueueDrained);
        } else {
            passes = self.drive(surface, &mut pending, &mut machine).await;
        }

        if machine.state() == RunState::Draining {
            info!(residual = pending.len(), reason = ?machine.stop_reason(), "budget exhausted, draining");
            machine.apply(RunEvent::DrainFinished);
        }

        let postprocess = if machine.state() == RunState::Completed {
            self.post_process().await
        } else {
            None
        };

        if let Some(progress) = &self.progress {
            progress.finish(machine.state(), pending.len());
        }
        match machine.abort_reason() {
            Some(reason) => error!(run_id, %reason, residual = pending.len(), "run aborted"),
            None => info!(run_id, passes, residual = pending.len(), "run completed"),
        }

        RunReport {
            run_id,
            account: request.account,
            state: machine.state(),
            transitions: machine.transitions(),
            passes,
            requested: request.keys.len(),
            excluded,
            finished: pending.finished().to_vec(),
            pending: pending.remaining(),
            stop_reason: machine.stop_reason(),
            abort_reason: machine.abort_reason().cloned(),
            postprocess,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// The pass loop. Returns the number of passes made.
    async fn drive<S>(&mut self, surface: &mut S, pending: &mut PendingSet, machine: &mut RunMachine) -> u32
    where
        S: RemoteSurface,
        A: Authenticator<S>,
    {
        let mut session = match self.sessions.start(surface).await {
            Ok(session) => session,
            Err(e) => {
                machine.apply(RunEvent::Fatal(AbortReason::Authentication(e.to_string())));
                return 0;
            }
        };

        let run = &self.config.run;
        let (max_passes, max_runtime, pass_interval) = (run.max_passes, run.max_runtime(), run.pass_interval());
        let (empty_pass_limit, stabilization_wait, max_item_attempts) =
            (run.empty_pass_limit, run.stabilization_wait(), run.max_item_attempts);

        let started = Instant::now();
        let mut passes = 0;
        let mut empty_passes = 0;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                warn!(pass = passes, "run cancelled");
                machine.apply(RunEvent::Fatal(AbortReason::Cancelled));
                break;
            }
            if pending.is_empty() {
                machine.apply(RunEvent::QueueDrained);
                break;
            }
            if passes >= max_passes {
                machine.apply(RunEvent::BudgetExhausted(StopReason::MaxPasses));
                break;
            }
            if started.elapsed() >= max_runtime {
                machine.apply(RunEvent::BudgetExhausted(StopReason::MaxRuntime));
                break;
            }
            passes += 1;
            if let Some(progress) = &self.progress {
                progress.pass(passes, max_passes, pending.len());
            }

            session = match self.sessions.ensure_fresh_session(session, surface).await {
                Ok(session) => session,
                Err(e) => {
                    machine.apply(RunEvent::Fatal(AbortReason::Authentication(e.to_string())));
                    break;
                }
            };

            match self.health.stabilize(surface).await {
                PassVerdict::Proceed => {}
                PassVerdict::ReAuthenticate => {
                    match self.sessions.reauthenticate(surface).await {
                        Ok(fresh) => {
                            session = fresh;
                            self.health.reset();
                        }
                        Err(e) => {
                            machine.apply(RunEvent::Fatal(AbortReason::Authentication(e.to_string())));
                            break;
                        }
                    }
                    continue;
                }
                PassVerdict::SkipPass => {
                    debug!(pass = passes, "skipping pass after failed recovery");
                    sleep(pass_interval).await;
                    continue;
                }
                PassVerdict::Abort(reason) => {
                    machine.apply(RunEvent::Fatal(AbortReason::Recovery(reason)));
                    break;
                }
            }

            if empty_passes >= empty_pass_limit {
                info!(
                    empty_passes,
                    wait_secs = stabilization_wait.as_secs(),
                    "no pending item rendered recently, waiting for the list to stabilize"
                );
                sleep(stabilization_wait).await;
                empty_passes = 0;
            }

            match self
                .scanner
                .scan_and_attempt_one(surface, pending, &self.watcher)
                .await
            {
                ScanOutcome::NoMatch => empty_passes += 1,
                ScanOutcome::Attempted { key, outcome } => {
                    empty_passes = 0;
                    if let Err(e) = self.ledger.record_outcome(&key, &outcome) {
                        error!(key = %key, error = %e, "failed to record attempt");
                    }
                    match pending.settle(&key, &outcome, max_item_attempts) {
                        Some(ItemTransition::Finished(state)) => {
                            info!(key = %key, %state, remaining = pending.len(), "item finished");
                            if let Some(progress) = &self.progress {
                                progress.item(&key, state);
                            }
                        }
                        Some(ItemTransition::Requeued { attempts }) => {
                            warn!(key = %key, attempts, max_item_attempts, "attempt failed, item requeued");
                        }
                        None => {}
                    }
                }
                ScanOutcome::Interrupted(e) => {
                    warn!(pass = passes, error = %e, "scan interrupted");
                    self.health.note_problem();
                }
            }

            sleep(pass_interval).await;
        }

        self.sessions.end(surface).await;
        passes
    }

    /// Best effort: failures are logged and never touch recorded attempts.
    async fn post_process(&mut self) -> Option<PostProcessSummary> {
        if !self.config.postprocess.enabled {
            return None;
        }
        match self.postprocessor.process(&self.config.download_dir).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "post-processing failed");
                None
            }
        }
    }
}
