//! Health classification of the remote surface and the recovery policy.
//!
//! [`classify`] and [`recovery_action`] are pure; [`HealthMonitor`] owns the
//! problem counters and performs the chosen action.

use std::fmt;

use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::SurfaceError;
use crate::surface::{RemoteSurface, SurfaceSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    Slow,
    ModalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded(Degradation),
    SessionExpired,
    Unresponsive,
    Critical,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        self == HealthState::Healthy
    }

    fn candidates(self) -> &'static [RecoveryAction] {
        use RecoveryAction::*;
        match self {
            HealthState::Healthy => &[],
            HealthState::Degraded(Degradation::ModalError) => &[DismissModal, RefreshView],
            HealthState::Degraded(Degradation::Slow) => &[Wait, RefreshView],
            HealthState::SessionExpired => &[ReAuthenticate],
            HealthState::Unresponsive => &[RefreshView, ReAuthenticate],
            HealthState::Critical => &[RefreshView, Abort],
        }
    }

    /// Action once candidates and the recovery budget are used up.
    fn exhausted_action(self) -> RecoveryAction {
        match self {
            HealthState::Critical | HealthState::SessionExpired => RecoveryAction::Abort,
            _ => RecoveryAction::SkipItem,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Degraded(Degradation::Slow) => write!(f, "DEGRADED(SLOW)"),
            HealthState::Degraded(Degradation::ModalError) => write!(f, "DEGRADED(MODAL_ERROR)"),
            HealthState::SessionExpired => write!(f, "SESSION_EXPIRED"),
            HealthState::Unresponsive => write!(f, "UNRESPONSIVE"),
            HealthState::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Wait,
    RefreshView,
    DismissModal,
    ReAuthenticate,
    /// Give up on the current pass.
    SkipItem,
    Abort,
}

/// What the orchestrator must do after a recovery action ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    RetryPass,
    ReAuthenticate,
    SkipPass,
    Abort(String),
}

/// Result of bringing the surface to a workable state for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassVerdict {
    Proceed,
    ReAuthenticate,
    SkipPass,
    Abort(String),
}

/// Recent-problem frequency fed to [`recovery_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemFrequency {
    pub consecutive: u32,
    /// Whether the last problem happened inside the recency window.
    pub recent: bool,
}

/// Classifies raw observations. An observation error is `Critical`.
///
/// Overlay text is matched case-insensitively: session-loss markers first,
/// then error markers. An overlay matching neither does not decide the state.
pub fn classify(
    observed: &Result<SurfaceSignals, SurfaceError>,
    config: &HealthConfig,
) -> HealthState {
    let signals = match observed {
        Ok(signals) => signals,
        Err(_) => return HealthState::Critical,
    };

    if let Some(text) = signals.overlay_text.as_deref() {
        let text = text.to_lowercase();
        let matches_any =
            |markers: &[String]| markers.iter().any(|m| text.contains(&m.to_lowercase()));
        if matches_any(&config.session_loss_markers) {
            return HealthState::SessionExpired;
        }
        if matches_any(&config.error_markers) {
            return HealthState::Degraded(Degradation::ModalError);
        }
    }

    if !signals.essentials_visible {
        HealthState::Unresponsive
    } else if signals.busy {
        HealthState::Degraded(Degradation::Slow)
    } else {
        HealthState::Healthy
    }
}

/// Chooses the recovery action for `state` at the given attempt index.
pub fn recovery_action(
    state: HealthState,
    attempt_index: u32,
    problems: ProblemFrequency,
    config: &HealthConfig,
) -> RecoveryAction {
    if problems.consecutive >= config.max_consecutive_problems && problems.recent {
        return RecoveryAction::ReAuthenticate;
    }

    let candidates = state.candidates();
    if attempt_index < config.max_recovery_attempts {
        let picked = candidates
            .get(attempt_index as usize)
            .or_else(|| candidates.last());
        if let Some(action) = picked {
            return *action;
        }
    }
    state.exhausted_action()
}

/// Tracks consecutive problems and performs recovery against a surface.
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_problems: u32,
    last_problem: Option<Instant>,
    problem_url: Option<String>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_problems: 0,
            last_problem: None,
            problem_url: None,
        }
    }

    pub fn consecutive_problems(&self) -> u32 {
        self.consecutive_problems
    }

    fn frequency(&self) -> ProblemFrequency {
        ProblemFrequency {
            consecutive: self.consecutive_problems,
            recent: self
                .last_problem
                .is_some_and(|at| at.elapsed() <= self.config.problem_recency()),
        }
    }

    /// Observes and classifies. A healthy result clears the problem streak.
    pub async fn check<S: RemoteSurface>(&mut self, surface: &mut S) -> HealthState {
        let observed = surface.observe().await;
        if let Err(e) = &observed {
            warn!(error = %e, "health observation failed");
        }
        let state = classify(&observed, &self.config);
        if state.is_healthy() {
            self.consecutive_problems = 0;
            self.problem_url = None;
        } else {
            match surface.current_url().await {
                Ok(url) => {
                    warn!(%state, %url, "surface unhealthy");
                    self.problem_url = Some(url);
                }
                Err(e) => debug!(error = %e, "current url unavailable"),
            }
        }
        state
    }

    pub fn recovery_action(&self, state: HealthState, attempt_index: u32) -> RecoveryAction {
        recovery_action(state, attempt_index, self.frequency(), &self.config)
    }

    /// Counts a problem seen outside a health check (e.g. an interrupted scan).
    pub fn note_problem(&mut self) {
        self.consecutive_problems += 1;
        self.last_problem = Some(Instant::now());
    }

    /// Clears the streak, e.g. after a fresh sign-in.
    pub fn reset(&mut self) {
        self.consecutive_problems = 0;
        self.last_problem = None;
    }

    /// Performs `action` and counts the problem.
    pub async fn execute_recovery<S: RemoteSurface>(
        &mut self,
        action: RecoveryAction,
        state: HealthState,
        surface: &mut S,
    ) -> RecoveryOutcome {
        self.note_problem();
        match action {
            RecoveryAction::Wait => {
                sleep(self.config.recovery_interval()).await;
                RecoveryOutcome::RetryPass
            }
            RecoveryAction::DismissModal => {
                match surface.dismiss_overlay().await {
                    Ok(true) => debug!("overlay dismissed"),
                    Ok(false) => warn!("no overlay could be dismissed"),
                    Err(e) => warn!(error = %e, "dismissing overlay failed"),
                }
                sleep(self.config.recovery_interval()).await;
                RecoveryOutcome::RetryPass
            }
            RecoveryAction::RefreshView => {
                if let Err(e) = surface.refresh().await {
                    warn!(error = %e, "refreshing view failed");
                }
                sleep(self.config.recovery_interval()).await;
                RecoveryOutcome::RetryPass
            }
            RecoveryAction::ReAuthenticate => RecoveryOutcome::ReAuthenticate,
            RecoveryAction::SkipItem => RecoveryOutcome::SkipPass,
            RecoveryAction::Abort => RecoveryOutcome::Abort(match &self.problem_url {
                Some(url) => format!("surface {state} at {url} after recovery attempts"),
                None => format!("surface {state} after recovery attempts"),
            }),
        }
    }

    /// Checks health and runs recovery until the surface is workable or the
    /// policy gives up on the pass.
    pub async fn stabilize<S: RemoteSurface>(&mut self, surface: &mut S) -> PassVerdict {
        let mut attempt = 0;
        loop {
            let state = self.check(surface).await;
            if state.is_healthy() {
                return PassVerdict::Proceed;
            }
            let action = self.recovery_action(state, attempt);
            info!(%state, ?action, attempt, consecutive = self.consecutive_problems, "surface unhealthy");
            match self.execute_recovery(action, state, surface).await {
                RecoveryOutcome::RetryPass => attempt += 1,
                RecoveryOutcome::ReAuthenticate => return PassVerdict::ReAuthenticate,
                RecoveryOutcome::SkipPass => return PassVerdict::SkipPass,
                RecoveryOutcome::Abort(reason) => return PassVerdict::Abort(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePortal;

    fn config() -> HealthConfig {
        HealthConfig::default()
    }

    fn overlay(text: &str) -> Result<SurfaceSignals, SurfaceError> {
        Ok(SurfaceSignals {
            overlay_text: Some(text.into()),
            ..SurfaceSignals::healthy()
        })
    }

    const CALM: ProblemFrequency = ProblemFrequency {
        consecutive: 0,
        recent: false,
    };

    #[test]
    fn classify_session_loss_overlay() {
        let state = classify(&overlay("Favor realizar NOVO LOGON"), &config());
        assert_eq!(state, HealthState::SessionExpired);
    }

    #[test]
    fn classify_error_overlay() {
        let state = classify(&overlay("ERRO: Houve um erro inesperado"), &config());
        assert_eq!(state, HealthState::Degraded(Degradation::ModalError));
    }

    #[test]
    fn unrecognized_overlay_falls_through() {
        let state = classify(&overlay("Bem-vindo"), &config());
        assert_eq!(state, HealthState::Healthy);
    }

    #[test]
    fn classify_missing_essentials_and_busy() {
        let missing = Ok(SurfaceSignals {
            essentials_visible: false,
            busy: true,
            ..SurfaceSignals::default()
        });
        assert_eq!(classify(&missing, &config()), HealthState::Unresponsive);

        let busy = Ok(SurfaceSignals {
            busy: true,
            ..SurfaceSignals::healthy()
        });
        assert_eq!(
            classify(&busy, &config()),
            HealthState::Degraded(Degradation::Slow)
        );
        assert_eq!(
            classify(&Ok(SurfaceSignals::healthy()), &config()),
            HealthState::Healthy
        );
    }

    #[test]
    fn observation_error_is_critical() {
        let err = Err(SurfaceError::Driver("target closed".into()));
        assert_eq!(classify(&err, &config()), HealthState::Critical);
    }

    #[test]
    fn candidates_follow_attempt_index() {
        let modal = HealthState::Degraded(Degradation::ModalError);
        assert_eq!(
            recovery_action(modal, 0, CALM, &config()),
            RecoveryAction::DismissModal
        );
        assert_eq!(
            recovery_action(modal, 1, CALM, &config()),
            RecoveryAction::RefreshView
        );
        assert_eq!(
            recovery_action(HealthState::Unresponsive, 1, CALM, &config()),
            RecoveryAction::ReAuthenticate
        );
        assert_eq!(
            recovery_action(HealthState::Critical, 1, CALM, &config()),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn exhausted_budget_skips_or_aborts() {
        let slow = HealthState::Degraded(Degradation::Slow);
        assert_eq!(
            recovery_action(slow, 2, CALM, &config()),
            RecoveryAction::SkipItem
        );
        assert_eq!(
            recovery_action(HealthState::Critical, 2, CALM, &config()),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn short_candidate_list_repeats_last_within_budget() {
        let mut config = config();
        config.max_recovery_attempts = 3;
        assert_eq!(
            recovery_action(HealthState::Degraded(Degradation::Slow), 2, CALM, &config),
            RecoveryAction::RefreshView
        );
    }

    #[test]
    fn frequent_recent_problems_escalate_regardless_of_state() {
        let busy = ProblemFrequency {
            consecutive: 4,
            recent: true,
        };
        for state in [
            HealthState::Degraded(Degradation::Slow),
            HealthState::Degraded(Degradation::ModalError),
            HealthState::Unresponsive,
            HealthState::Critical,
        ] {
            assert_eq!(
                recovery_action(state, 0, busy, &config()),
                RecoveryAction::ReAuthenticate
            );
        }

        let stale = ProblemFrequency {
            consecutive: 4,
            recent: false,
        };
        assert_eq!(
            recovery_action(HealthState::Degraded(Degradation::Slow), 0, stale, &config()),
            RecoveryAction::Wait
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_dismisses_modal_then_proceeds() {
        let mut portal = FakePortal::new(std::env::temp_dir());
        portal.script_health([overlay("Erro inesperado")]);

        let mut monitor = HealthMonitor::new(config());
        assert_eq!(monitor.stabilize(&mut portal).await, PassVerdict::Proceed);
        assert_eq!(portal.dismissals(), 1);
        assert_eq!(monitor.consecutive_problems(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_requests_reauth_for_expired_session() {
        let mut portal = FakePortal::new(std::env::temp_dir());
        portal.script_health([overlay("Favor realizar novo logon")]);

        let mut monitor = HealthMonitor::new(config());
        assert_eq!(
            monitor.stabilize(&mut portal).await,
            PassVerdict::ReAuthenticate
        );
        assert_eq!(monitor.consecutive_problems(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_skips_pass_when_slow_persists() {
        let busy = Ok(SurfaceSignals {
            busy: true,
            ..SurfaceSignals::healthy()
        });
        let mut portal = FakePortal::new(std::env::temp_dir());
        portal.script_health([busy.clone(), busy.clone(), busy]);

        let mut monitor = HealthMonitor::new(config());
        assert_eq!(monitor.stabilize(&mut portal).await, PassVerdict::SkipPass);
        assert_eq!(portal.refreshes(), 1);
        assert_eq!(monitor.consecutive_problems(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_problems_across_passes_escalate() {
        let busy = Ok(SurfaceSignals {
            busy: true,
            ..SurfaceSignals::healthy()
        });
        let mut portal = FakePortal::new(std::env::temp_dir());
        portal.script_health(std::iter::repeat_n(busy, 5));

        let mut monitor = HealthMonitor::new(config());
        assert_eq!(monitor.stabilize(&mut portal).await, PassVerdict::SkipPass);
        assert_eq!(
            monitor.stabilize(&mut portal).await,
            PassVerdict::ReAuthenticate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn critical_surface_aborts_after_refresh() {
        let mut portal = FakePortal::new(std::env::temp_dir());
        portal.script_health([
            Err(SurfaceError::Driver("closed".into())),
            Err(SurfaceError::Driver("closed".into())),
        ]);

        let mut monitor = HealthMonitor::new(config());
        let verdict = monitor.stabilize(&mut portal).await;
        let PassVerdict::Abort(reason) = verdict else {
            panic!("expected abort, got {verdict:?}");
        };
        assert!(reason.contains("CRITICAL"));
        assert!(reason.contains("https://portal.test/list"));
    }
}
