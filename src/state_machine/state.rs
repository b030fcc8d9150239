use std::fmt;

use serde::{Deserialize, Serialize};

/// The four states of an acquisition run.
///
/// A run flows: RUNNING → COMPLETED, or RUNNING → DRAINING → COMPLETED when a
/// budget runs out, or RUNNING/DRAINING → ABORTED on a fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Draining,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "RUNNING"),
            RunState::Draining => write!(f, "DRAINING"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Which budget stopped the loop before the queue drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPasses,
    MaxRuntime,
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Sign-in or re-authentication exhausted its retry budget.
    Authentication(String),
    /// The health recovery policy asked to abort.
    Recovery(String),
    /// Stopped from outside between passes.
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Authentication(msg) => write!(f, "authentication: {msg}"),
            AbortReason::Recovery(msg) => write!(f, "recovery: {msg}"),
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Inputs that move a run between states.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    QueueDrained,
    BudgetExhausted(StopReason),
    DrainFinished,
    Fatal(AbortReason),
}

/// The result of evaluating a run event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Moved to the given state.
    Next(RunState),
    /// The event has no effect in the current state.
    Ignored(RunState),
}

/// Tracks a run's state and the states it passed through.
#[derive(Debug, Clone)]
pub struct RunMachine {
    state: RunState,
    history: Vec<RunState>,
    stop_reason: Option<StopReason>,
    abort_reason: Option<AbortReason>,
}

impl Default for RunMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Running,
            history: Vec::new(),
            stop_reason: None,
            abort_reason: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// States left so far, oldest first, followed by the current one.
    pub fn transitions(&self) -> Vec<RunState> {
        let mut all = self.history.clone();
        all.push(self.state);
        all
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    /// Computes and applies the transition for `event`.
    ///
    /// - `Running`: drained → `Completed`; budget → `Draining`; fatal → `Aborted`.
    /// - `Draining`: drain finished → `Completed`; fatal → `Aborted`.
    /// - `Completed` and `Aborted` are terminal and ignore every event.
    pub fn apply(&mut self, event: RunEvent) -> Transition {
        let next = match (self.state, event) {
            (RunState::Running, RunEvent::QueueDrained) => RunState::Completed,
            (RunState::Running, RunEvent::BudgetExhausted(reason)) => {
                self.stop_reason = Some(reason);
                RunState::Draining
            }
            (RunState::Draining, RunEvent::DrainFinished) => RunState::Completed,
            (RunState::Running | RunState::Draining, RunEvent::Fatal(reason)) => {
                self.abort_reason = Some(reason);
                RunState::Aborted
            }
            (state, _) => return Transition::Ignored(state),
        };

        self.history.push(self.state);
        self.state = next;
        Transition::Next(next)
    }
}
