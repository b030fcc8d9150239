use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::error::{AcquisitionError, AuthError};
use crate::state_machine::RetryConfig;

/// Signs a surface in and out of the remote system.
///
/// `sign_in` must leave the surface on the work list.
#[allow(async_fn_in_trait)]
pub trait Authenticator<S> {
    async fn sign_in(&mut self, surface: &mut S) -> Result<(), AuthError>;

    async fn sign_out(&mut self, surface: &mut S) -> Result<(), AuthError>;
}

/// Age and refresh budget of the current authenticated session.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    pub started_at: Instant,
    pub budget: Duration,
}

impl SessionState {
    pub fn new(budget: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            budget,
        }
    }

    pub fn is_due(&self) -> bool {
        self.started_at.elapsed() >= self.budget
    }
}

/// Owns the session lifetime: initial sign-in, preemptive refresh and
/// forced re-authentication, each with bounded retry.
pub struct SessionManager<A> {
    auth: A,
    retry: RetryConfig,
    budget: Duration,
}

impl<A> SessionManager<A> {
    pub fn new(auth: A, budget: Duration, retry: RetryConfig) -> Self {
        Self {
            auth,
            retry,
            budget,
        }
    }

    pub async fn start<S>(&mut self, surface: &mut S) -> Result<SessionState, AcquisitionError>
    where
        A: Authenticator<S>,
    {
        self.sign_in_with_retry(surface).await?;
        info!(budget_secs = self.budget.as_secs(), "session started");
        Ok(SessionState::new(self.budget))
    }

    /// Returns `state` untouched while inside its budget, otherwise
    /// signs out and back in and returns a fresh state.
    pub async fn ensure_fresh_session<S>(
        &mut self,
        state: SessionState,
        surface: &mut S,
    ) -> Result<SessionState, AcquisitionError>
    where
        A: Authenticator<S>,
    {
        if !state.is_due() {
            return Ok(state);
        }
        info!(
            age_secs = state.started_at.elapsed().as_secs(),
            "session budget elapsed, re-authenticating"
        );
        self.reauthenticate(surface).await
    }

    /// Sign-out is best effort; the subsequent sign-in is not.
    pub async fn reauthenticate<S>(&mut self, surface: &mut S) -> Result<SessionState, AcquisitionError>
    where
        A: Authenticator<S>,
    {
        if let Err(e) = self.auth.sign_out(surface).await {
            warn!(error = %e, "sign-out before re-authentication failed");
        }
        self.sign_in_with_retry(surface).await?;
        Ok(SessionState::new(self.budget))
    }

    pub async fn end<S>(&mut self, surface: &mut S)
    where
        A: Authenticator<S>,
    {
        if let Err(e) = self.auth.sign_out(surface).await {
            warn!(error = %e, "sign-out failed");
        }
    }

    async fn sign_in_with_retry<S>(&mut self, surface: &mut S) -> Result<(), AcquisitionError>
    where
        A: Authenticator<S>,
    {
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.auth.sign_in(surface).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay_ms = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, max_attempts, delay_ms, error = %e, "sign-in failed, retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(AcquisitionError::AuthenticationExhausted { attempts: attempt, last: e });
                }
            }
        }
    }
}
