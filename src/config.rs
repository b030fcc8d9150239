//! Configuration loaded from `docharvest.toml`.
//!
//! [`AcquisitionConfig`] is built once per process and handed to each
//! orchestrator explicitly, so runs with different budgets can coexist.
//! Sections missing from the file fall back to defaults, except
//! `[ledger].freshness`, which must always be chosen explicitly.
//! `DOWNLOAD_DIR`, `RELAUNCH_TIME`, `MAX_PASSES`, `WEBMAIL_HOST` and
//! `ANTHROPIC_API_KEY` take precedence over the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::accounts::AccountConfig;
use crate::error::AcquisitionError;
use crate::ledger::{FreshnessWindow, MAX_WINDOW_DAYS};
use crate::state_machine::RetryConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Directory the browser downloads artifacts into.
    #[serde(default)]
    pub download_dir: PathBuf,

    /// SQLite file backing the attempt ledger.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub artifact: ArtifactConfig,

    pub ledger: LedgerConfig,

    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub webmail: WebmailConfig,

    #[serde(default)]
    pub postprocess: PostProcessConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("ledger.db")
}

/// Session lifetime and re-authentication policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Preemptive re-authentication budget.
    pub refresh_after_secs: u64,
    /// The portal's own session expiry, when known.
    pub remote_expiry_secs: Option<u64>,
    /// Required gap between the refresh budget and the remote expiry.
    pub expiry_margin_secs: u64,
    /// Retries for a failed sign-in before the run is aborted.
    pub auth_retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_after_secs: 720,
            remote_expiry_secs: None,
            expiry_margin_secs: 60,
            auth_retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn refresh_budget(&self) -> Duration {
        Duration::from_secs(self.refresh_after_secs)
    }
}

/// Loop budgets for one orchestration run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_passes: u32,
    pub max_runtime_secs: u64,
    /// Pause between passes.
    pub pass_interval_ms: u64,
    /// Consecutive passes without a match before the stabilization wait.
    pub empty_pass_limit: u32,
    pub stabilization_wait_secs: u64,
    /// Concrete attempts per item within one run.
    pub max_item_attempts: u32,
    /// Re-scans within a pass after a transient surface error.
    pub rescan_attempts: u32,
    /// Runs per account when a run aborts.
    pub account_attempts: u32,
    pub account_retry_delay_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_passes: 80,
            max_runtime_secs: 3600,
            pass_interval_ms: 500,
            empty_pass_limit: 3,
            stabilization_wait_secs: 30,
            max_item_attempts: 1,
            rescan_attempts: 2,
            account_attempts: 3,
            account_retry_delay_secs: 5,
        }
    }
}

impl RunConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn stabilization_wait(&self) -> Duration {
        Duration::from_secs(self.stabilization_wait_secs)
    }
}

/// Health classification and recovery policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Recovery attempts per pass before skipping or aborting.
    pub max_recovery_attempts: u32,
    /// Consecutive problems that force re-authentication.
    pub max_consecutive_problems: u32,
    /// How recent the last problem must be for escalation to apply.
    pub problem_recency_secs: u64,
    pub recovery_interval_ms: u64,
    /// Overlay text (lowercase substrings) meaning the session is gone.
    pub session_loss_markers: Vec<String>,
    /// Overlay text (lowercase substrings) meaning an error dialog.
    pub error_markers: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 2,
            max_consecutive_problems: 4,
            problem_recency_secs: 180,
            recovery_interval_ms: 1000,
            session_loss_markers: vec![
                "novo logon".into(),
                "sessão expirada".into(),
                "session expired".into(),
                "log in again".into(),
            ],
            error_markers: vec![
                "erro".into(),
                "error".into(),
                "falha".into(),
                "failed".into(),
            ],
        }
    }
}

impl HealthConfig {
    pub fn problem_recency(&self) -> Duration {
        Duration::from_secs(self.problem_recency_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

/// Artifact completion polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Suffixes of files still being written.
    pub partial_suffixes: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 300,
            partial_suffixes: vec![
                ".crdownload".into(),
                ".part".into(),
                ".download".into(),
                ".tmp".into(),
            ],
        }
    }
}

impl ArtifactConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Attempt-ledger policy. `freshness` has no default.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub freshness: FreshnessWindow,
    /// Default look-back for `status`.
    #[serde(default = "default_report_days")]
    pub report_days: u32,
}

fn default_report_days() -> u32 {
    7
}

/// Portal location, CSS selectors and wait bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub login_url: String,
    pub token_url: String,
    pub headless: bool,
    pub browser_path: Option<PathBuf>,
    /// Upper bound for "wait until interactable".
    pub element_timeout_ms: u64,
    /// Upper bound for the terminal signal after submitting an item.
    pub signal_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub selectors: PortalSelectors,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: String::new(),
            token_url: String::new(),
            headless: true,
            browser_path: None,
            element_timeout_ms: 3000,
            signal_timeout_ms: 10_000,
            navigation_timeout_ms: 60_000,
            selectors: PortalSelectors::default(),
        }
    }
}

impl PortalConfig {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub login_input: String,
    pub password_input: String,
    pub login_submit: String,
    pub token_input: String,
    pub token_submit: String,
    pub agency: String,
    pub list_filter: String,
    /// Option text of the list filter that shows every row.
    pub list_filter_all_text: String,
    pub rows: String,
    pub row_identifier: String,
    pub row_select: String,
    pub proceed: String,
    pub download: String,
    pub back: String,
    pub no_obligation: String,
    pub essentials: Vec<String>,
    pub overlays: String,
    pub close_buttons: Vec<String>,
    pub loading: Vec<String>,
    pub user_menu: String,
    pub user_menu_items: String,
    pub sign_out_text: String,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            login_input: "#cpfInput".into(),
            password_input: "#passwordInput".into(),
            login_submit: ".btn-primary".into(),
            token_input: "#tokenInput".into(),
            token_submit: ".btn-primary".into(),
            agency: ".centerElem".into(),
            list_filter: ".custom-select".into(),
            list_filter_all_text: "Todos".into(),
            rows: "#tbIdentificador tbody tr".into(),
            row_identifier: "span.IdentifierNumber".into(),
            row_select: "input[type='radio']".into(),
            proceed: "#btnproceed".into(),
            download: ".fa-download".into(),
            back: "#btnSelect".into(),
            no_obligation: "#OpenInvoices".into(),
            essentials: vec!["#tbIdentificador".into(), "#btnproceed".into()],
            overlays: ".modal.show, .modal[style*='display: block'], .alert-danger".into(),
            close_buttons: vec![
                ".modal.show .close".into(),
                ".modal.show .btn-close".into(),
                ".modal.show [data-dismiss='modal']".into(),
                ".modal.show .modal-footer button".into(),
                ".alert-danger .close".into(),
            ],
            loading: vec![
                ".fa-spinner".into(),
                ".spinner-border".into(),
                ".loading:not([style*='display: none'])".into(),
            ],
            user_menu: "#dropdownMenuLink".into(),
            user_menu_items: ".dropdown-item".into(),
            sign_out_text: "Sair".into(),
        }
    }
}

/// Webmail inbox used to fetch the one-time sign-in token.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebmailConfig {
    pub host: String,
    /// Text typed into the mailbox search.
    pub search_query: String,
    /// Substrings that must all appear in the token message subject.
    pub subject_markers: Vec<String>,
    pub timeout_ms: u64,
    pub user_input: String,
    pub password_input: String,
    pub login_submit: String,
    pub search_input: String,
    pub unread_rows: String,
    pub message_frame: String,
    pub token: String,
}

impl Default for WebmailConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            search_query: String::new(),
            subject_markers: vec!["Código".into()],
            timeout_ms: 20_000,
            user_input: "#user".into(),
            password_input: "#pass".into(),
            login_submit: "#login_submit".into(),
            search_input: "#mailsearchform".into(),
            unread_rows: "tr.unread".into(),
            message_frame: "#messagecontframe".into(),
            token: ".v1code".into(),
        }
    }
}

impl WebmailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Post-processing of retrieved artifacts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    pub enabled: bool,
    /// Relative paths resolve against the download directory.
    pub processed_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// File-name prefix marking documents that were already handled.
    pub marker: String,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Pause between summarizer calls.
    pub request_delay_ms: u64,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            processed_dir: PathBuf::from("processed"),
            reports_dir: PathBuf::from("reports"),
            marker: "ACQ_".into(),
            api_key: String::new(),
            api_url: "https://api.anthropic.com/v1/messages".into(),
            model: "claude-haiku-4-5-20251001".into(),
            max_tokens: 2048,
            request_delay_ms: 4000,
        }
    }
}

impl AcquisitionConfig {
    /// Loads, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        if !path.exists() {
            return Err(AcquisitionError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config = toml::from_str::<AcquisitionConfig>(&contents)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment values win over the file. Empty or unparsable values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("RELAUNCH_TIME").and_then(|v| v.trim().parse().ok()) {
            self.session.refresh_after_secs = secs;
        }
        if let Some(passes) = get("MAX_PASSES").and_then(|v| v.trim().parse().ok()) {
            self.run.max_passes = passes;
        }
        if let Some(host) = get("WEBMAIL_HOST") {
            self.webmail.host = host;
        }
        if let Some(key) = get("ANTHROPIC_API_KEY") {
            self.postprocess.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        let fail = |msg: String| Err(AcquisitionError::Config(msg));

        if self.download_dir.as_os_str().is_empty() {
            return fail("download_dir is required (or set DOWNLOAD_DIR)".into());
        }
        if self.run.max_passes == 0 {
            return fail("run.max_passes must be at least 1".into());
        }
        if self.run.max_item_attempts == 0 {
            return fail("run.max_item_attempts must be at least 1".into());
        }
        if self.artifact.poll_interval_ms == 0 {
            return fail("artifact.poll_interval_ms must be positive".into());
        }
        if self.health.max_consecutive_problems == 0 {
            return fail("health.max_consecutive_problems must be at least 1".into());
        }
        if self.session.refresh_after_secs == 0 {
            return fail("session.refresh_after_secs must be positive".into());
        }
        if let Some(expiry) = self.session.remote_expiry_secs {
            let latest = expiry.saturating_sub(self.session.expiry_margin_secs);
            if self.session.refresh_after_secs >= latest {
                return fail(format!(
                    "session.refresh_after_secs ({}) must be below the remote expiry ({expiry}s) minus the {}s margin",
                    self.session.refresh_after_secs, self.session.expiry_margin_secs
                ));
            }
        }
        if let FreshnessWindow::LastDays(days) = self.ledger.freshness {
            if days > MAX_WINDOW_DAYS {
                return fail(format!("ledger.freshness.last_days must be at most {MAX_WINDOW_DAYS}"));
            }
        }
        if self.ledger.report_days > MAX_WINDOW_DAYS {
            return fail(format!("ledger.report_days must be at most {MAX_WINDOW_DAYS}"));
        }
        if !self.accounts.is_empty() && self.portal.login_url.is_empty() {
            return fail("portal.login_url is required when accounts are configured".into());
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.name.as_str()) {
                return fail(format!("duplicate account name: {}", account.name));
            }
        }
        Ok(())
    }

    /// Resolves a possibly relative post-processing directory.
    pub fn resolve_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.download_dir.join(dir)
        }
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }
}
