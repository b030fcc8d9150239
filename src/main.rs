mod accounts;
mod anthropic;
mod artifact;
mod auth;
mod cli;
mod config;
mod error;
mod health;
mod ledger;
mod orchestrator;
mod postprocess;
mod scanner;
mod session;
mod state_machine;
mod surface;
#[cfg(test)]
mod testing;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};

use accounts::{AccountConfig, normalize_keys};
use anthropic::AnthropicClient;
use auth::{PortalAuthenticator, WebmailTokenSource};
use cli::{Cli, Command};
use config::AcquisitionConfig;
use ledger::{AttemptLedger, FreshnessWindow, SqliteLedgerStore};
use orchestrator::{AcquisitionOrchestrator, RunReport, WorkRequest};
use postprocess::{ArtifactPipeline, PostProcessor};
use state_machine::AbortReason;
use surface::ChromiumSurface;
use ui::RunProgress;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = AcquisitionConfig::load(&cli.config)?;
    if let Some(max_passes) = cli.max_passes {
        config.run.max_passes = max_passes;
        config.validate()?;
    }

    match cli.command {
        Command::Run { account, keys } => run(&config, account.as_deref(), &keys, cli.verbose).await,
        Command::Pending { account } => pending(&config, account.as_deref()),
        Command::Status { days } => status(&config, days.unwrap_or(config.ledger.report_days)),
        Command::Postprocess { dir } => post_process(&config, dir).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docharvest=debug" } else { "docharvest=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn selected_accounts<'a>(
    config: &'a AcquisitionConfig,
    name: Option<&str>,
) -> anyhow::Result<Vec<&'a AccountConfig>> {
    let selected: Vec<&AccountConfig> = match name {
        Some(name) => vec![
            config
                .account(name)
                .with_context(|| format!("unknown account: {name}"))?,
        ],
        None => config.accounts.iter().filter(|a| a.active).collect(),
    };
    if selected.is_empty() {
        bail!("no active accounts configured");
    }
    Ok(selected)
}

fn pipeline(config: &AcquisitionConfig) -> anyhow::Result<ArtifactPipeline<AnthropicClient>> {
    let pp = &config.postprocess;
    let sender = if pp.api_key.is_empty() {
        warn!("no summarizer API key, documents get fallback names and no reports");
        None
    } else {
        Some(AnthropicClient::new(pp.api_key.clone(), pp.api_url.clone())?)
    };
    Ok(ArtifactPipeline::new(
        sender,
        pp,
        config.resolve_dir(&pp.reports_dir),
        config.resolve_dir(&pp.processed_dir),
    ))
}

async fn run(
    config: &AcquisitionConfig,
    account: Option<&str>,
    keys: &[String],
    verbose: bool,
) -> anyhow::Result<()> {
    let accounts = selected_accounts(config, account)?;
    if !keys.is_empty() && accounts.len() != 1 {
        bail!("--keys needs --account when several accounts are active");
    }

    let store = Arc::new(SqliteLedgerStore::open(&config.ledger_path)?);
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping before the next pass");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let today = Local::now().date_naive();
    let mut aborted = 0;
    for account in accounts {
        let request = if keys.is_empty() {
            account.work_request(today)
        } else {
            WorkRequest::new(&account.name, normalize_keys(keys.iter().map(String::as_str)))
        };
        match run_account(config, account, request, store.clone(), cancel.clone()).await {
            Ok(report) => {
                ui::print_report(&report, verbose);
                if report.is_aborted() {
                    aborted += 1;
                }
            }
            Err(e) => {
                error!(account = %account.name, error = %e, "account run failed");
                aborted += 1;
            }
        }
        if cancel.load(Ordering::SeqCst) {
            break;
        }
    }

    if aborted > 0 {
        bail!("{aborted} account run(s) aborted");
    }
    Ok(())
}

/// One account, retried from a fresh browser while runs end aborted.
async fn run_account(
    config: &AcquisitionConfig,
    account: &AccountConfig,
    request: WorkRequest,
    store: Arc<SqliteLedgerStore>,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<RunReport> {
    let attempts = config.run.account_attempts.max(1);
    let delay = Duration::from_secs(config.run.account_retry_delay_secs);
    let mut attempt = 1;
    loop {
        info!(account = %account.name, attempt, attempts, "starting account run");
        let outcome = run_account_once(config, account, request.clone(), store.clone(), cancel.clone()).await;
        let retry = match &outcome {
            Ok(report) => report.is_aborted() && report.abort_reason != Some(AbortReason::Cancelled),
            Err(e) => {
                warn!(account = %account.name, attempt, error = %e, "account run could not start");
                true
            }
        };
        if !retry || attempt >= attempts || cancel.load(Ordering::SeqCst) {
            return outcome;
        }
        warn!(
            account = %account.name,
            attempt,
            delay_secs = delay.as_secs(),
            "account run aborted, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn run_account_once(
    config: &AcquisitionConfig,
    account: &AccountConfig,
    request: WorkRequest,
    store: Arc<SqliteLedgerStore>,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<RunReport> {
    let mut surface = ChromiumSurface::launch(&config.portal, &config.download_dir)
        .await
        .context("failed to start the browser")?;
    let tokens = WebmailTokenSource::new(config.webmail.clone(), account.inbox.clone());
    let auth = PortalAuthenticator::new(account, &config.portal, tokens);
    let mut orchestrator = AcquisitionOrchestrator::new(
        config.clone(),
        auth,
        AttemptLedger::new(store),
        pipeline(config)?,
    )
    .with_cancel_flag(cancel)
    .with_progress(RunProgress::start(&account.name));

    let report = orchestrator.run(&mut surface, request).await;
    surface.close().await;
    Ok(report)
}

fn pending(config: &AcquisitionConfig, account: Option<&str>) -> anyhow::Result<()> {
    let ledger = AttemptLedger::new(SqliteLedgerStore::open(&config.ledger_path)?);
    let today = Local::now().date_naive();
    for account in selected_accounts(config, account)? {
        let request = account.work_request(today);
        let unsatisfied = ledger.filter_unsatisfied(&request.keys, config.ledger.freshness);
        println!(
            "{}: {} of {} pending",
            account.name,
            unsatisfied.len(),
            request.keys.len()
        );
        for key in unsatisfied {
            println!("  {key}");
        }
    }
    Ok(())
}

fn status(config: &AcquisitionConfig, days: u32) -> anyhow::Result<()> {
    let ledger = AttemptLedger::new(SqliteLedgerStore::open(&config.ledger_path)?);
    let since = FreshnessWindow::LastDays(days).since(Local::now());
    let summary = ledger.summarize(since)?;
    ui::print_status(&summary, days);
    Ok(())
}

async fn post_process(config: &AcquisitionConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| config.download_dir.clone());
    let summary = pipeline(config)?.process(&dir).await?;
    ui::print_postprocess(&summary);
    Ok(())
}
