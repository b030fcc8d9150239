//! Interface de terminal do docharvest: spinner de progresso e relatórios coloridos.
//!
//! Usa `indicatif` para o spinner e `console` para as cores. O
//! [`RunProgress`] acompanha uma execução; as funções `print_*` formatam
//! relatórios finais e o resumo do ledger.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::ledger::LedgerSummary;
use crate::orchestrator::RunReport;
use crate::postprocess::PostProcessSummary;
use crate::state_machine::{ItemKey, ItemState, RunState};

/// Spinner de uma execução, com uma linha por item finalizado.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Inicia o spinner para a conta informada.
    pub fn start(account: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{account}: signing in"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn pass(&self, pass: u32, max_passes: u32, pending: usize) {
        self.pb
            .set_message(format!("pass {pass}/{max_passes}, {pending} pending"));
    }

    /// Imprime o estado final de um item acima do spinner.
    pub fn item(&self, key: &ItemKey, state: ItemState) {
        let mark = match state {
            ItemState::Succeeded => self.green.apply_to("✓"),
            ItemState::Failed => self.red.apply_to("✗"),
            _ => self.yellow.apply_to("–"),
        };
        self.pb.println(format!("  {mark} {key} {state}"));
    }

    pub fn finish(&self, state: RunState, residual: usize) {
        self.pb.finish_and_clear();
        match state {
            RunState::Aborted => println!(
                "  {} Run aborted, {residual} item(s) left",
                self.red.apply_to("✗")
            ),
            _ if residual > 0 => println!(
                "  {} Run completed, {residual} item(s) still pending",
                self.yellow.apply_to("!")
            ),
            _ => println!("  {} Run completed", self.green.apply_to("✓")),
        }
    }
}

/// Resumo de uma execução; `verbose` imprime o relatório completo em JSON.
pub fn print_report(report: &RunReport, verbose: bool) {
    let style = if report.is_aborted() {
        Style::new().red().bold()
    } else {
        Style::new().green().bold()
    };
    println!();
    println!(
        "{}",
        style.apply_to(format!("─── {} [{}] ───", report.account, report.state))
    );
    println!(
        "  requested {}, already satisfied {}, finished {}, pending {}, passes {}",
        report.requested,
        report.excluded.len(),
        report.finished.len(),
        report.pending.len(),
        report.passes
    );
    if let Some(reason) = &report.abort_reason {
        println!("  abort reason: {reason}");
    }
    for item in &report.pending {
        println!("  pending: {}", item.key);
    }
    if let Some(summary) = &report.postprocess {
        print_postprocess(summary);
    }
    if verbose {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

pub fn print_postprocess(summary: &PostProcessSummary) {
    println!(
        "  post-processing: renamed {}, summarized {}, moved {}, failures {}",
        summary.renamed, summary.summarized, summary.moved, summary.failures
    );
}

/// Tabela do comando `status`.
pub fn print_status(summary: &LedgerSummary, days: u32) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(format!("Last {days} day(s)")));
    println!(
        "  attempts {}, succeeded {}, failed {}, success rate {:.1}%",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.success_rate()
    );
    for (day, tally) in &summary.per_day {
        println!("  {day}  ok {:>4}  failed {:>4}", tally.succeeded, tally.failed);
    }
    if !summary.top_errors.is_empty() {
        println!("{}", bold.apply_to("Most frequent errors"));
        for (error, count) in &summary.top_errors {
            println!("  {count:>4}  {error}");
        }
    }
}
