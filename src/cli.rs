//! Interface de linha de comando do docharvest baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, pending, status,
//! postprocess) e flags globais (--config, --max-passes, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::ledger::MAX_WINDOW_DAYS;

/// docharvest: coleta resiliente de documentos em portais sem API.
#[derive(Debug, Parser)]
#[command(name = "docharvest", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML.
    #[arg(long, short, global = true, default_value = "docharvest.toml")]
    pub config: PathBuf,

    /// Sobrescreve o limite de passadas por execução.
    #[arg(long, global = true)]
    pub max_passes: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa a coleta para todas as contas ativas, ou apenas uma.
    Run {
        /// Nome da conta configurada.
        #[arg(long)]
        account: Option<String>,

        /// Chaves avulsas, no lugar dos itens configurados da conta.
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Lista as chaves ainda pendentes segundo o ledger.
    Pending {
        #[arg(long)]
        account: Option<String>,
    },

    /// Resume as tentativas registradas nos últimos dias.
    Status {
        /// Janela do resumo; padrão vem de `ledger.report_days`.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_WINDOW_DAYS)))]
        days: Option<u32>,
    },

    /// Renomeia, resume e organiza os documentos já baixados.
    Postprocess {
        /// Diretório a processar (padrão: o diretório de downloads).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}
