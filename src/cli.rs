//! Interface de linha de comando do baton baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, resume, dry-run,
//! status, check) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

/// baton: workflows duráveis e retomáveis para agentes de código.
#[derive(Debug, Parser)]
#[command(name = "baton", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./baton.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Aumenta o detalhamento dos logs (-v, -vv, -vvv).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia uma nova execução do workflow para a tarefa fornecida.
    Run {
        /// Descrição da tarefa (o que implementar).
        task: String,

        /// Identificador da execução; gerado automaticamente se omitido.
        #[arg(long)]
        run_id: Option<String>,

        /// Branch onde o pull request deve ser aberto.
        #[arg(long)]
        branch: Option<String>,
    },

    /// Retoma uma execução interrompida a partir do seu checkpoint.
    #[command(group(ArgGroup::new("source").required(true).args(["run_id", "checkpoint"])))]
    Resume {
        /// Identificador da execução a retomar.
        run_id: Option<String>,

        /// Caminho explícito para um arquivo de checkpoint.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Mostra os passos e comandos que seriam executados, sem executar nada.
    DryRun {
        /// Descrição da tarefa.
        task: String,

        /// Branch onde o pull request seria aberto.
        #[arg(long)]
        branch: Option<String>,
    },

    /// Lista as execuções com checkpoint e o passo atual de cada uma.
    Status,

    /// Verifica a configuração e se os executáveis dos agentes estão no PATH.
    Check,
}
