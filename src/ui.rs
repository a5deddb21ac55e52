//! Interface de terminal do baton: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente uma
//! execução do workflow a partir dos [`EngineUpdate`]s do motor.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use baton::workflow::{EngineUpdate, EventKind, Outcome, PlannedStep, WorkflowState};

/// Indicador visual de progresso para uma execução no terminal.
///
/// Exibe um spinner animado enquanto um passo roda e uma linha colorida por
/// transição: verde para sucesso, amarelo para resultados parciais e
/// vermelho para os demais.
pub struct RunProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    /// Inicia o spinner para a execução `run_id`.
    pub fn start(run_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("run {run_id}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner ou imprime a transição correspondente.
    pub fn update(&self, update: &EngineUpdate) {
        match update {
            EngineUpdate::StepStarted { step, .. } => {
                self.pb.set_message(format!("{step}…"));
            }
            EngineUpdate::StepFinished {
                step, event, next, ..
            } => {
                let (mark, style) = match event.kind {
                    EventKind::Success => ("✓", &self.green),
                    EventKind::Partial => ("◐", &self.yellow),
                    EventKind::RateLimited => ("⏳", &self.yellow),
                    _ => ("✗", &self.red),
                };
                let message = event
                    .message
                    .as_deref()
                    .map(|m| format!(" {}", self.dim.apply_to(m)))
                    .unwrap_or_default();
                self.pb.println(format!(
                    "  {} {step}: {}{message} → {next}",
                    style.apply_to(mark),
                    event.kind
                ));
            }
            EngineUpdate::Finished { .. } => {}
        }
    }

    /// Finaliza o spinner e exibe o resultado final da execução.
    pub fn complete(&self, outcome: Outcome, state: &WorkflowState) {
        self.pb.finish_and_clear();
        match outcome {
            Outcome::Succeeded => {
                println!("  {} Workflow completed", self.green.apply_to("✓"));
                if let Some(url) = state.get_str("pr_url") {
                    println!("    {url}");
                }
            }
            Outcome::Failed => {
                let reason = state
                    .history
                    .last()
                    .and_then(|h| h.message.as_deref())
                    .unwrap_or("see history");
                println!("  {} Workflow failed: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    /// Interrompe o spinner sem resultado (cancelamento ou erro).
    pub fn abandon(&self, reason: &str) {
        self.pb.finish_and_clear();
        println!("  {} {reason}", self.yellow.apply_to("■"));
    }
}

/// Imprime o plano de um dry-run.
pub fn print_plan(plan: &[PlannedStep]) {
    let bold = Style::new().bold();
    for (i, planned) in plan.iter().enumerate() {
        println!("{} {}", bold.apply_to(format!("{}.", i + 1)), bold.apply_to(&planned.step));
        for line in planned.description.lines() {
            println!("   {line}");
        }
    }
}
