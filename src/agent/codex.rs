use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::patterns::{matched_line, reset_estimate};
use super::process::{display_prompt, execute, prepare_prompt, render_command, resolve_executable};
use super::{Agent, AgentSettings, RunOpts, RunResult};
use crate::error::Result;
use crate::ratelimit::RateLimitInfo;

static LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate_limit_exceeded|usage_limit_reached|rate limit|too many requests|\b429\b)")
        .expect("valid regex")
});

/// Adapter for the OpenAI Codex CLI (`codex exec`).
#[derive(Debug, Clone)]
pub struct CodexAgent {
    name: String,
    settings: AgentSettings,
}

impl CodexAgent {
    pub fn new(name: impl Into<String>, mut settings: AgentSettings) -> Self {
        if settings.command.is_empty() {
            settings.command = "codex".to_string();
        }
        Self {
            name: name.into(),
            settings,
        }
    }

    fn args(&self, opts: &RunOpts, prompt: String) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--full-auto".to_string(),
        ];
        if let Some(model) = opts.model.as_ref().or(self.settings.model.as_ref()) {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        if let Some(effort) = opts.effort.as_ref().or(self.settings.effort.as_ref()) {
            args.push("-c".to_string());
            args.push(format!("model_reasoning_effort={effort}"));
        }
        args.push(prompt);
        args
    }
}

/// Text of the last agent message in `--json` output. Both the current
/// (`item.completed`) and the older (`msg`) event shapes are recognised.
fn final_text(stdout: &str) -> String {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|v| {
            if v["item"]["type"] == "agent_message" {
                return v["item"]["text"].as_str().map(str::to_string);
            }
            if v["msg"]["type"] == "agent_message" {
                return v["msg"]["message"].as_str().map(str::to_string);
            }
            None
        })
        .unwrap_or_else(|| stdout.trim().to_string())
}

#[async_trait]
impl Agent for CodexAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<RunResult> {
        let prompt = prepare_prompt(&opts.prompt)?;
        let args = self.args(opts, prompt.arg.clone());
        info!(agent = %self.name, "running codex");

        let raw = execute(&self.name, &self.settings.command, &args, opts, cancel).await?;
        drop(prompt);

        Ok(RunResult {
            text: final_text(&raw.stdout),
            exit_code: raw.exit_code,
            duration: raw.duration,
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }

    fn check_prerequisites(&self) -> Result<()> {
        resolve_executable(&self.name, &self.settings.command).map(|_| ())
    }

    fn parse_rate_limit(&self, output: &str) -> Option<RateLimitInfo> {
        let message = matched_line(output, &LIMIT)?;
        Some(RateLimitInfo {
            provider: self.name.clone(),
            reset_after: reset_estimate(output, self.settings.fallback_reset()),
            message,
        })
    }

    fn dry_run_command(&self, opts: &RunOpts) -> String {
        let args = self.args(opts, display_prompt(&opts.prompt));
        render_command(&self.settings.command, &args)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn agent() -> CodexAgent {
        CodexAgent::new(
            "codex",
            AgentSettings {
                model: Some("gpt-5".into()),
                effort: Some("high".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn dry_run_renders_full_command() {
        assert_eq!(
            agent().dry_run_command(&RunOpts::new("review this")),
            "codex exec --json --full-auto -m gpt-5 -c model_reasoning_effort=high 'review this'"
        );
    }

    #[test]
    fn effort_is_optional() {
        let agent = CodexAgent::new("codex", AgentSettings::default());
        assert_eq!(
            agent.dry_run_command(&RunOpts::new("go")),
            "codex exec --json --full-auto go"
        );
    }

    #[test]
    fn parses_try_again_in() {
        let out = "ERROR: stream error: rate_limit_exceeded: Rate limit reached for gpt-5. Please try again in 20.5s.";
        let info = agent().parse_rate_limit(out).unwrap();
        assert_eq!(info.reset_after, Duration::from_millis(20_500));
        assert_eq!(info.provider, "codex");
        assert!(info.message.starts_with("ERROR: stream error"));
    }

    #[test]
    fn parses_millis() {
        let out = "ERROR: rate_limit_exceeded: Rate limit reached for requests. Please try again in 20ms.";
        let info = agent().parse_rate_limit(out).unwrap();
        assert_eq!(info.reset_after, Duration::from_millis(20));
    }

    #[test]
    fn parses_minutes() {
        let info = agent()
            .parse_rate_limit("You've hit your usage limit (usage_limit_reached). Try again in 3 minutes")
            .unwrap();
        assert_eq!(info.reset_after, Duration::from_secs(180));
    }

    #[test]
    fn unrelated_output_is_not_a_limit() {
        assert!(agent().parse_rate_limit("error: patch failed to apply").is_none());
    }

    #[test]
    fn final_text_reads_agent_messages() {
        let current = concat!(
            r#"{"type":"thread.started"}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"Looks good."}}"#,
            "\n",
            r#"{"type":"turn.completed"}"#
        );
        assert_eq!(final_text(current), "Looks good.");

        let older = r#"{"id":"0","msg":{"type":"agent_message","message":"FINDING: typo"}}"#;
        assert_eq!(final_text(older), "FINDING: typo");
        assert_eq!(final_text("raw\n"), "raw");
    }
}
