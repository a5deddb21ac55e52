use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
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
    Regex::new(r"(?i)(rate[ _-]?limit|usage limit|too many requests|overloaded_error|\b429\b|\b529\b)")
        .expect("valid regex")
});

/// `Claude AI usage limit reached|1714521600`: the suffix is the reset time
/// as a unix timestamp.
static USAGE_RESET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)usage limit reached\|(\d{9,11})").expect("valid regex"));

/// Adapter for the Claude Code CLI (`claude -p`).
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    name: String,
    settings: AgentSettings,
}

impl ClaudeAgent {
    pub fn new(name: impl Into<String>, mut settings: AgentSettings) -> Self {
        if settings.command.is_empty() {
            settings.command = "claude".to_string();
        }
        Self {
            name: name.into(),
            settings,
        }
    }

    fn args(&self, opts: &RunOpts, prompt: String) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = opts.model.as_ref().or(self.settings.model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        let tools = opts
            .allowed_tools
            .as_ref()
            .unwrap_or(&self.settings.allowed_tools);
        if tools.is_empty() {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        args
    }
}

/// The `result` field of the last `{"type":"result"}` line, or the raw
/// stdout when the CLI did not emit stream-json.
fn final_text(stdout: &str) -> String {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|v| v["type"] == "result")
        .and_then(|v| v["result"].as_str().map(str::to_string))
        .unwrap_or_else(|| stdout.trim().to_string())
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<RunResult> {
        let prompt = prepare_prompt(&opts.prompt)?;
        let args = self.args(opts, prompt.arg.clone());
        info!(agent = %self.name, model = ?opts.model.as_ref().or(self.settings.model.as_ref()), "running claude");

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
        let reset_after = USAGE_RESET
            .captures(output)
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .map(|epoch| Duration::from_secs((epoch - Utc::now().timestamp()).max(1) as u64))
            .unwrap_or_else(|| reset_estimate(output, self.settings.fallback_reset()));
        Some(RateLimitInfo {
            provider: self.name.clone(),
            reset_after,
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
    use super::*;
    use crate::agent::patterns::DEFAULT_RESET;
    use crate::agent::LARGE_PROMPT_BYTES;

    fn agent() -> ClaudeAgent {
        ClaudeAgent::new(
            "claude",
            AgentSettings {
                model: Some("sonnet".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn dry_run_renders_full_command() {
        let cmd = agent().dry_run_command(&RunOpts::new("add a test"));
        assert_eq!(
            cmd,
            "claude -p 'add a test' --output-format stream-json --verbose --model sonnet --dangerously-skip-permissions"
        );
    }

    #[test]
    fn opts_override_settings() {
        let mut opts = RunOpts::new("x");
        opts.model = Some("opus".into());
        opts.allowed_tools = Some(vec!["Read".into(), "Grep".into()]);
        let cmd = agent().dry_run_command(&opts);
        assert!(cmd.contains("--model opus"));
        assert!(cmd.contains("--allowedTools Read,Grep"));
        assert!(!cmd.contains("skip-permissions"));
    }

    #[test]
    fn dry_run_of_large_prompt_mentions_file() {
        let cmd = agent().dry_run_command(&RunOpts::new("z".repeat(LARGE_PROMPT_BYTES + 10)));
        assert!(cmd.contains("temp file"));
        assert!(cmd.len() < 1024);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let info = agent()
            .parse_rate_limit("API Error: 429 rate_limit_error\nretry after 2.5 seconds")
            .unwrap();
        assert_eq!(info.reset_after, Duration::from_millis(2500));
        assert_eq!(info.message, "API Error: 429 rate_limit_error");
        assert_eq!(info.provider, "claude");
    }

    #[test]
    fn parses_usage_limit_epoch() {
        let reset = Utc::now().timestamp() + 3600;
        let info = agent()
            .parse_rate_limit(&format!("Claude AI usage limit reached|{reset}"))
            .unwrap();
        assert!(info.reset_after > Duration::from_secs(3500));
        assert!(info.reset_after <= Duration::from_secs(3600));
    }

    #[test]
    fn bare_status_uses_default_wait() {
        let info = agent().parse_rate_limit("529 overloaded_error").unwrap();
        assert_eq!(info.reset_after, DEFAULT_RESET);
    }

    #[test]
    fn ordinary_failures_are_not_rate_limits() {
        assert!(agent().parse_rate_limit("error: file not found").is_none());
    }

    #[test]
    fn final_text_prefers_result_line() {
        let stdout = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{}}"#,
            "\n",
            r#"{"type":"result","result":"All done.","is_error":false}"#,
            "\n"
        );
        assert_eq!(final_text(stdout), "All done.");
        assert_eq!(final_text("plain output\n"), "plain output");
    }

    #[test]
    fn missing_binary_fails_prerequisites() {
        let agent = ClaudeAgent::new(
            "claude",
            AgentSettings {
                command: "baton-missing-claude-binary".into(),
                ..Default::default()
            },
        );
        assert!(agent.check_prerequisites().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_failure_as_result() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-claude");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"type\":\"result\",\"result\":\"partial\"}'\necho 'boom' >&2\nexit 2\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let agent = ClaudeAgent::new(
            "claude",
            AgentSettings {
                command: script.display().to_string(),
                ..Default::default()
            },
        );
        agent.check_prerequisites().unwrap();
        let result = agent
            .run(&CancellationToken::new(), &RunOpts::new("hi"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 2);
        assert_eq!(result.text, "partial");
        assert_eq!(result.stderr, "boom\n");
    }
}
