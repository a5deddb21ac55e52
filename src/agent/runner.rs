use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Agent, RunOpts, RunResult};
use crate::error::{BatonError, Result};
use crate::ratelimit::RateLimitCoordinator;

/// Runs agents under the rate-limit protocol: wait while the provider is
/// limited, run, and on a recognised limit record it and try again until the
/// wait ceiling is reached.
#[derive(Clone)]
pub struct AgentRunner {
    coordinator: Arc<RateLimitCoordinator>,
}

impl AgentRunner {
    pub fn new(coordinator: Arc<RateLimitCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<RateLimitCoordinator> {
        &self.coordinator
    }

    pub async fn run(
        &self,
        agent: &dyn Agent,
        cancel: &CancellationToken,
        opts: &RunOpts,
    ) -> Result<RunResult> {
        let provider = self.coordinator.provider_for(agent.name()).to_string();

        loop {
            if self.coordinator.should_wait(&provider) {
                info!(agent = agent.name(), provider = %provider, "provider limited, waiting");
                self.coordinator.wait_for_reset(cancel, &provider).await?;
            }
            if cancel.is_cancelled() {
                return Err(BatonError::Cancelled);
            }

            let result = agent.run(cancel, opts).await?;

            let limit = (!result.success())
                .then(|| agent.parse_rate_limit(&result.combined_output()))
                .flatten();
            let Some(limit) = limit else {
                self.coordinator.record_success(&provider);
                return Ok(result);
            };

            self.coordinator.record_rate_limit(&provider, &limit);
            if self.coordinator.exceeded_max_waits(&provider) {
                let waits = self
                    .coordinator
                    .snapshot(&provider)
                    .map(|s| s.wait_count)
                    .unwrap_or_default();
                warn!(agent = agent.name(), provider = %provider, waits, "giving up on rate limit");
                return Err(BatonError::MaxWaitsExceeded { provider, waits });
            }
            warn!(
                agent = agent.name(),
                provider = %provider,
                reset_after_secs = limit.reset_after.as_secs_f64(),
                message = %limit.message,
                "rate limited, will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::agent::testing::{output, ScriptedAgent};
    use crate::ratelimit::{RateLimitConfig, RateLimitInfo};

    fn runner(max_waits: u32) -> AgentRunner {
        AgentRunner::new(Arc::new(RateLimitCoordinator::new(RateLimitConfig {
            max_waits,
            jitter_fraction: 0.0,
        })))
    }

    #[tokio::test]
    async fn retries_after_rate_limit_then_succeeds() {
        let agent = ScriptedAgent::new("claude", vec![output(1, "HTTP 429"), output(0, "done")]);
        let runner = runner(5);

        let started = Instant::now();
        let result = runner
            .run(&agent, &CancellationToken::new(), &RunOpts::new("go"))
            .await
            .unwrap();

        assert_eq!(result.text, "done");
        assert_eq!(agent.calls().len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(15));
        let state = runner.coordinator().snapshot("claude").unwrap();
        assert!(!state.is_limited);
        assert_eq!(state.wait_count, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_without_limit_is_returned() {
        let agent = ScriptedAgent::new("claude", vec![output(2, "compile error")]);
        let result = runner(5)
            .run(&agent, &CancellationToken::new(), &RunOpts::new("go"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn successful_output_mentioning_429_is_not_a_limit() {
        let agent = ScriptedAgent::new("claude", vec![output(0, "fixed the 429 handler")]);
        runner(5)
            .run(&agent, &CancellationToken::new(), &RunOpts::new("go"))
            .await
            .unwrap();
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn escalates_at_the_ceiling() {
        let agent = ScriptedAgent::new(
            "codex",
            (0..5).map(|_| output(1, "429")).collect(),
        );
        let err = runner(3)
            .run(&agent, &CancellationToken::new(), &RunOpts::new("go"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BatonError::MaxWaitsExceeded { ref provider, waits: 3 } if provider == "codex"
        ));
        assert_eq!(agent.calls().len(), 3);
    }

    #[tokio::test]
    async fn shared_provider_is_respected_across_agents() {
        let coordinator = Arc::new(
            RateLimitCoordinator::new(RateLimitConfig {
                max_waits: 5,
                jitter_fraction: 0.0,
            })
            .map_agent("fast", "anthropic")
            .map_agent("slow", "anthropic"),
        );
        coordinator.record_rate_limit(
            "anthropic",
            &RateLimitInfo {
                provider: "fast".into(),
                reset_after: Duration::from_millis(200),
                message: "limited".into(),
            },
        );

        let agent = ScriptedAgent::new("slow", vec![]);
        let started = Instant::now();
        AgentRunner::new(coordinator)
            .run(&agent, &CancellationToken::new(), &RunOpts::new("go"))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancelled_before_start_does_not_run() {
        let agent = ScriptedAgent::new("claude", vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner(5)
            .run(&agent, &cancel, &RunOpts::new("go"))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(agent.calls().is_empty());
    }
}
