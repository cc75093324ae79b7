//! Health checker used by the rollout controller.
//!
//! `check()` runs a single probe bounded by the per-attempt timeout.
//! `wait_until_healthy()` repeats it under a `RetryPolicy` until the
//! endpoint answers healthy, attempts run out, or the operator aborts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cutover_core::{
    epoch_millis, AbortSignal, CutoverError, CutoverResult, HealthCheckResult, HealthEndpoint,
    RetryPolicy,
};

use crate::clock::{Clock, TokioClock};
use crate::probe::{HttpProbe, Probe, ProbeResult};
use crate::retry::{retry_with_backoff, RetryOutcome};

/// Probes environment endpoints. Cheap to clone.
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        Self { probe, clock }
    }

    /// HTTP probes on the tokio clock.
    pub fn http() -> Self {
        Self::new(Arc::new(HttpProbe), Arc::new(TokioClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run one probe. A probe that outlives `timeout` counts as a failure.
    ///
    /// The returned result has `attempt` set to 1; retry loops overwrite it.
    pub async fn check(&self, endpoint: &HealthEndpoint, timeout: Duration) -> HealthCheckResult {
        let started = self.clock.now();

        let result = tokio::select! {
            result = self.probe.probe(endpoint) => result,
            _ = self.clock.sleep(timeout) => ProbeResult::Failed {
                error: format!("timed out after {timeout:?}"),
            },
        };

        let latency = self.clock.now().saturating_duration_since(started);
        debug!(%endpoint, ?result, ?latency, "health probe finished");

        HealthCheckResult {
            timestamp: epoch_millis(),
            success: result.is_healthy(),
            latency,
            attempt: 1,
            error: result.error_detail(),
        }
    }

    /// Probe until healthy, bounded by `policy`.
    ///
    /// Every attempt's result is returned in order, whatever the outcome.
    /// Exhaustion yields `Timeout`; an abort during a sleep yields `Aborted`.
    pub async fn wait_until_healthy(
        &self,
        endpoint: &HealthEndpoint,
        policy: &RetryPolicy,
        abort: &mut AbortSignal,
    ) -> HealthReport {
        let timeout = policy.timeout;
        let outcome = retry_with_backoff(
            self.clock.as_ref(),
            policy.max_attempts,
            policy.interval,
            policy.backoff,
            abort,
            |attempt| async move {
                let mut result = self.check(endpoint, timeout).await;
                result.attempt = attempt;
                if result.success {
                    Ok(result)
                } else {
                    warn!(
                        %endpoint,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "health check failed"
                    );
                    Err(result)
                }
            },
        )
        .await;
        debug!(
            %endpoint,
            attempts = outcome.attempts(),
            healthy = outcome.is_success(),
            "health wait finished"
        );

        match outcome {
            RetryOutcome::Succeeded {
                value, failures, ..
            } => {
                info!(%endpoint, attempt = value.attempt, "endpoint healthy");
                let mut results = failures;
                results.push(value);
                HealthReport {
                    results,
                    outcome: Ok(()),
                }
            }
            RetryOutcome::Exhausted { attempts, failures } => HealthReport {
                results: failures,
                outcome: Err(CutoverError::Timeout {
                    endpoint: endpoint.to_string(),
                    attempts,
                }),
            },
            RetryOutcome::Aborted { failures, .. } => HealthReport {
                results: failures,
                outcome: Err(CutoverError::Aborted),
            },
        }
    }
}

/// Everything one `wait_until_healthy` call observed.
#[derive(Debug)]
pub struct HealthReport {
    /// One entry per attempt, oldest first.
    pub results: Vec<HealthCheckResult>,
    pub outcome: CutoverResult<()>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn attempts(&self) -> u32 {
        self.results.len() as u32
    }
}
