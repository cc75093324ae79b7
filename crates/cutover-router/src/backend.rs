//! Routing layer backends.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use cutover_core::config::RouterConfig;
use cutover_core::{CutoverError, CutoverResult, TemplateVars};

/// Boxed backend future.
pub type RoutingFuture<'a> = Pin<Box<dyn Future<Output = CutoverResult<()>> + Send + 'a>>;

/// A new weight for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightChange {
    /// Environment key (`{service}/{slot}`).
    pub key: String,
    pub weight: u8,
}

impl WeightChange {
    /// Slot part of the key.
    pub fn slot(&self) -> &str {
        self.key
            .rsplit_once('/')
            .map(|(_, slot)| slot)
            .unwrap_or(&self.key)
    }
}

/// The layer that actually splits traffic.
pub trait RoutingBackend: Send + Sync {
    /// Apply weight changes for one service. Changes arrive ordered so
    /// that environments gaining traffic come before those losing it.
    fn apply<'a>(&'a self, service: &'a str, changes: &'a [WeightChange]) -> RoutingFuture<'a>;
}

// ── Command templates ──────────────────────────────────────────────

/// Drives the routing layer through the `[router]` command templates.
///
/// `set_weight` receives `{service}`, `{slot}`, `{weight}`. When `verify`
/// is configured it is polled with `{service}`, `{slot}` until it prints
/// the expected weight.
#[derive(Debug, Clone)]
pub struct CommandRouting {
    config: RouterConfig,
    verify_interval: Duration,
}

impl CommandRouting {
    pub fn new(config: RouterConfig, verify_interval: Duration) -> Self {
        Self {
            config,
            verify_interval,
        }
    }

    async fn verify(&self, service: &str, change: &WeightChange) -> CutoverResult<()> {
        let Some(verify) = &self.config.verify else {
            return Ok(());
        };
        let attempts = self.config.verify_attempts.unwrap_or(5).max(1);

        let mut vars = TemplateVars::new();
        vars.insert("service", service.to_string());
        vars.insert("slot", change.slot().to_string());

        let mut observed = String::new();
        for attempt in 1..=attempts {
            observed = verify.run(&vars).await?;
            if observed.trim().parse::<u8>().ok() == Some(change.weight) {
                debug!(%service, env = %change.key, weight = change.weight, attempt, "weight verified");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(self.verify_interval).await;
            }
        }
        warn!(%service, env = %change.key, expected = change.weight, %observed, "weight not observed");
        Err(CutoverError::Backend(format!(
            "routing layer reports '{observed}' for {} after {attempts} checks, expected {}",
            change.key, change.weight
        )))
    }
}

impl RoutingBackend for CommandRouting {
    fn apply<'a>(&'a self, service: &'a str, changes: &'a [WeightChange]) -> RoutingFuture<'a> {
        Box::pin(async move {
            for change in changes {
                let mut vars = TemplateVars::new();
                vars.insert("service", service.to_string());
                vars.insert("slot", change.slot().to_string());
                vars.insert("weight", change.weight.to_string());
                self.config.set_weight.run(&vars).await?;
            }
            for change in changes {
                self.verify(service, change).await?;
            }
            Ok(())
        })
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// Routing layer that only records what it was told. Failures can be
/// injected for the next N calls.
#[derive(Debug, Default)]
pub struct MemoryRouting {
    applied: Mutex<Vec<(String, Vec<WeightChange>)>>,
    observed: Mutex<BTreeMap<String, u8>>,
    failures: Mutex<u32>,
}

impl MemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls.
    pub fn fail(&self, times: u32) {
        *self.failures.lock().expect("failures lock") = times;
    }

    /// Fail every call from now on.
    pub fn fail_always(&self) {
        self.fail(u32::MAX);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.fail(0);
    }

    /// Successful `apply` calls, oldest first.
    pub fn applied(&self) -> Vec<(String, Vec<WeightChange>)> {
        self.applied.lock().expect("applied lock").clone()
    }

    /// Last weight applied to each environment key.
    pub fn observed(&self) -> BTreeMap<String, u8> {
        self.observed.lock().expect("observed lock").clone()
    }

    fn record(&self, service: &str, changes: &[WeightChange]) -> CutoverResult<()> {
        {
            let mut failures = self.failures.lock().expect("failures lock");
            if *failures > 0 {
                if *failures != u32::MAX {
                    *failures -= 1;
                }
                return Err(CutoverError::Backend(format!(
                    "injected routing failure for {service}"
                )));
            }
        }

        let mut observed = self.observed.lock().expect("observed lock");
        for change in changes {
            info!(%service, env = %change.key, weight = change.weight, "memory routing");
            observed.insert(change.key.clone(), change.weight);
        }
        self.applied
            .lock()
            .expect("applied lock")
            .push((service.to_string(), changes.to_vec()));
        Ok(())
    }
}

impl RoutingBackend for MemoryRouting {
    fn apply<'a>(&'a self, service: &'a str, changes: &'a [WeightChange]) -> RoutingFuture<'a> {
        let result = self.record(service, changes);
        Box::pin(async move { result })
    }
}
