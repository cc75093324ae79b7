//! Compute platform backends.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tracing::{debug, info};

use cutover_core::config::PlatformConfig;
use cutover_core::{CutoverError, CutoverResult, Environment, EnvironmentSpec, TemplateVars};

/// Boxed backend future.
pub type ComputeFuture<'a> = Pin<Box<dyn Future<Output = CutoverResult<()>> + Send + 'a>>;

/// The platform that runs environments.
pub trait ComputeBackend: Send + Sync {
    /// Launch the workload described by `spec`.
    fn start<'a>(&'a self, spec: &'a EnvironmentSpec) -> ComputeFuture<'a>;

    /// Tear the workload down.
    fn stop<'a>(&'a self, env: &'a Environment) -> ComputeFuture<'a>;

    /// Change the replica count of a running workload.
    fn scale<'a>(&'a self, env: &'a Environment, replicas: u32) -> ComputeFuture<'a>;
}

// ── Command templates ──────────────────────────────────────────────

/// Drives the platform through the `[platform]` command templates.
///
/// Placeholders: `{service}`, `{namespace}`, `{slot}`, `{version}`,
/// `{replicas}`.
#[derive(Debug, Clone)]
pub struct CommandCompute {
    config: PlatformConfig,
}

impl CommandCompute {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }

    fn vars(service: &str, namespace: &str, slot: &str, version: &str, replicas: u32) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("service", service.to_string());
        vars.insert("namespace", namespace.to_string());
        vars.insert("slot", slot.to_string());
        vars.insert("version", version.to_string());
        vars.insert("replicas", replicas.to_string());
        vars
    }
}

impl ComputeBackend for CommandCompute {
    fn start<'a>(&'a self, spec: &'a EnvironmentSpec) -> ComputeFuture<'a> {
        Box::pin(async move {
            let vars = Self::vars(
                &spec.service,
                &spec.namespace,
                &spec.slot,
                &spec.version,
                spec.replicas,
            );
            self.config.start.run(&vars).await?;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, env: &'a Environment) -> ComputeFuture<'a> {
        Box::pin(async move {
            let vars = Self::vars(&env.service, &env.namespace, &env.slot, &env.version, env.replicas);
            self.config.stop.run(&vars).await?;
            Ok(())
        })
    }

    fn scale<'a>(&'a self, env: &'a Environment, replicas: u32) -> ComputeFuture<'a> {
        Box::pin(async move {
            let Some(scale) = &self.config.scale else {
                debug!(env = %env.key(), replicas, "no scale command configured, skipping");
                return Ok(());
            };
            let vars = Self::vars(&env.service, &env.namespace, &env.slot, &env.version, replicas);
            scale.run(&vars).await?;
            Ok(())
        })
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// Kind of backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeOp {
    Start,
    Stop,
    Scale,
}

impl fmt::Display for ComputeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputeOp::Start => "start",
            ComputeOp::Stop => "stop",
            ComputeOp::Scale => "scale",
        };
        f.write_str(s)
    }
}

/// One recorded call against `MemoryCompute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeCall {
    pub op: ComputeOp,
    /// Environment key (`{service}/{slot}`).
    pub key: String,
    pub replicas: u32,
}

/// Backend that only records calls. Failures can be injected per
/// operation and environment key.
#[derive(Debug, Default)]
pub struct MemoryCompute {
    calls: Mutex<Vec<ComputeCall>>,
    /// Remaining injected failures per (op, key).
    failures: Mutex<HashMap<(ComputeOp, String), u32>>,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` on `key` fail.
    pub fn fail(&self, op: ComputeOp, key: &str, times: u32) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert((op, key.to_string()), times);
    }

    /// Make every call of `op` on `key` fail.
    pub fn fail_always(&self, op: ComputeOp, key: &str) {
        self.fail(op, key, u32::MAX);
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<ComputeCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, op: ComputeOp) -> Vec<ComputeCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn record(&self, op: ComputeOp, key: String, replicas: u32) -> CutoverResult<()> {
        self.calls.lock().expect("calls lock").push(ComputeCall {
            op,
            key: key.clone(),
            replicas,
        });

        let mut failures = self.failures.lock().expect("failures lock");
        if let Some(remaining) = failures.get_mut(&(op, key.clone())) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(CutoverError::Backend(format!("injected {op} failure for {key}")));
            }
        }
        info!(%op, %key, replicas, "memory compute");
        Ok(())
    }
}

impl ComputeBackend for MemoryCompute {
    fn start<'a>(&'a self, spec: &'a EnvironmentSpec) -> ComputeFuture<'a> {
        let result = self.record(ComputeOp::Start, spec.key(), spec.replicas);
        Box::pin(async move { result })
    }

    fn stop<'a>(&'a self, env: &'a Environment) -> ComputeFuture<'a> {
        let result = self.record(ComputeOp::Stop, env.key(), 0);
        Box::pin(async move { result })
    }

    fn scale<'a>(&'a self, env: &'a Environment, replicas: u32) -> ComputeFuture<'a> {
        let result = self.record(ComputeOp::Scale, env.key(), replicas);
        Box::pin(async move { result })
    }
}
