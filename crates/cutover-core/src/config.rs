//! cutover.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{render_str, CommandTemplate, TemplateVars};
use crate::duration::parse_duration;
use crate::error::{CutoverError, CutoverResult};
use crate::types::{Backoff, HealthEndpoint, RetryPolicy, StrategyKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverConfig {
    pub service: Option<ServiceConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    pub platform: Option<PlatformConfig>,
    pub router: Option<RouterConfig>,
    pub state: Option<StateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub namespace: Option<String>,
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Address template, e.g. `{slot}.{namespace}.internal:8080`.
    pub endpoint: String,
    pub path: String,
    pub interval: String,
    pub timeout: String,
    pub max_attempts: u32,
    /// `fixed` or `exponential`.
    pub backoff: String,
    pub max_backoff: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            endpoint: "{service}-{slot}.{namespace}:8080".to_string(),
            path: "/healthz".to_string(),
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            max_attempts: 10,
            backoff: "fixed".to_string(),
            max_backoff: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Default pause between weight steps.
    pub pause: String,
    pub canary_steps: Vec<u32>,
    pub rolling_steps: Vec<u32>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            pause: "30s".to_string(),
            canary_steps: vec![10, 25, 50, 100],
            rolling_steps: vec![25, 50, 75, 100],
        }
    }
}

/// Command templates driving the compute platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub start: CommandTemplate,
    pub stop: CommandTemplate,
    pub scale: Option<CommandTemplate>,
}

/// Command templates driving the routing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub set_weight: CommandTemplate,
    /// Prints the observed weight; polled until it matches.
    pub verify: Option<CommandTemplate>,
    pub verify_attempts: Option<u32>,
    pub verify_interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub dir: String,
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> CutoverResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CutoverError::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CutoverResult<Self> {
        toml::from_str(content).map_err(|e| CutoverError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> CutoverResult<String> {
        toml::to_string_pretty(self).map_err(|e| CutoverError::Config(e.to_string()))
    }

    /// Health retry policy from the `[health]` section.
    pub fn retry_policy(&self) -> CutoverResult<RetryPolicy> {
        let h = &self.health;
        let interval = duration_field("health.interval", &h.interval)?;
        let timeout = duration_field("health.timeout", &h.timeout)?;
        let backoff = match h.backoff.trim().to_ascii_lowercase().as_str() {
            "fixed" => Backoff::Fixed,
            "exponential" => {
                let max = match &h.max_backoff {
                    Some(s) => duration_field("health.max_backoff", s)?,
                    None => Duration::from_secs(60),
                };
                Backoff::Exponential { max }
            }
            other => {
                return Err(CutoverError::Config(format!(
                    "health.backoff must be 'fixed' or 'exponential', got '{other}'"
                )))
            }
        };
        Ok(RetryPolicy {
            max_attempts: h.max_attempts,
            interval,
            timeout,
            backoff,
        })
    }

    /// Default pause between steps.
    pub fn pause(&self) -> CutoverResult<Duration> {
        duration_field("rollout.pause", &self.rollout.pause)
    }

    /// Default weight steps for a strategy when none are given.
    pub fn default_steps(&self, strategy: StrategyKind) -> Vec<u32> {
        match strategy {
            StrategyKind::BlueGreen => vec![100],
            StrategyKind::Canary => self.rollout.canary_steps.clone(),
            StrategyKind::Rolling => self.rollout.rolling_steps.clone(),
        }
    }

    pub fn endpoint_template(&self) -> EndpointTemplate {
        EndpointTemplate::new(self.health.endpoint.clone(), self.health.path.clone())
    }

    /// Poll interval for the router's verify command.
    pub fn verify_interval(&self) -> CutoverResult<Duration> {
        match self.router.as_ref().and_then(|r| r.verify_interval.as_deref()) {
            Some(s) => duration_field("router.verify_interval", s),
            None => Ok(Duration::from_secs(1)),
        }
    }
}

/// Health endpoint address template plus the probe path.
///
/// The address may use `{service}`, `{namespace}` and `{slot}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplate {
    pub address: String,
    pub path: String,
}

impl EndpointTemplate {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }

    pub fn resolve(&self, service: &str, namespace: &str, slot: &str) -> CutoverResult<HealthEndpoint> {
        let mut vars = TemplateVars::new();
        vars.insert("service", service.to_string());
        vars.insert("namespace", namespace.to_string());
        vars.insert("slot", slot.to_string());
        let address = render_str(&self.address, &vars)?;
        Ok(HealthEndpoint::new(address, self.path.clone()))
    }
}

fn duration_field(field: &str, value: &str) -> CutoverResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| CutoverError::Config(format!("{field}: invalid duration '{value}'")))
}
