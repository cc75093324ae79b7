//! Readiness probe transports.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::debug;

use cutover_core::HealthEndpoint;

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered 2xx.
    Healthy,
    /// The endpoint answered with a non-2xx status.
    Unhealthy { status: u16 },
    /// The probe could not be executed (connection or protocol error).
    Failed { error: String },
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }

    /// Human-readable failure detail, `None` when healthy.
    pub fn error_detail(&self) -> Option<String> {
        match self {
            ProbeResult::Healthy => None,
            ProbeResult::Unhealthy { status } => Some(format!("status {status}")),
            ProbeResult::Failed { error } => Some(error.clone()),
        }
    }
}

/// Boxed probe future.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Executes one readiness probe. Injected into `HealthChecker` for testability.
pub trait Probe: Send + Sync {
    fn probe<'a>(&'a self, endpoint: &'a HealthEndpoint) -> ProbeFuture<'a>;
}

/// HTTP/1.1 `GET` probe over a fresh TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProbe;

impl Probe for HttpProbe {
    fn probe<'a>(&'a self, endpoint: &'a HealthEndpoint) -> ProbeFuture<'a> {
        Box::pin(http_probe(endpoint))
    }
}

/// Perform an HTTP readiness probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection or request fails. Timeouts are applied
/// by the caller.
pub async fn http_probe(endpoint: &HealthEndpoint) -> ProbeResult {
    let uri = endpoint.to_string();

    let stream = match tokio::net::TcpStream::connect(endpoint.address.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "probe connection failed");
            return ProbeResult::Failed {
                error: format!("connect: {e}"),
            };
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "probe handshake failed");
            return ProbeResult::Failed {
                error: format!("handshake: {e}"),
            };
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(endpoint.path.as_str())
        .header("host", endpoint.address.as_str())
        .header("user-agent", concat!("cutover/", env!("CARGO_PKG_VERSION")))
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            return ProbeResult::Failed {
                error: format!("request: {e}"),
            }
        }
    };

    match sender.send_request(req).await {
        Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
        Ok(resp) => {
            debug!(status = %resp.status(), %uri, "probe non-2xx");
            ProbeResult::Unhealthy {
                status: resp.status().as_u16(),
            }
        }
        Err(e) => {
            debug!(error = %e, %uri, "probe request failed");
            ProbeResult::Failed {
                error: format!("request: {e}"),
            }
        }
    }
}

/// Probe that always returns the same result. Used by dry runs.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub ProbeResult);

impl StaticProbe {
    pub fn healthy() -> Self {
        Self(ProbeResult::Healthy)
    }
}

impl Probe for StaticProbe {
    fn probe<'a>(&'a self, _endpoint: &'a HealthEndpoint) -> ProbeFuture<'a> {
        let result = self.0.clone();
        Box::pin(async move { result })
    }
}

/// Probe that replays a script of results, then repeats a fallback.
///
/// Counts every probe so callers can assert how many were made.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeResult>>,
    fallback: ProbeResult,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = ProbeResult>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    /// `healthy` successes, then failures forever.
    pub fn healthy_then_failing(healthy: usize) -> Self {
        Self::new(
            std::iter::repeat_n(ProbeResult::Healthy, healthy),
            ProbeResult::Unhealthy { status: 503 },
        )
    }

    /// Number of probes executed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    fn probe<'a>(&'a self, _endpoint: &'a HealthEndpoint) -> ProbeFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .expect("probe script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { next })
    }
}
