//! Health check probe logic.
//!
//! A single probe hits one instance; a cycle is judged against the
//! health policy by [`CycleTracker`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use cutover_state::{HealthPolicy, Instance};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        *self == ProbeResult::Healthy
    }
}

/// Probes one instance. The prober enforces the timeout on top of
/// whatever the implementation does.
#[async_trait]
pub trait InstanceProbe: Send + Sync {
    async fn probe(&self, instance: &Instance, timeout: Duration) -> ProbeResult;
}

/// Counts consecutive passing cycles for one task set.
///
/// A cycle passes when at least `ceil(min_healthy_fraction × expected)`
/// expected instances are healthy; with the default fraction of 1.0 that
/// means every expected instance. Any failing cycle resets the count.
#[derive(Debug)]
pub struct CycleTracker {
    policy: HealthPolicy,
    consecutive: u32,
    cycles: u64,
}

impl CycleTracker {
    pub fn new(policy: &HealthPolicy) -> Self {
        Self {
            policy: policy.clone(),
            consecutive: 0,
            cycles: 0,
        }
    }

    /// Record one cycle and return the new consecutive-success count.
    pub fn record(&mut self, healthy: u32, expected: u32) -> u32 {
        self.cycles += 1;
        let passed = expected > 0 && healthy >= self.policy.required_healthy(expected);
        if passed {
            self.consecutive += 1;
        } else {
            if self.consecutive > 0 {
                debug!(healthy, expected, after = self.consecutive, "passing streak broken");
            }
            self.consecutive = 0;
        }
        self.consecutive
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

/// Probes `http://{address}{path}` and treats 2xx as healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    path: String,
}

impl HttpProbe {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl InstanceProbe for HttpProbe {
    async fn probe(&self, instance: &Instance, timeout: Duration) -> ProbeResult {
        http_probe(&instance.address, &self.path, timeout).await
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "cutover-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
