//! Downstream dependency health for the `/status` endpoint
//!
//! Tools that depend on external systems (a database, an upstream API)
//! register a [`HealthProbe`]; `/status` runs every probe concurrently with a
//! bounded timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Default per-probe deadline
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A downstream dependency check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Dependency name reported in `/status`
    fn name(&self) -> &str;

    /// Check the dependency; `Err` carries operator-facing detail
    async fn check(&self) -> Result<(), String>;
}

/// Health of one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyHealth {
    /// `"ok"` or `"error"`
    pub status: &'static str,
    /// Failure detail (omitted in production mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DependencyHealth {
    fn ok() -> Self {
        Self {
            status: "ok",
            error: None,
        }
    }

    fn failed(detail: String, production: bool) -> Self {
        Self {
            status: "error",
            error: (!production).then_some(detail),
        }
    }

    /// Whether the dependency is healthy
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Runs the registered probes
#[derive(Clone, Default)]
pub struct HealthReporter {
    probes: Vec<Arc<dyn HealthProbe>>,
    timeout: Option<Duration>,
}

impl HealthReporter {
    /// Reporter without probes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Override the per-probe deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of registered probes
    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Whether no probes are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run every probe concurrently
    pub async fn check_all(&self, production: bool) -> BTreeMap<String, DependencyHealth> {
        let timeout = self.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
        let checks = self.probes.iter().map(|probe| async move {
            let result = match tokio::time::timeout(timeout, probe.check()).await {
                Ok(Ok(())) => DependencyHealth::ok(),
                Ok(Err(detail)) => {
                    tracing::warn!(
                        dependency = probe.name(),
                        error = %detail,
                        "Health probe failed"
                    );
                    DependencyHealth::failed(detail, production)
                }
                Err(_) => {
                    tracing::warn!(dependency = probe.name(), "Health probe timed out");
                    DependencyHealth::failed(format!("timed out after {timeout:?}"), production)
                }
            };
            (probe.name().to_string(), result)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}

impl std::fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.probes.iter().map(|p| p.name()).collect();
        f.debug_struct("HealthReporter")
            .field("probes", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Gateway version
    pub version: &'static str,
    /// Always `"streamable-http"`
    pub transport: &'static str,
    /// MCP protocol version
    pub protocol: &'static str,
    /// Human-readable uptime, e.g. `1h2m3s`
    pub uptime: String,
    /// Uptime in whole seconds
    pub uptime_secs: u64,
    /// Open sessions
    pub sessions: usize,
    /// Registered tools
    pub tools: usize,
    /// Dependency health by name
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

/// Format a duration as `1h2m3s`, dropping leading zero units
#[must_use]
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
