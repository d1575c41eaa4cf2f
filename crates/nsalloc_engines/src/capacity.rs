#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CPU_REQUESTS_QUERY: &str =
    r#"sum(kube_pod_container_resource_requests{resource="cpu",node=~".*"})"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacitySourceError {
    #[error("capacity endpoint unreachable ({kind}): {detail}")]
    Unreachable { kind: &'static str, detail: String },
    #[error("capacity endpoint answered http {0}")]
    HttpStatus(u16),
    #[error("capacity query failed: {0}")]
    Query(String),
    #[error("capacity query returned no samples")]
    NoData,
    #[error("capacity response malformed: {0}")]
    Malformed(String),
    #[error("no capacity endpoint configured or discoverable")]
    NoEndpoint,
}

/// Reports current aggregate CPU requests of the shared cluster.
pub trait CapacitySource {
    fn current_usage(&self) -> Result<f64, CapacitySourceError>;
}

impl<T: CapacitySource + ?Sized> CapacitySource for &T {
    fn current_usage(&self) -> Result<f64, CapacitySourceError> {
        (**self).current_usage()
    }
}

impl<T: CapacitySource + ?Sized> CapacitySource for Box<T> {
    fn current_usage(&self) -> Result<f64, CapacitySourceError> {
        (**self).current_usage()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySourceConfig {
    pub base_url: Option<String>,
    pub discovery_url: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl CapacitySourceConfig {
    pub fn mvp_v1() -> Self {
        Self {
            base_url: None,
            discovery_url: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::mvp_v1();
        cfg.base_url = non_empty_env("NSALLOC_PROMETHEUS_URL");
        cfg.discovery_url = non_empty_env("NSALLOC_DISCOVERY_URL");
        cfg.request_timeout_ms = std::env::var("NSALLOC_CAPACITY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(cfg.request_timeout_ms);
        cfg
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Prometheus-backed source. The base URL is either configured or resolved once through
/// the discovery endpoint and then cached.
#[derive(Debug)]
pub struct PrometheusCapacitySource {
    agent: ureq::Agent,
    config: CapacitySourceConfig,
    resolved_base_url: Mutex<Option<String>>,
}

impl PrometheusCapacitySource {
    pub fn new(config: CapacitySourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        let resolved_base_url = Mutex::new(config.base_url.clone());
        Self {
            agent,
            config,
            resolved_base_url,
        }
    }

    fn base_url(&self) -> Result<String, CapacitySourceError> {
        let mut cached = self
            .resolved_base_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(url) = cached.as_ref() {
            return Ok(url.clone());
        }
        let discovery_url = self
            .config
            .discovery_url
            .as_deref()
            .ok_or(CapacitySourceError::NoEndpoint)?;
        let body = self.get_text(discovery_url)?;
        let url = parse_discovery_response(&body)?;
        debug!(prometheus_url = %url, "capacity endpoint discovered");
        *cached = Some(url.clone());
        Ok(url)
    }

    fn forget_base_url(&self) {
        if self.config.base_url.is_none() {
            let mut cached = self
                .resolved_base_url
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *cached = None;
        }
    }

    fn get_text(&self, url: &str) -> Result<String, CapacitySourceError> {
        let response = self.agent.get(url).call().map_err(error_from_ureq)?;
        response
            .into_string()
            .map_err(|err| CapacitySourceError::Malformed(err.to_string()))
    }

    fn query_usage(&self, base_url: &str) -> Result<f64, CapacitySourceError> {
        let base = base_url.trim_end_matches('/');
        self.get_text(&format!("{base}/-/healthy"))?;
        let response = self
            .agent
            .get(&format!("{base}/api/v1/query"))
            .query("query", CPU_REQUESTS_QUERY)
            .call()
            .map_err(error_from_ureq)?;
        let body = response
            .into_string()
            .map_err(|err| CapacitySourceError::Malformed(err.to_string()))?;
        parse_query_response(&body)
    }
}

impl CapacitySource for PrometheusCapacitySource {
    fn current_usage(&self) -> Result<f64, CapacitySourceError> {
        let base_url = self.base_url()?;
        match self.query_usage(&base_url) {
            Ok(usage) => Ok(usage),
            Err(err) => {
                warn!(error = %err, prometheus_url = %base_url, "capacity query failed");
                // A discovered endpoint may have moved; resolve again next time.
                if matches!(err, CapacitySourceError::Unreachable { .. }) {
                    self.forget_base_url();
                }
                Err(err)
            }
        }
    }
}

fn error_from_ureq(err: ureq::Error) -> CapacitySourceError {
    match err {
        ureq::Error::Status(code, _) => CapacitySourceError::HttpStatus(code),
        ureq::Error::Transport(transport) => {
            let detail = transport.to_string();
            CapacitySourceError::Unreachable {
                kind: classify_transport_error_kind(&format!("{:?} {}", transport.kind(), detail)),
                detail,
            }
        }
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    prometheus_url: Option<String>,
}

pub fn parse_discovery_response(body: &str) -> Result<String, CapacitySourceError> {
    let parsed: DiscoveryResponse = serde_json::from_str(body)
        .map_err(|err| CapacitySourceError::Malformed(err.to_string()))?;
    parsed
        .prometheus_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or(CapacitySourceError::NoEndpoint)
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    /// `[unix_seconds, "value"]`
    value: (serde_json::Value, String),
}

/// Parses a Prometheus instant-vector response and returns the first sample.
pub fn parse_query_response(body: &str) -> Result<f64, CapacitySourceError> {
    let parsed: QueryResponse = serde_json::from_str(body)
        .map_err(|err| CapacitySourceError::Malformed(err.to_string()))?;
    if parsed.status != "success" {
        return Err(CapacitySourceError::Query(
            parsed.error.unwrap_or_else(|| parsed.status.clone()),
        ));
    }
    let sample = parsed
        .data
        .and_then(|data| data.result.into_iter().next())
        .ok_or(CapacitySourceError::NoData)?;
    let usage = sample
        .value
        .1
        .trim()
        .parse::<f64>()
        .map_err(|_| CapacitySourceError::Malformed(format!("value {:?}", sample.value.1)))?;
    if !usage.is_finite() || usage < 0.0 {
        return Err(CapacitySourceError::Malformed(format!("value {usage}")));
    }
    Ok(usage)
}
