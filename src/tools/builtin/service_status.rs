//! SSRF-guarded HTTP health probe behind a persistent circuit breaker.
//!
//! Reachability problems are values here, never errors: DNS failures, blocked
//! targets, and timeouts all map to `status = unknown` with a note, so the
//! worker can proceed with degraded evidence. Only allowlist misses and
//! storage faults surface as tool errors.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::TriageConfig;
use crate::error::ToolError;
use crate::store::Store;
use crate::tools::tool::EvidenceTool;
use crate::util::now_rfc3339;

const BODY_READ_LIMIT: usize = 8192;

fn default_method() -> String {
    "GET".to_string()
}

fn default_status_min() -> u16 {
    200
}

fn default_status_max() -> u16 {
    299
}

fn default_retries() -> u32 {
    1
}

fn default_scope() -> String {
    "external".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCheck {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, rename = "type")]
    pub check_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceExpectation {
    #[serde(default = "default_status_min")]
    pub status_min: u16,
    #[serde(default = "default_status_max")]
    pub status_max: u16,
    #[serde(default)]
    pub body_contains: Option<String>,
}

impl Default for ServiceExpectation {
    fn default() -> Self {
        Self {
            status_min: default_status_min(),
            status_max: default_status_max(),
            body_contains: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub check: ServiceCheck,
    #[serde(default)]
    pub expected: ServiceExpectation,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_scope")]
    pub scope: String,
}

/// Static allowlist of probeable services, loaded from JSON config.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn from_path(path: &Path) -> Result<Self, crate::error::ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let services: HashMap<String, ServiceEntry> = serde_json::from_str(&text)
            .map_err(|e| crate::error::ConfigError::ParseError(e.to_string()))?;
        Ok(Self { services })
    }

    pub fn from_value(value: Value) -> Result<Self, crate::error::ConfigError> {
        let services: HashMap<String, ServiceEntry> = serde_json::from_value(value)
            .map_err(|e| crate::error::ConfigError::ParseError(e.to_string()))?;
        Ok(Self { services })
    }

    pub fn get(&self, service_id: &str) -> Option<&ServiceEntry> {
        self.services.get(service_id)
    }
}

/// DNS resolution seam; injectable so the SSRF guard is testable without a
/// network.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a host to its addresses. `Err` carries a short note kind
    /// ("dns_timeout" or the resolver error text).
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, String>;
}

pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, String> {
        let lookup = tokio::net::lookup_host((host, port));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.dedup();
                Ok(ips)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("dns_timeout".to_string()),
        }
    }
}

fn is_non_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Short-TTL result cache keyed by (service_id, region); avoids hammering a
/// flapping dependency from repeated probes within one triage burst.
struct StatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), (Instant, Value)>>,
}

impl StatusCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, service_id: &str, region: &str) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        let (at, value) = entries.get(&(service_id.to_string(), region.to_string()))?;
        if at.elapsed() <= self.ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    fn put(&self, service_id: &str, region: &str, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                (service_id.to_string(), region.to_string()),
                (Instant::now(), value),
            );
        }
    }
}

pub struct ServiceStatusTool {
    registry: ServiceRegistry,
    store: Arc<dyn Store>,
    resolver: Arc<dyn Resolver>,
    client: reqwest::Client,
    cache: StatusCache,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl ServiceStatusTool {
    pub fn new(
        registry: ServiceRegistry,
        store: Arc<dyn Store>,
        resolver: Arc<dyn Resolver>,
        config: &TriageConfig,
    ) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout + config.read_timeout)
            .build()
            .map_err(|e| ToolError::Execution {
                name: "service_status".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            registry,
            store,
            resolver,
            client,
            cache: StatusCache::new(config.status_cache_ttl),
            breaker_threshold: config.breaker_threshold,
            breaker_cooldown: config.breaker_cooldown,
        })
    }

    fn bundle(
        &self,
        service_id: &str,
        tenant_id: Option<&str>,
        region: &str,
        scope: &str,
        checked_at: &str,
        status: &str,
        http_status: Option<u16>,
        latency_ms: Option<u64>,
        dns_ok: bool,
        confidence: f64,
        notes: &[String],
    ) -> Value {
        let mut detail_parts = vec![format!("{service_id} status={status}")];
        match http_status {
            Some(code) => detail_parts.push(format!("http={code}")),
            None => detail_parts.push("http=unreachable".to_string()),
        }
        if let Some(latency) = latency_ms {
            detail_parts.push(format!("latency_ms={latency}"));
        }
        if !notes.is_empty() {
            detail_parts.push(format!("notes={}", notes.join("/")));
        }
        let detail = detail_parts.join(" ");

        json!({
            "source": "app_events",
            "evidence_type": "service_status",
            "time_window": {"start": checked_at, "end": checked_at},
            "tenant": tenant_id,
            "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
            "metadata": {
                "service_id": service_id,
                "tenant_id": tenant_id,
                "region": if region.is_empty() { Value::Null } else { json!(region) },
                "status": status,
                "http_status": http_status,
                "latency_ms": latency_ms,
                "dns_ok": dns_ok,
                "scope": scope,
                "confidence": confidence,
                "notes": notes
            },
            "events": [{
                "ts": checked_at,
                "type": "service_status",
                "id": format!("svc-{service_id}-{checked_at}"),
                "message_id": null,
                "detail": detail
            }]
        })
    }

    async fn probe(
        &self,
        url: &str,
        method: &str,
        retries: u32,
        timeout: Option<Duration>,
        body_contains: Option<&str>,
    ) -> (Option<u16>, u64, String) {
        let method = method
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::GET);
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self.client.request(method.clone(), url);
            // Per-service timeout overrides the client-wide default.
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let latency = started.elapsed().as_millis() as u64;
                    let snippet = if body_contains.is_some() {
                        let body = response.text().await.unwrap_or_default();
                        body.chars().take(BODY_READ_LIMIT).collect()
                    } else {
                        String::new()
                    };
                    return (Some(status), latency, snippet);
                }
                Err(e) => {
                    if attempt > retries {
                        return (None, started.elapsed().as_millis() as u64, e.to_string());
                    }
                    // linear backoff between attempts
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
    }
}

#[async_trait]
impl EvidenceTool for ServiceStatusTool {
    fn name(&self) -> &'static str {
        "service_status"
    }

    fn params_schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["service_id"],
            "properties": {
                "service_id": {"type": "string"},
                "tenant_id": {"type": ["string", "null"]},
                "region": {"type": ["string", "null"]}
            }
        })
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let service_id = params
            .get("service_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tenant_id = params
            .get("tenant_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let region = params
            .get("region")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let entry = self
            .registry
            .get(&service_id)
            .ok_or_else(|| ToolError::Execution {
                name: "service_status".to_string(),
                reason: format!("service not allowlisted: {service_id}"),
            })?
            .clone();
        let scope = entry.scope.clone();

        if let Some(cached) = self.cache.get(&service_id, &region) {
            debug!(service = %service_id, "serving cached service status");
            return Ok(cached);
        }

        let storage = |e: crate::error::StorageError| ToolError::Execution {
            name: "service_status".to_string(),
            reason: e.to_string(),
        };

        // Breaker short-circuit: no DNS, no HTTP.
        let breaker = self
            .store
            .get_breaker(&service_id, &scope)
            .await
            .map_err(storage)?;
        if breaker.is_some_and(|b| b.is_open(Utc::now())) {
            let checked_at = now_rfc3339();
            return Ok(self.bundle(
                &service_id,
                tenant_id.as_deref(),
                &region,
                &scope,
                &checked_at,
                "unknown",
                None,
                None,
                false,
                0.2,
                &["circuit_open".to_string()],
            ));
        }

        let checked_at = now_rfc3339();
        let mut notes: Vec<String> = Vec::new();
        let mut dns_ok = false;

        let parsed = reqwest::Url::parse(&entry.check.url).ok();
        let host = parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .map(str::to_string);
        let port = parsed
            .as_ref()
            .and_then(|u| u.port_or_known_default())
            .unwrap_or(443);

        match host {
            Some(ref host) => match self.resolver.resolve(host, port).await {
                Ok(addrs) => {
                    dns_ok = true;
                    if scope == "external" && addrs.iter().all(is_non_public) && !addrs.is_empty()
                    {
                        warn!(service = %service_id, host = %host, "refusing to probe non-public target");
                        notes.push("blocked_non_public_ip".to_string());
                        let result = self.bundle(
                            &service_id,
                            tenant_id.as_deref(),
                            &region,
                            &scope,
                            &checked_at,
                            "unknown",
                            None,
                            None,
                            true,
                            0.2,
                            &notes,
                        );
                        self.cache.put(&service_id, &region, result.clone());
                        return Ok(result);
                    }
                }
                Err(kind) => notes.push(kind),
            },
            None => notes.push("missing_host".to_string()),
        }

        let mut http_status: Option<u16> = None;
        let mut latency_ms: Option<u64> = None;
        let mut body_snippet = String::new();
        if dns_ok {
            let (status, latency, snippet) = self
                .probe(
                    &entry.check.url,
                    &entry.check.method,
                    entry.retries,
                    entry.timeout_ms.map(Duration::from_millis),
                    entry.expected.body_contains.as_deref(),
                )
                .await;
            http_status = status;
            latency_ms = Some(latency);
            body_snippet = snippet;
        }

        let (status, confidence) = match http_status {
            Some(code) if (300..400).contains(&code) => {
                notes.push("redirect_blocked".to_string());
                ("unknown", 0.4)
            }
            Some(code) => {
                let body_ok = entry
                    .expected
                    .body_contains
                    .as_deref()
                    .is_none_or(|needle| body_snippet.contains(needle));
                if code >= entry.expected.status_min && code <= entry.expected.status_max && body_ok
                {
                    ("up", 0.8)
                } else {
                    ("down", 0.6)
                }
            }
            None => ("unknown", 0.2),
        };

        if status == "up" {
            self.store
                .reset_breaker(&service_id, &scope)
                .await
                .map_err(storage)?;
        } else {
            let kind = notes.first().cloned().unwrap_or_else(|| "failure".to_string());
            self.store
                .bump_breaker_failure(
                    &service_id,
                    &scope,
                    self.breaker_threshold,
                    self.breaker_cooldown,
                    &kind,
                )
                .await
                .map_err(storage)?;
        }

        let result = self.bundle(
            &service_id,
            tenant_id.as_deref(),
            &region,
            &scope,
            &checked_at,
            status,
            http_status,
            latency_ms,
            dns_ok,
            confidence,
            &notes,
        );
        self.cache.put(&service_id, &region, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedResolver {
        ips: Vec<IpAddr>,
        calls: AtomicUsize,
    }

    impl FixedResolver {
        fn new(ips: Vec<IpAddr>) -> Self {
            Self {
                ips,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<IpAddr>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ips.is_empty() {
                Err("dns_timeout".to_string())
            } else {
                Ok(self.ips.clone())
            }
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::from_value(json!({
            "api": {
                "check": {"type": "http", "url": "https://status.example.com/healthz", "method": "GET"},
                "expected": {"status_min": 200, "status_max": 299},
                "timeout_ms": 1500,
                "retries": 0,
                "scope": "external"
            }
        }))
        .unwrap()
    }

    async fn tool_with(resolver: Arc<dyn Resolver>) -> (ServiceStatusTool, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let config = TriageConfig::default();
        let tool = ServiceStatusTool::new(registry(), store.clone(), resolver, &config).unwrap();
        (tool, store)
    }

    #[tokio::test]
    async fn unknown_service_is_never_probed() {
        let resolver = Arc::new(FixedResolver::new(vec![]));
        let (tool, _store) = tool_with(resolver.clone()).await;
        let err = tool.run(&json!({"service_id": "shadow"})).await.unwrap_err();
        assert!(err.to_string().contains("not allowlisted"));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn private_resolution_blocks_the_probe() {
        let resolver = Arc::new(FixedResolver::new(vec![IpAddr::V4(Ipv4Addr::new(
            10, 0, 0, 5,
        ))]));
        let (tool, _store) = tool_with(resolver.clone()).await;
        let result = tool.run(&json!({"service_id": "api"})).await.unwrap();
        assert_eq!(result["metadata"]["status"], "unknown");
        assert_eq!(result["metadata"]["notes"][0], "blocked_non_public_ip");
        assert_eq!(result["metadata"]["dns_ok"], true);
    }

    #[tokio::test]
    async fn loopback_counts_as_non_public() {
        let resolver = Arc::new(FixedResolver::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let (tool, _store) = tool_with(resolver).await;
        let result = tool.run(&json!({"service_id": "api"})).await.unwrap();
        assert_eq!(result["metadata"]["notes"][0], "blocked_non_public_ip");
    }

    #[tokio::test]
    async fn dns_failure_maps_to_unknown_and_bumps_breaker() {
        let resolver = Arc::new(FixedResolver::new(vec![]));
        let (tool, store) = tool_with(resolver).await;
        let result = tool.run(&json!({"service_id": "api"})).await.unwrap();
        assert_eq!(result["metadata"]["status"], "unknown");
        assert_eq!(result["metadata"]["notes"][0], "dns_timeout");

        let breaker = store.get_breaker("api", "external").await.unwrap().unwrap();
        assert_eq!(breaker.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_dns() {
        let resolver = Arc::new(FixedResolver::new(vec![]));
        let (tool, store) = tool_with(resolver.clone()).await;
        for _ in 0..3 {
            store
                .bump_breaker_failure("api", "external", 3, Duration::from_secs(300), "timeout")
                .await
                .unwrap();
        }
        let result = tool.run(&json!({"service_id": "api"})).await.unwrap();
        assert_eq!(result["metadata"]["status"], "unknown");
        assert_eq!(result["metadata"]["notes"][0], "circuit_open");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn per_service_timeout_bounds_the_probe() {
        // Listener that accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(socket);
                });
            }
        });

        let registry = ServiceRegistry::from_value(json!({
            "slow": {
                "check": {"type": "http", "url": format!("http://{addr}/healthz"), "method": "GET"},
                "expected": {"status_min": 200, "status_max": 299},
                "timeout_ms": 50,
                "retries": 0,
                "scope": "internal"
            }
        }))
        .unwrap();
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let resolver = Arc::new(FixedResolver::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let tool =
            ServiceStatusTool::new(registry, store, resolver, &TriageConfig::default()).unwrap();

        let started = Instant::now();
        let result = tool.run(&json!({"service_id": "slow"})).await.unwrap();
        assert_eq!(result["metadata"]["status"], "unknown");
        assert!(result["metadata"]["http_status"].is_null());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn results_are_cached_within_the_ttl() {
        let resolver = Arc::new(FixedResolver::new(vec![IpAddr::V4(Ipv4Addr::new(
            10, 0, 0, 5,
        ))]));
        let (tool, _store) = tool_with(resolver.clone()).await;
        tool.run(&json!({"service_id": "api"})).await.unwrap();
        tool.run(&json!({"service_id": "api"})).await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }
}
