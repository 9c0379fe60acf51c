//! Deterministic sample evidence tools.
//!
//! These stand in for provider integrations (email events, DNS auth checks,
//! app events, integration events) with canned data shaped like the real
//! feeds. They are selected by the worker's case-type fallback table when a
//! classification suggests nothing usable.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::tool::EvidenceTool;
use crate::util::to_rfc3339;

fn str_param(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn window(params: &Value, default_span_minutes: i64) -> (String, String) {
    let now = Utc::now();
    let start = str_param(params, "start").unwrap_or_else(|| to_rfc3339(now));
    let end = str_param(params, "end")
        .unwrap_or_else(|| to_rfc3339(now + Duration::minutes(default_span_minutes)));
    (start, end)
}

fn optional_window_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "tenant": {"type": ["string", "null"]},
            "start": {"type": ["string", "null"]},
            "end": {"type": ["string", "null"]},
            "recipient_domain": {"type": ["string", "null"]},
            "workflow_id": {"type": ["string", "null"]},
            "integration_name": {"type": ["string", "null"]}
        }
    })
}

pub struct FetchEmailEventsSample;

#[async_trait]
impl EvidenceTool for FetchEmailEventsSample {
    fn name(&self) -> &'static str {
        "fetch_email_events_sample"
    }

    fn params_schema(&self) -> Value {
        optional_window_schema()
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let tenant = str_param(params, "tenant").unwrap_or_else(|| "sample-tenant".to_string());
        let domain =
            str_param(params, "recipient_domain").unwrap_or_else(|| "contoso.com".to_string());
        let (start, end) = window(params, 20);

        Ok(json!({
            "source": "email_events",
            "time_window": {"start": start, "end": end},
            "tenant": tenant,
            "summary_counts": {"sent": 3, "bounced": 1, "deferred": 0, "delivered": 1},
            "events": [
                {"ts": start, "type": "accepted", "id": "evt-accept-001", "message_id": "msg-001",
                 "detail": format!("Provider accepted message to ops@{domain}")},
                {"ts": start, "type": "bounce", "id": "evt-bounce-001", "message_id": "msg-002",
                 "detail": format!("550 5.1.1 recipient not found invoices@{domain}")},
                {"ts": end, "type": "delivered", "id": "evt-deliv-001", "message_id": "msg-003",
                 "detail": format!("Delivered to accounting@{domain}")},
                {"ts": end, "type": "unknown", "id": "evt-unknown-001", "message_id": null,
                 "detail": "Provider returned nonstandard status"}
            ]
        }))
    }
}

pub struct DnsEmailAuthCheckSample;

#[async_trait]
impl EvidenceTool for DnsEmailAuthCheckSample {
    fn name(&self) -> &'static str {
        "dns_email_auth_check_sample"
    }

    fn params_schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["domain"],
            "properties": {"domain": {"type": "string"}}
        })
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let domain = str_param(params, "domain").unwrap_or_else(|| "example.com".to_string());
        let now = Utc::now();
        let start = to_rfc3339(now);
        let end = to_rfc3339(now + Duration::minutes(5));

        Ok(json!({
            "source": "dns_checks",
            "time_window": {"start": start, "end": end},
            "tenant": null,
            "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
            "metadata": {
                "spf_present": true,
                "dkim_present": true,
                "dmarc_present": true,
                "dmarc_policy": "reject",
                "notes": format!("DMARC policy reject for {domain}")
            },
            "events": [
                {"ts": start, "type": "dns_check", "id": "dns-spf-1", "message_id": null,
                 "detail": format!("SPF present for {domain}")},
                {"ts": start, "type": "dns_check", "id": "dns-dkim-1", "message_id": null,
                 "detail": format!("DKIM present for {domain}")},
                {"ts": start, "type": "dns_check", "id": "dns-dmarc-1", "message_id": null,
                 "detail": format!("DMARC policy reject for {domain}")}
            ]
        }))
    }
}

pub struct FetchAppEventsSample;

#[async_trait]
impl EvidenceTool for FetchAppEventsSample {
    fn name(&self) -> &'static str {
        "fetch_app_events_sample"
    }

    fn params_schema(&self) -> Value {
        optional_window_schema()
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let tenant = str_param(params, "tenant").unwrap_or_else(|| "sample-tenant".to_string());
        let workflow_id = str_param(params, "workflow_id").unwrap_or_else(|| "wf-123".to_string());
        let (start, end) = window(params, 10);

        Ok(json!({
            "source": "app_events",
            "time_window": {"start": start, "end": end},
            "tenant": tenant,
            "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
            "events": [
                {"ts": start, "type": "workflow_triggered", "id": "app-001", "message_id": null,
                 "detail": format!("Workflow {workflow_id} triggered")},
                {"ts": end, "type": "workflow_disabled", "id": "app-002", "message_id": null,
                 "detail": format!("Workflow {workflow_id} disabled by config change")},
                {"ts": end, "type": "deployment_completed", "id": "app-003", "message_id": null,
                 "detail": format!("Deployment completed for {workflow_id}")}
            ]
        }))
    }
}

pub struct FetchIntegrationEventsSample;

#[async_trait]
impl EvidenceTool for FetchIntegrationEventsSample {
    fn name(&self) -> &'static str {
        "fetch_integration_events_sample"
    }

    fn params_schema(&self) -> Value {
        optional_window_schema()
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let tenant = str_param(params, "tenant").unwrap_or_else(|| "sample-tenant".to_string());
        let integration =
            str_param(params, "integration_name").unwrap_or_else(|| "ats".to_string());
        let (start, end) = window(params, 15);

        Ok(json!({
            "source": "integration_events",
            "time_window": {"start": start, "end": end},
            "tenant": tenant,
            "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
            "events": [
                {"ts": start, "type": "auth_failed", "id": "int-001", "message_id": null,
                 "detail": format!("Auth failed for {integration} token expired")},
                {"ts": start, "type": "rate_limited", "id": "int-002", "message_id": null,
                 "detail": format!("{integration} returned 429")},
                {"ts": end, "type": "webhook_delivery_failed", "id": "int-003", "message_id": null,
                 "detail": format!("{integration} webhook failed")}
            ]
        }))
    }
}
