//! Incident detection over a bounded log source.
//!
//! Deterministic: given the same entries and window, the decision and the
//! reported incident window are identical. The reported window is tightened
//! to the matching entries' actual span (clipped to the caller's hint) so
//! the evidence is auditable rather than a rubber stamp of the caller's
//! guess.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::evidence::redaction::redact_detail;
use crate::tools::tool::EvidenceTool;
use crate::util::{parse_datetime, to_rfc3339};

/// Matching entries at or above this count flag an observed incident.
pub const INCIDENT_THRESHOLD: usize = 3;
const MAX_EVENTS: usize = 50;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub service: String,
    pub level: String,
    pub event_type: String,
    pub status_code: i64,
    pub message: String,
}

#[derive(Deserialize)]
struct RawLogEntry {
    ts: String,
    service: String,
    level: String,
    event_type: String,
    /// Absent or null for non-HTTP entries (background jobs).
    #[serde(default)]
    status_code: Option<i64>,
    message: String,
}

/// Source of log entries for a service within a window.
pub trait LogSource: Send + Sync {
    fn query(&self, service: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<LogEntry>;
}

/// Log source backed by a JSONL fixture file, one entry per line.
pub struct JsonlLogSource {
    entries: Vec<LogEntry>,
}

impl JsonlLogSource {
    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        let text = std::fs::read_to_string(path).map_err(|e| ToolError::Execution {
            name: "log_evidence".to_string(),
            reason: format!("failed to read log fixture {}: {e}", path.display()),
        })?;
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let raw: RawLogEntry =
                serde_json::from_str(line).map_err(|e| ToolError::Execution {
                    name: "log_evidence".to_string(),
                    reason: format!("malformed log fixture line: {e}"),
                })?;
            entries.push(LogEntry {
                ts: parse_datetime(&raw.ts),
                service: raw.service,
                level: raw.level,
                event_type: raw.event_type,
                status_code: raw.status_code.unwrap_or(0),
                message: raw.message,
            });
        }
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}

impl LogSource for JsonlLogSource {
    fn query(&self, service: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.service == service && e.ts >= start && e.ts <= end)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryType {
    Errors,
    Timeouts,
    Availability,
}

impl QueryType {
    fn parse(s: &str) -> Self {
        match s {
            "timeouts" => QueryType::Timeouts,
            "availability" => QueryType::Availability,
            _ => QueryType::Errors,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            QueryType::Errors => "errors",
            QueryType::Timeouts => "timeouts",
            QueryType::Availability => "availability",
        }
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            QueryType::Errors => entry.status_code >= 500,
            QueryType::Timeouts => {
                entry.status_code == 504 || entry.event_type.to_lowercase().contains("timeout")
            }
            QueryType::Availability => {
                entry.status_code >= 500
                    || entry.message.to_lowercase().contains("unavailable")
                    || entry.event_type.to_lowercase().contains("service_down")
            }
        }
    }
}

struct Counts {
    errors: usize,
    timeouts: usize,
    availability_gaps: usize,
    total: usize,
}

fn count_events(entries: &[LogEntry]) -> Counts {
    Counts {
        errors: entries
            .iter()
            .filter(|e| QueryType::Errors.matches(e))
            .count(),
        timeouts: entries
            .iter()
            .filter(|e| QueryType::Timeouts.matches(e))
            .count(),
        availability_gaps: entries
            .iter()
            .filter(|e| QueryType::Availability.matches(e))
            .count(),
        total: entries.len(),
    }
}

impl Counts {
    fn metric(&self, query_type: QueryType) -> usize {
        match query_type {
            QueryType::Errors => self.errors,
            QueryType::Timeouts => self.timeouts,
            QueryType::Availability => self.availability_gaps,
        }
    }
}

pub struct LogEvidenceTool {
    source: Arc<dyn LogSource>,
}

impl LogEvidenceTool {
    pub fn new(source: Arc<dyn LogSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl EvidenceTool for LogEvidenceTool {
    fn name(&self) -> &'static str {
        "log_evidence"
    }

    fn params_schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["time_window", "query_type"],
            "properties": {
                "service": {"type": ["string", "null"]},
                "tenant": {"type": ["string", "null"]},
                "reason": {"type": ["string", "null"]},
                "query_type": {"type": "string", "enum": ["errors", "timeouts", "availability"]},
                "time_window": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["start", "end"],
                    "properties": {
                        "start": {"type": "string"},
                        "end": {"type": "string"}
                    }
                },
                "incident_window": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "start": {"type": ["string", "null"]},
                        "end": {"type": ["string", "null"]}
                    }
                }
            }
        })
    }

    async fn run(&self, params: &Value) -> Result<Value, ToolError> {
        let service = params
            .get("service")
            .and_then(Value::as_str)
            .or_else(|| params.get("tenant").and_then(Value::as_str))
            .unwrap_or("api")
            .to_string();
        let tenant = params.get("tenant").and_then(Value::as_str);
        let query_type = QueryType::parse(
            params
                .get("query_type")
                .and_then(Value::as_str)
                .unwrap_or("errors"),
        );
        let window = params
            .get("time_window")
            .ok_or_else(|| ToolError::Execution {
                name: "log_evidence".to_string(),
                reason: "missing time_window".to_string(),
            })?;
        let start_str = window
            .get("start")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let end_str = window
            .get("end")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let start = parse_datetime(&start_str);
        let end = parse_datetime(&end_str);

        // Incident-window hint narrows where matches count, clipped to the
        // broad window.
        let hint_start = params
            .get("incident_window")
            .and_then(|w| w.get("start"))
            .and_then(Value::as_str)
            .map(parse_datetime)
            .map(|dt| dt.max(start))
            .unwrap_or(start);
        let hint_end = params
            .get("incident_window")
            .and_then(|w| w.get("end"))
            .and_then(Value::as_str)
            .map(parse_datetime)
            .map(|dt| dt.min(end))
            .unwrap_or(end);

        let entries = self.source.query(&service, start, end);
        let hinted: Vec<LogEntry> = entries
            .iter()
            .filter(|e| e.ts >= hint_start && e.ts <= hint_end)
            .cloned()
            .collect();
        let counts = count_events(&hinted);
        let metric_count = counts.metric(query_type);
        let observed_incident = metric_count >= INCIDENT_THRESHOLD;

        let matching: Vec<&LogEntry> =
            hinted.iter().filter(|e| query_type.matches(e)).collect();
        let incident_window = if observed_incident && !matching.is_empty() {
            let first = matching.iter().map(|e| e.ts).min().unwrap_or(hint_start);
            let last = matching.iter().map(|e| e.ts).max().unwrap_or(hint_end);
            Some((to_rfc3339(first), to_rfc3339(last)))
        } else {
            None
        };

        let decision = if observed_incident {
            "corroborated"
        } else if metric_count > 0 {
            "inconclusive"
        } else {
            "not_observed"
        };
        let confidence = if observed_incident {
            (0.5 + metric_count as f64 / 10.0).min(1.0)
        } else {
            0.2
        };

        let qt = query_type.as_str();
        let mut detail_parts: Vec<String> = Vec::new();
        if entries.is_empty() {
            detail_parts.push(format!(
                "No entries found for {service} in window; absence of evidence is not proof of absence"
            ));
        } else if observed_incident {
            match &incident_window {
                Some((ws, we)) => detail_parts.push(format!(
                    "{qt} signals for {service} between {ws} and {we} ({metric_count} events)"
                )),
                None => detail_parts.push(format!(
                    "{qt} signals for {service} detected ({metric_count} events)"
                )),
            }
        } else {
            detail_parts.push(format!("No {qt} anomalies observed for {service} in window"));
        }
        detail_parts.push(format!(
            "errors={}, timeouts={}, availability_gaps={}, total={}",
            counts.errors, counts.timeouts, counts.availability_gaps, counts.total
        ));
        for sample in matching.iter().take(3) {
            detail_parts.push(redact_detail(&sample.message));
        }
        let detail = redact_detail(&detail_parts.join("; "));

        let event_ts = incident_window
            .as_ref()
            .map(|(ws, _)| ws.clone())
            .unwrap_or_else(|| to_rfc3339(Utc::now()));
        let events: Vec<Value> = vec![json!({
            "ts": event_ts,
            "type": format!("{qt}_summary"),
            "id": "log-1",
            "message_id": null,
            "detail": detail,
        })]
        .into_iter()
        .take(MAX_EVENTS)
        .collect();

        let incident_window_json = match &incident_window {
            Some((ws, we)) => json!({"start": ws, "end": we}),
            None => json!({"start": start_str, "end": end_str}),
        };

        Ok(json!({
            "source": "logs",
            "evidence_type": "logs",
            "time_window": {"start": start_str, "end": end_str},
            "incident_window": incident_window_json,
            "tenant": tenant,
            "observed_incident": observed_incident,
            "decision": decision,
            "confidence": confidence,
            "summary_counts": {
                "sent": 0,
                "bounced": 0,
                "deferred": 0,
                "delivered": 0,
                "errors": counts.errors,
                "timeouts": counts.timeouts,
                "availability_gaps": counts.availability_gaps,
                "total_events": counts.total
            },
            "metadata": {
                "query_type": qt,
                "log_entry_count": entries.len()
            },
            "events": events
        }))
    }
}
