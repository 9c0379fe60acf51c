//! Report collaborator: assemble the final triage report.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ReportError;
use crate::triage::classifier::Classification;

const MAX_TIMELINE_EVENTS: usize = 25;

/// Produce the final report from a classification and evidence bundles.
/// The top-level shape is fixed: `classification`, `timeline_summary`,
/// `customer_update`, `engineering_escalation`, `kb_suggestions`.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        classification: &Classification,
        evidence_bundles: &[Value],
    ) -> Result<Value, ReportError>;
}

/// Deterministic report assembly from the gathered bundles; no generative
/// text.
pub struct BundleReportGenerator;

impl BundleReportGenerator {
    fn timeline(evidence_bundles: &[Value]) -> Vec<Value> {
        let mut events: Vec<Value> = evidence_bundles
            .iter()
            .flat_map(|bundle| {
                let source = bundle
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                bundle
                    .get("events")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |event| {
                        json!({
                            "ts": event.get("ts").cloned().unwrap_or(Value::Null),
                            "source": source,
                            "type": event.get("type").cloned().unwrap_or(Value::Null),
                            "detail": event.get("detail").cloned().unwrap_or(Value::Null)
                        })
                    })
            })
            .collect();
        events.sort_by(|a, b| {
            let ta = a.get("ts").and_then(Value::as_str).unwrap_or_default();
            let tb = b.get("ts").and_then(Value::as_str).unwrap_or_default();
            ta.cmp(tb)
        });
        events.truncate(MAX_TIMELINE_EVENTS);
        events
    }

    fn summed(field: &str, evidence_bundles: &[Value]) -> i64 {
        evidence_bundles
            .iter()
            .filter_map(|b| b.get("summary_counts"))
            .filter_map(|c| c.get(field))
            .filter_map(Value::as_i64)
            .sum()
    }
}

#[async_trait]
impl ReportGenerator for BundleReportGenerator {
    async fn generate(
        &self,
        classification: &Classification,
        evidence_bundles: &[Value],
    ) -> Result<Value, ReportError> {
        let classification_json = serde_json::to_value(classification)
            .map_err(|e| ReportError::Failed(e.to_string()))?;

        let customer_update = classification
            .draft_reply
            .as_ref()
            .map(|draft| draft.body.clone())
            .filter(|body| !body.trim().is_empty())
            .unwrap_or_else(|| {
                "Thanks for reaching out. We are reviewing the evidence gathered for your \
                 report and will follow up with findings."
                    .to_string()
            });

        let sources: Vec<&str> = evidence_bundles
            .iter()
            .filter_map(|b| b.get("source").and_then(Value::as_str))
            .collect();

        Ok(json!({
            "classification": classification_json,
            "timeline_summary": Self::timeline(evidence_bundles),
            "customer_update": customer_update,
            "engineering_escalation": {
                "case_type": classification.case_type,
                "severity": classification.severity,
                "symptoms": classification.symptoms,
                "evidence_sources": sources,
                "summary_counts": {
                    "sent": Self::summed("sent", evidence_bundles),
                    "bounced": Self::summed("bounced", evidence_bundles),
                    "deferred": Self::summed("deferred", evidence_bundles),
                    "delivered": Self::summed("delivered", evidence_bundles)
                }
            },
            "kb_suggestions": []
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification() -> Classification {
        serde_json::from_value(json!({
            "case_type": "email_delivery",
            "severity": "high",
            "symptoms": ["bounces"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn report_has_the_fixed_shape() {
        let bundles = vec![json!({
            "source": "email_events",
            "time_window": {"start": "2025-05-01T10:00:00Z", "end": "2025-05-01T11:00:00Z"},
            "summary_counts": {"sent": 3, "bounced": 1, "deferred": 0, "delivered": 1},
            "events": [
                {"ts": "2025-05-01T10:30:00Z", "type": "bounce", "id": "e1", "detail": "550"},
                {"ts": "2025-05-01T10:10:00Z", "type": "accepted", "id": "e2", "detail": "ok"}
            ]
        })];
        let report = BundleReportGenerator
            .generate(&classification(), &bundles)
            .await
            .unwrap();

        for key in [
            "classification",
            "timeline_summary",
            "customer_update",
            "engineering_escalation",
            "kb_suggestions",
        ] {
            assert!(report.get(key).is_some(), "missing {key}");
        }
        // timeline sorted by timestamp
        let timeline = report["timeline_summary"].as_array().unwrap();
        assert_eq!(timeline[0]["type"], "accepted");
        assert_eq!(timeline[1]["type"], "bounce");
        assert_eq!(report["engineering_escalation"]["summary_counts"]["bounced"], 1);
    }

    #[tokio::test]
    async fn empty_draft_falls_back_to_stock_update() {
        let report = BundleReportGenerator
            .generate(&classification(), &[])
            .await
            .unwrap();
        assert!(
            report["customer_update"]
                .as_str()
                .unwrap()
                .contains("reviewing the evidence")
        );
    }
}
