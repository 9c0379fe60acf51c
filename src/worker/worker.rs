//! Triage worker: the queue-driven state machine.
//!
//! `queued -> processing -> {triaged | dead_letter | queued(retry)}`.
//! A classification schema failure dead-letters immediately; any other
//! failure after claim retries with capped exponential backoff until
//! `retry_count` exceeds the configured maximum. A single tool's failure
//! never fails the item, it only degrades the evidence set.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::TriageConfig;
use crate::error::{ClassifyError, Error};
use crate::evidence::{EvidenceRunner, RedactionLevel, redaction::redact};
use crate::queue::{QueueItem, QueueStatus, QueueUpdate, compute_idempotency_key};
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::triage::{Classification, Classifier, ReportGenerator};
use crate::util::to_rfc3339;
use crate::worker::time_window::{QueryWindow, derive_query_window};

struct TriagedArtifacts {
    redacted_payload: String,
    classification_json: String,
    evidence_sources_run: Vec<String>,
    final_report_json: String,
    response_metadata: String,
}

pub struct TriageWorker {
    store: Arc<dyn Store>,
    runner: Arc<EvidenceRunner>,
    registry: Arc<ToolRegistry>,
    classifier: Arc<dyn Classifier>,
    reporter: Arc<dyn ReportGenerator>,
    config: TriageConfig,
    processor_id: String,
}

impl TriageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<EvidenceRunner>,
        registry: Arc<ToolRegistry>,
        classifier: Arc<dyn Classifier>,
        reporter: Arc<dyn ReportGenerator>,
        config: TriageConfig,
        processor_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runner,
            registry,
            classifier,
            reporter,
            config,
            processor_id: processor_id.into(),
        }
    }

    /// Poll loop. Sleeps for the configured interval when the queue is
    /// empty; worker-level errors are logged and polling continues.
    pub async fn run(&self) {
        info!(processor_id = %self.processor_id, "worker started");
        loop {
            match self.process_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(processor_id = %self.processor_id, error = %e, "worker cycle failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Claim and process one item. Returns `Ok(false)` when the queue has
    /// no eligible work. Storage faults propagate; item-level failures are
    /// absorbed into the retry/dead-letter policy.
    pub async fn process_once(&self) -> Result<bool, Error> {
        let Some(item) = self.store.claim(&self.processor_id).await? else {
            return Ok(false);
        };
        info!(item = item.id, case_id = %item.case_id, "claimed item");

        match self.triage_item(&item).await {
            Ok(artifacts) => {
                self.store
                    .update_status(
                        item.id,
                        QueueStatus::Triaged,
                        QueueUpdate {
                            redacted_payload: Some(artifacts.redacted_payload),
                            classification_json: Some(artifacts.classification_json),
                            evidence_sources_run: Some(artifacts.evidence_sources_run),
                            final_report_json: Some(artifacts.final_report_json),
                            response_metadata: Some(artifacts.response_metadata),
                            finished_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(item = item.id, "item triaged");
            }
            Err(e) => self.handle_failure(&item, e).await?,
        }
        Ok(true)
    }

    async fn triage_item(&self, item: &QueueItem) -> Result<TriagedArtifacts, Error> {
        if item.idempotency_key.is_none() {
            let key = compute_idempotency_key(&item.tenant, &item.payload, item.created_at);
            self.store
                .update_status(
                    item.id,
                    QueueStatus::Processing,
                    QueueUpdate {
                        idempotency_key: Some(key),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let redacted_payload = redact(&item.payload);
        let metadata = json!({
            "tenant": item.tenant,
            "case_id": item.case_id,
            "created_at": to_rfc3339(item.created_at),
        });
        let classification = self.classifier.classify(&redacted_payload, &metadata).await?;
        let window = derive_query_window(classification.time_window.as_ref(), Utc::now());

        // Tools run concurrently; join_all keeps selection order in the
        // recorded sources and bundles.
        let runs = self
            .select_tools(&classification)
            .into_iter()
            .map(|(tool_name, params)| {
                let params = self.enrich_params(&tool_name, params, item, &window);
                async move {
                    let outcome = self
                        .runner
                        .run_with_evidence(
                            &item.case_id,
                            &tool_name,
                            &params,
                            RedactionLevel::Internal,
                            true,
                        )
                        .await;
                    (tool_name, outcome)
                }
            });

        let mut evidence_sources_run: Vec<String> = Vec::new();
        let mut evidence_bundles: Vec<Value> = Vec::new();
        for (tool_name, outcome) in join_all(runs).await {
            match outcome {
                Ok((record, mut bundle)) => {
                    if let Some(meta) = bundle
                        .as_object_mut()
                        .map(|o| o.entry("metadata").or_insert_with(|| json!({})))
                        .and_then(Value::as_object_mut)
                    {
                        meta.insert("tool_name".to_string(), json!(tool_name.as_str()));
                        meta.insert("evidence_id".to_string(), json!(record.evidence_id));
                        meta.insert("cache_hit".to_string(), json!(record.cache_hit));
                        meta.insert("query_window_reason".to_string(), json!(window.reason));
                    }
                    evidence_bundles.push(bundle);
                    evidence_sources_run.push(tool_name);
                }
                Err(e) => {
                    warn!(item = item.id, tool = %tool_name, error = %e, "evidence tool failed");
                    evidence_sources_run.push(format!("{tool_name}:error:{e}"));
                }
            }
        }

        let report = self
            .reporter
            .generate(&classification, &evidence_bundles)
            .await?;

        let classification_json = serde_json::to_string(&classification)
            .map_err(|e| crate::error::StorageError::Serialization(e.to_string()))?;
        let response_metadata = json!({
            "evidence_count": evidence_bundles.len(),
            "query_window": {
                "start": to_rfc3339(window.start),
                "end": to_rfc3339(window.end),
                "reason": window.reason,
            },
        });

        Ok(TriagedArtifacts {
            redacted_payload,
            classification_json,
            evidence_sources_run,
            final_report_json: report.to_string(),
            response_metadata: response_metadata.to_string(),
        })
    }

    /// Suggested tools win when any survive the allowlist filter; the
    /// static case-type table only fills an empty selection. An empty
    /// result is valid: no evidence gathered.
    fn select_tools(&self, classification: &Classification) -> Vec<(String, Value)> {
        let suggested: Vec<(String, Value)> = classification
            .suggested_tools
            .iter()
            .filter(|s| self.registry.contains(&s.tool_name))
            .map(|s| {
                let params = if s.params.is_object() {
                    s.params.clone()
                } else {
                    json!({})
                };
                (s.tool_name.clone(), params)
            })
            .collect();
        if !suggested.is_empty() {
            return suggested;
        }

        let primary_domain = classification.scope.recipient_domains.first().cloned();
        let mut fallback: Vec<(String, Value)> = Vec::new();
        match classification.case_type.as_str() {
            "email_delivery" => {
                fallback.push((
                    "fetch_email_events_sample".to_string(),
                    json!({"recipient_domain": primary_domain.clone()}),
                ));
                if let Some(domain) = primary_domain {
                    fallback.push((
                        "dns_email_auth_check_sample".to_string(),
                        json!({"domain": domain}),
                    ));
                }
            }
            "integration" => fallback.push((
                "fetch_integration_events_sample".to_string(),
                json!({"integration_name": "ats"}),
            )),
            "auth_access" | "ui_bug" => {
                fallback.push(("fetch_app_events_sample".to_string(), json!({})))
            }
            _ => {}
        }
        fallback.retain(|(name, _)| self.registry.contains(name));
        fallback
    }

    /// Fill in the derived query window and tenant defaults the tools
    /// expect but the classifier does not supply.
    fn enrich_params(
        &self,
        tool_name: &str,
        mut params: Value,
        item: &QueueItem,
        window: &QueryWindow,
    ) -> Value {
        let Some(obj) = params.as_object_mut() else {
            return params;
        };
        if tool_name == "log_evidence" {
            obj.insert(
                "time_window".to_string(),
                json!({
                    "start": to_rfc3339(window.start),
                    "end": to_rfc3339(window.end),
                }),
            );
            obj.entry("tenant").or_insert_with(|| json!(item.tenant));
            obj.entry("service").or_insert_with(|| json!("api"));
            obj.entry("query_type").or_insert_with(|| json!("errors"));
            obj.remove("start");
            obj.remove("end");
        } else if tool_name.starts_with("fetch_") {
            obj.entry("start")
                .or_insert_with(|| json!(to_rfc3339(window.start)));
            obj.entry("end")
                .or_insert_with(|| json!(to_rfc3339(window.end)));
        }
        params
    }

    async fn handle_failure(&self, item: &QueueItem, error: Error) -> Result<(), Error> {
        if let Error::Classify(ClassifyError::SchemaInvalid(_)) = &error {
            warn!(item = item.id, error = %error, "classification schema invalid, dead-lettering");
            self.store
                .update_status(
                    item.id,
                    QueueStatus::DeadLetter,
                    QueueUpdate {
                        retry_count: Some(item.retry_count + 1),
                        finished_at: Some(Utc::now()),
                        response_metadata: Some(
                            json!({
                                "error": error.to_string(),
                                "dead_letter_reason": "schema_validation",
                            })
                            .to_string(),
                        ),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let next_retry = item.retry_count + 1;
        if next_retry > self.config.max_retries {
            warn!(item = item.id, error = %error, "retries exhausted, dead-lettering");
            self.store
                .update_status(
                    item.id,
                    QueueStatus::DeadLetter,
                    QueueUpdate {
                        retry_count: Some(next_retry),
                        finished_at: Some(Utc::now()),
                        response_metadata: Some(
                            json!({
                                "error": error.to_string(),
                                "dead_letter_reason": "max_retries",
                            })
                            .to_string(),
                        ),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let delay = self.config.backoff_delay(item.retry_count);
        let available_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
        warn!(
            item = item.id,
            error = %error,
            retry = next_retry,
            delay_secs = delay.as_secs(),
            "requeueing after failure"
        );
        self.store
            .update_status(
                item.id,
                QueueStatus::Queued,
                QueueUpdate {
                    retry_count: Some(next_retry),
                    available_at: Some(available_at),
                    response_metadata: Some(
                        json!({
                            "error": error.to_string(),
                            "next_action": "retry",
                            "retry_in_seconds": delay.as_secs(),
                        })
                        .to_string(),
                    ),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReportError, ToolError};
    use crate::queue::EnqueueRequest;
    use crate::store::LibSqlStore;
    use crate::tools::builtin::{
        DnsEmailAuthCheckSample, FetchAppEventsSample, FetchEmailEventsSample,
        FetchIntegrationEventsSample,
    };
    use crate::tools::tool::EvidenceTool;
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Script {
        Classify(Value),
        SchemaInvalid,
        Transient,
    }

    struct ScriptedClassifier {
        script: Mutex<Vec<Script>>,
    }

    impl ScriptedClassifier {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            _text: &str,
            _metadata: &Value,
        ) -> Result<Classification, ClassifyError> {
            let step = self.script.lock().unwrap().pop();
            match step {
                Some(Script::Classify(payload)) => {
                    crate::triage::classifier::parse_classification(&payload)
                }
                Some(Script::SchemaInvalid) => Err(ClassifyError::SchemaInvalid(
                    "case_type missing".to_string(),
                )),
                Some(Script::Transient) | None => Err(ClassifyError::RequestFailed(
                    "connection refused".to_string(),
                )),
            }
        }
    }

    struct StubReporter;

    #[async_trait]
    impl ReportGenerator for StubReporter {
        async fn generate(
            &self,
            _classification: &Classification,
            bundles: &[Value],
        ) -> Result<Value, ReportError> {
            Ok(json!({"bundle_count": bundles.len()}))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl EvidenceTool for BrokenTool {
        fn name(&self) -> &'static str {
            "broken_tool"
        }

        fn params_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn run(&self, _params: &Value) -> Result<Value, ToolError> {
            Err(ToolError::Execution {
                name: "broken_tool".to_string(),
                reason: "boom".to_string(),
            })
        }
    }

    fn full_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new().unwrap();
        registry.register(Arc::new(FetchEmailEventsSample)).unwrap();
        registry.register(Arc::new(DnsEmailAuthCheckSample)).unwrap();
        registry.register(Arc::new(FetchAppEventsSample)).unwrap();
        registry
            .register(Arc::new(FetchIntegrationEventsSample))
            .unwrap();
        registry.register(Arc::new(BrokenTool)).unwrap();
        registry
    }

    async fn worker_with(
        script: Vec<Script>,
        config: TriageConfig,
    ) -> (TriageWorker, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let registry = Arc::new(full_registry());
        let runner = Arc::new(EvidenceRunner::new(
            store.clone(),
            registry.clone(),
            &config,
        ));
        let worker = TriageWorker::new(
            store.clone(),
            runner,
            registry,
            Arc::new(ScriptedClassifier::new(script)),
            Arc::new(StubReporter),
            config,
            "w-test",
        );
        (worker, store)
    }

    async fn enqueue(store: &LibSqlStore, text: &str) -> i64 {
        let (id, _) = store
            .enqueue(&EnqueueRequest {
                text: text.to_string(),
                tenant: "acme".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        id
    }

    fn email_classification() -> Value {
        json!({
            "case_type": "email_delivery",
            "scope": {"recipient_domains": ["contoso.com"]},
            "symptoms": ["bounces"]
        })
    }

    #[tokio::test]
    async fn empty_queue_reports_no_work() {
        let (worker, _store) = worker_with(vec![], TriageConfig::default()).await;
        assert!(!worker.process_once().await.unwrap());
    }

    #[tokio::test]
    async fn successful_triage_runs_fallback_tools() {
        let (worker, store) = worker_with(
            vec![Script::Classify(email_classification())],
            TriageConfig::default(),
        )
        .await;
        let id = enqueue(&store, "mail to billing@contoso.com bounces").await;

        assert!(worker.process_once().await.unwrap());
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Triaged);
        assert_eq!(
            item.evidence_sources_run,
            vec![
                "fetch_email_events_sample".to_string(),
                "dns_email_auth_check_sample".to_string()
            ]
        );
        assert!(item.final_report_json.is_some());
        assert!(item.finished_at.is_some());
        assert!(item.idempotency_key.is_some());
        // classifier input is redacted
        assert!(!item.redacted_payload.unwrap().contains("billing@contoso.com"));
    }

    #[tokio::test]
    async fn suggested_tools_win_over_the_fallback_table() {
        let classification = json!({
            "case_type": "email_delivery",
            "suggested_tools": [
                {"tool_name": "fetch_app_events_sample", "params": {}},
                {"tool_name": "not_registered", "params": {}}
            ]
        });
        let (worker, store) = worker_with(
            vec![Script::Classify(classification)],
            TriageConfig::default(),
        )
        .await;
        let id = enqueue(&store, "app is weird").await;

        worker.process_once().await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(
            item.evidence_sources_run,
            vec!["fetch_app_events_sample".to_string()]
        );
    }

    #[tokio::test]
    async fn tool_failure_records_a_marker_but_item_still_triages() {
        let classification = json!({
            "case_type": "other",
            "suggested_tools": [
                {"tool_name": "broken_tool", "params": {}},
                {"tool_name": "fetch_app_events_sample", "params": {}}
            ]
        });
        let (worker, store) = worker_with(
            vec![Script::Classify(classification)],
            TriageConfig::default(),
        )
        .await;
        let id = enqueue(&store, "something broke").await;

        worker.process_once().await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Triaged);
        assert_eq!(item.evidence_sources_run.len(), 2);
        assert!(item.evidence_sources_run[0].starts_with("broken_tool:error:"));
        assert_eq!(item.evidence_sources_run[1], "fetch_app_events_sample");
    }

    #[tokio::test]
    async fn schema_invalid_classification_dead_letters_immediately() {
        let (worker, store) =
            worker_with(vec![Script::SchemaInvalid], TriageConfig::default()).await;
        let id = enqueue(&store, "garbled").await;

        worker.process_once().await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::DeadLetter);
        assert!(
            item.response_metadata
                .unwrap()
                .contains("schema_validation")
        );
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let (worker, store) =
            worker_with(vec![Script::Transient], TriageConfig::default()).await;
        let id = enqueue(&store, "flaky upstream").await;

        let before = Utc::now();
        worker.process_once().await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.retry_count, 1);
        assert!(item.available_at > before);
        // not claimable until the delay elapses
        assert!(store.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_max_retries_dead_letters_on_first_failure() {
        let config = TriageConfig {
            max_retries: 0,
            ..TriageConfig::default()
        };
        let (worker, store) = worker_with(vec![Script::Transient], config).await;
        let id = enqueue(&store, "poison").await;

        worker.process_once().await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::DeadLetter);
        assert_eq!(item.retry_count, 1);
        assert!(item.response_metadata.unwrap().contains("max_retries"));
    }
}
