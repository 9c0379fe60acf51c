//! Integration tests for queue lifecycle semantics: idempotent enqueue,
//! exclusive claims under concurrency, and the retry/dead-letter path
//! through a full worker cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use intake_triage::config::TriageConfig;
use intake_triage::error::ClassifyError;
use intake_triage::evidence::EvidenceRunner;
use intake_triage::queue::{EnqueueRequest, QueueStatus, QueueUpdate};
use intake_triage::store::{LibSqlStore, Store};
use intake_triage::tools::ToolRegistry;
use intake_triage::tools::builtin::{
    DnsEmailAuthCheckSample, FetchAppEventsSample, FetchEmailEventsSample,
    FetchIntegrationEventsSample,
};
use intake_triage::triage::{BundleReportGenerator, Classification, Classifier};
use intake_triage::worker::TriageWorker;

struct FixedClassifier {
    payload: Value,
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(
        &self,
        _text: &str,
        _metadata: &Value,
    ) -> Result<Classification, ClassifyError> {
        intake_triage::triage::classifier::parse_classification(&self.payload)
    }
}

struct FailingClassifier;

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify(
        &self,
        _text: &str,
        _metadata: &Value,
    ) -> Result<Classification, ClassifyError> {
        Err(ClassifyError::RequestFailed("upstream refused".to_string()))
    }
}

async fn memory_store() -> Arc<LibSqlStore> {
    Arc::new(LibSqlStore::new_memory().await.unwrap())
}

fn sample_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new().unwrap();
    registry.register(Arc::new(FetchEmailEventsSample)).unwrap();
    registry.register(Arc::new(DnsEmailAuthCheckSample)).unwrap();
    registry.register(Arc::new(FetchAppEventsSample)).unwrap();
    registry
        .register(Arc::new(FetchIntegrationEventsSample))
        .unwrap();
    Arc::new(registry)
}

fn worker(
    store: Arc<LibSqlStore>,
    classifier: Arc<dyn Classifier>,
    config: TriageConfig,
) -> TriageWorker {
    let registry = sample_registry();
    let runner = Arc::new(EvidenceRunner::new(store.clone(), registry.clone(), &config));
    TriageWorker::new(
        store,
        runner,
        registry,
        classifier,
        Arc::new(BundleReportGenerator),
        config,
        "itest-worker",
    )
}

#[tokio::test]
async fn resubmitting_the_same_message_reuses_the_item() {
    let store = memory_store().await;
    let request = EnqueueRequest {
        text: "our invoices bounce since this morning".to_string(),
        tenant: "acme".to_string(),
        ..Default::default()
    };

    let (first_id, created) = store.enqueue(&request).await.unwrap();
    assert!(created);
    let (second_id, created) = store.enqueue(&request).await.unwrap();
    assert!(!created);
    assert_eq!(first_id, second_id);

    // A different tenant with the same text is separate work.
    let other = EnqueueRequest {
        tenant: "globex".to_string(),
        ..request
    };
    let (third_id, created) = store.enqueue(&other).await.unwrap();
    assert!(created);
    assert_ne!(first_id, third_id);
}

#[tokio::test]
async fn concurrent_claimers_never_share_an_item() {
    let store = memory_store().await;
    for n in 0..12 {
        store
            .enqueue(&EnqueueRequest {
                text: format!("report {n}"),
                tenant: "acme".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(item) = store.claim(&format!("claimer-{w}")).await.unwrap() {
                claimed.push(item.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let distinct: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 12);
    assert_eq!(distinct.len(), 12);
    assert!(store.claim("late").await.unwrap().is_none());
}

#[tokio::test]
async fn full_cycle_produces_a_triaged_item_with_report() {
    let store = memory_store().await;
    let classifier = Arc::new(FixedClassifier {
        payload: json!({
            "case_type": "email_delivery",
            "severity": "high",
            "scope": {"recipient_domains": ["contoso.com"]},
            "symptoms": ["bounces"],
            "draft_reply": {"subject": "Re: bounces", "body": "We are investigating the bounces."}
        }),
    });
    let worker = worker(store.clone(), classifier, TriageConfig::default());

    let (id, _) = store
        .enqueue(&EnqueueRequest {
            text: "mail to billing@contoso.com bounces with 550".to_string(),
            tenant: "acme".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

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

    let report: Value = serde_json::from_str(item.final_report_json.as_deref().unwrap()).unwrap();
    for key in [
        "classification",
        "timeline_summary",
        "customer_update",
        "engineering_escalation",
        "kb_suggestions",
    ] {
        assert!(report.get(key).is_some(), "missing {key}");
    }
    assert_eq!(
        report["customer_update"],
        "We are investigating the bounces."
    );

    // Evidence persisted under the item's case id.
    let records = store
        .list_evidence_for_intake(&item.case_id, 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn repeated_failures_walk_retry_then_dead_letter() {
    let store = memory_store().await;
    let config = TriageConfig {
        max_retries: 1,
        retry_base: Duration::from_secs(5),
        ..TriageConfig::default()
    };
    let worker = worker(store.clone(), Arc::new(FailingClassifier), config);

    let (id, _) = store
        .enqueue(&EnqueueRequest {
            text: "anything".to_string(),
            tenant: "acme".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // First failure requeues with a future available_at.
    worker.process_once().await.unwrap();
    let item = store.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Queued);
    assert_eq!(item.retry_count, 1);
    assert!(item.available_at > Utc::now());
    assert!(store.claim("early").await.unwrap().is_none());

    // Make the item eligible again without waiting out the backoff.
    store
        .update_status(
            id,
            QueueStatus::Queued,
            QueueUpdate {
                available_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Second failure exhausts max_retries = 1.
    worker.process_once().await.unwrap();
    let item = store.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert_eq!(item.retry_count, 2);
    let metadata: Value =
        serde_json::from_str(item.response_metadata.as_deref().unwrap()).unwrap();
    assert_eq!(metadata["dead_letter_reason"], "max_retries");

    // Dead-lettered items stay off the queue.
    assert!(store.claim("after").await.unwrap().is_none());
}
