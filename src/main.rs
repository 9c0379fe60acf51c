use std::path::Path;
use std::sync::Arc;

use intake_triage::api::{ApiState, api_routes};
use intake_triage::config::TriageConfig;
use intake_triage::evidence::EvidenceRunner;
use intake_triage::store::{LibSqlStore, Store};
use intake_triage::tools::ToolRegistry;
use intake_triage::tools::builtin::{
    DnsEmailAuthCheckSample, FetchAppEventsSample, FetchEmailEventsSample,
    FetchIntegrationEventsSample, JsonlLogSource, LogEvidenceTool, ServiceRegistry,
    ServiceStatusTool, SystemResolver,
};
use intake_triage::triage::{BundleReportGenerator, HttpClassifier};
use intake_triage::worker::TriageWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    // Guard must outlive main so buffered log lines are flushed.
    let _log_guard = match std::env::var("TRIAGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "intake-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = Arc::new(TriageConfig::from_env()?);

    let api_key = std::env::var("TRIAGE_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: TRIAGE_API_KEY not set");
        eprintln!("  export TRIAGE_API_KEY=...");
        std::process::exit(1);
    });
    let admin_key = std::env::var("TRIAGE_ADMIN_KEY").ok();

    let classify_endpoint = std::env::var("TRIAGE_CLASSIFY_ENDPOINT")
        .unwrap_or_else(|_| "http://127.0.0.1:8089/classify".to_string());
    let http_port: u16 = std::env::var("TRIAGE_HTTP_PORT")
        .unwrap_or_else(|_| "8088".to_string())
        .parse()
        .unwrap_or(8088);
    let worker_count: usize = std::env::var("TRIAGE_WORKERS")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .unwrap_or(2);

    eprintln!("intake-triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{http_port}");
    eprintln!("   Classifier: {classify_endpoint}");
    eprintln!("   Workers: {worker_count}");

    // ── Database ─────────────────────────────────────────────────────
    let db_path =
        std::env::var("TRIAGE_DB_PATH").unwrap_or_else(|_| "./data/intake-triage.db".to_string());
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(Path::new(&db_path)).await?);
    eprintln!("   Database: {db_path}");

    // ── Tool registry ────────────────────────────────────────────────
    let services_path = std::env::var("TRIAGE_SERVICES_PATH")
        .unwrap_or_else(|_| "./config/services_registry.json".to_string());
    let logs_path = std::env::var("TRIAGE_LOGS_PATH")
        .unwrap_or_else(|_| "./fixtures/fake_logs.jsonl".to_string());

    let service_registry = ServiceRegistry::from_path(Path::new(&services_path))?;
    let log_source = Arc::new(JsonlLogSource::from_path(Path::new(&logs_path))?);

    let mut registry = ToolRegistry::new()?;
    registry.register(Arc::new(FetchEmailEventsSample))?;
    registry.register(Arc::new(DnsEmailAuthCheckSample))?;
    registry.register(Arc::new(FetchAppEventsSample))?;
    registry.register(Arc::new(FetchIntegrationEventsSample))?;
    registry.register(Arc::new(LogEvidenceTool::new(log_source)))?;
    registry.register(Arc::new(ServiceStatusTool::new(
        service_registry,
        store.clone(),
        Arc::new(SystemResolver::new(config.dns_timeout)),
        &config,
    )?))?;
    let registry = Arc::new(registry);
    eprintln!("   Tools: {}", registry.names().join(", "));

    // ── Collaborators ────────────────────────────────────────────────
    let runner = Arc::new(EvidenceRunner::new(store.clone(), registry.clone(), &config));
    let classifier = Arc::new(HttpClassifier::new(
        classify_endpoint,
        config.classify_timeout,
    )?);
    let reporter = Arc::new(BundleReportGenerator);

    // ── Workers ──────────────────────────────────────────────────────
    for n in 0..worker_count {
        let worker = TriageWorker::new(
            store.clone(),
            runner.clone(),
            registry.clone(),
            classifier.clone(),
            reporter.clone(),
            (*config).clone(),
            format!("worker-{n}"),
        );
        tokio::spawn(async move { worker.run().await });
    }

    // ── HTTP API ─────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        store,
        runner,
        config,
        api_key: secrecy::SecretString::from(api_key),
        admin_key: admin_key.map(secrecy::SecretString::from),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port)).await?;
    tracing::info!(port = http_port, "HTTP API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
