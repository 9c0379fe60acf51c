//! Built-in evidence tools.

pub mod log_evidence;
pub mod samples;
pub mod service_status;

pub use log_evidence::{JsonlLogSource, LogEvidenceTool, LogSource};
pub use samples::{
    DnsEmailAuthCheckSample, FetchAppEventsSample, FetchEmailEventsSample,
    FetchIntegrationEventsSample,
};
pub use service_status::{Resolver, ServiceRegistry, ServiceStatusTool, SystemResolver};
