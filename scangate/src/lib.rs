pub mod adapter;
pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod orchestrator;
pub mod output;
pub mod packager;
pub mod report;
pub mod summary;
pub mod token;
pub mod vendors;

pub use adapter::{
    Project, ProjectId, ReportFormat, ScanHandle, ScanStatus, SeverityStatistics, VendorAdapter,
};
pub use config::{EngineConfig, Vendor};
pub use error::{Result, ScanError};
pub use gate::{GatePolicy, GateVerdict, evaluate};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, PollPolicy, RunOutcome, RunState, ScanRequest,
};
pub use packager::PackagingMode;
pub use report::{ProjectReport, ReportFetcher, ReportOutcome, ReportWindow};
pub use summary::{LogNotifier, Notifier, RunSummary};

/// Orchestrator for the configured vendor with the configured poll and gate policies.
pub fn orchestrator(config: &EngineConfig) -> Result<Orchestrator> {
    let adapter = vendors::create_adapter(config)?;
    Ok(Orchestrator::builder(adapter)
        .poll_policy(config.poll_policy())
        .gate_policy(config.gate_policy())
        .build())
}

/// Run one gated lifecycle. Only building the vendor client can fail here;
/// lifecycle failures are reported in the outcome.
pub async fn run_gate(config: &EngineConfig, request: &ScanRequest) -> Result<RunOutcome> {
    Ok(orchestrator(config)?.run_gate(request).await)
}

pub async fn run_submit_only(config: &EngineConfig, request: &ScanRequest) -> Result<ScanHandle> {
    orchestrator(config)?.run_submit_only(request).await
}
