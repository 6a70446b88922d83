use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::{ScanStatus, VendorAdapter};
use crate::gate::{GatePolicy, GateVerdict};
use crate::orchestrator::{RunOutcome, RunState};

/// Everything a notification about one run needs to say.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub project: String,
    pub vendor: String,
    pub verdict: GateVerdict,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScanStatus>,
    pub high: Option<u64>,
    pub medium: Option<u64>,
    pub high_threshold: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn from_outcome(
        project: &str,
        adapter: &dyn VendorAdapter,
        gate: &GatePolicy,
        outcome: &RunOutcome,
    ) -> Self {
        Self {
            project: project.to_string(),
            vendor: adapter.name().to_string(),
            verdict: outcome.verdict,
            state: outcome.state,
            project_id: outcome.project_id.as_ref().map(|id| id.to_string()),
            scan_id: outcome.handle.as_ref().map(|h| h.scan_id.clone()),
            last_status: outcome.last_status,
            high: outcome.statistics.as_ref().map(|s| s.high),
            medium: outcome.statistics.as_ref().map(|s| s.medium),
            high_threshold: gate.high_threshold,
            result_url: outcome.handle.as_ref().and_then(|h| adapter.result_url(h)),
            recipients: vec![],
            error: outcome.error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Attach the e-mail addresses of `team`. Lookup failures leave the list empty.
    pub async fn with_team_recipients(
        mut self,
        adapter: &dyn VendorAdapter,
        team: Option<&str>,
    ) -> Self {
        let Some(team) = team else {
            return self;
        };
        match adapter.team_recipients(team).await {
            Ok(recipients) => self.recipients = recipients,
            Err(e) => warn!(team, error = %e, "could not resolve team recipients"),
        }
        self
    }
}

/// Receives the summary of every finished run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// Emits the summary as a structured log event.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        info!(
            project = %summary.project,
            vendor = %summary.vendor,
            verdict = %summary.verdict,
            state = %summary.state,
            scan_id = summary.scan_id.as_deref().unwrap_or("-"),
            high = summary.high,
            medium = summary.medium,
            threshold = summary.high_threshold,
            result_url = summary.result_url.as_deref().unwrap_or("-"),
            recipients = summary.recipients.len(),
            error = summary.error.as_deref(),
            "scan run finished"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
