use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{ProjectId, ScanHandle, ScanStatus, SeverityStatistics, VendorAdapter};
use crate::error::{Result, ScanError};
use crate::gate::{self, GatePolicy, GateVerdict};
use crate::packager::{Packager, PackagingMode};

/// Suspension between status checks. Tests substitute a clock that never waits.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Upper bound on status checks.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
        }
    }
}

/// What to scan and where it belongs.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub project: String,
    /// Owning team path, e.g. `/CxServer/SP/Company/Team`.
    pub team: Option<String>,
    pub source: PathBuf,
    pub incremental: bool,
    pub packaging: PackagingMode,
}

impl ScanRequest {
    pub fn new(project: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            team: None,
            source: source.into(),
            incremental: false,
            packaging: PackagingMode::Full,
        }
    }
}

/// Where a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Authenticated,
    ProjectResolved,
    Submitted,
    Polling,
    Completed,
    FailedTerminal,
    CanceledTerminal,
    TimedOut,
    Cancelled,
    StatsFetched,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::Authenticated => "authenticated",
            RunState::ProjectResolved => "project_resolved",
            RunState::Submitted => "submitted",
            RunState::Polling => "polling",
            RunState::Completed => "completed",
            RunState::FailedTerminal => "failed_terminal",
            RunState::CanceledTerminal => "canceled_terminal",
            RunState::TimedOut => "timed_out",
            RunState::Cancelled => "cancelled",
            RunState::StatsFetched => "stats_fetched",
        };
        f.write_str(s)
    }
}

/// Result of one gated lifecycle. Always produced, never pending.
#[derive(Debug)]
pub struct RunOutcome {
    pub verdict: GateVerdict,
    pub state: RunState,
    pub project_id: Option<ProjectId>,
    pub handle: Option<ScanHandle>,
    pub last_status: Option<ScanStatus>,
    pub statistics: Option<SeverityStatistics>,
    /// Status checks performed.
    pub attempts: u32,
    /// Why the run is inconclusive, when it is.
    pub error: Option<ScanError>,
}

impl RunOutcome {
    fn new() -> Self {
        Self {
            verdict: GateVerdict::Inconclusive,
            state: RunState::Init,
            project_id: None,
            handle: None,
            last_status: None,
            statistics: None,
            attempts: 0,
            error: None,
        }
    }

    fn inconclusive(mut self, error: Option<ScanError>) -> Self {
        self.verdict = GateVerdict::Inconclusive;
        self.error = error;
        self
    }
}

/// Drives one vendor adapter through authenticate, resolve, submit, poll and gate.
pub struct Orchestrator {
    adapter: Arc<dyn VendorAdapter>,
    poll: PollPolicy,
    gate: GatePolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancellationToken>,
}

impl Orchestrator {
    pub fn builder(adapter: Arc<dyn VendorAdapter>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(adapter)
    }

    pub fn adapter(&self) -> &Arc<dyn VendorAdapter> {
        &self.adapter
    }

    pub fn gate_policy(&self) -> &GatePolicy {
        &self.gate
    }

    /// Run the full lifecycle and evaluate the gate.
    ///
    /// Errors never escape; they end up in [`RunOutcome::error`] with an
    /// `Inconclusive` verdict.
    #[instrument(
        skip(self, request),
        fields(vendor = self.adapter.name(), project = %request.project)
    )]
    pub async fn run_gate(&self, request: &ScanRequest) -> RunOutcome {
        let mut run = RunOutcome::new();

        if let Err(e) = self.adapter.authenticate().await {
            warn!(error = %e, "authentication failed");
            return run.inconclusive(Some(e));
        }
        run.state = RunState::Authenticated;

        let project = match self
            .adapter
            .resolve_project(&request.project, request.team.as_deref())
            .await
        {
            Ok(project) => project,
            Err(e) => {
                warn!(error = %e, "project resolution failed");
                return run.inconclusive(Some(e));
            }
        };
        run.project_id = Some(project.clone());
        run.state = RunState::ProjectResolved;

        let handle = match self.submit(&project, request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "submission failed");
                return run.inconclusive(Some(e));
            }
        };
        run.handle = Some(handle.clone());
        run.state = RunState::Submitted;

        if !self.gate.is_enabled() {
            info!(scan_id = %handle.scan_id, "gate disabled; not waiting for results");
            run.verdict = GateVerdict::Pass;
            return run;
        }

        run.state = RunState::Polling;
        match self.wait_for_terminal(&handle, &mut run).await {
            Ok(ScanStatus::Completed) => run.state = RunState::Completed,
            Ok(ScanStatus::Canceled) => {
                warn!(scan_id = %handle.scan_id, "scan was canceled by the vendor");
                run.state = RunState::CanceledTerminal;
                return run.inconclusive(None);
            }
            Ok(status) => {
                warn!(scan_id = %handle.scan_id, %status, "scan did not complete");
                run.state = RunState::FailedTerminal;
                return run.inconclusive(None);
            }
            Err(e) => {
                run.state = match e {
                    ScanError::Timeout { .. } => RunState::TimedOut,
                    ScanError::Cancelled { .. } => RunState::Cancelled,
                    _ => RunState::Polling,
                };
                warn!(scan_id = %handle.scan_id, error = %e, "stopped waiting for scan");
                return run.inconclusive(Some(e));
            }
        }

        let stats = match self.adapter.fetch_statistics(&handle).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(scan_id = %handle.scan_id, error = %e, "failed to fetch statistics");
                return run.inconclusive(Some(e));
            }
        };
        run.state = RunState::StatsFetched;
        run.verdict = gate::evaluate(&stats, &self.gate);
        info!(
            scan_id = %handle.scan_id,
            high = stats.high,
            medium = stats.medium,
            threshold = self.gate.high_threshold,
            verdict = %run.verdict,
            "gate evaluated"
        );
        run.statistics = Some(stats);
        run
    }

    /// Authenticate, resolve and submit without waiting for the scan.
    #[instrument(
        skip(self, request),
        fields(vendor = self.adapter.name(), project = %request.project)
    )]
    pub async fn run_submit_only(&self, request: &ScanRequest) -> Result<ScanHandle> {
        self.adapter.authenticate().await?;
        let project = self
            .adapter
            .resolve_project(&request.project, request.team.as_deref())
            .await?;
        self.submit(&project, request).await
    }

    async fn submit(&self, project: &ProjectId, request: &ScanRequest) -> Result<ScanHandle> {
        let artifact = Packager::new(request.packaging).package(&request.source).await?;
        debug!(
            project_id = %project,
            size = artifact.size(),
            file = artifact.file_name(),
            "artifact packaged"
        );
        let submitted = self.adapter.submit(project, &artifact, request.incremental).await;
        drop(artifact);

        let handle = submitted?;
        info!(scan_id = %handle.scan_id, project_id = %project, "scan submitted");
        Ok(handle)
    }

    /// Sleep, then check, until the scan is terminal or the attempts run out.
    async fn wait_for_terminal(
        &self,
        handle: &ScanHandle,
        run: &mut RunOutcome,
    ) -> Result<ScanStatus> {
        for attempt in 1..=self.poll.max_attempts {
            if self.pause().await {
                return Err(ScanError::Cancelled {
                    scan_id: handle.scan_id.clone(),
                });
            }
            run.attempts = attempt;

            match self.adapter.poll_status(handle).await {
                Ok(status) => {
                    debug!(scan_id = %handle.scan_id, attempt, %status, "scan status");
                    run.last_status = Some(status);
                    if status.is_terminal() {
                        return Ok(status);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        scan_id = %handle.scan_id,
                        attempt,
                        error = %e,
                        "status check failed; still waiting"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(ScanError::Timeout {
            scan_id: handle.scan_id.clone(),
            attempts: self.poll.max_attempts,
        })
    }

    /// Returns true when the run was cancelled during the pause.
    async fn pause(&self) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = self.sleeper.sleep(self.poll.interval) => false,
            },
            None => {
                self.sleeper.sleep(self.poll.interval).await;
                false
            }
        }
    }
}

pub struct OrchestratorBuilder {
    adapter: Arc<dyn VendorAdapter>,
    poll: PollPolicy,
    gate: GatePolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn new(adapter: Arc<dyn VendorAdapter>) -> Self {
        Self {
            adapter,
            poll: PollPolicy::default(),
            gate: GatePolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            cancel: None,
        }
    }

    pub fn poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn gate_policy(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            adapter: self.adapter,
            poll: self.poll,
            gate: self.gate,
            sleeper: self.sleeper,
            cancel: self.cancel,
        }
    }
}
