use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{json_id, json_str, parse_timestamp, project_list};
use crate::adapter::{
    Project, ProjectId, ReportFormat, ScanHandle, ScanStatus, SeverityStatistics, VendorAdapter,
};
use crate::error::{Result, ScanError};
use crate::http;
use crate::orchestrator::PollPolicy;
use crate::packager::Artifact;
use crate::token::TokenCache;

pub const SCAN_SCOPE: &str = "sast_rest_api";
pub const ACCESS_CONTROL_SCOPE: &str = "access_control_api";

const API_V1: &str = "application/json;v=1.0";
const API_V2_2: &str = "application/json;v=2.2";
const CX_ORIGIN: &str = "scangate";

const REPORT_READY: i64 = 2;
const REPORT_FAILED: i64 = 3;

/// Map a SAST scan status name onto the normalized status.
pub fn normalize_status(raw: &str) -> ScanStatus {
    match raw {
        "Completed" | "Finished" | "Partial" => ScanStatus::Completed,
        "New" | "Queued" | "PreScan" => ScanStatus::Queued,
        "Scanning" | "SourcePullingAndDeployment" | "PostScan" | "Running" => ScanStatus::Running,
        "Failed" => ScanStatus::Failed,
        "Canceled" | "Cancelled" => ScanStatus::Canceled,
        _ => ScanStatus::Unknown,
    }
}

pub struct SastAdapter {
    client: reqwest::Client,
    tokens: TokenCache,
    api_base: String,
    web_base: String,
    default_team_id: String,
    report_poll: PollPolicy,
}

impl SastAdapter {
    pub fn new(
        client: reqwest::Client,
        tokens: TokenCache,
        api_base: &str,
        web_base: &str,
        default_team_id: &str,
    ) -> Self {
        Self {
            client,
            tokens,
            api_base: api_base.trim_end_matches('/').to_string(),
            web_base: web_base.trim_end_matches('/').to_string(),
            default_team_id: default_team_id.to_string(),
            report_poll: PollPolicy {
                interval: Duration::from_secs(1),
                max_attempts: 60,
            },
        }
    }

    /// Override how long report generation is waited for.
    pub fn with_report_poll(mut self, policy: PollPolicy) -> Self {
        self.report_poll = policy;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn get_json(&self, scope: &str, url: &str, what: &str) -> Result<Value> {
        let response = http::send_authorized(&self.tokens, scope, what, |token| {
            Ok(self.client.get(url).bearer_auth(token).header(ACCEPT, API_V1))
        })
        .await?;
        http::read_json(response, what).await
    }

    /// POST a JSON body; `api_version` is both the content type and the accepted response version.
    async fn post_json(
        &self,
        url: &str,
        api_version: &str,
        body: &Value,
        what: &str,
    ) -> Result<Value> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ScanError::Protocol(format!("failed to encode {what}: {e}")))?;
        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, what, |token| {
            Ok(self
                .client
                .post(url)
                .bearer_auth(token)
                .header(CONTENT_TYPE, api_version)
                .header(ACCEPT, api_version)
                .body(payload.clone()))
        })
        .await?;
        http::read_json(response, what).await
    }

    async fn teams(&self) -> Result<Vec<Value>> {
        let teams = self
            .get_json(ACCESS_CONTROL_SCOPE, &self.url("/auth/teams"), "team list")
            .await?;
        Ok(teams.as_array().cloned().unwrap_or_default())
    }

    /// Find the id of the team whose full name matches `team_path`.
    async fn find_team_id(&self, team_path: &str) -> Result<String> {
        let wanted = normalize_team_path(team_path);
        self.teams()
            .await?
            .iter()
            .find(|team| {
                json_str(team, "fullName")
                    .is_some_and(|name| name.trim_start_matches('/') == wanted)
            })
            .and_then(|team| team.get("id").and_then(json_id))
            .ok_or_else(|| ScanError::NotFound(format!("team {team_path}")))
    }

    /// Owning team for a new project. Lookup problems fall back to the default team.
    async fn owning_team(&self, team: Option<&str>) -> String {
        let Some(team) = team.filter(|t| !t.trim().is_empty()) else {
            return self.default_team_id.clone();
        };
        match self.find_team_id(team).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    team,
                    error = %e,
                    default = %self.default_team_id,
                    "team lookup failed; using default team"
                );
                self.default_team_id.clone()
            }
        }
    }

    /// Scan start time from the scan details, if the server reports one.
    async fn scan_started_at(&self, scan_id: &str) -> Option<chrono::DateTime<Utc>> {
        let what = format!("scan {scan_id} details");
        match self
            .get_json(SCAN_SCOPE, &self.url(&format!("/sast/scans/{scan_id}")), &what)
            .await
        {
            Ok(details) => started_on(&details),
            Err(e) => {
                debug!(scan_id, error = %e, "scan details unavailable");
                None
            }
        }
    }

    async fn wait_for_report(&self, report_id: &str) -> Result<()> {
        let url = self.url(&format!("/reports/sastScan/{report_id}/status"));
        let what = format!("report {report_id} status");

        for attempt in 1..=self.report_poll.max_attempts {
            let status = self.get_json(SCAN_SCOPE, &url, &what).await?;
            match status.pointer("/status/id").and_then(Value::as_i64) {
                Some(REPORT_READY) => return Ok(()),
                Some(REPORT_FAILED) => {
                    let detail = format!("report {report_id} generation failed");
                    return Err(ScanError::Protocol(detail));
                }
                other => debug!(report_id, attempt, status = ?other, "report not ready"),
            }
            tokio::time::sleep(self.report_poll.interval).await;
        }

        Err(ScanError::Timeout {
            scan_id: format!("report {report_id}"),
            attempts: self.report_poll.max_attempts,
        })
    }
}

#[async_trait]
impl VendorAdapter for SastAdapter {
    fn name(&self) -> &str {
        "SAST"
    }

    async fn authenticate(&self) -> Result<()> {
        self.tokens.acquire(SCAN_SCOPE).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn find_project(&self, name: &str) -> Result<ProjectId> {
        self.list_projects()
            .await?
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| ScanError::NotFound(format!("project {name}")))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let listing = self
            .get_json(SCAN_SCOPE, &self.url("/projects"), "project list")
            .await?;
        Ok(project_list(&listing))
    }

    #[instrument(skip(self))]
    async fn create_project(&self, name: &str, team: Option<&str>) -> Result<ProjectId> {
        let owning_team = self.owning_team(team).await;
        let body = json!({
            "name": name,
            "owningTeam": owning_team,
            "isPublic": true,
        });
        let created = self
            .post_json(&self.url("/projects"), API_V2_2, &body, "project creation")
            .await?;
        let id = created
            .get("id")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol("project creation: missing 'id'".into()))?;
        debug!(project = name, id = %id, owning_team = %owning_team, "project created");
        Ok(ProjectId::new(id))
    }

    #[instrument(skip(self, artifact), fields(project_id = %project, size = artifact.size()))]
    async fn submit(
        &self,
        project: &ProjectId,
        artifact: &Artifact,
        incremental: bool,
    ) -> Result<ScanHandle> {
        let bytes = artifact.read().await?;
        let url = self.url("/sast/scanWithSettings");
        let what = "source upload";

        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, what, |token| {
            let source = Part::bytes(bytes.clone())
                .file_name(artifact.file_name().to_string())
                .mime_str(artifact.content_type())
                .map_err(|e| ScanError::Protocol(format!("{what}: {e}")))?;
            let form = Form::new()
                .text("projectId", project.as_str().to_string())
                .text("isIncremental", incremental.to_string())
                .part("zippedSource", source);
            Ok(self
                .client
                .post(&url)
                .bearer_auth(token)
                .header(ACCEPT, API_V1)
                .header("cxOrigin", CX_ORIGIN)
                .multipart(form))
        })
        .await?;

        let body: Value = http::read_json(response, what).await?;
        let scan_id = body
            .get("id")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol(format!("{what}: missing scan 'id'")))?;

        Ok(ScanHandle {
            scan_id,
            project_id: project.clone(),
            submitted_at: Utc::now(),
        })
    }

    async fn poll_status(&self, handle: &ScanHandle) -> Result<ScanStatus> {
        let what = format!("scan {} status", handle.scan_id);
        let scan = self
            .get_json(SCAN_SCOPE, &self.url(&format!("/sast/scans/{}", handle.scan_id)), &what)
            .await?;
        Ok(scan_status(&scan))
    }

    #[instrument(skip(self, handle), fields(scan_id = %handle.scan_id))]
    async fn fetch_statistics(&self, handle: &ScanHandle) -> Result<SeverityStatistics> {
        let what = format!("scan {} statistics", handle.scan_id);
        let url = self.url(&format!("/sast/scans/{}/resultsStatistics", handle.scan_id));
        let stats = self.get_json(SCAN_SCOPE, &url, &what).await?;

        Ok(SeverityStatistics {
            high: stats.get("highSeverity").and_then(Value::as_u64).unwrap_or(0),
            medium: stats.get("mediumSeverity").and_then(Value::as_u64).unwrap_or(0),
            scan_created_at: self.scan_started_at(&handle.scan_id).await,
        })
    }

    #[instrument(skip(self, handle), fields(scan_id = %handle.scan_id))]
    async fn fetch_report(&self, handle: &ScanHandle, format: ReportFormat) -> Result<Vec<u8>> {
        let report_type = match format {
            ReportFormat::Pdf | ReportFormat::Rtf | ReportFormat::Csv | ReportFormat::Xml => {
                format.extension().to_ascii_uppercase()
            }
            ReportFormat::Json => {
                return Err(ScanError::UnsupportedFormat {
                    vendor: self.name().to_string(),
                    format: format.to_string(),
                });
            }
        };

        let body = json!({
            "reportType": report_type,
            "scanId": numeric_or_string(&handle.scan_id),
        });
        let requested = self
            .post_json(&self.url("/reports/sastScan"), API_V1, &body, "report request")
            .await?;
        let report_id = requested
            .get("reportId")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol("report request: missing 'reportId'".into()))?;

        self.wait_for_report(&report_id).await?;

        let what = format!("report {report_id} download");
        let url = self.url(&format!("/reports/sastScan/{report_id}"));
        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, &what, |token| {
            Ok(self.client.get(&url).bearer_auth(token))
        })
        .await?;
        http::read_bytes(response, &what).await
    }

    #[instrument(skip(self))]
    async fn latest_scan(&self, project: &ProjectId) -> Result<ScanHandle> {
        let url = self.url(&format!("/sast/scans?projectId={project}&last=1"));
        let scans = self.get_json(SCAN_SCOPE, &url, "latest scan").await?;
        let scan = scans
            .as_array()
            .and_then(|s| s.first())
            .ok_or_else(|| ScanError::NotFound(format!("scans of project {project}")))?;

        let scan_id = scan
            .get("id")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol("latest scan: missing 'id'".into()))?;
        let submitted_at = started_on(scan)
            .ok_or_else(|| {
                ScanError::Protocol(format!(
                    "latest scan {scan_id}: missing or invalid start time"
                ))
            })?;

        Ok(ScanHandle {
            scan_id,
            project_id: project.clone(),
            submitted_at,
        })
    }

    fn result_url(&self, handle: &ScanHandle) -> Option<String> {
        if self.web_base.is_empty() {
            return None;
        }
        Some(format!(
            "{}/CxWebClient/ViewerMain.aspx?scanid={}&projectid={}",
            self.web_base, handle.scan_id, handle.project_id
        ))
    }

    #[instrument(skip(self))]
    async fn team_recipients(&self, team: &str) -> Result<Vec<String>> {
        let team_id = self.find_team_id(team).await?;
        let what = format!("team {team_id} members");
        let users = self
            .get_json(
                ACCESS_CONTROL_SCOPE,
                &self.url(&format!("/auth/teams/{team_id}/Users")),
                &what,
            )
            .await?;
        Ok(users
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|u| json_str(u, "email").map(String::from))
            .collect())
    }
}

/// The finished status wins unless it is a placeholder such as `None`.
fn scan_status(scan: &Value) -> ScanStatus {
    let status_of = |pointer: &str| {
        scan.pointer(pointer)
            .and_then(Value::as_str)
            .map_or(ScanStatus::Unknown, normalize_status)
    };
    match status_of("/finishedScanStatus/value") {
        ScanStatus::Unknown => status_of("/status/name"),
        finished => finished,
    }
}

/// `\CxServer\SP\Team` and `/CxServer/SP/Team` name the same team.
fn normalize_team_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

fn started_on(scan: &Value) -> Option<chrono::DateTime<Utc>> {
    scan.pointer("/dateAndTime/startedOn")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn numeric_or_string(id: &str) -> Value {
    id.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(id))
}
