use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{json_id, json_str, parse_timestamp, project_list};
use crate::adapter::{
    Project, ProjectId, ReportFormat, ScanHandle, ScanStatus, SeverityStatistics, VendorAdapter,
};
use crate::error::{Result, ScanError};
use crate::http;
use crate::packager::Artifact;
use crate::token::TokenCache;

pub const SCAN_SCOPE: &str = "sca_api";

pub fn normalize_status(raw: &str) -> ScanStatus {
    match raw {
        "Done" | "Completed" => ScanStatus::Completed,
        "Queued" | "Pending" => ScanStatus::Queued,
        "Running" | "Scanning" => ScanStatus::Running,
        "Failed" => ScanStatus::Failed,
        "Canceled" | "Cancelled" => ScanStatus::Canceled,
        _ => ScanStatus::Unknown,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RiskReport {
    #[serde(default)]
    risk_report_summary: RiskReportSummary,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RiskReportSummary {
    high_vulnerability_count: u64,
    medium_vulnerability_count: u64,
    created_on: Option<String>,
}

/// Read severity counts out of a JSON risk report export.
pub fn parse_risk_report_summary(export: &[u8]) -> Result<SeverityStatistics> {
    let report: RiskReport = serde_json::from_slice(export)
        .map_err(|e| ScanError::Protocol(format!("invalid risk report export: {e}")))?;
    let summary = report.risk_report_summary;
    Ok(SeverityStatistics {
        high: summary.high_vulnerability_count,
        medium: summary.medium_vulnerability_count,
        scan_created_at: summary.created_on.as_deref().and_then(parse_timestamp),
    })
}

pub struct ScaAdapter {
    client: reqwest::Client,
    tokens: TokenCache,
    api_base: String,
    web_base: String,
}

impl ScaAdapter {
    pub fn new(
        client: reqwest::Client,
        tokens: TokenCache,
        api_base: &str,
        web_base: &str,
    ) -> Self {
        Self {
            client,
            tokens,
            api_base: api_base.trim_end_matches('/').to_string(),
            web_base: web_base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<Value> {
        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, what, |token| {
            Ok(self.client.get(url).bearer_auth(token).header(ACCEPT, "application/json"))
        })
        .await?;
        http::read_json(response, what).await
    }

    async fn post_json(&self, url: &str, body: &Value, what: &str) -> Result<Value> {
        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, what, |token| {
            Ok(self.client.post(url).bearer_auth(token).json(body))
        })
        .await?;
        http::read_json(response, what).await
    }

    async fn export(&self, scan_id: &str, format: &str) -> Result<Vec<u8>> {
        let what = format!("risk report export of scan {scan_id}");
        let url = self.url(&format!(
            "/risk-management/risk-reports/{scan_id}/export?format={format}&dataType[]=All"
        ));
        let response = http::send_authorized(&self.tokens, SCAN_SCOPE, &what, |token| {
            Ok(self.client.get(&url).bearer_auth(token))
        })
        .await?;
        http::read_bytes(response, &what).await
    }
}

#[async_trait]
impl VendorAdapter for ScaAdapter {
    fn name(&self) -> &str {
        "SCA"
    }

    async fn authenticate(&self) -> Result<()> {
        self.tokens.acquire(SCAN_SCOPE).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn find_project(&self, name: &str) -> Result<ProjectId> {
        let base = self.url("/risk-management/projects");
        let url = reqwest::Url::parse_with_params(&base, &[("name", name)])
            .map_err(|e| ScanError::Config(format!("invalid SCA api url: {e}")))?;
        let project = self.get_json(url.as_str(), "project lookup").await?;
        project
            .get("id")
            .and_then(json_id)
            .map(ProjectId::new)
            .ok_or_else(|| ScanError::NotFound(format!("project {name}")))
    }

    #[instrument(skip(self))]
    async fn list_projects(&self) -> Result<Vec<Project>> {
        let listing = self
            .get_json(&self.url("/risk-management/projects"), "project list")
            .await?;
        Ok(project_list(&listing))
    }

    #[instrument(skip(self))]
    async fn create_project(&self, name: &str, team: Option<&str>) -> Result<ProjectId> {
        let assigned_teams: Vec<String> = team
            .filter(|t| !t.trim().is_empty())
            .map(team_path)
            .into_iter()
            .collect();
        let body = json!({
            "name": name,
            "assignedTeams": assigned_teams,
        });
        let created = self
            .post_json(&self.url("/risk-management/projects"), &body, "project creation")
            .await?;
        let id = created
            .get("id")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol("project creation: missing 'id'".into()))?;
        debug!(project = name, id = %id, "project created");
        Ok(ProjectId::new(id))
    }

    #[instrument(skip(self, artifact), fields(project_id = %project, size = artifact.size()))]
    async fn submit(
        &self,
        project: &ProjectId,
        artifact: &Artifact,
        incremental: bool,
    ) -> Result<ScanHandle> {
        if incremental {
            debug!("incremental scans are not supported by SCA; running a full scan");
        }

        let request = json!({"projectId": project.as_str()});
        let link = self
            .post_json(&self.url("/api/uploads"), &request, "upload link")
            .await?;
        let upload_url = json_str(&link, "url")
            .ok_or_else(|| ScanError::Protocol("upload link: missing 'url'".into()))?
            .to_string();

        let bytes = artifact.read().await?;
        http::send_authorized(&self.tokens, SCAN_SCOPE, "manifest upload", |token| {
            Ok(self
                .client
                .put(&upload_url)
                .bearer_auth(token)
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, artifact.content_type())
                .body(bytes.clone()))
        })
        .await?;

        let body = json!({
            "projectId": project.as_str(),
            "uploadedFileUrl": upload_url,
        });
        let scan = self
            .post_json(&self.url("/api/scans/uploaded-zip"), &body, "scan start")
            .await?;
        let scan_id = scan
            .get("scanId")
            .and_then(json_id)
            .ok_or_else(|| ScanError::Protocol("scan start: missing 'scanId'".into()))?;

        Ok(ScanHandle {
            scan_id,
            project_id: project.clone(),
            submitted_at: Utc::now(),
        })
    }

    async fn poll_status(&self, handle: &ScanHandle) -> Result<ScanStatus> {
        let what = format!("scan {} status", handle.scan_id);
        let scan = self
            .get_json(&self.url(&format!("/api/scans/{}", handle.scan_id)), &what)
            .await?;
        Ok(normalize_status(json_str(&scan, "status").unwrap_or_default()))
    }

    #[instrument(skip(self, handle), fields(scan_id = %handle.scan_id))]
    async fn fetch_statistics(&self, handle: &ScanHandle) -> Result<SeverityStatistics> {
        let export = self.export(&handle.scan_id, "json").await?;
        parse_risk_report_summary(&export)
    }

    #[instrument(skip(self, handle), fields(scan_id = %handle.scan_id))]
    async fn fetch_report(&self, handle: &ScanHandle, format: ReportFormat) -> Result<Vec<u8>> {
        match format {
            ReportFormat::Pdf | ReportFormat::Csv | ReportFormat::Xml | ReportFormat::Json => {
                self.export(&handle.scan_id, format.extension()).await
            }
            ReportFormat::Rtf => Err(ScanError::UnsupportedFormat {
                vendor: self.name().to_string(),
                format: format.to_string(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn latest_scan(&self, project: &ProjectId) -> Result<ScanHandle> {
        let details = self
            .get_json(&self.url(&format!("/risk-management/projects/{project}")), "project details")
            .await?;
        let scan_id = details
            .get("latestScanId")
            .and_then(json_id)
            .ok_or_else(|| ScanError::NotFound(format!("scans of project {project}")))?;

        let what = format!("scan {scan_id} details");
        let scan = self
            .get_json(&self.url(&format!("/api/scans/{scan_id}")), &what)
            .await?;
        let submitted_at = json_str(&scan, "createdOn")
            .and_then(parse_timestamp)
            .ok_or_else(|| ScanError::Protocol(format!("{what}: missing or invalid 'createdOn'")))?;

        Ok(ScanHandle {
            scan_id,
            project_id: project.clone(),
            submitted_at,
        })
    }

    /// CSV exports arrive as a zip of one file per data type.
    fn report_extension(&self, format: ReportFormat) -> &'static str {
        match format {
            ReportFormat::Csv => "zip",
            other => other.extension(),
        }
    }

    fn result_url(&self, handle: &ScanHandle) -> Option<String> {
        if self.web_base.is_empty() {
            return None;
        }
        Some(format!("{}/#/projects/{}", self.web_base, handle.project_id))
    }
}

/// Team names are assigned under the `/CxServer` root unless already absolute.
fn team_path(team: &str) -> String {
    let team = team.replace('\\', "/");
    if team.starts_with('/') {
        team
    } else {
        format!("/CxServer/{team}")
    }
}
