use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{Result, ScanError};
use crate::packager::Artifact;

/// Vendor-assigned project identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A project as the vendor lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

/// Correlation key for every call made after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanHandle {
    pub scan_id: String,
    pub project_id: ProjectId,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Unknown,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Canceled => "canceled",
            ScanStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityStatistics {
    pub high: u64,
    pub medium: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Rtf,
    Csv,
    Xml,
    Json,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Rtf => "rtf",
            ReportFormat::Csv => "csv",
            ReportFormat::Xml => "xml",
            ReportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ReportFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(ReportFormat::Pdf),
            "rtf" => Ok(ReportFormat::Rtf),
            "csv" => Ok(ReportFormat::Csv),
            "xml" => Ok(ReportFormat::Xml),
            "json" => Ok(ReportFormat::Json),
            other => Err(ScanError::Config(format!(
                "unknown report format: {other} (valid: pdf, rtf, csv, xml, json)"
            ))),
        }
    }
}

/// The lifecycle operations every vendor backend provides.
///
/// Implementations make one logical call per method and never loop on scan
/// status; polling policy belongs to the orchestrator.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire the credential the scan API needs.
    async fn authenticate(&self) -> Result<()>;

    /// Look a project up by name; `ScanError::NotFound` when absent.
    async fn find_project(&self, name: &str) -> Result<ProjectId>;

    async fn create_project(&self, name: &str, team: Option<&str>) -> Result<ProjectId>;

    /// Every project visible to the account, in the order the vendor returns them.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Find the project, creating it only when the lookup reports it missing.
    async fn resolve_project(&self, name: &str, team: Option<&str>) -> Result<ProjectId> {
        match self.find_project(name).await {
            Err(e) if e.is_not_found() => {
                info!(vendor = self.name(), project = name, "project not found; creating it");
                self.create_project(name, team).await
            }
            other => other,
        }
    }

    async fn submit(
        &self,
        project: &ProjectId,
        artifact: &Artifact,
        incremental: bool,
    ) -> Result<ScanHandle>;

    async fn poll_status(&self, handle: &ScanHandle) -> Result<ScanStatus>;

    /// Only meaningful once the scan completed. Missing counts read as zero.
    async fn fetch_statistics(&self, handle: &ScanHandle) -> Result<SeverityStatistics>;

    async fn fetch_report(&self, handle: &ScanHandle, format: ReportFormat) -> Result<Vec<u8>>;

    /// Most recent scan of a project.
    async fn latest_scan(&self, project: &ProjectId) -> Result<ScanHandle>;

    /// File extension a saved report of `format` should carry.
    fn report_extension(&self, format: ReportFormat) -> &'static str {
        format.extension()
    }

    /// Link to the scan results in the vendor web UI.
    fn result_url(&self, _handle: &ScanHandle) -> Option<String> {
        None
    }

    /// E-mail addresses of the members of `team`.
    async fn team_recipients(&self, _team: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(ScanStatus::Canceled.is_terminal());
        assert!(!ScanStatus::Queued.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(!ScanStatus::Unknown.is_terminal());
    }

    #[test]
    fn report_format_parses_case_insensitively() {
        assert_eq!("PDF".parse::<ReportFormat>().unwrap(), ReportFormat::Pdf);
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!(matches!(
            "docx".parse::<ReportFormat>(),
            Err(ScanError::Config(_))
        ));
    }

    /// Lookup table adapter: only project resolution is exercised here.
    struct Directory {
        existing: Option<&'static str>,
        lookup_error: Option<fn() -> ScanError>,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl VendorAdapter for Directory {
        fn name(&self) -> &str {
            "directory"
        }
        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }
        async fn find_project(&self, name: &str) -> Result<ProjectId> {
            if let Some(make) = self.lookup_error {
                return Err(make());
            }
            match self.existing {
                Some(existing) if existing == name => Ok(ProjectId::new("42")),
                _ => Err(ScanError::NotFound(format!("project {name}"))),
            }
        }
        async fn create_project(&self, _name: &str, _team: Option<&str>) -> Result<ProjectId> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(ProjectId::new("new-1"))
        }
        async fn list_projects(&self) -> Result<Vec<Project>> {
            unimplemented!()
        }
        async fn submit(&self, _: &ProjectId, _: &Artifact, _: bool) -> Result<ScanHandle> {
            unimplemented!()
        }
        async fn poll_status(&self, _: &ScanHandle) -> Result<ScanStatus> {
            unimplemented!()
        }
        async fn fetch_statistics(&self, _: &ScanHandle) -> Result<SeverityStatistics> {
            unimplemented!()
        }
        async fn fetch_report(&self, _: &ScanHandle, _: ReportFormat) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn latest_scan(&self, _: &ProjectId) -> Result<ScanHandle> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn resolve_existing_project_does_not_create() {
        let dir = Directory {
            existing: Some("payments"),
            lookup_error: None,
            creates: AtomicUsize::new(0),
        };
        let first = dir.resolve_project("payments", None).await.unwrap();
        let second = dir.resolve_project("payments", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(dir.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolve_missing_project_creates_exactly_once() {
        let dir = Directory {
            existing: None,
            lookup_error: None,
            creates: AtomicUsize::new(0),
        };
        let id = dir.resolve_project("payments", Some("/CxServer/Team")).await.unwrap();
        assert_eq!(id.as_str(), "new-1");
        assert_eq!(dir.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_does_not_create_on_other_errors() {
        let dir = Directory {
            existing: None,
            lookup_error: Some(|| ScanError::Transient("503".into())),
            creates: AtomicUsize::new(0),
        };
        let err = dir.resolve_project("payments", None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(dir.creates.load(Ordering::SeqCst), 0);
    }
}
