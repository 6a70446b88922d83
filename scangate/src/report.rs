use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::adapter::{Project, ProjectId, ReportFormat, ScanHandle, VendorAdapter};
use crate::error::{Result, ScanError};

/// Exclusive bounds on when the reported scan may have started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReportWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at > since) && self.until.is_none_or(|until| at < until)
    }
}

/// A downloaded report and the scan it describes.
#[derive(Debug)]
pub struct Report {
    pub handle: ScanHandle,
    pub format: ReportFormat,
    pub bytes: Vec<u8>,
}

/// What happened to one project of a batch download.
#[derive(Debug)]
pub enum ReportOutcome {
    Saved(PathBuf),
    OutsideWindow,
    Failed(ScanError),
}

#[derive(Debug)]
pub struct ProjectReport {
    pub project: String,
    pub outcome: ReportOutcome,
}

pub struct ReportFetcher {
    adapter: Arc<dyn VendorAdapter>,
}

impl ReportFetcher {
    pub fn new(adapter: Arc<dyn VendorAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn fetch(&self, handle: &ScanHandle, format: ReportFormat) -> Result<Vec<u8>> {
        self.adapter.fetch_report(handle, format).await
    }

    /// Download the report and write it as `<project>_<VENDOR>_report.<ext>` under `dir`.
    #[instrument(
        skip(self, handle),
        fields(vendor = self.adapter.name(), scan_id = %handle.scan_id)
    )]
    pub async fn save(
        &self,
        handle: &ScanHandle,
        format: ReportFormat,
        dir: &Path,
        project: &str,
    ) -> Result<PathBuf> {
        let bytes = self.fetch(handle, format).await?;
        self.write(project, format, &bytes, dir).await
    }

    /// Report of the project's most recent scan.
    ///
    /// The project is looked up, never created. `None` when the latest scan
    /// started outside `window`.
    #[instrument(skip(self, window), fields(vendor = self.adapter.name()))]
    pub async fn fetch_latest(
        &self,
        project: &str,
        format: ReportFormat,
        window: Option<&ReportWindow>,
    ) -> Result<Option<Report>> {
        self.adapter.authenticate().await?;
        let project_id = self.adapter.find_project(project).await?;
        self.fetch_latest_of(&project_id, format, window).await
    }

    async fn fetch_latest_of(
        &self,
        project: &ProjectId,
        format: ReportFormat,
        window: Option<&ReportWindow>,
    ) -> Result<Option<Report>> {
        let handle = self.adapter.latest_scan(project).await?;

        if window.is_some_and(|w| !w.contains(handle.submitted_at)) {
            info!(
                scan_id = %handle.scan_id,
                started = %handle.submitted_at,
                "latest scan outside report window; skipping"
            );
            return Ok(None);
        }

        let bytes = self.fetch(&handle, format).await?;
        Ok(Some(Report { handle, format, bytes }))
    }

    pub async fn save_latest(
        &self,
        project: &str,
        format: ReportFormat,
        window: Option<&ReportWindow>,
        dir: &Path,
    ) -> Result<Option<PathBuf>> {
        match self.fetch_latest(project, format, window).await? {
            Some(report) => Ok(Some(self.write(project, report.format, &report.bytes, dir).await?)),
            None => Ok(None),
        }
    }

    /// Save the latest report of each of the first `max` listed projects.
    ///
    /// Only a failed listing is an error. A project whose report cannot be
    /// fetched is recorded as `Failed` and the batch moves on.
    #[instrument(skip(self, window, dir), fields(vendor = self.adapter.name()))]
    pub async fn save_latest_all(
        &self,
        max: usize,
        format: ReportFormat,
        window: Option<&ReportWindow>,
        dir: &Path,
    ) -> Result<Vec<ProjectReport>> {
        self.adapter.authenticate().await?;
        let projects = self.adapter.list_projects().await?;
        info!(listed = projects.len(), max, "downloading latest reports");

        let mut reports = Vec::new();
        for project in projects.into_iter().take(max) {
            let outcome = match self.save_latest_of(&project, format, window, dir).await {
                Ok(Some(path)) => ReportOutcome::Saved(path),
                Ok(None) => ReportOutcome::OutsideWindow,
                Err(e) => {
                    warn!(project = %project.name, error = %e, "no report for project");
                    ReportOutcome::Failed(e)
                }
            };
            reports.push(ProjectReport {
                project: project.name,
                outcome,
            });
        }
        Ok(reports)
    }

    async fn save_latest_of(
        &self,
        project: &Project,
        format: ReportFormat,
        window: Option<&ReportWindow>,
        dir: &Path,
    ) -> Result<Option<PathBuf>> {
        match self.fetch_latest_of(&project.id, format, window).await? {
            Some(report) => {
                let path = self.write(&project.name, report.format, &report.bytes, dir).await?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    pub fn file_name(&self, project: &str, format: ReportFormat) -> String {
        report_file_name(project, self.adapter.name(), self.adapter.report_extension(format))
    }

    async fn write(
        &self,
        project: &str,
        format: ReportFormat,
        bytes: &[u8],
        dir: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.file_name(project, format));
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), size = bytes.len(), "report saved");
        Ok(path)
    }
}

pub fn report_file_name(project: &str, vendor: &str, extension: &str) -> String {
    let project: String = project
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!("{project}_{}_report.{extension}", vendor.to_ascii_uppercase())
}
