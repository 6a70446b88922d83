use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use scangate::ReportFormat;

/// Submit source to a SAST/SCA platform and gate on the findings
#[derive(Parser)]
#[command(name = "scangate", version)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "SCANGATE_CONFIG", default_value = "scangate.yaml")]
    pub config: PathBuf,

    /// Overrides the username from the configuration file
    #[arg(long, global = true, env = "SCANGATE_USERNAME")]
    pub username: Option<String>,

    /// Overrides the password from the configuration file
    #[arg(long, global = true, env = "SCANGATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Package a source tree, submit it and evaluate the gate
    Scan(ScanArgs),
    /// Download the report of the latest scan of one project, or of the first listed projects
    Report(ReportArgs),
}

#[derive(Args)]
pub struct ScanArgs {
    /// Directory to package and submit
    pub source: PathBuf,

    /// Project name on the vendor platform
    pub project: String,

    /// Owning team, e.g. /CxServer/SP/Company/Team
    #[arg(long)]
    pub team: Option<String>,

    /// Request an incremental scan (SAST only)
    #[arg(long)]
    pub incremental: bool,

    /// Highest tolerated number of high-severity findings; negative submits without waiting
    #[arg(long, allow_negative_numbers = true)]
    pub threshold: Option<i64>,

    /// Highest tolerated number of medium-severity findings
    #[arg(long)]
    pub medium_threshold: Option<i64>,

    /// Package dependency manifests only (always on for SCA)
    #[arg(long)]
    pub manifests_only: bool,

    /// Also save a report of the finished scan in this format
    #[arg(long)]
    pub report_format: Option<ReportFormat>,

    /// Directory for saved reports
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Output the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Project name on the vendor platform; all listed projects when omitted
    pub project: Option<String>,

    /// Number of listed projects to cover when no project is named [default: 5]
    #[arg(short, long, conflicts_with = "project")]
    pub max: Option<usize>,

    #[arg(short, long, default_value = "pdf")]
    pub format: ReportFormat,

    /// Directory to write the report into
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Only download scans started after this moment (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Only download scans started before this moment; a bare date includes that day
    #[arg(long, value_parser = parse_until)]
    pub until: Option<DateTime<Utc>>,
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_moment(raw, false)
}

fn parse_until(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_moment(raw, true)
}

/// A bare date means its midnight, or the following midnight for an upper bound.
fn parse_moment(raw: &str, upper: bool) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD or an RFC 3339 timestamp, got '{raw}'"))?;
    let day = if upper { date.succ_opt() } else { Some(date) };
    day.and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| format!("invalid date '{raw}'"))
}
