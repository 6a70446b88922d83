mod cli;

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ReportArgs, ScanArgs};
use scangate::output::formatter;
use scangate::vendors::create_adapter;
use scangate::{
    EngineConfig, GateVerdict, LogNotifier, Notifier, Orchestrator, PackagingMode, ReportFetcher,
    ReportOutcome, ReportWindow, RunSummary, ScanRequest, Vendor,
};

const EXIT_INCONCLUSIVE: u8 = 1;
const EXIT_FAIL: u8 = 2;

/// Projects covered by `report` when none is named and `--max` is absent.
const DEFAULT_REPORT_PROJECTS: usize = 5;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(&args.verbose, args.log_json);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_INCONCLUSIVE)
        }
    }
}

fn init_tracing(verbosity: &Verbosity<InfoLevel>, json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Cli) -> anyhow::Result<ExitCode> {
    let mut config = EngineConfig::load(&args.config)?;
    if let Some(username) = args.username {
        config.username = username;
    }
    if let Some(password) = args.password {
        config.password = password;
    }

    match args.command {
        Command::Scan(scan) => run_scan(config, scan).await,
        Command::Report(report) => run_report(config, report).await,
    }
}

async fn run_scan(mut config: EngineConfig, args: ScanArgs) -> anyhow::Result<ExitCode> {
    if let Some(threshold) = args.threshold {
        config.high_threshold = threshold;
    }
    if args.medium_threshold.is_some() {
        config.medium_threshold = args.medium_threshold;
    }
    config.validate()?;

    let packaging = if args.manifests_only || config.vendor == Vendor::Sca {
        PackagingMode::Manifests
    } else {
        PackagingMode::Full
    };
    let request = ScanRequest {
        project: args.project.clone(),
        team: args.team.clone(),
        source: args.source.clone(),
        incremental: args.incremental,
        packaging,
    };

    let adapter = create_adapter(&config)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; abandoning the wait for results");
            on_interrupt.cancel();
        }
    });

    let orchestrator = Orchestrator::builder(adapter.clone())
        .poll_policy(config.poll_policy())
        .gate_policy(config.gate_policy())
        .cancellation(cancel)
        .build();
    let outcome = orchestrator.run_gate(&request).await;

    // reports exist only for scans that finished
    let finished = (args.report_format, &outcome.handle, &outcome.statistics);
    if let (Some(format), Some(handle), Some(_)) = finished {
        let fetcher = ReportFetcher::new(adapter.clone());
        match fetcher.save(handle, format, &args.output_dir, &args.project).await {
            Ok(path) => info!(path = %path.display(), "report saved"),
            Err(e) => warn!(error = %e, "failed to save report"),
        }
    }

    let gate = orchestrator.gate_policy();
    let summary = RunSummary::from_outcome(&args.project, adapter.as_ref(), gate, &outcome)
        .with_team_recipients(adapter.as_ref(), args.team.as_deref())
        .await;
    LogNotifier.notify(&summary).await?;

    let mut stdout = std::io::stdout().lock();
    formatter(args.json)
        .write_summary(&summary, &mut stdout)
        .context("failed to write summary")?;
    stdout.flush()?;

    Ok(match outcome.verdict {
        GateVerdict::Pass => ExitCode::SUCCESS,
        GateVerdict::Fail => ExitCode::from(EXIT_FAIL),
        GateVerdict::Inconclusive => ExitCode::from(EXIT_INCONCLUSIVE),
    })
}

async fn run_report(config: EngineConfig, args: ReportArgs) -> anyhow::Result<ExitCode> {
    config.validate()?;
    let adapter = create_adapter(&config)?;
    let fetcher = ReportFetcher::new(adapter);

    let window = ReportWindow {
        since: args.since,
        until: args.until,
    };
    let bounded = window.since.is_some() || window.until.is_some();
    let window = bounded.then_some(&window);

    let Some(project) = args.project.as_deref() else {
        let max = args.max.unwrap_or(DEFAULT_REPORT_PROJECTS);
        let reports = fetcher
            .save_latest_all(max, args.format, window, &args.output_dir)
            .await
            .context("failed to list projects")?;

        let mut failed = 0;
        for report in &reports {
            match &report.outcome {
                ReportOutcome::Saved(path) => println!("{}", path.display()),
                ReportOutcome::OutsideWindow => {
                    println!("no scan of {} in the requested window", report.project)
                }
                ReportOutcome::Failed(e) => {
                    failed += 1;
                    eprintln!("error: {}: {e}", report.project);
                }
            }
        }
        return Ok(if failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_INCONCLUSIVE)
        });
    };

    let saved = fetcher
        .save_latest(project, args.format, window, &args.output_dir)
        .await
        .with_context(|| format!("failed to fetch the {} report for {project}", args.format))?;

    match saved {
        Some(path) => println!("{}", path.display()),
        None => println!("no scan of {project} in the requested window"),
    }
    Ok(ExitCode::SUCCESS)
}
