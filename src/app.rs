use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::{
    actions::{self, BackendActions, HttpBackend, ReportSource, ScanConfiguration, StartRunRequest},
    cli::args::{Cli, Command, StartArgs, WatchArgs},
    config::{ConfigLoader, GlobalConfig},
    core::{Delivery, Reconciler},
    core::ViewModel,
    dashboard::{Dashboard, DashboardExit, detail, metrics::RunMetrics, query},
    monitoring::{LiveState, LiveView},
    sources::{JsonLinesChannel, MemoryBackend, RestSnapshotSource, Scenario, SnapshotSource, UpdateChannel},
    table::TableBuilder,
    utils::{logging, time::format_elapsed},
};

const REPORT_LOADING_LINES: &[&str] = &[
    "Collecting findings",
    "Correlating agent evidence",
    "Ranking issues by severity",
    "Drafting remediation advice",
    "Writing the executive summary",
];

pub async fn run(cli: Cli) -> Result<()> {
    let config = ConfigLoader::load_with_custom_path(cli.config.as_deref())?;

    let level = logging::level_from_cli(&cli, config.logging.level());
    logging::init(level)?;

    tracing::info!(
        backend = %config.backend.api_url,
        data = %config.data.rest_url,
        "configuration loaded"
    );

    match cli.command {
        Command::Watch(args) => watch(&config, args).await,
        Command::Summary { run_id, json } => summary(&config, &run_id, json).await,
        Command::Agent { run_id, agent } => {
            let view = fetch_view(&config, &run_id).await?;
            print!("{}", detail::agent_detail(&view, agent, Utc::now()));
            Ok(())
        }
        Command::Finding { run_id, finding_id } => {
            let view = fetch_view(&config, &run_id).await?;
            let finding = query::finding(&view, &finding_id)
                .with_context(|| format!("Finding {} not found in run {}", finding_id, run_id))?;
            print!("{}", detail::finding_detail(finding));
            Ok(())
        }
        Command::Start(args) => start(&config, args).await,
        Command::Cancel { run_id } => {
            HttpBackend::new(&config.backend.api_url).cancel_run(&run_id).await?;
            println!("{} cancellation requested for {}", "✓".green(), run_id.bold());
            Ok(())
        }
        Command::Rerun { run_id, watch: follow } => {
            let snapshots = rest_source(&config)?;
            let backend = HttpBackend::new(&config.backend.api_url);
            let new_id = actions::rerun(&snapshots, &backend, &run_id)
                .await
                .with_context(|| format!("Failed to re-run {}", run_id))?;
            println!("{} re-run of {} started as {}", "✓".green(), run_id, new_id.bold());
            if follow {
                watch(&config, WatchArgs { run_id: new_id, updates: None, no_clear: false }).await?;
            }
            Ok(())
        }
        Command::Report { run_id } => report(&config, &run_id).await,
        Command::Replay { scenario, no_clear } => replay(&config, &scenario, no_clear).await,
        Command::InitConfig { path } => {
            ConfigLoader::generate_template(&path)?;
            println!("{} wrote {}", "✓".green(), path.display());
            Ok(())
        }
    }
}

fn rest_source(config: &GlobalConfig) -> Result<RestSnapshotSource> {
    RestSnapshotSource::new(
        &config.data.rest_url,
        config.data.api_key.clone(),
        config.live.fetch_timeout(),
    )
    .context("Failed to build the snapshot client")
}

async fn watch(config: &GlobalConfig, args: WatchArgs) -> Result<()> {
    let snapshots: Arc<dyn SnapshotSource> = Arc::new(rest_source(config)?);
    let channel = args
        .updates
        .as_deref()
        .map(|arg| Arc::new(JsonLinesChannel::from_arg(arg)) as Arc<dyn UpdateChannel>);

    follow(config, &args.run_id, snapshots, channel, !args.no_clear).await
}

/// Runs the dashboard over a live view until the run is final or the user
/// interrupts, then prints a one-line verdict.
async fn follow(
    config: &GlobalConfig,
    run_id: &str,
    snapshots: Arc<dyn SnapshotSource>,
    channel: Option<Arc<dyn UpdateChannel>>,
    clear: bool,
) -> Result<()> {
    let view = LiveView::start(run_id, snapshots, channel, config.live.options());
    let dashboard = Dashboard::new(config.live.recent_events, clear, config.live.render_interval());

    let exit = dashboard
        .run(view.subscribe())
        .await
        .context("Failed to draw the dashboard")?;
    view.shutdown().await;

    print_verdict(exit.state());
    if let DashboardExit::Interrupted(_) = exit {
        println!("{}", "Stopped watching; the scan keeps running on the backend.".dimmed());
    }
    Ok(())
}

fn print_verdict(state: &LiveState) {
    let metrics = RunMetrics::compute(&state.view, Utc::now());
    let status = state
        .view
        .run()
        .map(|r| r.status.to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string());
    println!(
        "{} {}: security score {}/100, risk {} ({}), {} findings in {}",
        "Run".bold(),
        state.view.run_id().bold(),
        metrics.security_score,
        metrics.risk_score,
        metrics.risk_label.as_str(),
        metrics.counts.total(),
        format_elapsed(metrics.elapsed)
    );
    println!("{} {}", "Status".bold(), status);
}

#[derive(Serialize)]
struct SummaryOutput<'a> {
    run_id: &'a str,
    status: Option<String>,
    target: Option<&'a str>,
    #[serde(flatten)]
    metrics: &'a RunMetrics,
}

/// One snapshot fetch reconciled into a view, for the one-shot commands.
async fn fetch_view(config: &GlobalConfig, run_id: &str) -> Result<ViewModel> {
    let snapshot = rest_source(config)?
        .fetch(run_id, config.live.event_limit)
        .await
        .with_context(|| format!("Failed to fetch run {}", run_id))?;

    let mut reconciler = Reconciler::new(run_id, config.live.event_limit);
    let outcome = reconciler.apply(Delivery::Snapshot(snapshot), Utc::now());
    for diagnostic in &outcome.diagnostics {
        tracing::warn!("{}", diagnostic);
    }
    if reconciler.view().run().is_none() {
        anyhow::bail!("Run {} not found", run_id);
    }
    Ok(reconciler.view().clone())
}

async fn summary(config: &GlobalConfig, run_id: &str, json: bool) -> Result<()> {
    let view = fetch_view(config, run_id).await?;
    let Some(run) = view.run() else {
        anyhow::bail!("Run {} not found", run_id);
    };
    let metrics = RunMetrics::compute(&view, Utc::now());

    if json {
        let output = SummaryOutput {
            run_id,
            status: Some(run.status.to_string()),
            target: Some(run.target.as_str()),
            metrics: &metrics,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} {}  {}", "Run".cyan().bold(), run_id.bold(), run.target.yellow());
    println!(
        "Status {}  elapsed {}  security score {}/100  risk {} ({})",
        run.status,
        format_elapsed(metrics.elapsed),
        metrics.security_score,
        metrics.risk_score,
        metrics.risk_label.as_str()
    );
    println!("{}", TableBuilder::severity_counts(&metrics.counts));
    println!("{}", TableBuilder::coverage(&metrics.coverage));
    for (severity, findings) in query::group_by_severity(&view) {
        println!("\n{} ({})", severity.as_str().bold(), findings.len());
        for finding in findings {
            println!("  {} {} {}", finding.id.dimmed(), finding.agent_type.label(), finding.title);
        }
    }
    Ok(())
}

async fn start(config: &GlobalConfig, args: StartArgs) -> Result<()> {
    let configuration = ScanConfiguration {
        auth_type: args.auth_type,
        username: args.username,
        password: args.password,
        token: args.token,
        instructions: args.instructions,
    };
    let request = StartRunRequest::new(&args.target, args.agents, &configuration)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid scan request")?;

    let backend = HttpBackend::new(&config.backend.api_url);
    let run_id = backend
        .start_run(&request)
        .await
        .with_context(|| format!("Failed to start a scan of {}", request.target_url))?;
    println!(
        "{} scan of {} started as {} ({} agents)",
        "✓".green(),
        request.target_url.yellow(),
        run_id.bold(),
        request.agents.len()
    );

    if args.watch {
        watch(config, WatchArgs { run_id, updates: None, no_clear: false }).await?;
    }
    Ok(())
}

async fn report(config: &GlobalConfig, run_id: &str) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")?
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );
    spinner.set_message(REPORT_LOADING_LINES[0]);
    spinner.enable_steady_tick(Duration::from_millis(100));

    let backend = HttpBackend::new(&config.backend.api_url);
    let mut chunks = match backend.stream_report(run_id).await {
        Ok(chunks) => chunks,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).with_context(|| format!("Failed to generate report for {}", run_id));
        }
    };

    // Cycle status lines until the first text arrives.
    let mut rotate = tokio::time::interval(Duration::from_secs(2));
    rotate.tick().await;
    let mut line = 0;
    let first = loop {
        tokio::select! {
            chunk = chunks.next() => break chunk,
            _ = rotate.tick() => {
                line = (line + 1) % REPORT_LOADING_LINES.len();
                spinner.set_message(REPORT_LOADING_LINES[line]);
            }
        }
    };
    spinner.finish_and_clear();

    let mut stdout = std::io::stdout();
    let mut next = first;
    while let Some(chunk) = next {
        let text = chunk.context("Report stream interrupted")?;
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        next = chunks.next().await;
    }
    writeln!(stdout)?;
    Ok(())
}

async fn replay(config: &GlobalConfig, path: &std::path::Path, no_clear: bool) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let backend = MemoryBackend::new();
    scenario.seed(&backend);
    tracing::info!(
        run = %scenario.run_id,
        steps = scenario.steps.len(),
        duration_ms = scenario.duration().as_millis() as u64,
        "replaying scenario"
    );

    let player = scenario.play(backend.clone());
    let result = follow(
        config,
        &scenario.run_id,
        Arc::new(backend.clone()),
        Some(Arc::new(backend)),
        !no_clear,
    )
    .await;
    player.abort();
    result
}
