use std::fmt::Write as _;
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};

use super::metrics::{RiskLabel, RunMetrics, ScoreBand};
use super::query;
use crate::core::Phase;
use crate::core::models::{Event, EventType, RunStatus, Severity};
use crate::monitoring::LiveState;
use crate::table::TableBuilder;
use crate::utils::time::{ago, clock, format_elapsed};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

pub struct Renderer {
    stdout: io::Stdout,
    recent_events: usize,
    clear: bool,
}

impl Renderer {
    pub fn new(recent_events: usize, clear: bool) -> Self {
        Self {
            stdout: io::stdout(),
            recent_events,
            clear,
        }
    }

    pub fn draw(&mut self, state: &LiveState, now: DateTime<Utc>) -> io::Result<()> {
        let metrics = RunMetrics::compute(&state.view, now);
        let frame = self.frame(state, &metrics, now);
        let mut out = self.stdout.lock();
        if self.clear {
            out.write_all(CLEAR_SCREEN.as_bytes())?;
        }
        out.write_all(frame.as_bytes())?;
        out.flush()
    }

    pub fn frame(&self, state: &LiveState, metrics: &RunMetrics, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        self.header(&mut out, state, metrics, now);
        let _ = writeln!(out, "{}", TableBuilder::coverage(&metrics.coverage));
        self.findings(&mut out, state);
        self.events(&mut out, state, now);
        out
    }

    fn header(&self, out: &mut String, state: &LiveState, metrics: &RunMetrics, now: DateTime<Utc>) {
        let view = &state.view;
        let target = view.run().map(|r| r.target.as_str()).unwrap_or("-");
        let _ = writeln!(
            out,
            "{} {}  {}",
            "Security scan".cyan().bold(),
            target.yellow().bold(),
            view.run_id().dimmed()
        );

        let status = match view.run() {
            Some(run) => run_status(run.status),
            None => "WAITING".dimmed(),
        };
        let phase = match state.phase {
            Phase::Initializing => "connecting".dimmed(),
            Phase::Live if state.is_stale() => "stale".yellow().bold(),
            Phase::Live => "live".green(),
            Phase::Terminal { finalized: false } => "finalizing".cyan(),
            Phase::Terminal { finalized: true } => "final".normal(),
        };
        let updated = state
            .last_applied_at
            .map(|at| ago(at, now))
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(
            out,
            "Status {}  [{}]  elapsed {}  updated {}",
            status,
            phase,
            format_elapsed(metrics.elapsed),
            updated
        );

        let _ = writeln!(
            out,
            "Security score {}  Risk {} ({})  Findings {}  Requests {}  Agents done {}/{}",
            score(metrics.security_score, metrics.score_band),
            metrics.risk_score,
            risk_label(metrics.risk_label),
            metrics.counts.total(),
            metrics.total_requests,
            metrics.agents_finished,
            view.sessions().len()
        );

        let mut counts = String::new();
        for severity in Severity::DESCENDING {
            let _ = write!(
                counts,
                "{} {}  ",
                severity_tag(severity),
                metrics.counts.get(severity)
            );
        }
        let _ = writeln!(out, "{}", counts.trim_end());
        if state.diagnostics > 0 {
            let _ = writeln!(out, "{}", format!("{} diagnostics reported, see log", state.diagnostics).dimmed());
        }
        out.push('\n');
    }

    fn findings(&self, out: &mut String, state: &LiveState) {
        let sorted = query::findings_by_severity(&state.view);
        let _ = writeln!(out, "{}", "[Findings]".green().bold());
        if sorted.is_empty() {
            let _ = writeln!(out, "  {}\n", "No findings yet".dimmed());
            return;
        }
        let _ = writeln!(out, "{}\n", TableBuilder::findings(&sorted));
    }

    fn events(&self, out: &mut String, state: &LiveState, now: DateTime<Utc>) {
        let recent = query::recent_events(&state.view, self.recent_events);
        let _ = writeln!(
            out,
            "{} {}",
            "[Activity]".green().bold(),
            format!("latest {} of {}", recent.len(), state.view.event_count()).dimmed()
        );
        if recent.is_empty() {
            let _ = writeln!(out, "  {}", "No activity yet".dimmed());
        }
        for event in recent {
            let _ = writeln!(out, "  {}", event_line(event, now));
        }
    }
}

pub(super) fn event_line(event: &Event, now: DateTime<Utc>) -> String {
    let kind = match event.event_type {
        EventType::Info => "INFO".blue(),
        EventType::Warning => "WARN".yellow(),
        EventType::Error => "ERR ".red(),
        EventType::Success => "OK  ".green(),
        EventType::Screenshot => "SHOT".magenta(),
    };
    let mut line = format!(
        "{} {} {:<14} {}",
        clock(event.created_at).dimmed(),
        kind,
        event.agent_type.label(),
        event.message
    );
    if let Some(image) = event.image() {
        let _ = write!(line, " {}", image.cyan().underline());
    }
    if now.signed_duration_since(event.created_at).num_seconds() < 5 {
        line.push_str(" *");
    }
    line
}

pub(super) fn run_status(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Queued => status.as_str().dimmed(),
        RunStatus::Running => status.as_str().cyan().bold(),
        RunStatus::Completed => status.as_str().green().bold(),
        RunStatus::Failed => status.as_str().red().bold(),
        RunStatus::Cancelled => status.as_str().yellow().bold(),
    }
}

fn score(value: u8, band: ScoreBand) -> ColoredString {
    let text = format!("{}/100", value);
    match band {
        ScoreBand::Good => text.green().bold(),
        ScoreBand::Fair => text.yellow().bold(),
        ScoreBand::Poor => text.truecolor(255, 140, 0).bold(),
        ScoreBand::Bad => text.red().bold(),
    }
}

fn risk_label(label: RiskLabel) -> ColoredString {
    match label {
        RiskLabel::Low => label.as_str().green(),
        RiskLabel::Moderate => label.as_str().yellow(),
        RiskLabel::High => label.as_str().red(),
        RiskLabel::Critical => label.as_str().magenta().bold(),
    }
}

pub(super) fn severity_tag(severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => severity.as_str().magenta().bold(),
        Severity::High => severity.as_str().red(),
        Severity::Medium => severity.as_str().yellow(),
        Severity::Low => severity.as_str().blue(),
        Severity::Info => severity.as_str().dimmed(),
    }
}
