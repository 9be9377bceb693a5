//! Drill-down views: one agent's work within a run, and one finding.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use colored::Colorize;

use super::metrics::agent_coverage;
use super::query;
use super::renderer::{event_line, severity_tag};
use crate::core::ViewModel;
use crate::core::models::{AgentStatus, AgentType, Finding};
use crate::table::TableBuilder;
use crate::utils::time::clock;

pub fn agent_detail(view: &ViewModel, agent: AgentType, now: DateTime<Utc>) -> String {
    let events = query::events_for_agent(view, agent);
    let mut findings = query::findings_for_agent(view, agent);
    query::sort_by_severity(&mut findings);
    let screenshots = query::screenshot_events(view, agent);
    let highlights = query::agent_highlights(view, agent);
    let coverage = agent_coverage(view).into_iter().find(|c| c.agent == agent);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}  {}",
        agent.label().cyan().bold(),
        agent.class_name().dimmed(),
        view.run_id().dimmed()
    );
    let (status, progress) = coverage
        .as_ref()
        .map(|c| (c.status, c.progress))
        .unwrap_or((AgentStatus::Pending, 0));
    let requests = match coverage.as_ref() {
        Some(c) if c.budget > 0 => format!("{}/{}", c.requests_used, c.budget),
        Some(c) => c.requests_used.to_string(),
        None => "0".to_string(),
    };
    let _ = writeln!(
        out,
        "Status {}  progress {}%  requests {}  events {}  findings {}  screenshots {}\n",
        status.as_str().bold(),
        progress,
        requests,
        events.len(),
        findings.len(),
        screenshots.len()
    );

    let _ = writeln!(out, "{}", "[Summary]".green().bold());
    if highlights.is_empty() {
        let _ = writeln!(out, "  {}", "Nothing reported yet".dimmed());
    }
    for event in &highlights {
        let _ = writeln!(out, "  {} {}", clock(event.created_at).dimmed(), event.message);
    }
    out.push('\n');

    let _ = writeln!(out, "{}", "[Findings]".green().bold());
    if findings.is_empty() {
        let _ = writeln!(out, "  {}\n", "No findings from this agent".dimmed());
    } else {
        let _ = writeln!(out, "{}\n", TableBuilder::findings(&findings));
    }

    let _ = writeln!(out, "{}", "[Screenshots]".green().bold());
    if screenshots.is_empty() {
        let _ = writeln!(out, "  {}", "No screenshots captured by this agent".dimmed());
    }
    for event in &screenshots {
        let image = event.image().unwrap_or_default();
        let _ = writeln!(
            out,
            "  {} {} {}",
            clock(event.created_at).dimmed(),
            image.cyan().underline(),
            event.message
        );
    }
    out.push('\n');

    let _ = writeln!(out, "{}", "[Log]".green().bold());
    if events.is_empty() {
        let _ = writeln!(out, "  {}", "No activity yet".dimmed());
    }
    for event in events {
        let _ = writeln!(out, "  {}", event_line(event, now));
    }
    out
}

pub fn finding_detail(finding: &Finding) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", finding.title.bold());
    let _ = writeln!(
        out,
        "{}  agent {}  found {}  id {}\n",
        severity_tag(finding.severity),
        finding.agent_type.label(),
        finding.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        finding.id.dimmed()
    );

    section(&mut out, "[Evidence]", &finding.evidence, "No evidence recorded");
    section(
        &mut out,
        "[Recommendation]",
        &finding.recommendation,
        "No recommendation recorded",
    );

    let _ = writeln!(out, "{}", "[Screenshots]".green().bold());
    if finding.screenshots.is_empty() {
        let _ = writeln!(out, "  {}", "No screenshots attached".dimmed());
    } else {
        let _ = writeln!(out, "{}", TableBuilder::screenshots(&finding.screenshots));
    }
    out
}

fn section(out: &mut String, title: &str, body: &str, empty: &str) {
    let _ = writeln!(out, "{}", title.green().bold());
    if body.trim().is_empty() {
        let _ = writeln!(out, "  {}\n", empty.dimmed());
        return;
    }
    for line in body.lines() {
        let _ = writeln!(out, "  {}", line);
    }
    out.push('\n');
}
