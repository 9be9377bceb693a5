//! Read-only views over a [`ViewModel`] for the presentation layer.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::core::ViewModel;
use crate::core::models::{AgentType, Event, EventType, Finding, Severity};

/// Message fragments that mark an agent's progress steps, as opposed to
/// chatter like raw request logs.
const HIGHLIGHT_MARKERS: &[&str] = &[
    "Starting",
    "Discovered",
    "Navigat",
    "Found",
    "Testing",
    "Scanning",
    "THINK",
    "ACT",
    "Authentication",
    "Performing",
    "Login",
    "login",
    "Content",
    "LLM",
    "CONSOLE",
    "NETWORK",
];

pub fn events_for_agent(view: &ViewModel, agent: AgentType) -> Vec<&Event> {
    view.events().filter(|e| e.agent_type == agent).collect()
}

pub fn findings_for_agent(view: &ViewModel, agent: AgentType) -> Vec<&Finding> {
    view.findings().filter(|f| f.agent_type == agent).collect()
}

pub fn finding<'a>(view: &'a ViewModel, id: &str) -> Option<&'a Finding> {
    view.findings().find(|f| f.id == id)
}

/// Most severe first, then newest first. Ties fall back to id for a stable order.
pub fn sort_by_severity(findings: &mut [&Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn findings_by_severity(view: &ViewModel) -> Vec<&Finding> {
    let mut findings: Vec<&Finding> = view.findings().collect();
    sort_by_severity(&mut findings);
    findings
}

/// The `k` most recent events, newest first.
pub fn recent_events(view: &ViewModel, k: usize) -> Vec<&Event> {
    view.events().rev().take(k).collect()
}

/// Findings grouped by severity, most severe group first.
pub fn group_by_severity(view: &ViewModel) -> Vec<(Severity, Vec<&Finding>)> {
    let mut groups: BTreeMap<Reverse<Severity>, Vec<&Finding>> = BTreeMap::new();
    for finding in findings_by_severity(view) {
        groups.entry(Reverse(finding.severity)).or_default().push(finding);
    }
    groups.into_iter().map(|(Reverse(s), f)| (s, f)).collect()
}

/// An agent's events carrying a screenshot image, oldest first.
pub fn screenshot_events(view: &ViewModel, agent: AgentType) -> Vec<&Event> {
    view.events()
        .filter(|e| e.agent_type == agent && e.image().is_some())
        .collect()
}

/// Progress steps of one agent, oldest first. Falls back to every INFO
/// event when no message looks like a step.
pub fn agent_highlights(view: &ViewModel, agent: AgentType) -> Vec<&Event> {
    let events = events_for_agent(view, agent);
    let steps: Vec<&Event> = events
        .iter()
        .copied()
        .filter(|e| HIGHLIGHT_MARKERS.iter().any(|m| e.message.contains(m)))
        .collect();
    if !steps.is_empty() {
        return steps;
    }
    events.into_iter().filter(|e| e.event_type == EventType::Info).collect()
}
