//! Derived numbers for the dashboard. Every function here is pure and total:
//! the same view and clock always produce the same metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::ViewModel;
use crate::core::models::{AgentStatus, AgentType, EventType, Run, Severity};

/// Time since the run started, frozen at `ended_at` once the run is terminal.
pub fn elapsed(run: Option<&Run>, now: DateTime<Utc>) -> Duration {
    let Some(run) = run else {
        return Duration::ZERO;
    };
    let Some(started) = run.started_at else {
        return Duration::ZERO;
    };
    let end = match run.ended_at {
        Some(ended) if run.status.is_terminal() => ended,
        _ => now,
    };
    (end - started).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn tally<'a>(severities: impl IntoIterator<Item = &'a Severity>) -> Self {
        let mut counts = Self::default();
        for severity in severities {
            *counts.slot(*severity) += 1;
        }
        counts
    }

    fn slot(&mut self, severity: Severity) -> &mut usize {
        match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
            Severity::Info => &mut self.info,
        }
    }

    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.info
    }

    /// `25·C + 15·H + 8·M + 3·L + 1·I`, unclamped.
    pub fn weighted(&self) -> u64 {
        Severity::DESCENDING
            .iter()
            .map(|s| self.get(*s) as u64 * u64::from(s.weight()))
            .sum()
    }
}

/// Weighted sum clamped to 100. The web dashboard's header "Security Index"
/// weighted INFO findings differently; here both scores share one weighting so
/// they stay complements.
pub fn risk_score(counts: &SeverityCounts) -> u8 {
    counts.weighted().min(100) as u8
}

/// `100 - risk_score`.
pub fn security_score(counts: &SeverityCounts) -> u8 {
    100 - risk_score(counts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLabel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLabel {
    pub fn from_score(risk: u8) -> Self {
        match risk {
            70.. => RiskLabel::Critical,
            40.. => RiskLabel::High,
            20.. => RiskLabel::Moderate,
            _ => RiskLabel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLabel::Low => "Low",
            RiskLabel::Moderate => "Moderate",
            RiskLabel::High => "High",
            RiskLabel::Critical => "Critical",
        }
    }
}

/// Colour band of the security score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScoreBand {
    Good,
    Fair,
    Poor,
    Bad,
}

impl ScoreBand {
    pub fn from_score(security: u8) -> Self {
        match security {
            80.. => ScoreBand::Good,
            50.. => ScoreBand::Fair,
            25.. => ScoreBand::Poor,
            _ => ScoreBand::Bad,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentCoverage {
    pub agent: AgentType,
    pub status: AgentStatus,
    pub progress: u8,
    pub requests_used: u64,
    pub budget: u64,
    pub finding_count: usize,
    pub worst: Option<Severity>,
    pub event_count: usize,
    pub screenshot_count: usize,
}

impl AgentCoverage {
    fn pending(agent: AgentType) -> Self {
        Self {
            agent,
            status: AgentStatus::Pending,
            progress: 0,
            requests_used: 0,
            budget: 0,
            finding_count: 0,
            worst: None,
            event_count: 0,
            screenshot_count: 0,
        }
    }
}

/// One row per known agent, in display order. Custom agents only appear
/// when a session for one exists.
pub fn agent_coverage(view: &ViewModel) -> Vec<AgentCoverage> {
    let mut rows: BTreeMap<AgentType, AgentCoverage> = AgentType::ALL
        .iter()
        .map(|a| (*a, AgentCoverage::pending(*a)))
        .collect();

    for session in view.sessions() {
        let row = rows
            .entry(session.agent_type)
            .or_insert_with(|| AgentCoverage::pending(session.agent_type));
        row.status = session.status;
        row.progress = session.progress;
        row.requests_used = session.requests_used;
        row.budget = session.budget;
    }

    for finding in view.findings() {
        if let Some(row) = rows.get_mut(&finding.agent_type) {
            row.finding_count += 1;
            row.worst = row.worst.max(Some(finding.severity));
        }
    }

    for event in view.events() {
        if let Some(row) = rows.get_mut(&event.agent_type) {
            row.event_count += 1;
            if event.event_type == EventType::Screenshot {
                row.screenshot_count += 1;
            }
        }
    }

    rows.into_values().collect()
}

/// Everything the dashboard shows above the feeds, computed in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub elapsed: Duration,
    pub counts: SeverityCounts,
    pub risk_score: u8,
    pub security_score: u8,
    pub risk_label: RiskLabel,
    pub score_band: ScoreBand,
    pub coverage: Vec<AgentCoverage>,
    pub total_requests: u64,
    pub agents_finished: usize,
}

impl RunMetrics {
    pub fn compute(view: &ViewModel, now: DateTime<Utc>) -> Self {
        let counts = SeverityCounts::tally(view.findings().map(|f| &f.severity));
        let risk = risk_score(&counts);
        let security = security_score(&counts);
        let coverage = agent_coverage(view);

        Self {
            elapsed: elapsed(view.run(), now),
            counts,
            risk_score: risk,
            security_score: security,
            risk_label: RiskLabel::from_score(risk),
            score_band: ScoreBand::from_score(security),
            total_requests: view.sessions().iter().map(|s| s.requests_used).sum(),
            agents_finished: view.sessions().iter().filter(|s| s.status.is_terminal()).count(),
            coverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::RunStatus;
    use crate::core::state::fixtures::*;
    use crate::core::{Delivery, EntityKind, Notification, Reconciler};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn view_with(findings: &[(AgentType, Severity)]) -> ViewModel {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(Delivery::Notification(Notification::insert(EntityKind::Run, &run(RunStatus::Running))), at(0));
        for (i, (agent, severity)) in findings.iter().enumerate() {
            rec.apply(
                Delivery::Notification(Notification::insert(
                    EntityKind::Finding,
                    &finding(&format!("f{}", i), *agent, *severity, i as i64),
                )),
                at(0),
            );
        }
        rec.view().clone()
    }

    #[test]
    fn elapsed_is_zero_without_start() {
        let mut r = run(RunStatus::Queued);
        r.started_at = None;
        assert_eq!(elapsed(Some(&r), at(100)), Duration::ZERO);
        assert_eq!(elapsed(None, at(100)), Duration::ZERO);
    }

    #[test]
    fn elapsed_freezes_at_end_for_terminal_runs() {
        let r = run(RunStatus::Completed);
        assert_eq!(elapsed(Some(&r), at(5_000)), Duration::from_secs(600));
    }

    #[test]
    fn elapsed_follows_the_clock_while_running() {
        let r = run(RunStatus::Running);
        assert_eq!(elapsed(Some(&r), at(42)), Duration::from_secs(42));
        // Clock skew never produces a negative duration.
        assert_eq!(elapsed(Some(&r), at(-5)), Duration::ZERO);
    }

    #[rstest]
    #[case(&[], 0, 100)]
    #[case(&[Severity::Critical], 25, 75)]
    #[case(&[Severity::High, Severity::Medium, Severity::Low, Severity::Info], 27, 73)]
    #[case(&[Severity::Critical; 5], 100, 0)]
    fn scores(#[case] severities: &[Severity], #[case] risk: u8, #[case] security: u8) {
        let counts = SeverityCounts::tally(severities);
        assert_eq!(risk_score(&counts), risk);
        assert_eq!(security_score(&counts), security);
    }

    #[rstest]
    #[case(0, RiskLabel::Low)]
    #[case(19, RiskLabel::Low)]
    #[case(20, RiskLabel::Moderate)]
    #[case(40, RiskLabel::High)]
    #[case(70, RiskLabel::Critical)]
    #[case(100, RiskLabel::Critical)]
    fn risk_labels(#[case] score: u8, #[case] expected: RiskLabel) {
        assert_eq!(RiskLabel::from_score(score), expected);
    }

    #[test]
    fn coverage_lists_every_agent_pending_by_default() {
        let view = ViewModel::new(RUN, 10);
        let coverage = agent_coverage(&view);
        assert_eq!(coverage.len(), AgentType::ALL.len());
        assert!(coverage.iter().all(|c| c.status == AgentStatus::Pending && c.worst.is_none()));
    }

    #[test]
    fn coverage_joins_class_names_and_tags() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(
            Delivery::Notification(Notification::insert(
                EntityKind::AgentSession,
                &serde_json::json!({
                    "id": "s1", "run_id": RUN, "agent_type": "sqli",
                    "status": "RUNNING", "progress": 40, "requests_used": 3, "budget": 50,
                }),
            )),
            at(0),
        );
        rec.apply(
            Delivery::Notification(Notification::insert(
                EntityKind::Finding,
                &serde_json::json!({
                    "id": "f1", "run_id": RUN, "agent_type": "SQLiAgent", "severity": "CRITICAL",
                    "title": "SQL injection", "created_at": "2025-01-01T00:00:00Z",
                }),
            )),
            at(1),
        );

        let metrics = RunMetrics::compute(rec.view(), at(2));
        let sqli = metrics.coverage.iter().find(|c| c.agent == AgentType::Sqli).unwrap();
        assert_eq!(sqli.progress, 40);
        assert_eq!(sqli.status, AgentStatus::Running);
        assert_eq!(sqli.finding_count, 1);
        assert_eq!(sqli.worst, Some(Severity::Critical));
        assert_eq!(metrics.risk_score, 25);
        assert_eq!(metrics.security_score, 75);
        assert_eq!(metrics.risk_label, RiskLabel::Moderate);
        assert_eq!(metrics.total_requests, 3);
    }

    #[test]
    fn custom_agent_appears_only_with_a_session() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(
            Delivery::Notification(Notification::insert(
                EntityKind::AgentSession,
                &session("s1", AgentType::Custom, AgentStatus::Queued, 0),
            )),
            at(0),
        );
        let coverage = agent_coverage(rec.view());
        assert_eq!(coverage.len(), AgentType::ALL.len() + 1);
        assert_eq!(coverage.last().map(|c| c.agent), Some(AgentType::Custom));
    }

    #[test]
    fn worst_severity_wins() {
        let view = view_with(&[
            (AgentType::Xss, Severity::Low),
            (AgentType::Xss, Severity::High),
            (AgentType::Xss, Severity::Medium),
        ]);
        let xss = agent_coverage(&view).into_iter().find(|c| c.agent == AgentType::Xss).unwrap();
        assert_eq!(xss.finding_count, 3);
        assert_eq!(xss.worst, Some(Severity::High));
    }

    fn severity() -> impl Strategy<Value = Severity> {
        proptest::sample::select(Severity::DESCENDING.to_vec())
    }

    proptest! {
        #[test]
        fn scores_are_complementary_and_bounded(severities in proptest::collection::vec(severity(), 0..30)) {
            let counts = SeverityCounts::tally(&severities);
            let risk = risk_score(&counts);
            let security = security_score(&counts);
            prop_assert!(risk <= 100 && security <= 100);
            prop_assert_eq!(u32::from(risk) + u32::from(security), 100);
            if counts.weighted() <= 100 {
                prop_assert_eq!(u64::from(risk), counts.weighted());
            }
            prop_assert_eq!(counts.total(), severities.len());
        }
    }
}
