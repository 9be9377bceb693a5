//! Merges snapshot fetches and channel notifications into one view model.
//!
//! Every merge is a set union keyed by identity: snapshots may reveal records
//! the channel missed but never retract anything already known. Run records
//! carry no version, so the last applied Run wins even if an older snapshot
//! races a newer notification; the next poll corrects it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::RecordError;
use super::events::{Delivery, Diagnostic, EntityKind, Notification, Origin, Snapshot};
use super::models::{AgentSession, Event, Finding, Run};
use super::state::{EventMerge, ViewModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing applied yet.
    Initializing,
    /// At least one fetch or delivery applied.
    Live,
    /// The run reached a terminal status. One final snapshot is still merged,
    /// after which the view is frozen.
    Terminal { finalized: bool },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminal { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "INITIALIZING",
            Phase::Live => "LIVE",
            Phase::Terminal { .. } => "TERMINAL",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// The view model content differs from before the delivery.
    pub changed: bool,
    /// Records merged or recognised as duplicates.
    pub accepted: usize,
    pub diagnostics: Vec<Diagnostic>,
    /// This delivery moved the view into the terminal phase.
    pub entered_terminal: bool,
    /// The delivery counted as a successful landing, changed or not.
    pub applied: bool,
}

impl ApplyOutcome {
    fn record(&mut self, origin: Origin, result: Result<bool, RecordError>) {
        match result {
            Ok(changed) => {
                self.accepted += 1;
                self.changed |= changed;
            }
            Err(error) => self.diagnostics.push(Diagnostic::Rejected { origin, error }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciler {
    view: ViewModel,
    phase: Phase,
    last_applied_at: Option<DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(run_id: impl Into<String>, event_limit: usize) -> Self {
        Self {
            view: ViewModel::new(run_id, event_limit),
            phase: Phase::Initializing,
            last_applied_at: None,
        }
    }

    pub fn view(&self) -> &ViewModel {
        &self.view
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Wall-clock time of the last successfully applied delivery.
    pub fn last_applied_at(&self) -> Option<DateTime<Utc>> {
        self.last_applied_at
    }

    /// True once the final pass after the terminal transition has been merged.
    pub fn is_final(&self) -> bool {
        self.phase == Phase::Terminal { finalized: true }
    }

    pub fn apply(&mut self, delivery: Delivery, at: DateTime<Utc>) -> ApplyOutcome {
        let origin = delivery.origin();

        match (self.phase, &delivery) {
            (Phase::Terminal { finalized: true }, _)
            | (Phase::Terminal { finalized: false }, Delivery::Notification(_)) => {
                tracing::debug!(run = %self.view.run_id(), %origin, "delivery after terminal ignored");
                return ApplyOutcome {
                    diagnostics: vec![Diagnostic::IgnoredAfterTerminal { origin }],
                    ..ApplyOutcome::default()
                };
            }
            _ => {}
        }

        let mut outcome = ApplyOutcome::default();
        let successful = match delivery {
            Delivery::Snapshot(snapshot) => {
                self.merge_snapshot(snapshot, &mut outcome);
                true
            }
            Delivery::Notification(notification) => self.merge_notification(notification, &mut outcome),
        };

        if outcome.changed {
            self.view.bump();
        }
        if successful {
            self.last_applied_at = Some(at);
            outcome.applied = true;
        }

        self.phase = match self.phase {
            Phase::Terminal { .. } => {
                tracing::info!(run = %self.view.run_id(), "final reconciliation pass merged");
                Phase::Terminal { finalized: true }
            }
            current => {
                let terminal = self.view.run().is_some_and(|r| r.status.is_terminal());
                if terminal {
                    outcome.entered_terminal = true;
                    tracing::info!(run = %self.view.run_id(), "run reached a terminal status");
                    Phase::Terminal { finalized: false }
                } else if successful {
                    Phase::Live
                } else {
                    current
                }
            }
        };

        tracing::debug!(
            run = %self.view.run_id(),
            %origin,
            accepted = outcome.accepted,
            rejected = outcome.diagnostics.len(),
            changed = outcome.changed,
            revision = self.view.revision(),
            "delivery applied"
        );
        outcome
    }

    fn merge_snapshot(&mut self, snapshot: Snapshot, outcome: &mut ApplyOutcome) {
        let origin = Origin::Snapshot;
        if let Some(run) = snapshot.run {
            let result = self.merge_run(run, outcome);
            outcome.record(origin, result);
        }
        for session in snapshot.agent_sessions {
            let result = self.merge_session(session, outcome);
            outcome.record(origin, result);
        }
        for event in snapshot.run_events {
            let result = self.merge_event(event);
            outcome.record(origin, result);
        }
        for finding in snapshot.findings {
            let result = self.merge_finding(finding);
            outcome.record(origin, result);
        }
    }

    /// Returns whether the record was accepted.
    fn merge_notification(&mut self, notification: Notification, outcome: &mut ApplyOutcome) -> bool {
        // Events and findings are immutable: an UPDATE for one is treated
        // like a redelivered INSERT.
        let result = match notification.kind {
            EntityKind::Run => self.merge_run(notification.record, outcome),
            EntityKind::AgentSession => self.merge_session(notification.record, outcome),
            EntityKind::Event => self.merge_event(notification.record),
            EntityKind::Finding => self.merge_finding(notification.record),
        };
        let accepted = result.is_ok();
        outcome.record(Origin::Channel, result);
        accepted
    }

    fn merge_run(&mut self, raw: Value, outcome: &mut ApplyOutcome) -> Result<bool, RecordError> {
        let run: Run = decode(EntityKind::Run, raw)?;
        require_id(EntityKind::Run, &run.id)?;
        if run.id != self.view.run_id() {
            return Err(RecordError::ForeignRun {
                kind: EntityKind::Run,
                id: run.id.clone(),
                expected: self.view.run_id().to_string(),
                found: run.id,
            });
        }

        let consistent = run.end_consistent();
        let (status, ended_at) = (run.status, run.ended_at);
        let changed = self.view.replace_run(run);
        if changed && !consistent {
            outcome.diagnostics.push(Diagnostic::RunEndMismatch { status, ended_at });
        }
        Ok(changed)
    }

    fn merge_session(&mut self, raw: Value, outcome: &mut ApplyOutcome) -> Result<bool, RecordError> {
        let session: AgentSession = decode(EntityKind::AgentSession, raw)?;
        require_id(EntityKind::AgentSession, &session.id)?;
        self.require_run(EntityKind::AgentSession, &session.id, &session.run_id)?;
        if session.progress > 100 {
            return Err(RecordError::ProgressOutOfRange {
                id: session.id,
                progress: session.progress,
            });
        }

        let over = session.over_budget().then(|| Diagnostic::BudgetExceeded {
            agent: session.agent_type,
            requests_used: session.requests_used,
            budget: session.budget,
        });
        let changed = self.view.upsert_session(session)?;
        if changed {
            outcome.diagnostics.extend(over);
        }
        Ok(changed)
    }

    fn merge_event(&mut self, raw: Value) -> Result<bool, RecordError> {
        let event: Event = decode(EntityKind::Event, raw)?;
        require_id(EntityKind::Event, &event.id)?;
        self.require_run(EntityKind::Event, &event.id, &event.run_id)?;
        Ok(self.view.insert_event(event) == EventMerge::Inserted)
    }

    fn merge_finding(&mut self, raw: Value) -> Result<bool, RecordError> {
        let finding: Finding = decode(EntityKind::Finding, raw)?;
        require_id(EntityKind::Finding, &finding.id)?;
        self.require_run(EntityKind::Finding, &finding.id, &finding.run_id)?;
        Ok(self.view.insert_finding(finding))
    }

    fn require_run(&self, kind: EntityKind, id: &str, run_id: &str) -> Result<(), RecordError> {
        if run_id == self.view.run_id() {
            return Ok(());
        }
        Err(RecordError::ForeignRun {
            kind,
            id: id.to_string(),
            expected: self.view.run_id().to_string(),
            found: run_id.to_string(),
        })
    }
}

/// Pure form of [`Reconciler::apply`]: consumes the current state and returns
/// the next one.
pub fn reduce(
    mut reconciler: Reconciler,
    delivery: Delivery,
    at: DateTime<Utc>,
) -> (Reconciler, ApplyOutcome) {
    let outcome = reconciler.apply(delivery, at);
    (reconciler, outcome)
}

fn decode<T: DeserializeOwned>(kind: EntityKind, raw: Value) -> Result<T, RecordError> {
    serde_json::from_value(raw).map_err(|e| RecordError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn require_id(kind: EntityKind, id: &str) -> Result<(), RecordError> {
    if id.trim().is_empty() {
        return Err(RecordError::MissingIdentity { kind });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{AgentStatus, AgentType, RunStatus, Severity};
    use crate::core::state::fixtures::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn to_value<T: serde::Serialize>(v: &T) -> Value {
        serde_json::to_value(v).unwrap()
    }

    fn snapshot_with_events(ids: &[(&str, i64)]) -> Delivery {
        Delivery::Snapshot(Snapshot {
            run: Some(to_value(&run(RunStatus::Running))),
            agent_sessions: vec![],
            run_events: ids.iter().rev().map(|(id, s)| to_value(&event(id, *s))).collect(),
            findings: vec![],
        })
    }

    fn channel_event(id: &str, secs: i64) -> Delivery {
        Delivery::Notification(Notification::insert(EntityKind::Event, &event(id, secs)))
    }

    fn channel_finding(id: &str, secs: i64) -> Delivery {
        Delivery::Notification(Notification::insert(
            EntityKind::Finding,
            &finding(id, AgentType::Xss, Severity::Medium, secs),
        ))
    }

    #[test]
    fn starts_initializing_and_goes_live_on_first_snapshot() {
        let mut rec = Reconciler::new(RUN, 200);
        assert_eq!(rec.phase(), Phase::Initializing);
        rec.apply(Delivery::Snapshot(Snapshot::default()), at(1));
        assert_eq!(rec.phase(), Phase::Live);
        assert_eq!(rec.last_applied_at(), Some(at(1)));
    }

    #[test]
    fn malformed_notification_does_not_go_live() {
        let mut rec = Reconciler::new(RUN, 200);
        let outcome = rec.apply(
            Delivery::Notification(Notification {
                kind: EntityKind::Finding,
                change: crate::core::events::ChangeKind::Insert,
                record: json!({"id": "f1", "severity": "SEVERE"}),
            }),
            at(1),
        );
        assert_eq!(rec.phase(), Phase::Initializing);
        assert!(!outcome.changed);
        assert!(matches!(
            outcome.diagnostics.as_slice(),
            [Diagnostic::Rejected { origin: Origin::Channel, error: RecordError::Malformed { .. } }]
        ));
        assert_eq!(rec.last_applied_at(), None);
    }

    #[test]
    fn bad_record_in_snapshot_leaves_the_rest_intact() {
        let mut rec = Reconciler::new(RUN, 200);
        let snapshot = Snapshot {
            run: Some(to_value(&run(RunStatus::Running))),
            agent_sessions: vec![
                json!({"id": "s1", "run_id": RUN, "agent_type": "sqli", "status": "EXPLODED"}),
                to_value(&session("s2", AgentType::Xss, AgentStatus::Running, 5)),
            ],
            run_events: vec![json!({"id": "e0"}), to_value(&event("e1", 1))],
            findings: vec![to_value(&finding("f1", AgentType::Xss, Severity::Low, 2))],
        };
        let outcome = rec.apply(Delivery::Snapshot(snapshot), at(3));

        assert_eq!(outcome.diagnostics.len(), 2);
        assert_eq!(outcome.accepted, 4);
        assert_eq!(rec.view().sessions().len(), 1);
        assert_eq!(rec.view().event_count(), 1);
        assert_eq!(rec.view().finding_count(), 1);
    }

    #[test]
    fn foreign_records_are_rejected() {
        let mut rec = Reconciler::new(RUN, 200);
        let mut other = finding("f1", AgentType::Sqli, Severity::High, 1);
        other.run_id = "run-2".to_string();
        let outcome = rec.apply(
            Delivery::Notification(Notification::insert(EntityKind::Finding, &other)),
            at(1),
        );
        assert!(matches!(
            outcome.diagnostics[0],
            Diagnostic::Rejected { error: RecordError::ForeignRun { .. }, .. }
        ));
        assert_eq!(rec.view().finding_count(), 0);
    }

    #[test]
    fn progress_over_hundred_is_rejected() {
        let mut rec = Reconciler::new(RUN, 200);
        let outcome = rec.apply(
            Delivery::Notification(Notification::update(
                EntityKind::AgentSession,
                &session("s1", AgentType::Sqli, AgentStatus::Running, 140),
            )),
            at(1),
        );
        assert!(matches!(
            outcome.diagnostics[0],
            Diagnostic::Rejected { error: RecordError::ProgressOutOfRange { progress: 140, .. }, .. }
        ));
    }

    #[test]
    fn budget_overrun_is_reported_but_kept() {
        let mut rec = Reconciler::new(RUN, 200);
        let mut s = session("s1", AgentType::AuthAbuse, AgentStatus::Running, 50);
        s.requests_used = 120;
        s.budget = 100;
        let outcome = rec.apply(
            Delivery::Notification(Notification::update(EntityKind::AgentSession, &s)),
            at(1),
        );
        assert_eq!(rec.view().sessions().len(), 1);
        assert_eq!(
            outcome.diagnostics,
            vec![Diagnostic::BudgetExceeded {
                agent: AgentType::AuthAbuse,
                requests_used: 120,
                budget: 100,
            }]
        );
    }

    #[test]
    fn terminal_run_without_end_is_reported() {
        let mut rec = Reconciler::new(RUN, 200);
        let mut r = run(RunStatus::Failed);
        r.ended_at = None;
        let outcome = rec.apply(
            Delivery::Notification(Notification::update(EntityKind::Run, &r)),
            at(1),
        );
        assert!(outcome.diagnostics.contains(&Diagnostic::RunEndMismatch {
            status: RunStatus::Failed,
            ended_at: None,
        }));
        assert!(rec.phase().is_terminal());
    }

    #[test]
    fn same_event_from_snapshot_and_channel_is_kept_once() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(snapshot_with_events(&[("e1", 1)]), at(1));
        let outcome = rec.apply(channel_event("e1", 1), at(2));

        assert!(!outcome.changed);
        assert_eq!(outcome.accepted, 1);
        let ids: Vec<_> = rec.view().events().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["e1".to_string()]);
    }

    #[test]
    fn repeated_snapshot_is_idempotent() {
        let mut rec = Reconciler::new(RUN, 200);
        let delivery = snapshot_with_events(&[("e1", 1), ("e2", 2)]);
        rec.apply(delivery.clone(), at(1));
        let before = rec.view().clone();
        let outcome = rec.apply(delivery, at(2));
        assert!(!outcome.changed);
        assert_eq!(rec.view(), &before);
    }

    #[test]
    fn unchanged_redelivery_at_the_same_instant_still_counts_as_applied() {
        let mut rec = Reconciler::new(RUN, 200);
        let delivery = snapshot_with_events(&[("e1", 1)]);
        assert!(rec.apply(delivery.clone(), at(5)).applied);

        let again = rec.apply(delivery, at(5));
        assert!(again.applied);
        assert!(!again.changed);
        assert_eq!(rec.last_applied_at(), Some(at(5)));

        let rejected = rec.apply(
            Delivery::Notification(Notification {
                kind: EntityKind::Event,
                change: crate::core::events::ChangeKind::Insert,
                record: json!({"id": ""}),
            }),
            at(6),
        );
        assert!(!rejected.applied);
    }

    #[test]
    fn snapshot_never_retracts_channel_records() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(channel_finding("f-live", 5), at(1));
        rec.apply(snapshot_with_events(&[("e1", 1)]), at(2));
        assert!(rec.view().contains_finding("f-live"));
        assert!(rec.view().contains_event("e1"));
    }

    #[test]
    fn example_scenario_sqli_critical() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(
            Delivery::Snapshot(Snapshot {
                run: Some(to_value(&run(RunStatus::Running))),
                agent_sessions: vec![json!({
                    "id": "s1", "run_id": RUN, "agent_type": "sqli",
                    "status": "RUNNING", "progress": 40, "requests_used": 3, "budget": 50,
                })],
                ..Snapshot::default()
            }),
            at(1),
        );
        rec.apply(
            Delivery::Notification(Notification {
                kind: EntityKind::Finding,
                change: crate::core::events::ChangeKind::Insert,
                record: json!({
                    "id": "f1", "run_id": RUN, "agent_type": "SQLiAgent", "severity": "CRITICAL",
                    "title": "SQL injection", "evidence": "' OR 1=1", "recommendation": "parameterise",
                    "created_at": "2025-01-01T00:00:00Z",
                }),
            }),
            at(2),
        );

        let view = rec.view();
        assert_eq!(view.session_for(AgentType::Sqli).map(|s| s.progress), Some(40));
        let f = view.findings().next().unwrap();
        assert_eq!(f.agent_type, AgentType::Sqli);
        assert_eq!(f.severity, Severity::Critical);
    }

    #[test]
    fn terminal_lock_allows_exactly_one_final_snapshot() {
        let mut rec = Reconciler::new(RUN, 200);
        rec.apply(snapshot_with_events(&[("e1", 1)]), at(1));
        let outcome = rec.apply(
            Delivery::Notification(Notification::update(EntityKind::Run, &run(RunStatus::Completed))),
            at(2),
        );
        assert!(outcome.entered_terminal);
        assert_eq!(rec.phase(), Phase::Terminal { finalized: false });

        // Late channel traffic is ignored while waiting for the final pass.
        let ignored = rec.apply(channel_event("late", 3), at(3));
        assert!(!ignored.changed);
        assert!(!rec.view().contains_event("late"));

        let final_pass = Delivery::Snapshot(Snapshot {
            run: Some(to_value(&run(RunStatus::Completed))),
            run_events: vec![to_value(&event("last-write", 4))],
            ..Snapshot::default()
        });
        rec.apply(final_pass, at(4));
        assert!(rec.is_final());
        assert!(rec.view().contains_event("last-write"));

        let frozen = rec.view().clone();
        rec.apply(snapshot_with_events(&[("after", 9)]), at(9));
        rec.apply(channel_finding("f-after", 9), at(9));
        assert_eq!(rec.view(), &frozen);
    }

    #[test]
    fn reduce_matches_apply() {
        let rec = Reconciler::new(RUN, 200);
        let (rec, outcome) = reduce(rec, channel_event("e1", 1), at(1));
        assert!(outcome.changed);
        assert_eq!(rec.view().revision(), 1);
    }

    fn apply_all(limit: usize, deliveries: &[Delivery]) -> (Vec<String>, Vec<String>) {
        let mut rec = Reconciler::new(RUN, limit);
        for d in deliveries {
            rec.apply(d.clone(), at(0));
        }
        let events = rec.view().events().map(|e| e.id.clone()).collect();
        let mut findings: Vec<String> = rec.view().findings().map(|f| f.id.clone()).collect();
        findings.sort();
        (events, findings)
    }

    fn delivery_strategy() -> impl Strategy<Value = Delivery> {
        prop_oneof![
            (0u8..30, 0i64..50).prop_map(|(id, s)| channel_event(&format!("e{}", id), s + i64::from(id) * 100)),
            (0u8..10, 0i64..50).prop_map(|(id, s)| channel_finding(&format!("f{}", id), s)),
            proptest::collection::vec(0u8..30, 0..8).prop_map(|ids| {
                let pairs: Vec<(String, i64)> = ids
                    .into_iter()
                    .map(|id| (format!("e{}", id), i64::from(id) * 100))
                    .collect();
                let refs: Vec<(&str, i64)> = pairs.iter().map(|(id, s)| (id.as_str(), *s)).collect();
                snapshot_with_events(&refs)
            }),
        ]
    }

    proptest! {
        #[test]
        fn union_is_independent_of_delivery_order(
            deliveries in proptest::collection::vec(delivery_strategy(), 0..40),
            seed in any::<u64>(),
        ) {
            // Events are keyed by a per-id timestamp so every delivery of an id
            // carries the same record.
            let deliveries: Vec<Delivery> = deliveries
                .into_iter()
                .map(|d| match d {
                    Delivery::Notification(mut n) if n.kind == EntityKind::Event => {
                        let id = n.record["id"].as_str().unwrap().to_string();
                        let n_id: i64 = id[1..].parse().unwrap();
                        n.record = to_value(&event(&id, n_id * 100));
                        Delivery::Notification(n)
                    }
                    Delivery::Notification(mut n) => {
                        let id = n.record["id"].as_str().unwrap().to_string();
                        n.record = to_value(&finding(&id, AgentType::Xss, Severity::Medium, 7));
                        Delivery::Notification(n)
                    }
                    other => other,
                })
                .collect();

            let mut shuffled = deliveries.clone();
            let len = shuffled.len();
            if len > 1 {
                let mut state = seed;
                for i in (1..len).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (state >> 33) as usize % (i + 1);
                    shuffled.swap(i, j);
                }
            }

            prop_assert_eq!(apply_all(5, &deliveries), apply_all(5, &shuffled));
            prop_assert_eq!(apply_all(500, &deliveries), apply_all(500, &shuffled));
        }

        #[test]
        fn retention_keeps_the_most_recent(limit in 1usize..20, extra in 1usize..20) {
            let mut rec = Reconciler::new(RUN, limit);
            let total = limit + extra;
            for i in 0..total {
                rec.apply(channel_event(&format!("e{:03}", i), i as i64), at(0));
            }
            let ids: Vec<String> = rec.view().events().map(|e| e.id.clone()).collect();
            let expected: Vec<String> = (extra..total).map(|i| format!("e{:03}", i)).collect();
            prop_assert_eq!(ids.len(), limit);
            prop_assert_eq!(ids, expected);
        }

        #[test]
        fn redelivery_never_changes_membership(ids in proptest::collection::vec(0u8..20, 1..20)) {
            let mut rec = Reconciler::new(RUN, 200);
            for id in &ids {
                rec.apply(channel_finding(&format!("f{}", id), 1), at(0));
            }
            let before = rec.view().clone();
            for id in &ids {
                let outcome = rec.apply(channel_finding(&format!("f{}", id), 1), at(0));
                prop_assert!(!outcome.changed);
            }
            prop_assert_eq!(rec.view(), &before);
        }
    }
}
