use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::RecordError;
use super::models::{AgentType, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[serde(alias = "security_runs")]
    Run,
    #[serde(alias = "agent_sessions")]
    AgentSession,
    #[serde(alias = "run_events")]
    Event,
    #[serde(alias = "findings")]
    Finding,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Run => "run",
            EntityKind::AgentSession => "agent_session",
            EntityKind::Event => "event",
            EntityKind::Finding => "finding",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
}

/// Which input produced a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Snapshot,
    Channel,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Snapshot => "snapshot",
            Origin::Channel => "channel",
        })
    }
}

/// One change notification as it arrives on the update channel.
///
/// The record stays undecoded so that a malformed payload can be rejected on
/// its own without losing the rest of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(alias = "table")]
    pub kind: EntityKind,
    #[serde(alias = "type", alias = "eventType")]
    pub change: ChangeKind,
    #[serde(alias = "new")]
    pub record: Value,
}

impl Notification {
    pub fn insert<T: Serialize>(kind: EntityKind, record: &T) -> Self {
        Self {
            kind,
            change: ChangeKind::Insert,
            record: serde_json::to_value(record).unwrap_or(Value::Null),
        }
    }

    pub fn update<T: Serialize>(kind: EntityKind, record: &T) -> Self {
        Self {
            kind,
            change: ChangeKind::Update,
            record: serde_json::to_value(record).unwrap_or(Value::Null),
        }
    }
}

/// Full state of a run as returned by one snapshot fetch, records undecoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub run: Option<Value>,
    #[serde(default)]
    pub agent_sessions: Vec<Value>,
    /// Newest first, bounded by the requested event limit.
    #[serde(default)]
    pub run_events: Vec<Value>,
    #[serde(default)]
    pub findings: Vec<Value>,
}

impl Snapshot {
    pub fn record_count(&self) -> usize {
        usize::from(self.run.is_some())
            + self.agent_sessions.len()
            + self.run_events.len()
            + self.findings.len()
    }
}

/// Input to the reconciler: everything that may mutate the view model.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Snapshot(Snapshot),
    Notification(Notification),
}

impl Delivery {
    pub fn origin(&self) -> Origin {
        match self {
            Delivery::Snapshot(_) => Origin::Snapshot,
            Delivery::Notification(_) => Origin::Channel,
        }
    }
}

/// Observations reported on the error side channel. None of them stop the view.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Rejected { origin: Origin, error: RecordError },
    BudgetExceeded { agent: AgentType, requests_used: u64, budget: u64 },
    RunEndMismatch { status: RunStatus, ended_at: Option<DateTime<Utc>> },
    SourceFailure { origin: Origin, message: String },
    IgnoredAfterTerminal { origin: Origin },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Rejected { origin, error } => {
                write!(f, "dropped {} record: {}", origin, error)
            }
            Diagnostic::BudgetExceeded { agent, requests_used, budget } => write!(
                f,
                "agent {} used {} requests over a budget of {}",
                agent, requests_used, budget
            ),
            Diagnostic::RunEndMismatch { status, ended_at } => match ended_at {
                Some(at) => write!(f, "run is {} but reports ended_at {}", status, at),
                None => write!(f, "run is {} without ended_at", status),
            },
            Diagnostic::SourceFailure { origin, message } => {
                write!(f, "{} failed: {}", origin, message)
            }
            Diagnostic::IgnoredAfterTerminal { origin } => {
                write!(f, "{} delivery ignored, run view is final", origin)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_accepts_realtime_payload_names() {
        let n: Notification = serde_json::from_value(json!({
            "table": "findings",
            "eventType": "INSERT",
            "new": {"id": "f1"},
        }))
        .unwrap();
        assert_eq!(n.kind, EntityKind::Finding);
        assert_eq!(n.change, ChangeKind::Insert);
        assert_eq!(n.record["id"], "f1");
    }

    #[test]
    fn notification_accepts_native_names() {
        let n: Notification = serde_json::from_value(json!({
            "kind": "agent_session",
            "change": "update",
            "record": {"id": "s1"},
        }))
        .unwrap();
        assert_eq!(n.kind, EntityKind::AgentSession);
        assert_eq!(n.change, ChangeKind::Update);
    }

    #[test]
    fn snapshot_counts_records() {
        let snapshot = Snapshot {
            run: Some(json!({})),
            agent_sessions: vec![json!({}), json!({})],
            run_events: vec![json!({})],
            findings: vec![],
        };
        assert_eq!(snapshot.record_count(), 4);
    }
}
