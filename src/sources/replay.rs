use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::MemoryBackend;
use crate::core::{EntityKind, Notification};

/// How a scripted step reaches the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Stored and pushed.
    #[default]
    Normal,
    /// Stored only; the dashboard sees it on the next poll.
    Silent,
    /// Pushed only; never visible to polling.
    ChannelOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub after_ms: u64,
    #[serde(default)]
    pub mode: StepMode,
    #[serde(flatten)]
    pub notification: Notification,
}

/// A scripted run fed through a [`MemoryBackend`], for demos and offline checks.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub run_id: String,
    #[serde(default)]
    pub initial: Vec<Notification>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(content)?;
        if scenario.run_id.trim().is_empty() {
            anyhow::bail!("scenario run_id must not be empty");
        }
        Ok(scenario)
    }

    /// Total scripted duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.steps.iter().map(|s| s.after_ms).sum())
    }

    /// Writes the initial records without notifying anyone.
    pub fn seed(&self, backend: &MemoryBackend) {
        for notification in &self.initial {
            backend.write_silently(stamped(notification.clone()));
        }
    }

    /// Plays the steps in the background. Each `after_ms` is relative to the
    /// previous step.
    pub fn play(&self, backend: MemoryBackend) -> JoinHandle<()> {
        let steps = self.steps.clone();
        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            for (i, step) in steps.into_iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
                let notification = stamped(step.notification);
                tracing::debug!(run = %run_id, step = i, kind = %notification.kind, mode = ?step.mode, "replay step");
                match step.mode {
                    StepMode::Normal => backend.write(notification),
                    StepMode::Silent => backend.write_silently(notification),
                    StepMode::ChannelOnly => backend.publish_only(notification),
                }
            }
            tracing::info!(run = %run_id, "replay finished");
        })
    }
}

/// Events and findings written without a `created_at` get the current time.
fn stamped(mut notification: Notification) -> Notification {
    if matches!(notification.kind, EntityKind::Event | EntityKind::Finding) {
        if let Value::Object(map) = &mut notification.record {
            map.entry("created_at")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }
    }
    notification
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChangeKind;
    use crate::sources::{SnapshotSource, UpdateChannel};

    const SCENARIO: &str = r#"
run_id: run-demo
initial:
  - kind: run
    change: insert
    record: { id: run-demo, status: RUNNING, target: "https://shop.test" }
steps:
  - after_ms: 100
    kind: finding
    change: insert
    record: { id: f1, run_id: run-demo, agent_type: SQLiAgent, severity: CRITICAL, title: SQLi }
  - after_ms: 50
    mode: silent
    table: run_events
    type: INSERT
    record: { id: e1, run_id: run-demo, agent_type: sqli, event_type: INFO, message: probing }
"#;

    #[test]
    fn parses_both_notification_spellings() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        assert_eq!(scenario.run_id, "run-demo");
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.steps[1].mode, StepMode::Silent);
        assert_eq!(scenario.steps[1].notification.change, ChangeKind::Insert);
        assert_eq!(scenario.duration(), Duration::from_millis(150));
    }

    #[test]
    fn empty_run_id_is_rejected() {
        assert!(Scenario::parse("run_id: ' '\n").is_err());
    }

    #[test]
    fn stamping_only_touches_timestamped_kinds() {
        let run = stamped(Notification {
            kind: EntityKind::Run,
            change: ChangeKind::Insert,
            record: serde_json::json!({"id": "r"}),
        });
        assert!(run.record.get("created_at").is_none());

        let event = stamped(Notification {
            kind: EntityKind::Event,
            change: ChangeKind::Insert,
            record: serde_json::json!({"id": "e", "created_at": "2025-01-01T00:00:00Z"}),
        });
        assert_eq!(event.record["created_at"], "2025-01-01T00:00:00Z");
    }

    #[tokio::test(start_paused = true)]
    async fn play_writes_steps_in_order() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let backend = MemoryBackend::new();
        scenario.seed(&backend);
        let mut sub = backend.subscribe("run-demo").await.unwrap();

        scenario.play(backend.clone()).await.unwrap();

        let pushed = sub.next().await.unwrap().unwrap();
        assert_eq!(pushed.record["id"], "f1");
        let snapshot = backend.fetch("run-demo", 10).await.unwrap();
        assert!(snapshot.run.is_some());
        assert_eq!(snapshot.findings.len(), 1);
        assert_eq!(snapshot.run_events.len(), 1);
    }
}
