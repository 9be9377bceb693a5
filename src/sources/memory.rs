//! In-process backend implementing both data sources over one shared store.
//!
//! Used by the replay command and by tests of the live driver. Writes can be
//! stored and published together, stored without a notification (a "missed"
//! delivery that only the next poll reveals), or published without being
//! stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChannelItem, SnapshotSource, Subscription, UpdateChannel, record_run_id};
use crate::core::{EntityKind, Notification, Snapshot, SourceError};

const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Default)]
struct Store {
    runs: HashMap<String, Value>,
    sessions: Vec<Value>,
    events: Vec<Value>,
    findings: Vec<Value>,
    subscribers: Vec<(String, mpsc::Sender<ChannelItem>)>,
    failing_fetches: usize,
    fetches: usize,
}

impl Store {
    fn upsert(&mut self, notification: &Notification) {
        let record = notification.record.clone();
        match notification.kind {
            EntityKind::Run => {
                if let Some(id) = record_id(&record) {
                    self.runs.insert(id.to_string(), record);
                }
            }
            EntityKind::AgentSession => upsert_by_id(&mut self.sessions, record),
            EntityKind::Event => upsert_by_id(&mut self.events, record),
            EntityKind::Finding => upsert_by_id(&mut self.findings, record),
        }
    }

    fn publish(&mut self, notification: &Notification) {
        let run = record_run_id(notification).map(str::to_string);
        self.subscribers.retain(|(subscribed, tx)| {
            if tx.is_closed() {
                return false;
            }
            if run.as_deref().is_some_and(|r| r != subscribed) {
                return true;
            }
            // A full buffer drops the notification, like a lossy channel.
            if tx.try_send(Ok(notification.clone())).is_err() {
                tracing::debug!(run = %subscribed, "subscriber lagging, notification dropped");
            }
            true
        });
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores the record and notifies subscribers.
    pub fn write(&self, notification: Notification) {
        let mut store = self.lock();
        store.upsert(&notification);
        store.publish(&notification);
    }

    /// Stores the record without notifying anyone.
    pub fn write_silently(&self, notification: Notification) {
        self.lock().upsert(&notification);
    }

    /// Notifies subscribers without storing the record.
    pub fn publish_only(&self, notification: Notification) {
        self.lock().publish(&notification);
    }

    /// Makes the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.lock().failing_fetches = n;
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn subscriber_count(&self) -> usize {
        let mut store = self.lock();
        store.subscribers.retain(|(_, tx)| !tx.is_closed());
        store.subscribers.len()
    }

    /// Ends every live subscription, as a dropped connection would.
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }
}

#[async_trait]
impl SnapshotSource for MemoryBackend {
    async fn fetch(&self, run_id: &str, event_limit: usize) -> Result<Snapshot, SourceError> {
        let mut store = self.lock();
        store.fetches += 1;
        if store.failing_fetches > 0 {
            store.failing_fetches -= 1;
            return Err(SourceError::Unavailable("injected fetch failure".to_string()));
        }

        let belongs = |v: &&Value| v.get("run_id").and_then(Value::as_str) == Some(run_id);

        let mut run_events: Vec<Value> = store.events.iter().filter(belongs).cloned().collect();
        run_events.sort_by_key(|v| std::cmp::Reverse(created_at(v)));
        run_events.truncate(event_limit);

        let mut findings: Vec<Value> = store.findings.iter().filter(belongs).cloned().collect();
        findings.sort_by_key(created_at);

        Ok(Snapshot {
            run: store.runs.get(run_id).cloned(),
            agent_sessions: store.sessions.iter().filter(belongs).cloned().collect(),
            run_events,
            findings,
        })
    }
}

#[async_trait]
impl UpdateChannel for MemoryBackend {
    async fn subscribe(&self, run_id: &str) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock().subscribers.push((run_id.to_string(), tx));
        Ok(Subscription::new(rx, None))
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id")?.as_str()
}

fn created_at(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("created_at")?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()
}

fn upsert_by_id(rows: &mut Vec<Value>, record: Value) {
    let id = record_id(&record).map(str::to_string);
    match id.and_then(|id| rows.iter().position(|r| record_id(r) == Some(id.as_str()))) {
        Some(idx) => rows[idx] = record,
        None => rows.push(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{AgentType, RunStatus, Severity};
    use crate::core::state::fixtures::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn fetch_returns_newest_events_first_and_bounded() {
        let backend = MemoryBackend::new();
        backend.write(Notification::insert(EntityKind::Run, &run(RunStatus::Running)));
        for i in 0..5 {
            backend.write(Notification::insert(EntityKind::Event, &event(&format!("e{}", i), i)));
        }

        let snapshot = backend.fetch(RUN, 3).await.unwrap();
        let ids: Vec<_> = snapshot
            .run_events
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["e4", "e3", "e2"]);
        assert!(snapshot.run.is_some());
    }

    #[tokio::test]
    async fn silent_write_reaches_fetch_but_not_subscribers() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe(RUN).await.unwrap();
        backend.write_silently(Notification::insert(
            EntityKind::Finding,
            &finding("f1", AgentType::Sqli, Severity::High, 1),
        ));
        backend.write(Notification::insert(
            EntityKind::Finding,
            &finding("f2", AgentType::Sqli, Severity::Low, 2),
        ));

        let delivered = sub.next().await.unwrap().unwrap();
        assert_eq!(delivered.record["id"], "f2");
        assert_eq!(backend.fetch(RUN, 10).await.unwrap().findings.len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let backend = MemoryBackend::new();
        backend.fail_next_fetches(1);
        assert!(backend.fetch(RUN, 10).await.is_err());
        assert!(backend.fetch(RUN, 10).await.is_ok());
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test]
    async fn dropped_subscription_is_forgotten() {
        let backend = MemoryBackend::new();
        let sub = backend.subscribe(RUN).await.unwrap();
        assert_eq!(backend.subscriber_count(), 1);
        drop(sub);
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn other_runs_are_not_delivered() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe(RUN).await.unwrap();
        let mut foreign = event("x", 1);
        foreign.run_id = "run-2".to_string();
        backend.write(Notification::insert(EntityKind::Event, &foreign));
        backend.write(Notification::insert(EntityKind::Event, &event("mine", 2)));

        let delivered = sub.next().await.unwrap().unwrap();
        assert_eq!(delivered.record["id"], "mine");
    }
}
