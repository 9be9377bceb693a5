use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{Notification, Snapshot, SourceError};

pub mod jsonl;
pub mod memory;
pub mod replay;
pub mod rest;

pub use jsonl::JsonLinesChannel;
pub use memory::MemoryBackend;
pub use replay::Scenario;
pub use rest::RestSnapshotSource;

pub type ChannelItem = Result<Notification, SourceError>;

/// Pull side: the complete current state of one run.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Events come back newest first, at most `event_limit` of them. Must be
    /// repeatable and free of side effects on the backend.
    async fn fetch(&self, run_id: &str, event_limit: usize) -> Result<Snapshot, SourceError>;
}

/// Push side: incremental change notifications for one run.
#[async_trait]
pub trait UpdateChannel: Send + Sync {
    async fn subscribe(&self, run_id: &str) -> Result<Subscription, SourceError>;

    /// Whether a subscription that ended should be re-established. Finite
    /// feeds return false.
    fn resumable(&self) -> bool {
        true
    }
}

/// A live subscription. Dropping it tears the delivery down.
pub struct Subscription {
    rx: mpsc::Receiver<ChannelItem>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChannelItem>, pump: Option<JoinHandle<()>>) -> Self {
        Self { rx, pump }
    }

    pub async fn next(&mut self) -> Option<ChannelItem> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run identity carried by a raw record: `id` for runs, `run_id` otherwise.
pub(crate) fn record_run_id(notification: &Notification) -> Option<&str> {
    let field = match notification.kind {
        crate::core::EntityKind::Run => "id",
        _ => "run_id",
    };
    notification.record.get(field)?.as_str()
}
