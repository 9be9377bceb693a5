//! Live driver: runs the poller and the update channel for one run and
//! funnels both into a single reducer task that owns the reconciler.
//!
//! Observers get the reconciled state through a `watch` channel; every
//! published value is an immutable [`LiveState`]. Dropping the [`LiveView`]
//! stops polling, unsubscribes and discards the state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::{
    ApplyOutcome, DEFAULT_EVENT_LIMIT, Delivery, Diagnostic, Origin, Phase, Reconciler, Snapshot,
    SourceError, ViewModel,
};
use crate::sources::{ChannelItem, SnapshotSource, UpdateChannel};

const QUEUE_CAPACITY: usize = 256;
const DIAGNOSTIC_BUFFER: usize = 256;
const FINAL_FETCH_ATTEMPTS: usize = 3;
/// Polls still waiting on the source; ticks beyond this are skipped.
const MAX_IN_FLIGHT_FETCHES: usize = 4;

#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub poll_interval: Duration,
    pub event_limit: usize,
    /// No successful delivery for this long marks the view stale.
    pub stale_after: Duration,
    /// Delay before re-subscribing after the update channel drops.
    pub resubscribe_after: Duration,
    /// A snapshot fetch not answered within this is abandoned.
    pub fetch_timeout: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            event_limit: DEFAULT_EVENT_LIMIT,
            stale_after: Duration::from_secs(10),
            resubscribe_after: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// One published state of the reconciled run.
#[derive(Debug, Clone)]
pub struct LiveState {
    pub view: ViewModel,
    pub phase: Phase,
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Diagnostics reported since the view started.
    pub diagnostics: u64,
    landed_at: Instant,
    stale_after: Duration,
}

impl LiveState {
    fn initial(run_id: &str, options: &LiveOptions) -> Self {
        Self {
            view: ViewModel::new(run_id, options.event_limit),
            phase: Phase::Initializing,
            last_applied_at: None,
            diagnostics: 0,
            landed_at: Instant::now(),
            stale_after: options.stale_after,
        }
    }

    /// Snapshot of a reconciler driven outside a live view, e.g. a one-off fetch.
    pub fn from_reconciler(reconciler: &Reconciler, options: &LiveOptions) -> Self {
        Self {
            view: reconciler.view().clone(),
            phase: reconciler.phase(),
            last_applied_at: reconciler.last_applied_at(),
            diagnostics: 0,
            landed_at: Instant::now(),
            stale_after: options.stale_after,
        }
    }

    /// Nothing landed within the grace window. A terminal view is never stale.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        !self.phase.is_terminal() && now.saturating_duration_since(self.landed_at) >= self.stale_after
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub fn is_final(&self) -> bool {
        self.phase == Phase::Terminal { finalized: true }
    }
}

enum Input {
    Fetched(Result<Snapshot, SourceError>),
    Pushed(ChannelItem),
}

/// Handle to a running live view.
pub struct LiveView {
    run_id: String,
    state: watch::Receiver<Arc<LiveState>>,
    diagnostics: Option<mpsc::Receiver<Diagnostic>>,
    poller: JoinHandle<()>,
    channel: Option<JoinHandle<()>>,
    reducer: JoinHandle<()>,
}

impl LiveView {
    /// Starts polling immediately and subscribes to `channel` when given.
    pub fn start(
        run_id: impl Into<String>,
        snapshots: Arc<dyn SnapshotSource>,
        channel: Option<Arc<dyn UpdateChannel>>,
        options: LiveOptions,
    ) -> Self {
        let run_id = run_id.into();
        let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(Arc::new(LiveState::initial(&run_id, &options)));
        let (diag_tx, diag_rx) = mpsc::channel(DIAGNOSTIC_BUFFER);

        let poller = tokio::spawn(poll_snapshots(
            run_id.clone(),
            snapshots.clone(),
            options.clone(),
            input_tx.clone(),
        ));
        let channel = channel.map(|channel| {
            tokio::spawn(pump_channel(
                run_id.clone(),
                channel,
                options.resubscribe_after,
                input_tx,
            ))
        });

        let reducer = Reducer {
            reconciler: Reconciler::new(run_id.clone(), options.event_limit),
            snapshots,
            options,
            state_tx,
            diag_tx,
            diagnostics: 0,
            landed_at: Instant::now(),
            sources: std::iter::once(poller.abort_handle())
                .chain(channel.as_ref().map(JoinHandle::abort_handle))
                .collect(),
        };
        let reducer = tokio::spawn(reducer.run(input_rx));

        tracing::info!(run = %run_id, "live view started");
        Self {
            run_id,
            state: state_rx,
            diagnostics: Some(diag_rx),
            poller,
            channel,
            reducer,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// A new observer. `changed()` on it fails once the view has stopped.
    pub fn subscribe(&self) -> watch::Receiver<Arc<LiveState>> {
        self.state.clone()
    }

    pub fn current(&self) -> Arc<LiveState> {
        self.state.borrow().clone()
    }

    /// The diagnostics side channel. Can be taken once; when nobody reads it,
    /// diagnostics beyond the buffer are only logged.
    pub fn take_diagnostics(&mut self) -> Option<mpsc::Receiver<Diagnostic>> {
        self.diagnostics.take()
    }

    /// Stops polling and unsubscribes without waiting.
    pub fn close(&mut self) {
        self.poller.abort();
        if let Some(channel) = &self.channel {
            channel.abort();
        }
        self.reducer.abort();
    }

    /// Stops everything and waits until the tasks are gone.
    pub async fn shutdown(mut self) {
        self.close();
        let _ = (&mut self.poller).await;
        if let Some(channel) = self.channel.as_mut() {
            let _ = channel.await;
        }
        let _ = (&mut self.reducer).await;
        tracing::info!(run = %self.run_id, "live view stopped");
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.close();
    }
}

struct Reducer {
    reconciler: Reconciler,
    snapshots: Arc<dyn SnapshotSource>,
    options: LiveOptions,
    state_tx: watch::Sender<Arc<LiveState>>,
    diag_tx: mpsc::Sender<Diagnostic>,
    diagnostics: u64,
    landed_at: Instant,
    sources: Vec<AbortHandle>,
}

impl Reducer {
    async fn run(mut self, mut inputs: mpsc::Receiver<Input>) {
        while let Some(input) = inputs.recv().await {
            let outcome = match input {
                Input::Fetched(Ok(snapshot)) => self.apply(Delivery::Snapshot(snapshot)),
                Input::Pushed(Ok(notification)) => self.apply(Delivery::Notification(notification)),
                Input::Fetched(Err(e)) => self.source_failure(Origin::Snapshot, &e),
                Input::Pushed(Err(e)) => self.source_failure(Origin::Channel, &e),
            };
            if outcome.entered_terminal {
                self.finish().await;
                return;
            }
        }
    }

    fn apply(&mut self, delivery: Delivery) -> ApplyOutcome {
        self.apply_at(delivery, Utc::now())
    }

    fn apply_at(&mut self, delivery: Delivery, at: DateTime<Utc>) -> ApplyOutcome {
        let phase = self.reconciler.phase();
        let outcome = self.reconciler.apply(delivery, at);
        if outcome.applied {
            self.landed_at = Instant::now();
        }
        for diagnostic in &outcome.diagnostics {
            self.report(diagnostic.clone());
        }

        let visible = outcome.applied
            || outcome.changed
            || !outcome.diagnostics.is_empty()
            || self.reconciler.phase() != phase;
        if visible {
            self.publish();
        }
        outcome
    }

    fn source_failure(&mut self, origin: Origin, error: &SourceError) -> ApplyOutcome {
        self.report(Diagnostic::SourceFailure {
            origin,
            message: error.to_string(),
        });
        self.publish();
        ApplyOutcome::default()
    }

    /// Tears down both sources, then merges one last snapshot.
    async fn finish(&mut self) {
        for source in self.sources.drain(..) {
            source.abort();
        }
        let run_id = self.reconciler.view().run_id().to_string();

        let limit = self.options.event_limit;
        for attempt in 1..=FINAL_FETCH_ATTEMPTS {
            match fetch_within(self.snapshots.as_ref(), &run_id, limit, self.options.fetch_timeout).await {
                Ok(snapshot) => {
                    self.apply(Delivery::Snapshot(snapshot));
                    tracing::info!(run = %run_id, "live view final");
                    return;
                }
                Err(e) => {
                    self.source_failure(Origin::Snapshot, &e);
                    if attempt < FINAL_FETCH_ATTEMPTS {
                        tokio::time::sleep(self.options.poll_interval).await;
                    }
                }
            }
        }
        tracing::warn!(run = %run_id, "final snapshot unavailable, keeping the last reconciled view");
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics += 1;
        match &diagnostic {
            Diagnostic::IgnoredAfterTerminal { .. } => tracing::debug!("{}", diagnostic),
            _ => tracing::warn!(run = %self.reconciler.view().run_id(), "{}", diagnostic),
        }
        let _ = self.diag_tx.try_send(diagnostic);
    }

    fn publish(&self) {
        self.state_tx.send_replace(Arc::new(LiveState {
            view: self.reconciler.view().clone(),
            phase: self.reconciler.phase(),
            last_applied_at: self.reconciler.last_applied_at(),
            diagnostics: self.diagnostics,
            landed_at: self.landed_at,
            stale_after: self.options.stale_after,
        }));
    }
}

/// Fetches on every tick, the first one immediately. A slow fetch does not
/// delay the next tick, so fetches may overlap.
async fn poll_snapshots(
    run_id: String,
    source: Arc<dyn SnapshotSource>,
    options: LiveOptions,
    tx: mpsc::Sender<Input>,
) {
    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tx.is_closed() {
                    break;
                }
                if in_flight.len() >= MAX_IN_FLIGHT_FETCHES {
                    tracing::debug!(run = %run_id, in_flight = in_flight.len(), "source slow, skipping poll");
                    continue;
                }
                let (run_id, source, tx) = (run_id.clone(), source.clone(), tx.clone());
                let (limit, timeout) = (options.event_limit, options.fetch_timeout);
                in_flight.spawn(async move {
                    let result = fetch_within(source.as_ref(), &run_id, limit, timeout).await;
                    let _ = tx.send(Input::Fetched(result)).await;
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }
}

async fn fetch_within(
    source: &dyn SnapshotSource,
    run_id: &str,
    event_limit: usize,
    timeout: Duration,
) -> Result<Snapshot, SourceError> {
    tokio::time::timeout(timeout, source.fetch(run_id, event_limit))
        .await
        .unwrap_or(Err(SourceError::TimedOut(timeout)))
}

async fn pump_channel(
    run_id: String,
    channel: Arc<dyn UpdateChannel>,
    retry_after: Duration,
    tx: mpsc::Sender<Input>,
) {
    loop {
        match channel.subscribe(&run_id).await {
            Ok(mut subscription) => {
                tracing::debug!(run = %run_id, "subscribed to updates");
                while let Some(item) = subscription.next().await {
                    if tx.send(Input::Pushed(item)).await.is_err() {
                        return;
                    }
                }
                if !channel.resumable() {
                    tracing::info!(run = %run_id, "update feed exhausted, continuing on polling alone");
                    return;
                }
                if tx.send(Input::Pushed(Err(SourceError::Closed))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let resumable = channel.resumable();
                if tx.send(Input::Pushed(Err(e))).await.is_err() || !resumable {
                    return;
                }
            }
        }
        tokio::time::sleep(retry_after).await;
    }
}
