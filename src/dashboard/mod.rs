pub mod detail;
pub mod metrics;
pub mod query;
pub mod renderer;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use self::renderer::Renderer;
use crate::monitoring::LiveState;

/// Why the dashboard loop returned.
#[derive(Debug)]
pub enum DashboardExit {
    /// The live view stopped; carries the last state it published.
    Finished(Arc<LiveState>),
    Interrupted(Arc<LiveState>),
}

impl DashboardExit {
    pub fn state(&self) -> &Arc<LiveState> {
        match self {
            DashboardExit::Finished(state) | DashboardExit::Interrupted(state) => state,
        }
    }
}

pub struct Dashboard {
    renderer: Renderer,
    render_interval: Duration,
}

impl Dashboard {
    pub fn new(recent_events: usize, clear: bool, render_interval: Duration) -> Self {
        Self {
            renderer: Renderer::new(recent_events, clear),
            render_interval,
        }
    }

    /// Redraws on every published state and on every tick, so the elapsed
    /// clock and the stale marker move even when nothing lands.
    pub async fn run(mut self, mut states: watch::Receiver<Arc<LiveState>>) -> io::Result<DashboardExit> {
        let mut render_ticker = tokio::time::interval(self.render_interval);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                changed = states.changed() => {
                    let state = states.borrow_and_update().clone();
                    self.renderer.draw(&state, Utc::now())?;
                    if changed.is_err() {
                        tracing::debug!("live view stopped, leaving dashboard");
                        return Ok(DashboardExit::Finished(state));
                    }
                }

                _ = render_ticker.tick() => {
                    let state = states.borrow().clone();
                    self.renderer.draw(&state, Utc::now())?;
                }

                _ = &mut ctrl_c => {
                    tracing::info!("interrupted");
                    return Ok(DashboardExit::Interrupted(states.borrow().clone()));
                }
            }
        }
    }
}
