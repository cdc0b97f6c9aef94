//! Periodic refresh of the sync window.
//!
//! One task, started and stopped explicitly. A tick is skipped when an
//! engine write touching the window is in flight, and missed ticks are not
//! replayed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::engine::ReconciliationEngine;
use super::event_store::{EventStore, ReconcileStats};
use super::refresh::refresh_range;
use super::write_tracker::WriteTracker;
use crate::error::{Error, ProviderError, SyncResult};
use crate::traits::ProviderClient;
use crate::utils::time::SyncWindow;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Called with every provider error a poll runs into
pub type ErrorCallback = Arc<dyn Fn(&ProviderError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Refreshed(ReconcileStats),
    /// A write overlapping the window was in flight
    Skipped,
}

struct Poller {
    provider: Arc<dyn ProviderClient>,
    store: Arc<EventStore>,
    writes: Arc<WriteTracker>,
    window: SyncWindow,
}

impl Poller {
    async fn poll(&self) -> Result<PollOutcome, ProviderError> {
        let range = self.window.current();
        if self.writes.overlaps(&range) {
            debug!("Skipping poll of {}: write in flight", range);
            return Ok(PollOutcome::Skipped);
        }
        refresh_range(&*self.provider, &self.store, range)
            .await
            .map(PollOutcome::Refreshed)
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PollingScheduler {
    poller: Arc<Poller>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl PollingScheduler {
    pub fn new(engine: &ReconciliationEngine, interval: Duration) -> Self {
        Self {
            poller: Arc::new(Poller {
                provider: engine.provider(),
                store: engine.store(),
                writes: engine.writes(),
                window: engine.window(),
            }),
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start polling. Errors never stop the loop; they are logged and handed to `on_error`.
    pub fn start<F>(&self, on_error: F) -> SyncResult<()>
    where
        F: Fn(&ProviderError) + Send + Sync + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::SchedulerAlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let on_error: ErrorCallback = Arc::new(on_error);
        let handle = tokio::spawn(Self::run(
            Arc::clone(&self.poller),
            self.interval,
            cancel.clone(),
            on_error,
        ));

        *running = Some(Running { cancel, handle });
        info!("Polling scheduler started (every {:?})", self.interval);
        Ok(())
    }

    /// Stop polling and wait for the task to finish
    pub async fn stop(&self) -> SyncResult<()> {
        let Running { cancel, handle } = self
            .running
            .lock()
            .take()
            .ok_or(Error::SchedulerNotRunning)?;

        cancel.cancel();
        handle
            .await
            .map_err(|e| Error::Other(format!("polling task failed: {}", e)))?;
        info!("Polling scheduler stopped");
        Ok(())
    }

    /// Refresh the window now, outside the timer
    pub async fn poll_once(&self) -> Result<PollOutcome, ProviderError> {
        self.poller.poll().await
    }

    async fn run(poller: Arc<Poller>, period: Duration, cancel: CancellationToken, on_error: ErrorCallback) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = poller.poll() => result,
                    };
                    match result {
                        Ok(PollOutcome::Refreshed(stats)) => {
                            debug!("Poll applied {} changes", stats.upserted + stats.removed);
                        }
                        Ok(PollOutcome::Skipped) => {}
                        Err(e) => {
                            error!("Poll failed: {}", e);
                            on_error(&e);
                        }
                    }
                }
            }
        }
    }
}
