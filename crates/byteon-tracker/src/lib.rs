//! Client-side adaptive poller for live registrant counts.
//!
//! Each observation cycle fetches the export, counts rows, and reconciles the
//! result into a [`watch`] snapshot. The loop runs on a normal cadence and
//! switches to a quicker one for a few cycles after the count goes up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteon_core::{count_rows, Observation, PollingPhase, MAX_QUICK_CHECKS, NORMAL_INTERVAL, QUICK_INTERVAL};
use byteon_storage::CsvSource;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "byteon-tracker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub normal_interval: Duration,
    pub quick_interval: Duration,
    pub max_quick_checks: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            normal_interval: NORMAL_INTERVAL,
            quick_interval: QUICK_INTERVAL,
            max_quick_checks: MAX_QUICK_CHECKS,
        }
    }
}

impl PollerConfig {
    pub fn interval_for(&self, phase: PollingPhase) -> Duration {
        match phase {
            PollingPhase::Normal => self.normal_interval,
            PollingPhase::QuickConfirm { .. } => self.quick_interval,
        }
    }
}

struct Shared {
    source: Arc<dyn CsvSource>,
    url: String,
    state: watch::Sender<Observation>,
    sealed: AtomicBool,
}

impl Shared {
    /// Runs one fetch -> count -> reconcile pass.
    ///
    /// Returns whether the live count went up, or `None` when the session was
    /// torn down before the result could be committed.
    async fn observe(&self) -> Option<bool> {
        let outcome = self
            .source
            .fetch_csv(&self.url)
            .await
            .map(|text| count_rows(&text));

        let mut increased = None;
        self.state.send_if_modified(|obs| {
            // Checked under the channel lock so a seal cannot interleave with a commit.
            if self.sealed.load(Ordering::Acquire) {
                return false;
            }
            increased = Some(match &outcome {
                Ok(count) => obs.apply_count(*count),
                Err(err) => {
                    obs.apply_error(err.to_string());
                    false
                }
            });
            true
        });

        match (&outcome, increased) {
            (_, None) => debug!(url = %self.url, "dropping observation after teardown"),
            (Ok(count), Some(up)) => debug!(url = %self.url, count, increased = up, "observation committed"),
            (Err(err), Some(_)) => warn!(url = %self.url, error = %err, "observation failed"),
        }
        increased
    }

    fn set_phase(&self, phase: PollingPhase) {
        self.state.send_if_modified(|obs| {
            if self.sealed.load(Ordering::Acquire) || obs.phase == phase {
                return false;
            }
            obs.phase = phase;
            true
        });
    }

    fn seal(&self) {
        self.state.send_if_modified(|_| {
            self.sealed.store(true, Ordering::Release);
            false
        });
    }

    fn snapshot(&self) -> Observation {
        self.state.borrow().clone()
    }
}

/// Handle to a running poll loop. Dropping it tears the loop down.
pub struct AdaptivePoller {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl AdaptivePoller {
    /// Starts polling `url`. The first cycle runs immediately.
    ///
    /// `fallback_count` is the persisted count shown until the first live
    /// observation succeeds. Must be called from within a Tokio runtime.
    pub fn start(
        source: Arc<dyn CsvSource>,
        url: impl Into<String>,
        config: PollerConfig,
        fallback_count: Option<u64>,
    ) -> Self {
        let (state, _) = watch::channel(Observation::seeded(fallback_count));
        let shared = Arc::new(Shared {
            source,
            url: url.into(),
            state,
            sealed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();
        info!(url = %shared.url, ?config, "starting adaptive poller");
        let task = tokio::spawn(run_loop(Arc::clone(&shared), config, shutdown.clone()));
        Self {
            shared,
            shutdown,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Observation> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> Observation {
        self.shared.snapshot()
    }

    pub fn refresher(&self) -> Refresher {
        Refresher {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs one cycle now, outside the timer schedule. The phase is left alone.
    pub async fn refresh(&self) -> Option<Observation> {
        self.refresher().refresh().await
    }

    /// Cancels the timer and seals the state; nothing commits afterwards.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.shared.seal();
        self.task.abort();
        info!(url = %self.shared.url, "adaptive poller stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for AdaptivePoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable manual-refresh trigger, e.g. for a "refresh" button.
#[derive(Clone)]
pub struct Refresher {
    shared: Arc<Shared>,
}

impl Refresher {
    /// Returns the committed snapshot, or `None` if the poller was torn down.
    pub async fn refresh(&self) -> Option<Observation> {
        if self.shared.sealed.load(Ordering::Acquire) {
            return None;
        }
        self.shared.observe().await?;
        Some(self.shared.snapshot())
    }
}

async fn run_loop(shared: Arc<Shared>, config: PollerConfig, shutdown: CancellationToken) {
    let mut phase = PollingPhase::Normal;
    let mut delay = Duration::ZERO;

    loop {
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let increased = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            increased = shared.observe() => increased,
        };
        let Some(increased) = increased else { break };

        let next = phase.after_cycle(increased, config.max_quick_checks);
        if next.is_quick() != phase.is_quick() {
            debug!(url = %shared.url, from = ?phase, to = ?next, "polling phase changed");
        }
        phase = next;
        shared.set_phase(phase);
        delay = config.interval_for(phase);
    }
}
