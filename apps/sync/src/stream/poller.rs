//! Interval polling used when a stream is unavailable.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// The same logical fetch used for a full refresh.
pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct PollerState {
    ticker: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
    /// Stopped by the inactivity timer rather than by `stop()`.
    suspended: bool,
}

/// Runs a fetch immediately and then every `interval`.
///
/// `start` is idempotent. With an idle timeout, polling suspends when
/// `record_activity` has not been called for that long, and resumes on the
/// next call.
#[derive(Clone)]
pub struct Poller {
    fetch: PollFn,
    interval: Duration,
    idle_timeout: Option<Duration>,
    state: Arc<Mutex<PollerState>>,
}

impl Poller {
    pub fn new(fetch: PollFn, interval: Duration) -> Self {
        Self {
            fetch,
            interval,
            idle_timeout: None,
            state: Arc::new(Mutex::new(PollerState::default())),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn is_polling(&self) -> bool {
        self.lock().ticker.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn start(&self) {
        let mut state = self.lock();
        if state.ticker.is_some() {
            return;
        }
        state.suspended = false;
        state.ticker = Some(self.spawn_ticker());
        self.arm_idle_timer(&mut state);
        info!("Polling every {}s", self.interval.as_secs());
    }

    /// Clears the interval timer and the inactivity timer.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
            debug!("Polling stopped");
        }
        if let Some(idle) = state.idle_timer.take() {
            idle.abort();
        }
        state.suspended = false;
    }

    /// Resets the inactivity timer, resuming polling if it had been suspended.
    pub fn record_activity(&self) {
        let mut state = self.lock();
        if state.suspended {
            state.suspended = false;
            state.ticker = Some(self.spawn_ticker());
            info!("Activity detected; polling resumed");
        }
        if state.ticker.is_some() {
            self.arm_idle_timer(&mut state);
        }
    }

    fn spawn_ticker(&self) -> JoinHandle<()> {
        let fetch = self.fetch.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                fetch().await;
            }
        })
    }

    fn arm_idle_timer(&self, state: &mut PollerState) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        if let Some(previous) = state.idle_timer.take() {
            previous.abort();
        }
        let shared = self.state.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
                state.suspended = true;
                info!("No activity for {}s; polling suspended", timeout.as_secs());
            }
            state.idle_timer = None;
        }));
    }

    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
