//! Reconnect scheduling.
//!
//! The scheduler remembers why the connection was lost and how many times in
//! a row it has been retried, and arms a single-shot timer that asks the
//! connection to reconnect. A reachability signal fires an armed timer early;
//! it never arms one on its own. There is no retry limit: every temporary
//! disconnect is retried until the connection finishes, is permanently
//! disconnected, or the scheduler is stopped.

use crate::{
    clock::Clock, dispatch::DispatchQueue, error::HassLinkError, protected::Protected,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why the connection is not currently connected.
#[derive(Debug, Clone)]
pub enum ReconnectState {
    /// Not waiting on anything: never connected, connected, or stopped.
    Idle,
    /// A reconnect attempt is scheduled.
    WaitingToReconnect {
        last_error: Option<HassLinkError>,
        /// Latest time the attempt will start.
        at_latest: SystemTime,
        retry_count: u32,
    },
}

impl ReconnectState {
    pub fn retry_count(&self) -> u32 {
        match self {
            ReconnectState::Idle => 0,
            ReconnectState::WaitingToReconnect { retry_count, .. } => *retry_count,
        }
    }
}

/// Callback invoked (on the callback queue) when it is time to reconnect.
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

pub struct ReconnectScheduler {
    state: Protected<SchedulerState>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    tolerance: Duration,
    callback_queue: DispatchQueue,
    on_reconnect: Mutex<Option<ReconnectCallback>>,
    weak_self: Weak<ReconnectScheduler>,
}

#[derive(Default)]
struct SchedulerState {
    reason: Option<ReconnectState>,
    retry_count: u32,
    timer: Option<RetryTimer>,
    next_timer_id: u64,
}

struct RetryTimer {
    id: u64,
    fire_now: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReconnectScheduler {
    pub fn new(
        delay: Duration,
        tolerance: Duration,
        clock: Arc<dyn Clock>,
        callback_queue: DispatchQueue,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Protected::default(),
            clock,
            delay,
            tolerance,
            callback_queue,
            on_reconnect: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Register the reconnection-requested callback.
    pub fn set_on_reconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .on_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn reason(&self) -> ReconnectState {
        self.state
            .read(|state| state.reason.clone().unwrap_or(ReconnectState::Idle))
    }

    pub fn retry_count(&self) -> u32 {
        self.state.read(|state| state.retry_count)
    }

    /// Whether a reconnect timer is currently armed.
    pub fn is_waiting(&self) -> bool {
        self.state.read(|state| state.timer.is_some())
    }

    pub fn did_start_initial_connect(&self) {
        self.reset("initial connect");
    }

    pub fn did_finish_connect(&self) {
        self.reset("connected");
    }

    pub fn did_disconnect_permanently(&self) {
        self.reset("permanent disconnect");
    }

    /// Stop any pending reconnect.
    pub fn stop(&self) {
        self.reset("stopped");
    }

    /// Record a temporary disconnect and schedule the next attempt.
    pub fn did_disconnect_temporarily(&self, error: Option<HassLinkError>) {
        let now = self.clock.now();
        let delay = self.delay;
        let tolerance = self.tolerance;
        let weak_self = self.weak_self.clone();

        self.state.mutate(|state| {
            if let Some(previous) = state.timer.take() {
                previous.task.abort();
            }

            state.retry_count = state.retry_count.saturating_add(1);
            let retry_count = state.retry_count;
            let at_latest = now + delay + tolerance;
            state.reason = Some(ReconnectState::WaitingToReconnect {
                last_error: error.clone(),
                at_latest,
                retry_count,
            });

            state.next_timer_id += 1;
            let id = state.next_timer_id;
            let fire_in = delay + tolerance_offset(tolerance, retry_count);
            let fire_now = Arc::new(Notify::new());
            let notified = fire_now.clone();

            let task = tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(fire_in) => {},
                    _ = notified.notified() => {},
                }
                if let Some(scheduler) = weak_self.upgrade() {
                    scheduler.timer_fired(id);
                }
            });

            log::info!(
                "[hass-link] Reconnecting in {:?} (attempt {}){}",
                fire_in,
                retry_count,
                error
                    .as_ref()
                    .map(|e| format!(" after error: {}", e))
                    .unwrap_or_default()
            );

            state.timer = Some(RetryTimer { id, fire_now, task });
        });
    }

    /// The network became reachable again: fire an armed timer now.
    pub fn network_reachable(&self) {
        let fired = self
            .state
            .read(|state| match &state.timer {
                Some(timer) => {
                    timer.fire_now.notify_one();
                    true
                },
                None => false,
            });
        if fired {
            log::debug!("[hass-link] Network reachable, reconnecting early");
        }
    }

    fn timer_fired(&self, id: u64) {
        let should_fire = self
            .state
            .mutate(|state| match &state.timer {
                Some(timer) if timer.id == id => {
                    state.timer = None;
                    true
                },
                _ => false,
            })
            .into_inner();

        if !should_fire {
            return;
        }

        let callback = self
            .on_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => self.callback_queue.dispatch(move || callback()),
            None => log::warn!("[hass-link] Reconnect timer fired with no callback registered"),
        }
    }

    fn reset(&self, why: &str) {
        let had_timer = self
            .state
            .mutate(|state| {
                state.reason = Some(ReconnectState::Idle);
                state.retry_count = 0;
                match state.timer.take() {
                    Some(timer) => {
                        timer.task.abort();
                        true
                    },
                    None => false,
                }
            })
            .into_inner();
        if had_timer {
            log::debug!("[hass-link] Reconnect timer cancelled ({})", why);
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.state.mutate(|state| {
            if let Some(timer) = state.timer.take() {
                timer.task.abort();
            }
        });
    }
}

/// Spread attempts across the tolerance window, deterministically per attempt.
fn tolerance_offset(tolerance: Duration, retry_count: u32) -> Duration {
    let tolerance_ms = tolerance.as_millis() as u64;
    if tolerance_ms == 0 {
        return Duration::ZERO;
    }

    let mut hasher = DefaultHasher::new();
    retry_count.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % (tolerance_ms + 1))
}
