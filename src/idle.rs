//! Tracking of idle resources, and a background task which evicts them.

#[cfg(feature = "probes")]
use crate::probes;
use crate::slot::{Resource, Slot};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{event, instrument, Level};

/// Whether an item is in use, or how long it has been out of use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActivityState {
    Active,
    Inactive(Duration),
}

impl ActivityState {
    /// Returns true if the item has been inactive for strictly longer than
    /// `max_idle`.
    pub fn idle_longer_than(&self, max_idle: Duration) -> bool {
        match self {
            ActivityState::Active => false,
            ActivityState::Inactive(idle) => *idle > max_idle,
        }
    }
}

#[derive(Debug)]
struct Activity {
    // Number of outstanding activations.
    users: usize,
    last_deactivated: Instant,
}

/// An "in use" flag, remembering when it was last cleared.
///
/// Activations are counted: the item stays active until every activation
/// has been matched by a deactivation. Starts out inactive, as if
/// deactivated at the moment of creation.
#[derive(Debug)]
pub struct ActivityTracker {
    inner: Mutex<Activity>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Activity {
                users: 0,
                last_deactivated: Instant::now(),
            }),
        }
    }

    pub fn activate(&self) {
        self.inner.lock().unwrap().users += 1;
    }

    /// Ends one activation. The idle clock restarts once none remain.
    pub fn deactivate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.users = inner.users.saturating_sub(1);
        if inner.users == 0 {
            inner.last_deactivated = Instant::now();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().users > 0
    }

    /// Computes the state from the last deactivation time.
    pub fn state(&self) -> ActivityState {
        let inner = self.inner.lock().unwrap();
        if inner.users > 0 {
            ActivityState::Active
        } else {
            ActivityState::Inactive(inner.last_deactivated.elapsed())
        }
    }
}

/// A resource which tracks its own activity.
pub trait Tracked {
    fn tracker(&self) -> &ActivityTracker;
}

/// An item which the [IdleEvictor] can inspect and evict.
#[async_trait]
pub trait Idle: Send + Sync {
    /// Returns the activity of the item, or `None` if there is nothing
    /// live to track.
    fn activity(&self) -> Option<ActivityState>;

    /// Closes the item if it is still idle for longer than `max_idle`.
    ///
    /// Returns true if something was closed.
    async fn evict_if_idle(&self, max_idle: Duration) -> bool;
}

#[async_trait]
impl<T: Resource + Tracked> Idle for Slot<T> {
    fn activity(&self) -> Option<ActivityState> {
        self.current().map(|value| value.tracker().state())
    }

    async fn evict_if_idle(&self, max_idle: Duration) -> bool {
        // Re-checked under the slot lock: the item may have been borrowed
        // since it was observed to be idle.
        self.invalidate_if(|value| value.tracker().state().idle_longer_than(max_idle))
            .await
    }
}

/// Supplies the current set of items to scan, once per cycle.
pub type ItemSupplier = Arc<dyn Fn() -> Vec<Arc<dyn Idle>> + Send + Sync>;

struct EvictorInner {
    name: String,
    max_idle: Duration,
    items: ItemSupplier,
    evicted: AtomicU64,
}

impl EvictorInner {
    async fn run_cycle(&self) -> usize {
        let mut evicted = 0;
        for item in (self.items)() {
            let Some(state) = item.activity() else {
                continue;
            };
            if !state.idle_longer_than(self.max_idle) {
                continue;
            }
            if item.evict_if_idle(self.max_idle).await {
                evicted += 1;
                self.evicted.fetch_add(1, Ordering::SeqCst);
            }
        }

        if evicted > 0 {
            event!(Level::DEBUG, name = self.name.as_str(), evicted, "Evicted idle items");
            #[cfg(feature = "probes")]
            probes::idle__evicted!(|| (self.name.as_str(), evicted as u64));
        }
        evicted
    }

    // Runs one cycle, and keeps the schedule alive even if it panics.
    async fn run_cycle_guarded(&self) {
        if let Err(panic) = AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic");
            event!(
                Level::ERROR,
                name = self.name.as_str(),
                reason,
                "Idle eviction cycle failed"
            );
        }
    }
}

/// Periodically closes items which have been idle for too long.
///
/// The scan runs in a background task, spawned on construction and stopped
/// by [IdleEvictor::stop] or when the evictor is dropped.
pub struct IdleEvictor {
    inner: Arc<EvictorInner>,
    handle: Mutex<Option<AbortHandle>>,
}

impl IdleEvictor {
    /// Starts evicting items idle for longer than `max_idle`.
    ///
    /// The first scan runs one `period` after construction. When `period` is
    /// `None`, it equals `max_idle`.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(items), name = "IdleEvictor::new")]
    pub fn new(
        name: String,
        max_idle: Duration,
        period: Option<Duration>,
        items: ItemSupplier,
    ) -> Self {
        let period = period.unwrap_or(max_idle);
        let inner = Arc::new(EvictorInner {
            name,
            max_idle,
            items,
            evicted: AtomicU64::new(0),
        });

        let handle = tokio::task::spawn({
            let inner = inner.clone();
            async move {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    event!(Level::TRACE, name = inner.name.as_str(), "Scanning for idle items");
                    inner.run_cycle_guarded().await;
                }
            }
        })
        .abort_handle();

        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Scans all items once, in the calling task.
    ///
    /// Returns the number of items evicted by this scan.
    pub async fn run_cycle(&self) -> usize {
        self.inner.run_cycle().await
    }

    /// Returns the number of items evicted since construction.
    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::SeqCst)
    }

    pub fn max_idle(&self) -> Duration {
        self.inner.max_idle
    }

    /// Returns true until [Self::stop] has been called.
    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    /// Stops the background task. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            event!(Level::DEBUG, name = self.inner.name.as_str(), "Stopping idle evictor");
            handle.abort();
        }
    }
}

impl Drop for IdleEvictor {
    fn drop(&mut self) {
        self.stop();
    }
}
