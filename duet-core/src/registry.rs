use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use crate::protocol::Panel;

const ACTIVITY_EVENTS_CAPACITY: usize = 256;

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);
pub const STRICT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub run_id: String,
    pub panel: Panel,
}

impl RunKey {
    pub fn new(run_id: impl Into<String>, panel: Panel) -> Self {
        Self {
            run_id: run_id.into(),
            panel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunActivityEntry {
    pub run_id: String,
    pub panel: Panel,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    Requested,
    StaleRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    Began(RunKey),
    Ended(RunKey),
    /// The watchdog removed an entry whose `end` never arrived.
    Stalled { key: RunKey, waited: Duration },
    ForceCleared {
        cleared: Vec<RunKey>,
        reason: ClearReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryTimings {
    pub watchdog_timeout: Duration,
    pub sweep_interval: Duration,
    pub staleness_threshold: Duration,
}

impl Default for RegistryTimings {
    fn default() -> Self {
        Self {
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
        }
    }
}

#[derive(Debug)]
struct TrackedEntry {
    entry: RunActivityEntry,
    generation: u64,
    watchdog: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<RunKey, TrackedEntry>,
    next_generation: u64,
    busy_since: Option<Instant>,
}

/// Open runs across both panels, and the busy signal derived from them.
///
/// Busy is `true` exactly while at least one entry exists. Each entry is
/// guarded by a watchdog task that force-removes it if `end` never arrives,
/// and [`RunActivityRegistry::spawn_sweeper`] clears a registry that has been
/// continuously busy past the staleness threshold.
#[derive(Debug, Clone)]
pub struct RunActivityRegistry {
    state: Arc<Mutex<RegistryState>>,
    busy_tx: Arc<watch::Sender<bool>>,
    events_tx: broadcast::Sender<ActivityEvent>,
    timings: RegistryTimings,
}

impl Default for RunActivityRegistry {
    fn default() -> Self {
        Self::new(RegistryTimings::default())
    }
}

impl RunActivityRegistry {
    pub fn new(timings: RegistryTimings) -> Self {
        let (busy_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(ACTIVITY_EVENTS_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            busy_tx: Arc::new(busy_tx),
            events_tx,
            timings,
        }
    }

    pub fn busy_receiver(&self) -> watch::Receiver<bool> {
        self.busy_tx.subscribe()
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events_tx.subscribe()
    }

    /// Returns `false` when the run was already registered; the existing
    /// entry and its watchdog are kept.
    pub fn begin(&self, run_id: &str, panel: Panel) -> bool {
        let key = RunKey::new(run_id, panel);
        let mut state = self.lock();
        if state.entries.contains_key(&key) {
            debug!(run_id, %panel, "run already registered");
            return false;
        }

        let now = Instant::now();
        let generation = state.next_generation;
        state.next_generation += 1;
        let watchdog = self.spawn_watchdog(key.clone(), generation);
        state.entries.insert(
            key.clone(),
            TrackedEntry {
                entry: RunActivityEntry {
                    run_id: run_id.to_string(),
                    panel,
                    created_at: now,
                },
                generation,
                watchdog,
            },
        );
        state.busy_since.get_or_insert(now);
        debug!(run_id, %panel, open = state.entries.len(), "run began");

        let _ = self.events_tx.send(ActivityEvent::Began(key));
        self.publish_busy(&mut state);
        true
    }

    /// Returns `false` (and logs) when no such entry exists.
    pub fn end(&self, run_id: &str, panel: Panel) -> bool {
        let key = RunKey::new(run_id, panel);
        let mut state = self.lock();
        let Some(tracked) = state.entries.remove(&key) else {
            debug!(run_id, %panel, "end for a run that is not registered");
            return false;
        };
        if let Some(watchdog) = tracked.watchdog {
            watchdog.abort();
        }
        debug!(run_id, %panel, open = state.entries.len(), "run ended");

        let _ = self.events_tx.send(ActivityEvent::Ended(key));
        self.publish_busy(&mut state);
        true
    }

    pub fn is_busy(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    pub fn contains(&self, run_id: &str, panel: Panel) -> bool {
        self.lock()
            .entries
            .contains_key(&RunKey::new(run_id, panel))
    }

    /// Open entries, oldest first.
    pub fn entries(&self) -> Vec<RunActivityEntry> {
        let state = self.lock();
        let mut entries: Vec<RunActivityEntry> = state
            .entries
            .values()
            .map(|tracked| tracked.entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }

    /// Removes every entry and cancels every watchdog.
    pub fn force_clear(&self) -> Vec<RunKey> {
        self.clear_with(ClearReason::Requested)
    }

    /// Starts the periodic staleness sweep. The task stops when the handle
    /// is dropped.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let registry = self.clone();
        let period = self.timings.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let now = ticker.tick().await;
                registry.sweep_stale(now);
            }
        });
        SweeperHandle {
            task: task.abort_handle(),
        }
    }

    /// Clears the registry if it has been busy since before
    /// `now - staleness_threshold`. Returns whether it did.
    pub fn sweep_stale(&self, now: Instant) -> bool {
        let stale_for = {
            let state = self.lock();
            match state.busy_since {
                Some(since) if now.duration_since(since) >= self.timings.staleness_threshold => {
                    now.duration_since(since)
                }
                _ => return false,
            }
        };
        warn!(
            busy_for_ms = stale_for.as_millis(),
            "run activity registry stayed busy past the staleness threshold; clearing"
        );
        self.clear_with(ClearReason::StaleRegistry);
        true
    }

    fn clear_with(&self, reason: ClearReason) -> Vec<RunKey> {
        let mut state = self.lock();
        let mut cleared: Vec<RunKey> = Vec::with_capacity(state.entries.len());
        for (key, tracked) in state.entries.drain() {
            if let Some(watchdog) = tracked.watchdog {
                watchdog.abort();
            }
            cleared.push(key);
        }
        cleared.sort_by(|a, b| a.panel.cmp(&b.panel).then_with(|| a.run_id.cmp(&b.run_id)));
        debug!(?reason, cleared = cleared.len(), "run activity registry cleared");

        let _ = self.events_tx.send(ActivityEvent::ForceCleared {
            cleared: cleared.clone(),
            reason,
        });
        self.publish_busy(&mut state);
        cleared
    }

    fn spawn_watchdog(&self, key: RunKey, generation: u64) -> Option<AbortHandle> {
        let Ok(runtime) = Handle::try_current() else {
            warn!(run_id = %key.run_id, panel = %key.panel, "no tokio runtime; run has no watchdog");
            return None;
        };
        let registry = self.clone();
        let timeout = self.timings.watchdog_timeout;
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(&key, generation);
        });
        Some(task.abort_handle())
    }

    fn expire(&self, key: &RunKey, generation: u64) {
        let mut state = self.lock();
        let matches = state
            .entries
            .get(key)
            .is_some_and(|tracked| tracked.generation == generation);
        if !matches {
            return;
        }
        let Some(tracked) = state.entries.remove(key) else {
            return;
        };
        let waited = tracked.entry.created_at.elapsed();
        warn!(
            run_id = %key.run_id,
            panel = %key.panel,
            waited_ms = waited.as_millis(),
            "run never reported completion; watchdog removed it"
        );

        let _ = self.events_tx.send(ActivityEvent::Stalled {
            key: key.clone(),
            waited,
        });
        self.publish_busy(&mut state);
    }

    fn publish_busy(&self, state: &mut RegistryState) {
        let busy = !state.entries.is_empty();
        if !busy {
            state.busy_since = None;
        }
        self.busy_tx.send_if_modified(|current| {
            if *current == busy {
                return false;
            }
            *current = busy;
            true
        });
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps the sweep task alive; aborts it on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    task: AbortHandle,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
