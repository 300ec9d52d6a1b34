use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot published by a [`ProgressThrottle`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Progress {
    pub run_id: String,
    pub text: String,
    /// Number of firings so far, starting at 1.
    pub sequence: u64,
    pub terminal: bool,
}

/// Leading-edge throttle over a run's progress.
///
/// The first delta fires immediately. Later deltas inside the interval only
/// mark a pending firing, which becomes due at `last_fired + interval`.
/// [`ProgressThrottle::finish`] always fires once more with `terminal` set.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    tx: watch::Sender<Progress>,
    latest: Progress,
    pending: bool,
    last_fired: Option<Instant>,
    finished: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self {
            interval,
            tx,
            latest: Progress::default(),
            pending: false,
            last_fired: None,
            finished: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    /// Records the newest text. Returns `true` when this call fired.
    pub fn on_delta(&mut self, run_id: &str, text: &str) -> bool {
        if self.finished {
            return false;
        }
        run_id.clone_into(&mut self.latest.run_id);
        text.clone_into(&mut self.latest.text);

        let now = Instant::now();
        match self.last_fired {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = true;
                false
            }
            _ => {
                self.fire(now, false);
                true
            }
        }
    }

    /// When the pending firing is due.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.pending || self.finished {
            return None;
        }
        self.last_fired.map(|last| last + self.interval)
    }

    /// Fires the pending snapshot if its deadline has passed.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.fire(now, false);
                true
            }
            _ => false,
        }
    }

    /// Fires any pending snapshot right away and yields so subscribers can
    /// observe it before the caller emits what comes next.
    pub async fn flush(&mut self) {
        if self.pending && !self.finished {
            debug!(run_id = %self.latest.run_id, "flushing pending progress");
            self.fire(Instant::now(), false);
            tokio::task::yield_now().await;
        }
    }

    /// Terminal firing. Calling it again returns the same snapshot.
    pub fn finish(&mut self) -> Progress {
        if !self.finished {
            self.fire(Instant::now(), true);
            self.finished = true;
        }
        self.tx.borrow().clone()
    }

    /// Text of the newest delta seen, fired or not.
    pub fn partial_text(&self) -> &str {
        &self.latest.text
    }

    pub fn is_pending(&self) -> bool {
        self.pending && !self.finished
    }

    fn fire(&mut self, now: Instant, terminal: bool) {
        self.latest.sequence += 1;
        self.latest.terminal = terminal;
        self.pending = false;
        self.last_fired = Some(now);
        self.tx.send_replace(self.latest.clone());
    }
}
