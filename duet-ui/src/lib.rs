use std::collections::BTreeMap;
use std::future::pending;

use duet_core::AbortReason;
use duet_core::ActivityEvent;
use duet_core::ClearReason;
use duet_core::Message;
use duet_core::MessageSaver;
use duet_core::MessageUpdate;
use duet_core::Panel;
use duet_core::Progress;
use duet_core::RawEvent;
use duet_core::RecoveryPayload;
use duet_core::RunAbort;
use duet_core::RunActivityRegistry;
use duet_core::RunState;
use duet_core::StreamConfig;
use duet_core::Submission;
use duet_core::TurnError;
use duet_core::TurnOutput;
use duet_core::TurnSession;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

const TEXT_PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub sequence: u64,
    pub panel: Option<Panel>,
    pub summary: String,
}

/// What one panel currently shows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PanelView {
    pub message: Option<Message>,
    pub is_final: bool,
    pub progress: Option<Progress>,
    pub recovery: Option<RecoveryPayload>,
    pub updates: usize,
}

impl PanelView {
    fn for_message(message: Message) -> Self {
        Self {
            message: Some(message),
            ..Self::default()
        }
    }

    /// Assembled text, falling back to the last throttled progress.
    pub fn display_text(&self) -> &str {
        if let Some(message) = &self.message
            && !message.text.is_empty()
        {
            return &message.text;
        }
        self.progress
            .as_ref()
            .map(|progress| progress.text.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    timeline: Vec<TimelineEntry>,
    next_sequence: u64,
    panels: BTreeMap<Panel, PanelView>,
    busy: bool,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets `panel` to show `placeholder` for a new run.
    pub fn begin_panel(&mut self, panel: Panel, placeholder: Message) {
        let summary = format!("run_started {}", placeholder.run_id);
        self.panels
            .insert(panel, PanelView::for_message(placeholder));
        self.record(Some(panel), summary);
    }

    pub fn push(&mut self, output: TurnOutput) {
        match output {
            TurnOutput::Update(update) => self.push_update(update),
            TurnOutput::Recovered(payload) => self.push_recovery(payload),
        }
    }

    /// Applies an assembled message. Updates after the final one are ignored.
    pub fn push_update(&mut self, update: MessageUpdate) {
        let view = self.panels.entry(update.panel).or_default();
        if view.is_final {
            debug!(panel = %update.panel, run_id = %update.message.run_id, "ignoring update for a finalized panel");
            return;
        }
        let summary = if update.is_final {
            format!(
                "message_final {} {}",
                update.message.run_id,
                preview(&update.message.text)
            )
        } else {
            format!(
                "message_update {} segments={}",
                update.message.run_id,
                update.message.segment_count()
            )
        };
        view.updates += 1;
        view.is_final = update.is_final;
        view.message = Some(update.message);
        self.record(Some(update.panel), summary);
    }

    pub fn push_recovery(&mut self, payload: RecoveryPayload) {
        let summary = match &payload.error {
            Some(error) => format!(
                "run_recovered {} {} error={error}",
                payload.run_id,
                run_state_name(payload.state)
            ),
            None => format!(
                "run_recovered {} {} partial={}",
                payload.run_id,
                run_state_name(payload.state),
                preview(&payload.partial_text)
            ),
        };
        let panel = payload.panel;
        let view = self.panels.entry(panel).or_default();
        view.is_final = true;
        view.message = Some(payload.message.clone());
        view.recovery = Some(payload);
        self.record(Some(panel), summary);
    }

    pub fn push_progress(&mut self, panel: Panel, progress: Progress) {
        let summary = format!(
            "progress {} #{}{}",
            progress.run_id,
            progress.sequence,
            if progress.terminal { " terminal" } else { "" }
        );
        self.panels.entry(panel).or_default().progress = Some(progress);
        self.record(Some(panel), summary);
    }

    pub fn push_activity(&mut self, event: &ActivityEvent) {
        match event {
            ActivityEvent::Began(key) => {
                self.record(Some(key.panel), format!("activity_began {}", key.run_id));
            }
            ActivityEvent::Ended(key) => {
                self.record(Some(key.panel), format!("activity_ended {}", key.run_id));
            }
            ActivityEvent::Stalled { key, waited } => {
                self.record(
                    Some(key.panel),
                    format!("activity_stalled {} after {}ms", key.run_id, waited.as_millis()),
                );
            }
            ActivityEvent::ForceCleared { cleared, reason } => {
                self.record(
                    None,
                    format!(
                        "activity_cleared {} runs={}",
                        clear_reason_name(*reason),
                        cleared.len()
                    ),
                );
            }
        }
    }

    pub fn set_busy(&mut self, busy: bool) {
        if self.busy == busy {
            return;
        }
        self.busy = busy;
        self.record(None, format!("busy {busy}"));
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn panel(&self, panel: Panel) -> Option<&PanelView> {
        self.panels.get(&panel)
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    fn record(&mut self, panel: Option<Panel>, summary: String) {
        self.next_sequence += 1;
        self.timeline.push(TimelineEntry {
            sequence: self.next_sequence,
            panel,
            summary,
        });
    }
}

#[derive(Debug, Error)]
pub enum DuetRuntimeError {
    #[error("a turn needs at least one panel feed")]
    NoFeeds,
    #[error(transparent)]
    Turn(#[from] TurnError),
}

/// One panel's submission and the raw events its transport delivers.
#[derive(Debug)]
pub struct PanelFeed {
    pub submission: Submission,
    pub events: mpsc::Receiver<RawEvent>,
}

impl PanelFeed {
    pub fn new(submission: Submission, events: mpsc::Receiver<RawEvent>) -> Self {
        Self { submission, events }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnReport {
    pub events_processed: usize,
    pub completed: Vec<MessageUpdate>,
    pub recovered: Vec<RecoveryPayload>,
}

#[derive(Debug, Default)]
struct Lane {
    events: Option<mpsc::Receiver<RawEvent>>,
    abort: Option<RunAbort>,
    progress: Option<watch::Receiver<Progress>>,
}

#[derive(Debug)]
pub struct DuetRuntime {
    config: StreamConfig,
    registry: RunActivityRegistry,
    store: ConversationStore,
}

impl Default for DuetRuntime {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl DuetRuntime {
    pub fn new(config: StreamConfig) -> Self {
        let registry = RunActivityRegistry::new(config.registry_timings());
        Self {
            config,
            registry,
            store: ConversationStore::new(),
        }
    }

    pub fn registry(&self) -> &RunActivityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Drives one turn until every panel's run has concluded.
    ///
    /// A feed that closes completes its run (and hands the message to
    /// `saver`), unless the run's abort was signalled, in which case the run
    /// is recovered instead. Stalls reported by the registry are recovered
    /// as well.
    pub async fn run_turn(
        &mut self,
        feeds: Vec<PanelFeed>,
        saver: Option<&dyn MessageSaver>,
    ) -> Result<TurnReport, DuetRuntimeError> {
        if feeds.is_empty() {
            return Err(DuetRuntimeError::NoFeeds);
        }

        let mut session = TurnSession::from_config(self.registry.clone(), &self.config);
        let mut activity = self.registry.event_receiver();
        let mut busy = self.registry.busy_receiver();
        let _sweeper = self.registry.spawn_sweeper();

        let mut primary = Lane::default();
        let mut secondary = Lane::default();
        for feed in feeds {
            let panel = feed.submission.panel;
            let fresh = feed.submission.placeholder.for_run(&feed.submission.run_id);
            let abort = session.begin(feed.submission)?;
            self.store.begin_panel(panel, fresh);
            let lane = match panel {
                Panel::Primary => &mut primary,
                Panel::Secondary => &mut secondary,
            };
            *lane = Lane {
                events: Some(feed.events),
                abort: Some(abort),
                progress: session.progress_receiver(panel),
            };
        }
        self.store.set_busy(*busy.borrow_and_update());

        let mut report = TurnReport::default();
        let mut activity_open = true;
        let mut busy_open = true;
        while !session.is_concluded() {
            tokio::select! {
                event = next_event(&mut primary.events) => {
                    self.on_feed(&mut session, Panel::Primary, event, &mut primary, saver, &mut report).await;
                }
                event = next_event(&mut secondary.events) => {
                    self.on_feed(&mut session, Panel::Secondary, event, &mut secondary, saver, &mut report).await;
                }
                () = wait_aborted(primary.abort.as_ref()) => {
                    primary.abort = None;
                    self.on_abort(&mut session, Panel::Primary, &mut report);
                }
                () = wait_aborted(secondary.abort.as_ref()) => {
                    secondary.abort = None;
                    self.on_abort(&mut session, Panel::Secondary, &mut report);
                }
                () = sleep_until_opt(session.next_progress_deadline()) => {
                    let fired = session.poll_progress(Instant::now());
                    debug!(?fired, "throttled progress fired");
                }
                received = activity.recv(), if activity_open => match received {
                    Ok(event) => self.on_activity(&mut session, &event, &mut report),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "activity receiver lagged");
                    }
                    Err(RecvError::Closed) => activity_open = false,
                },
                changed = busy.changed(), if busy_open => {
                    if changed.is_ok() {
                        self.store.set_busy(*busy.borrow_and_update());
                    } else {
                        busy_open = false;
                    }
                }
            }
            self.sync_progress(Panel::Primary, &mut primary);
            self.sync_progress(Panel::Secondary, &mut secondary);
        }

        drop(session);
        self.sync_progress(Panel::Primary, &mut primary);
        self.sync_progress(Panel::Secondary, &mut secondary);
        loop {
            match activity.try_recv() {
                Ok(event) => self.store.push_activity(&event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        self.store.set_busy(self.registry.is_busy());
        Ok(report)
    }

    async fn on_feed(
        &mut self,
        session: &mut TurnSession,
        panel: Panel,
        event: Option<RawEvent>,
        lane: &mut Lane,
        saver: Option<&dyn MessageSaver>,
        report: &mut TurnReport,
    ) {
        let Some(event) = event else {
            lane.events = None;
            self.finish_panel(session, panel, saver, report).await;
            return;
        };
        report.events_processed += 1;
        if let Some(output) = session.handle_event(panel, event).await {
            self.record_output(output, report);
        }
    }

    async fn finish_panel(
        &mut self,
        session: &mut TurnSession,
        panel: Panel,
        saver: Option<&dyn MessageSaver>,
        report: &mut TurnReport,
    ) {
        if session
            .abort_handle(panel)
            .is_some_and(|abort| abort.is_aborted())
        {
            self.on_abort(session, panel, report);
            return;
        }

        let completed = match saver {
            Some(saver) => session.complete_and_save(panel, saver).await,
            None => session.complete(panel),
        };
        match completed {
            Ok(Some(update)) => {
                self.store.push_update(update.clone());
                report.completed.push(update);
            }
            Ok(None) => debug!(%panel, "feed closed after the run concluded"),
            Err(error) => warn!(%panel, %error, "could not complete run"),
        }
    }

    fn on_abort(&mut self, session: &mut TurnSession, panel: Panel, report: &mut TurnReport) {
        match session.abort(panel, AbortReason::UserCancelled) {
            Ok(Some(payload)) => self.record_output(TurnOutput::Recovered(payload), report),
            Ok(None) => debug!(%panel, "abort signalled for a concluded run"),
            Err(error) => warn!(%panel, %error, "could not abort run"),
        }
    }

    fn on_activity(
        &mut self,
        session: &mut TurnSession,
        event: &ActivityEvent,
        report: &mut TurnReport,
    ) {
        self.store.push_activity(event);
        for payload in session.handle_activity(event) {
            self.record_output(TurnOutput::Recovered(payload), report);
        }
    }

    fn record_output(&mut self, output: TurnOutput, report: &mut TurnReport) {
        if let TurnOutput::Recovered(payload) = &output {
            report.recovered.push(payload.clone());
        }
        self.store.push(output);
    }

    fn sync_progress(&mut self, panel: Panel, lane: &mut Lane) {
        if let Some(progress) = lane.progress.as_mut()
            && progress.has_changed().unwrap_or(false)
        {
            let latest = progress.borrow_and_update().clone();
            self.store.push_progress(panel, latest);
        }
    }
}

/// Spawns a task that plays `events` into a fresh feed.
///
/// With `abort_after = Some(n)`, the task waits until the consumer has taken
/// the `n`th event, signals `abort` and closes the feed.
pub fn spawn_replay(
    events: Vec<RawEvent>,
    abort_after: Option<usize>,
    abort: RunAbort,
) -> mpsc::Receiver<RawEvent> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for (sent, event) in events.into_iter().enumerate() {
            if abort_after.is_some_and(|limit| sent >= limit) {
                break;
            }
            if tx.send(event).await.is_err() {
                return;
            }
        }
        if abort_after.is_some() {
            // The permit frees up once the last event was received.
            if tx.reserve().await.is_ok() {
                debug!("replay abort point reached");
                abort.signal();
            }
        }
    });
    rx
}

async fn next_event(events: &mut Option<mpsc::Receiver<RawEvent>>) -> Option<RawEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn wait_aborted(abort: Option<&RunAbort>) {
    match abort {
        Some(abort) => abort.aborted().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(TEXT_PREVIEW_MAX_CHARS).collect();
    if text.chars().count() > TEXT_PREVIEW_MAX_CHARS {
        preview.push_str("...");
    }
    preview
}

fn run_state_name(state: RunState) -> &'static str {
    match state {
        RunState::Idle => "idle",
        RunState::Active => "active",
        RunState::Completed => "completed",
        RunState::Aborted => "aborted",
        RunState::Failed => "failed",
    }
}

fn clear_reason_name(reason: ClearReason) -> &'static str {
    match reason {
        ClearReason::Requested => "requested",
        ClearReason::StaleRegistry => "stale_registry",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use duet_core::ActivityEvent;
    use duet_core::ClearReason;
    use duet_core::Message;
    use duet_core::MessageUpdate;
    use duet_core::Panel;
    use duet_core::Progress;
    use duet_core::RawEvent;
    use duet_core::RecoveryPayload;
    use duet_core::RunAbort;
    use duet_core::RunKey;
    use duet_core::RunState;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::ConversationStore;
    use super::DuetRuntime;
    use super::DuetRuntimeError;
    use super::spawn_replay;

    fn message(run_id: &str, text: &str) -> Message {
        let mut message = Message::placeholder("pending", "assistant", None, None).for_run(run_id);
        message.text = text.to_string();
        message
    }

    fn update(panel: Panel, run_id: &str, text: &str, is_final: bool) -> MessageUpdate {
        MessageUpdate {
            panel,
            message: message(run_id, text),
            is_final,
        }
    }

    #[test]
    fn updates_after_the_final_message_are_ignored() {
        let mut store = ConversationStore::new();
        store.begin_panel(Panel::Primary, message("R1", ""));

        store.push_update(update(Panel::Primary, "R1", "Hel", false));
        store.push_update(update(Panel::Primary, "R1", "Hello", true));
        store.push_update(update(Panel::Primary, "R1", "Hello again", false));

        let Some(view) = store.panel(Panel::Primary) else {
            panic!("primary panel should exist");
        };
        assert!(view.is_final);
        assert_eq!(view.updates, 2);
        assert_eq!(view.display_text(), "Hello");
        assert_eq!(
            store.timeline().last().map(|entry| entry.summary.as_str()),
            Some("message_final R1 Hello")
        );
    }

    #[test]
    fn begin_panel_resets_a_finalized_view() {
        let mut store = ConversationStore::new();
        store.push_update(update(Panel::Secondary, "R1", "done", true));
        store.begin_panel(Panel::Secondary, message("R2", ""));

        let Some(view) = store.panel(Panel::Secondary) else {
            panic!("secondary panel should exist");
        };
        assert!(!view.is_final);
        assert_eq!(view.updates, 0);
        assert_eq!(view.message.as_ref().map(|m| m.run_id.as_str()), Some("R2"));
    }

    #[test]
    fn recovery_marks_the_panel_final_and_keeps_partial_text() {
        let mut store = ConversationStore::new();
        let recovered = message("R1", "Hel");
        store.push_recovery(RecoveryPayload {
            panel: Panel::Primary,
            partial_text: "Hel".to_string(),
            conversation_id: None,
            sender: "assistant".to_string(),
            run_id: "R1".to_string(),
            message_id: "R1".to_string(),
            parent_message_id: None,
            state: RunState::Aborted,
            error: None,
            message: recovered,
        });

        let Some(view) = store.panel(Panel::Primary) else {
            panic!("primary panel should exist");
        };
        assert!(view.is_final);
        assert_eq!(view.display_text(), "Hel");
        assert_eq!(
            store.timeline().last().map(|entry| entry.summary.as_str()),
            Some("run_recovered R1 aborted partial=Hel")
        );
    }

    #[test]
    fn progress_is_shown_until_a_message_has_text() {
        let mut store = ConversationStore::new();
        store.begin_panel(Panel::Primary, message("R1", ""));
        store.push_progress(
            Panel::Primary,
            Progress {
                run_id: "R1".to_string(),
                text: "Hel".to_string(),
                sequence: 1,
                terminal: false,
            },
        );

        let Some(view) = store.panel(Panel::Primary) else {
            panic!("primary panel should exist");
        };
        assert_eq!(view.display_text(), "Hel");
    }

    #[test]
    fn activity_and_busy_changes_are_recorded_in_order() {
        let mut store = ConversationStore::new();
        store.push_activity(&ActivityEvent::Began(RunKey::new("R1", Panel::Primary)));
        store.set_busy(true);
        store.set_busy(true);
        store.push_activity(&ActivityEvent::Stalled {
            key: RunKey::new("R1", Panel::Primary),
            waited: Duration::from_secs(60),
        });
        store.push_activity(&ActivityEvent::ForceCleared {
            cleared: vec![RunKey::new("R2", Panel::Secondary)],
            reason: ClearReason::StaleRegistry,
        });
        store.set_busy(false);

        let summaries: Vec<(u64, &str)> = store
            .timeline()
            .iter()
            .map(|entry| (entry.sequence, entry.summary.as_str()))
            .collect();
        assert_eq!(
            summaries,
            vec![
                (1, "activity_began R1"),
                (2, "busy true"),
                (3, "activity_stalled R1 after 60000ms"),
                (4, "activity_cleared stale_registry runs=1"),
                (5, "busy false"),
            ]
        );
        assert!(!store.is_busy());
    }

    #[tokio::test]
    async fn run_turn_rejects_an_empty_turn() {
        let mut runtime = DuetRuntime::default();
        let result = runtime.run_turn(Vec::new(), None).await;
        assert!(matches!(result, Err(DuetRuntimeError::NoFeeds)));
    }

    #[tokio::test]
    async fn replay_signals_abort_after_the_limit() {
        let abort = RunAbort::new();
        let events = (0..3)
            .map(|n| RawEvent::new("message-delta", json!({ "n": n })))
            .collect();
        let mut rx = spawn_replay(events, Some(2), abort.clone());

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event.data["n"].clone());
        }
        assert_eq!(received, vec![json!(0), json!(1)]);
        assert!(abort.is_aborted());
    }
}
