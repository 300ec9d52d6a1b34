//! One turn of a conversation: up to two panels, each streaming one run.
//!
//! [`TurnSession`] owns everything scoped to the turn (correlator maps, run
//! controllers, throttles) and releases it when every run has concluded or
//! the session is dropped. Event-level problems are logged and the event is
//! dropped; run-level problems always yield a [`RecoveryPayload`].

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::assembler::AssembleError;
use crate::assembler::append;
use crate::assembler::assemble;
use crate::assembler::relocate;
use crate::config::StreamConfig;
use crate::correlator::CorrelatorError;
use crate::correlator::RunCorrelator;
use crate::message::Message;
use crate::message::SegmentKind;
use crate::message::SegmentPatch;
use crate::message::ToolCallPatch;
use crate::normalizer::NormalizeError;
use crate::normalizer::normalize;
use crate::persist::MessageSaver;
use crate::protocol::DELTA_TYPE_TOOL_CALLS;
use crate::protocol::Panel;
use crate::protocol::RawEvent;
use crate::protocol::StepKind;
use crate::protocol::StreamEvent;
use crate::recovery::AbortReason;
use crate::recovery::RecoveryPayload;
use crate::recovery::RunAbort;
use crate::recovery::RunController;
use crate::recovery::RunState;
use crate::recovery::Submission;
use crate::registry::ActivityEvent;
use crate::registry::RunActivityRegistry;
use crate::throttle::Progress;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("the {0} panel already has a run in this turn")]
    PanelAlreadyStarted(Panel),
    #[error("the {0} panel has no run in this turn")]
    PanelNotStarted(Panel),
}

/// Event-level failure. Logged, never propagated out of the session.
#[derive(Debug, Error)]
pub enum StreamFault {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Correlate(#[from] CorrelatorError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("event for run `{run_id}` does not belong to the {panel} panel's run `{expected}`")]
    ForeignRun {
        panel: Panel,
        run_id: String,
        expected: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub panel: Panel,
    pub message: Message,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutput {
    Update(MessageUpdate),
    Recovered(RecoveryPayload),
}

#[derive(Debug)]
pub struct TurnSession {
    registry: RunActivityRegistry,
    correlator: RunCorrelator,
    runs: BTreeMap<Panel, RunController>,
    throttle_interval: Duration,
}

impl TurnSession {
    pub fn new(registry: RunActivityRegistry, throttle_interval: Duration) -> Self {
        Self {
            registry,
            correlator: RunCorrelator::new(),
            runs: BTreeMap::new(),
            throttle_interval,
        }
    }

    pub fn from_config(registry: RunActivityRegistry, config: &StreamConfig) -> Self {
        Self::new(registry, config.throttle_interval())
    }

    pub fn registry(&self) -> &RunActivityRegistry {
        &self.registry
    }

    /// Starts `submission`'s run and registers it as active. Returns the
    /// run's abort handle.
    pub fn begin(&mut self, submission: Submission) -> Result<RunAbort, TurnError> {
        let panel = submission.panel;
        if self.runs.contains_key(&panel) {
            return Err(TurnError::PanelAlreadyStarted(panel));
        }
        let mut run = RunController::new(submission, self.throttle_interval);
        run.activate(&self.registry);
        let abort = run.abort_handle().clone();
        self.runs.insert(panel, run);
        Ok(abort)
    }

    pub fn panels(&self) -> impl Iterator<Item = Panel> + '_ {
        self.runs.keys().copied()
    }

    pub fn run_state(&self, panel: Panel) -> Option<RunState> {
        self.runs.get(&panel).map(RunController::state)
    }

    pub fn abort_handle(&self, panel: Panel) -> Option<RunAbort> {
        self.runs.get(&panel).map(|run| run.abort_handle().clone())
    }

    pub fn progress_receiver(&self, panel: Panel) -> Option<watch::Receiver<Progress>> {
        self.runs.get(&panel).map(|run| run.throttle().subscribe())
    }

    /// Latest assembled message for the panel's run.
    pub fn message(&self, panel: Panel) -> Option<Message> {
        let run = self.runs.get(&panel)?;
        Some(
            self.correlator
                .message(panel, run.run_id())
                .cloned()
                .unwrap_or_else(|| run.fresh_message()),
        )
    }

    pub async fn handle_event(&mut self, panel: Panel, raw: RawEvent) -> Option<TurnOutput> {
        let Some(run) = self.runs.get(&panel) else {
            warn!(%panel, event = %raw.event, "event for a panel with no run in this turn");
            return None;
        };
        if run.abort_handle().is_aborted() && !run.state().is_terminal() {
            return self
                .recover(panel, AbortReason::UserCancelled)
                .map(TurnOutput::Recovered);
        }
        if !run.state().accepts_updates() {
            debug!(%panel, event = %raw.event, "dropping event for a concluded run");
            return None;
        }

        let result = match normalize(raw) {
            Ok(event) => self.apply(panel, event).await,
            Err(error) => Err(error.into()),
        };
        match result {
            Ok(output) => output,
            Err(fault) => {
                log_fault(panel, &fault);
                None
            }
        }
    }

    /// `Active -> Completed`; emits the final message once.
    pub fn complete(&mut self, panel: Panel) -> Result<Option<MessageUpdate>, TurnError> {
        let message = self
            .message(panel)
            .ok_or(TurnError::PanelNotStarted(panel))?;
        let run = self
            .runs
            .get_mut(&panel)
            .ok_or(TurnError::PanelNotStarted(panel))?;
        if run.complete(&self.registry).is_none() {
            return Ok(None);
        }
        debug!(%panel, run_id = %message.run_id, "run completed");
        self.release_if_concluded();
        Ok(Some(MessageUpdate {
            panel,
            message,
            is_final: true,
        }))
    }

    /// Completes the run and hands the finished message to `saver`. A failed
    /// save is logged and not retried.
    pub async fn complete_and_save(
        &mut self,
        panel: Panel,
        saver: &dyn MessageSaver,
    ) -> Result<Option<MessageUpdate>, TurnError> {
        let update = self.complete(panel)?;
        if let Some(update) = &update
            && let Err(error) = saver.save(panel, &update.message).await
        {
            warn!(%panel, run_id = %update.message.run_id, %error, "failed to save finished message");
        }
        Ok(update)
    }

    pub fn abort(
        &mut self,
        panel: Panel,
        reason: AbortReason,
    ) -> Result<Option<RecoveryPayload>, TurnError> {
        if !self.runs.contains_key(&panel) {
            return Err(TurnError::PanelNotStarted(panel));
        }
        Ok(self.recover(panel, reason))
    }

    /// Routes a run the registry gave up on through recovery.
    pub fn handle_stall(&mut self, run_id: &str, panel: Panel) -> Option<RecoveryPayload> {
        let run = self.runs.get(&panel)?;
        if run.run_id() != run_id || run.state().is_terminal() {
            return None;
        }
        self.recover(panel, AbortReason::Stalled)
    }

    pub fn handle_activity(&mut self, event: &ActivityEvent) -> Vec<RecoveryPayload> {
        match event {
            ActivityEvent::Stalled { key, .. } => {
                self.handle_stall(&key.run_id, key.panel).into_iter().collect()
            }
            ActivityEvent::ForceCleared { cleared, .. } => cleared
                .iter()
                .filter_map(|key| self.handle_stall(&key.run_id, key.panel))
                .collect(),
            ActivityEvent::Began(_) | ActivityEvent::Ended(_) => Vec::new(),
        }
    }

    /// Fires every throttle whose deadline has passed; returns their panels.
    pub fn poll_progress(&mut self, now: Instant) -> Vec<Panel> {
        self.runs
            .iter_mut()
            .filter_map(|(panel, run)| run.throttle_mut().poll_due(now).then_some(*panel))
            .collect()
    }

    pub fn next_progress_deadline(&self) -> Option<Instant> {
        self.runs
            .values()
            .filter_map(|run| run.throttle().deadline())
            .min()
    }

    /// Every started run has reached a terminal state.
    pub fn is_concluded(&self) -> bool {
        self.runs.values().all(|run| run.state().is_terminal())
    }

    /// Aborts whatever is still running and releases all turn state.
    pub fn teardown(&mut self) -> Vec<RecoveryPayload> {
        let panels: Vec<Panel> = self.runs.keys().copied().collect();
        let recovered = panels
            .into_iter()
            .filter_map(|panel| self.recover(panel, AbortReason::Teardown))
            .collect();
        self.correlator.clear();
        recovered
    }

    async fn apply(
        &mut self,
        panel: Panel,
        event: StreamEvent,
    ) -> Result<Option<TurnOutput>, StreamFault> {
        match event {
            StreamEvent::RunStepCreated(created) => {
                self.expect_run(panel, &created.run_id)?;
                if created.kind == StepKind::ToolCalls
                    && let Some(run) = self.runs.get_mut(&panel)
                {
                    run.throttle_mut().flush().await;
                }
                let index = self
                    .correlator
                    .register_step(
                        panel,
                        &created.step_id,
                        &created.run_id,
                        created.index,
                        created.kind,
                        &created.tool_calls,
                    )
                    .index;
                let patches = match created.kind {
                    StepKind::ToolCalls => {
                        let first = created.tool_calls.into_iter().next().unwrap_or_default();
                        vec![SegmentPatch::ToolCall(first)]
                    }
                    StepKind::MessageCreation | StepKind::Other => Vec::new(),
                };
                self.assemble_patches(panel, index, patches, false)
            }
            StreamEvent::RunStepDelta(delta) => {
                let index = self.locate_step(panel, &delta.step_id)?;
                if delta.delta_type != DELTA_TYPE_TOOL_CALLS {
                    debug!(%panel, step_id = %delta.step_id, delta_type = %delta.delta_type, "ignoring step delta without tool calls");
                    return Ok(None);
                }
                let fallback = self.tool_call_id(panel, &delta.step_id);
                let patches = delta
                    .tool_calls
                    .into_iter()
                    .map(|patch| SegmentPatch::ToolCall(with_fallback_id(patch, fallback.as_deref())))
                    .collect();
                self.assemble_patches(panel, index, patches, false)
            }
            StreamEvent::RunStepCompleted(completed) => {
                let index = self.locate_step(panel, &completed.step_id)?;
                if let Some(reported) = completed.index.filter(|reported| *reported != index) {
                    debug!(%panel, step_id = %completed.step_id, reported, index, "completed step reports another index; keeping the registered one");
                }
                let fallback = self.tool_call_id(panel, &completed.step_id);
                let patch = with_fallback_id(completed.tool_call, fallback.as_deref());
                self.assemble_patches(panel, index, vec![SegmentPatch::ToolCall(patch)], true)
            }
            StreamEvent::MessageDelta(delta) | StreamEvent::ReasoningDelta(delta) => {
                let index = self.locate_step(panel, &delta.step_id)?;
                self.assemble_parts(panel, &delta.step_id, index, delta.patches)
            }
            StreamEvent::AgentUpdate(update) => {
                self.expect_run(panel, &update.run_id)?;
                self.assemble_patches(
                    panel,
                    update.index,
                    vec![SegmentPatch::AgentUpdate(update.payload)],
                    false,
                )
            }
            StreamEvent::Error(error) => {
                if let Some(run_id) = &error.run_id {
                    self.expect_run(panel, run_id)?;
                }
                let current = self.current_message(panel)?;
                let message = append(&current, SegmentPatch::Error(error.message.clone()))?;
                self.correlator.store_message(panel, message);
                Ok(self
                    .recover(panel, AbortReason::TransportFailure(error.message))
                    .map(TurnOutput::Recovered))
            }
        }
    }

    /// Applies `patches` in order at `index`. Rejected patches are logged;
    /// nothing is emitted when every patch was rejected.
    fn assemble_patches(
        &mut self,
        panel: Panel,
        index: usize,
        patches: Vec<SegmentPatch>,
        is_final: bool,
    ) -> Result<Option<TurnOutput>, StreamFault> {
        self.assemble_at(panel, None, index, patches, is_final)
    }

    /// Applies the parts of one content delta. The first part kind takes the
    /// step's own slot; parts of any other kind go to a side slot per kind.
    fn assemble_parts(
        &mut self,
        panel: Panel,
        step_id: &str,
        index: usize,
        patches: Vec<SegmentPatch>,
    ) -> Result<Option<TurnOutput>, StreamFault> {
        self.assemble_at(panel, Some(step_id), index, patches, false)
    }

    fn assemble_at(
        &mut self,
        panel: Panel,
        parts_of: Option<&str>,
        index: usize,
        patches: Vec<SegmentPatch>,
        is_final: bool,
    ) -> Result<Option<TurnOutput>, StreamFault> {
        let current = self.current_message(panel)?;
        let mut message = self.claim_slot(panel, index, current);
        let attempted = patches.len();
        let mut rejected = 0;
        for patch in patches {
            let slot = match parts_of {
                Some(step_id) => self.part_index(panel, step_id, index, patch.kind(), &message),
                None => index,
            };
            match assemble(&message, slot, patch, is_final) {
                Ok(next) => message = next,
                Err(error) => {
                    rejected += 1;
                    log_fault(panel, &error.into());
                }
            }
        }
        if attempted > 0 && rejected == attempted {
            return Ok(None);
        }
        Ok(self.commit(panel, message))
    }

    fn part_index(
        &mut self,
        panel: Panel,
        step_id: &str,
        index: usize,
        kind: SegmentKind,
        message: &Message,
    ) -> usize {
        if message
            .segment(index)
            .is_none_or(|segment| segment.kind() == kind)
        {
            return index;
        }
        if let Some(slot) = self.correlator.part_slot(panel, step_id, kind) {
            return slot;
        }
        let slot = message.content.len();
        self.correlator.assign_part_slot(panel, step_id, kind, slot);
        slot
    }

    /// Moves a side part out of `index` so the step registered there owns it.
    fn claim_slot(&mut self, panel: Panel, index: usize, message: Message) -> Message {
        let Some((step_id, kind)) = self.correlator.part_at(panel, index) else {
            return message;
        };
        let Some((moved, slot)) = relocate(&message, index) else {
            return message;
        };
        debug!(%panel, step_id = %step_id, %kind, from = index, to = slot, "moved content part for a new step");
        self.correlator.assign_part_slot(panel, &step_id, kind, slot);
        moved
    }

    fn commit(&mut self, panel: Panel, message: Message) -> Option<TurnOutput> {
        let run = self.runs.get_mut(&panel)?;
        if !run.record(&message) {
            return None;
        }
        self.correlator.store_message(panel, message.clone());
        Some(TurnOutput::Update(MessageUpdate {
            panel,
            message,
            is_final: false,
        }))
    }

    fn recover(&mut self, panel: Panel, reason: AbortReason) -> Option<RecoveryPayload> {
        let message = self.message(panel)?;
        let run = self.runs.get_mut(&panel)?;
        let recovered = run.abort(reason, &self.registry, &message);
        self.release_if_concluded();
        recovered
    }

    fn current_message(&self, panel: Panel) -> Result<Message, TurnError> {
        self.message(panel).ok_or(TurnError::PanelNotStarted(panel))
    }

    fn expect_run(&self, panel: Panel, run_id: &str) -> Result<(), StreamFault> {
        let run = self
            .runs
            .get(&panel)
            .ok_or(TurnError::PanelNotStarted(panel))?;
        if run.run_id() == run_id {
            return Ok(());
        }
        Err(StreamFault::ForeignRun {
            panel,
            run_id: run_id.to_string(),
            expected: run.run_id().to_string(),
        })
    }

    /// Index of a registered step that belongs to the panel's run.
    fn locate_step(&self, panel: Panel, step_id: &str) -> Result<usize, StreamFault> {
        let run_id = self.correlator.resolve_run(panel, step_id)?;
        self.expect_run(panel, run_id)?;
        let step = self.correlator.step(panel, step_id).ok_or_else(|| {
            CorrelatorError::UnknownStep {
                panel,
                step_id: step_id.to_string(),
            }
        })?;
        Ok(step.index)
    }

    fn tool_call_id(&self, panel: Panel, step_id: &str) -> Option<String> {
        self.correlator
            .tool_call_id_for(panel, step_id)
            .map(str::to_string)
    }

    fn release_if_concluded(&mut self) {
        if self.is_concluded() && !self.correlator.is_empty() {
            self.correlator.clear();
            debug!("turn concluded; correlator released");
        }
    }
}

impl Drop for TurnSession {
    fn drop(&mut self) {
        let abandoned = self.teardown();
        if !abandoned.is_empty() {
            debug!(runs = abandoned.len(), "turn session dropped with runs in flight");
        }
    }
}

fn with_fallback_id(mut patch: ToolCallPatch, fallback: Option<&str>) -> ToolCallPatch {
    let missing = patch.id.as_deref().is_none_or(str::is_empty);
    if missing && let Some(id) = fallback {
        patch.id = Some(id.to_string());
    }
    patch
}

fn log_fault(panel: Panel, fault: &StreamFault) {
    match fault {
        StreamFault::Assemble(error) => {
            warn!(%panel, %error, "rejected segment patch");
        }
        other => warn!(%panel, error = %other, "dropping stream event"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::MessageUpdate;
    use super::TurnError;
    use super::TurnOutput;
    use super::TurnSession;
    use crate::message::ContentSegment;
    use crate::message::Message;
    use crate::message::ToolArgs;
    use crate::persist::MemoryMessageSaver;
    use crate::protocol::Panel;
    use crate::protocol::RawEvent;
    use crate::recovery::AbortReason;
    use crate::recovery::RunState;
    use crate::recovery::Submission;
    use crate::registry::ActivityEvent;
    use crate::registry::ClearReason;
    use crate::registry::RegistryTimings;
    use crate::registry::RunActivityRegistry;

    const THROTTLE: Duration = Duration::from_millis(250);

    fn session() -> TurnSession {
        TurnSession::new(RunActivityRegistry::default(), THROTTLE)
    }

    fn submission(panel: Panel, run_id: &str) -> Submission {
        let placeholder = Message::placeholder(
            "pending",
            "assistant",
            Some("convo-1".to_string()),
            Some("user-1".to_string()),
        );
        Submission::new(panel, run_id, placeholder)
    }

    fn start(session: &mut TurnSession, panel: Panel, run_id: &str) {
        if let Err(error) = session.begin(submission(panel, run_id)) {
            panic!("failed to begin {panel}: {error}");
        }
    }

    fn created(step_id: &str, run_id: &str, index: usize, kind: &str, tool_calls: Value) -> RawEvent {
        RawEvent::new(
            "run-step-created",
            json!({
                "id": step_id,
                "runId": run_id,
                "index": index,
                "stepDetails": { "type": kind, "tool_calls": tool_calls }
            }),
        )
    }

    fn text_delta(step_id: &str, text: &str) -> RawEvent {
        RawEvent::new(
            "message-delta",
            json!({ "id": step_id, "delta": { "content": [{ "type": "text", "text": text }] } }),
        )
    }

    fn update(output: Option<TurnOutput>) -> MessageUpdate {
        match output {
            Some(TurnOutput::Update(update)) => update,
            other => panic!("expected a message update, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn assembles_text_across_deltas_and_completes() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");

        let first = update(
            session
                .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
                .await,
        );
        assert_eq!(first.message.message_id, "R1");
        assert_eq!(first.message.conversation_id.as_deref(), Some("convo-1"));

        session.handle_event(Panel::Primary, text_delta("A", "Hel")).await;
        let latest = update(session.handle_event(Panel::Primary, text_delta("A", "lo")).await);
        assert_eq!(latest.message.text, "Hello");
        assert!(session.registry().is_busy());

        let Ok(Some(done)) = session.complete(Panel::Primary) else {
            panic!("completion should emit the final message");
        };
        assert!(done.is_final);
        assert_eq!(done.message.text, "Hello");
        assert_eq!(session.run_state(Panel::Primary), Some(RunState::Completed));
        assert!(!session.registry().is_busy());
        assert!(session.is_concluded());

        assert_eq!(session.complete(Panel::Primary), Ok(None));
        assert_eq!(
            session.handle_event(Panel::Primary, text_delta("A", "!")).await,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_arguments_stream_and_finalize() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(
                Panel::Primary,
                created(
                    "T",
                    "R1",
                    1,
                    "tool_calls",
                    json!([{ "id": "call_1", "name": "search", "args": "" }]),
                ),
            )
            .await;
        for fragment in ["{\"q\":", "1}"] {
            session
                .handle_event(
                    Panel::Primary,
                    RawEvent::new(
                        "run-step-delta",
                        json!({ "id": "T", "delta": { "type": "tool_calls", "tool_calls": [{ "args": fragment }] } }),
                    ),
                )
                .await;
        }

        let Some(message) = session.message(Panel::Primary) else {
            panic!("panel should have a message");
        };
        let Some(ContentSegment::ToolCall { tool_call }) = message.segment(1) else {
            panic!("expected a tool call at index 1");
        };
        assert_eq!(tool_call.id, "call_1");
        assert_eq!(tool_call.args, ToolArgs::Partial("{\"q\":1}".to_string()));
        assert_eq!(tool_call.progress, None);

        let completed = RawEvent::new(
            "run-step-completed",
            json!({ "result": { "id": "T", "tool_call": { "name": "search", "output": "3 hits" } } }),
        );
        let first = update(session.handle_event(Panel::Primary, completed.clone()).await);
        let second = update(session.handle_event(Panel::Primary, completed).await);
        assert_eq!(first.message, second.message);

        let Some(ContentSegment::ToolCall { tool_call }) = second.message.segment(1) else {
            panic!("expected a tool call at index 1");
        };
        assert_eq!(tool_call.id, "call_1");
        assert_eq!(tool_call.args, ToolArgs::Partial("{\"q\":1}".to_string()));
        assert_eq!(tool_call.progress, Some(1.0));
        assert_eq!(tool_call.output.as_deref(), Some("3 hits"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn delta_for_unregistered_step_is_dropped() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "kept")).await;

        let output = session.handle_event(Panel::Primary, text_delta("ghost", "lost")).await;
        assert_eq!(output, None);
        assert!(logs_contain("never registered"));

        let Some(message) = session.message(Panel::Primary) else {
            panic!("panel should have a message");
        };
        assert_eq!(message.text, "kept");
        assert_eq!(session.run_state(Panel::Primary), Some(RunState::Active));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn malformed_and_foreign_events_are_dropped() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");

        let unknown = session
            .handle_event(Panel::Primary, RawEvent::new("on_run_step", json!({})))
            .await;
        assert_eq!(unknown, None);
        assert!(logs_contain("unrecognized event name"));

        let foreign = session
            .handle_event(Panel::Primary, created("A", "R9", 0, "message_creation", json!([])))
            .await;
        assert_eq!(foreign, None);
        assert!(logs_contain("does not belong"));
        assert_eq!(session.run_state(Panel::Primary), Some(RunState::Active));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn kind_mismatch_is_rejected_and_logged() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "text")).await;

        let collision = session
            .handle_event(
                Panel::Primary,
                created("B", "R1", 0, "tool_calls", json!([{ "id": "call_1" }])),
            )
            .await;
        assert_eq!(collision, None);
        assert!(logs_contain("segment kind mismatch at index 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_signal_recovers_text_processed_before_it() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        let Some(abort) = session.abort_handle(Panel::Primary) else {
            panic!("run should expose its abort handle");
        };
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "Hel")).await;
        session.handle_event(Panel::Primary, text_delta("A", "lo")).await;

        abort.signal();
        let output = session.handle_event(Panel::Primary, text_delta("A", " world")).await;
        let Some(TurnOutput::Recovered(payload)) = output else {
            panic!("expected recovery, got {output:?}");
        };
        assert_eq!(payload.partial_text, "Hello");
        assert_eq!(payload.state, RunState::Aborted);
        assert_eq!(payload.message.text, "Hello");
        assert_eq!(payload.parent_message_id.as_deref(), Some("user-1"));
        assert!(!session.registry().is_busy());
        assert!(session.is_concluded());
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_fails_the_run_with_an_error_segment() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "partial")).await;

        let output = session
            .handle_event(
                Panel::Primary,
                RawEvent::new("error", json!({ "message": "upstream closed" })),
            )
            .await;
        let Some(TurnOutput::Recovered(payload)) = output else {
            panic!("expected recovery, got {output:?}");
        };
        assert_eq!(payload.state, RunState::Failed);
        assert_eq!(
            payload.error.as_deref(),
            Some("transport failure: upstream closed")
        );
        assert_eq!(payload.partial_text, "partial");
        assert_eq!(
            payload.message.segment(1),
            Some(&ContentSegment::Error {
                message: "upstream closed".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panels_stay_independent() {
        let mut session = session();
        start(&mut session, Panel::Primary, "RA");
        start(&mut session, Panel::Secondary, "RB");
        for (panel, run_id) in [(Panel::Primary, "RA"), (Panel::Secondary, "RB")] {
            session
                .handle_event(panel, created("step", run_id, 0, "message_creation", json!([])))
                .await;
        }
        session.handle_event(Panel::Primary, text_delta("step", "left")).await;
        session.handle_event(Panel::Secondary, text_delta("step", "right")).await;

        let Ok(Some(recovered)) = session.abort(Panel::Primary, AbortReason::UserCancelled)
        else {
            panic!("primary abort should recover");
        };
        assert_eq!(recovered.partial_text, "left");
        assert!(session.registry().is_busy());
        assert!(!session.is_concluded());

        let more = update(session.handle_event(Panel::Secondary, text_delta("step", "!")).await);
        assert_eq!(more.message.text, "right!");

        let Ok(Some(done)) = session.complete(Panel::Secondary) else {
            panic!("secondary should complete");
        };
        assert_eq!(done.message.text, "right!");
        assert!(!session.registry().is_busy());
        assert!(session.is_concluded());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_run_is_recovered_from_registry_activity() {
        let mut session = session();
        let mut activity = session.registry().event_receiver();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "slow")).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut recovered = Vec::new();
        while let Ok(event) = activity.try_recv() {
            recovered.extend(session.handle_activity(&event));
        }

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, RunState::Failed);
        assert_eq!(recovered[0].partial_text, "slow");
        assert_eq!(recovered[0].error.as_deref(), Some("run stalled"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_registry_sweep_fails_the_open_run() {
        let registry = RunActivityRegistry::new(RegistryTimings {
            watchdog_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            staleness_threshold: Duration::from_secs(120),
        });
        let mut activity = registry.event_receiver();
        let _sweeper = registry.spawn_sweeper();
        let mut session = TurnSession::new(registry.clone(), THROTTLE);
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "half")).await;

        tokio::time::sleep(Duration::from_secs(121)).await;
        let mut swept = false;
        let mut recovered = Vec::new();
        while let Ok(event) = activity.try_recv() {
            swept |= matches!(
                event,
                ActivityEvent::ForceCleared {
                    reason: ClearReason::StaleRegistry,
                    ..
                }
            );
            recovered.extend(session.handle_activity(&event));
        }

        assert!(swept);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, RunState::Failed);
        assert_eq!(recovered[0].error.as_deref(), Some("run stalled"));
        assert_eq!(recovered[0].partial_text, "half");
        assert_eq!(session.run_state(Panel::Primary), Some(RunState::Failed));
        assert!(!registry.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_content_parts_each_keep_a_slot() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        let mixed = RawEvent::new(
            "message-delta",
            json!({
                "id": "A",
                "delta": { "content": [
                    { "type": "text", "text": "look: " },
                    { "type": "image_url", "image_url": { "url": "https://img/1.png" } }
                ] }
            }),
        );

        let both = update(session.handle_event(Panel::Primary, mixed).await);
        assert_eq!(both.message.text, "look: ");
        assert_eq!(
            both.message.segment(1),
            Some(&ContentSegment::ImageRef {
                url: "https://img/1.png".to_string()
            })
        );

        session.handle_event(Panel::Primary, text_delta("A", "here")).await;
        let tools = update(
            session
                .handle_event(
                    Panel::Primary,
                    created("T", "R1", 1, "tool_calls", json!([{ "id": "call_1", "name": "search" }])),
                )
                .await,
        );
        assert_eq!(tools.message.text, "look: here");
        let Some(ContentSegment::ToolCall { tool_call }) = tools.message.segment(1) else {
            panic!("expected the tool call to own index 1");
        };
        assert_eq!(tool_call.id, "call_1");
        assert_eq!(
            tools.message.segment(2),
            Some(&ContentSegment::ImageRef {
                url: "https://img/1.png".to_string()
            })
        );
        assert_eq!(tools.message.segment_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_agent_update_index_is_dropped() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "kept")).await;
        let before = session.message(Panel::Primary);

        let huge = RawEvent::new(
            "agent-update",
            json!({ "agent_update": { "runId": "R1", "index": u64::MAX, "agent": "planner" } }),
        );
        assert_eq!(session.handle_event(Panel::Primary, huge).await, None);
        assert_eq!(session.message(Panel::Primary), before);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_step_creation_flushes_pending_progress() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        let Some(progress) = session.progress_receiver(Panel::Primary) else {
            panic!("run should expose progress");
        };
        session
            .handle_event(Panel::Primary, created("A", "R1", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Primary, text_delta("A", "Let me ")).await;
        session.handle_event(Panel::Primary, text_delta("A", "search.")).await;
        assert!(session.next_progress_deadline().is_some());

        session
            .handle_event(
                Panel::Primary,
                created("T", "R1", 1, "tool_calls", json!([{ "id": "call_1" }])),
            )
            .await;
        assert_eq!(progress.borrow().text, "Let me search.");
    }

    #[tokio::test(start_paused = true)]
    async fn begin_rejects_a_second_run_on_the_same_panel() {
        let mut session = session();
        start(&mut session, Panel::Primary, "R1");
        let second = session.begin(submission(Panel::Primary, "R2"));
        assert!(matches!(second, Err(TurnError::PanelAlreadyStarted(Panel::Primary))));
        assert_eq!(
            session.complete(Panel::Secondary),
            Err(TurnError::PanelNotStarted(Panel::Secondary))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn complete_and_save_hands_the_final_message_over_once() {
        let mut session = session();
        let saver = MemoryMessageSaver::new();
        start(&mut session, Panel::Secondary, "R2");
        session
            .handle_event(Panel::Secondary, created("A", "R2", 0, "message_creation", json!([])))
            .await;
        session.handle_event(Panel::Secondary, text_delta("A", "done")).await;

        let first = session.complete_and_save(Panel::Secondary, &saver).await;
        assert!(matches!(first, Ok(Some(_))));
        let second = session.complete_and_save(Panel::Secondary, &saver).await;
        assert_eq!(second, Ok(None));

        let saved = saver.saved().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, Panel::Secondary);
        assert_eq!(saved[0].1.text, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_releases_the_registry() {
        let registry = RunActivityRegistry::default();
        {
            let mut session = TurnSession::new(registry.clone(), THROTTLE);
            start(&mut session, Panel::Primary, "R1");
            start(&mut session, Panel::Secondary, "R2");
            assert!(registry.is_busy());
        }
        assert!(!registry.is_busy());
    }
}
