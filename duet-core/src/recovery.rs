use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::message::Message;
use crate::protocol::Panel;
use crate::registry::RunActivityRegistry;
use crate::throttle::Progress;
use crate::throttle::ProgressThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Active,
    Completed,
    Aborted,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn accepts_updates(self) -> bool {
        self == Self::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    UserCancelled,
    TransportFailure(String),
    Stalled,
    Teardown,
}

impl AbortReason {
    fn terminal_state(&self) -> RunState {
        match self {
            Self::UserCancelled | Self::Teardown => RunState::Aborted,
            Self::TransportFailure(_) | Self::Stalled => RunState::Failed,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserCancelled => f.write_str("cancelled by user"),
            Self::TransportFailure(message) => write!(f, "transport failure: {message}"),
            Self::Stalled => f.write_str("run stalled"),
            Self::Teardown => f.write_str("session torn down"),
        }
    }
}

/// Abort signal shared between the transport and the session.
#[derive(Debug, Clone, Default)]
pub struct RunAbort {
    token: CancellationToken,
}

impl RunAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`RunAbort::signal`] has been called.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }
}

/// What the route layer hands over when a panel starts a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub panel: Panel,
    pub run_id: String,
    pub placeholder: Message,
    pub abort: RunAbort,
}

impl Submission {
    pub fn new(panel: Panel, run_id: impl Into<String>, placeholder: Message) -> Self {
        Self {
            panel,
            run_id: run_id.into(),
            placeholder,
            abort: RunAbort::new(),
        }
    }
}

/// Frozen best-known state of a run that ended without completing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPayload {
    pub panel: Panel,
    pub partial_text: String,
    pub conversation_id: Option<String>,
    pub sender: String,
    pub run_id: String,
    pub message_id: String,
    pub parent_message_id: Option<String>,
    pub state: RunState,
    /// Set when the run failed; aborted runs carry no error.
    pub error: Option<String>,
    pub message: Message,
}

/// Per-run state machine plus the progress throttle it owns.
#[derive(Debug)]
pub struct RunController {
    submission: Submission,
    state: RunState,
    throttle: ProgressThrottle,
}

impl RunController {
    pub fn new(submission: Submission, throttle_interval: Duration) -> Self {
        Self {
            submission,
            state: RunState::Idle,
            throttle: ProgressThrottle::new(throttle_interval),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.submission.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn abort_handle(&self) -> &RunAbort {
        &self.submission.abort
    }

    /// The placeholder rebound to this run, before any content arrives.
    pub fn fresh_message(&self) -> Message {
        self.submission.placeholder.for_run(&self.submission.run_id)
    }

    pub fn throttle(&self) -> &ProgressThrottle {
        &self.throttle
    }

    pub fn throttle_mut(&mut self) -> &mut ProgressThrottle {
        &mut self.throttle
    }

    pub fn partial_text(&self) -> &str {
        self.throttle.partial_text()
    }

    /// `Idle -> Active`, registering the run with `registry`.
    pub fn activate(&mut self, registry: &RunActivityRegistry) -> bool {
        if self.state != RunState::Idle {
            return false;
        }
        self.state = RunState::Active;
        registry.begin(&self.submission.run_id, self.submission.panel);
        true
    }

    /// Feeds an assembled message to the throttle. Ignored unless active.
    pub fn record(&mut self, message: &Message) -> bool {
        if !self.state.accepts_updates() {
            debug!(
                run_id = %self.submission.run_id,
                panel = %self.submission.panel,
                state = ?self.state,
                "ignoring update for inactive run"
            );
            return false;
        }
        self.throttle.on_delta(&message.run_id, &message.text);
        true
    }

    /// `Active -> Completed`. A second call returns `None`.
    pub fn complete(&mut self, registry: &RunActivityRegistry) -> Option<Progress> {
        if self.state != RunState::Active {
            return None;
        }
        self.state = RunState::Completed;
        let progress = self.throttle.finish();
        registry.end(&self.submission.run_id, self.submission.panel);
        Some(progress)
    }

    /// Moves a non-terminal run to `Aborted` or `Failed` and freezes
    /// `message` into a recovery payload. The registry entry is released
    /// whatever the prior state.
    pub fn abort(
        &mut self,
        reason: AbortReason,
        registry: &RunActivityRegistry,
        message: &Message,
    ) -> Option<RecoveryPayload> {
        registry.end(&self.submission.run_id, self.submission.panel);
        if self.state.is_terminal() {
            return None;
        }

        self.submission.abort.signal();
        self.state = reason.terminal_state();
        self.throttle.finish();

        let error = (self.state == RunState::Failed).then(|| reason.to_string());
        if error.is_some() {
            warn!(
                run_id = %self.submission.run_id,
                panel = %self.submission.panel,
                %reason,
                "run failed; recovering partial output"
            );
        }

        Some(RecoveryPayload {
            panel: self.submission.panel,
            partial_text: self.throttle.partial_text().to_string(),
            conversation_id: message.conversation_id.clone(),
            sender: message.sender.clone(),
            run_id: self.submission.run_id.clone(),
            message_id: message.message_id.clone(),
            parent_message_id: message.parent_message_id.clone(),
            state: self.state,
            error,
            message: message.clone(),
        })
    }
}
