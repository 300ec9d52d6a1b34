use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::message::SegmentPatch;
use crate::message::ToolCallPatch;

pub const EVENT_RUN_STEP_CREATED: &str = "run-step-created";
pub const EVENT_RUN_STEP_DELTA: &str = "run-step-delta";
pub const EVENT_RUN_STEP_COMPLETED: &str = "run-step-completed";
pub const EVENT_MESSAGE_DELTA: &str = "message-delta";
pub const EVENT_REASONING_DELTA: &str = "reasoning-delta";
pub const EVENT_AGENT_UPDATE: &str = "agent-update";
pub const EVENT_ERROR: &str = "error";

/// Step delta type that carries tool-call fragments.
pub const DELTA_TYPE_TOOL_CALLS: &str = "tool_calls";

/// A protocol event exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// One of the (at most two) concurrent UI slots driving a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Panel {
    Primary,
    Secondary,
}

impl Panel {
    pub const ALL: [Panel; 2] = [Panel::Primary, Panel::Secondary];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ToolCalls,
    MessageCreation,
    Other,
}

impl StepKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "tool_calls" => Self::ToolCalls,
            "message_creation" => Self::MessageCreation,
            _ => Self::Other,
        }
    }
}

/// Validated, type-discriminated protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RunStepCreated(RunStepCreated),
    RunStepDelta(RunStepDelta),
    RunStepCompleted(RunStepCompleted),
    MessageDelta(ContentDelta),
    ReasoningDelta(ContentDelta),
    AgentUpdate(AgentUpdate),
    Error(StreamErrorEvent),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStepCreated(_) => EVENT_RUN_STEP_CREATED,
            Self::RunStepDelta(_) => EVENT_RUN_STEP_DELTA,
            Self::RunStepCompleted(_) => EVENT_RUN_STEP_COMPLETED,
            Self::MessageDelta(_) => EVENT_MESSAGE_DELTA,
            Self::ReasoningDelta(_) => EVENT_REASONING_DELTA,
            Self::AgentUpdate(_) => EVENT_AGENT_UPDATE,
            Self::Error(_) => EVENT_ERROR,
        }
    }

    /// Step the event refers to, when it is addressed by step.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::RunStepCreated(event) => Some(&event.step_id),
            Self::RunStepDelta(event) => Some(&event.step_id),
            Self::RunStepCompleted(event) => Some(&event.step_id),
            Self::MessageDelta(event) | Self::ReasoningDelta(event) => Some(&event.step_id),
            Self::AgentUpdate(_) | Self::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStepCreated {
    pub step_id: String,
    pub run_id: String,
    pub index: usize,
    pub kind: StepKind,
    pub tool_calls: Vec<ToolCallPatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStepDelta {
    pub step_id: String,
    pub delta_type: String,
    pub tool_calls: Vec<ToolCallPatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStepCompleted {
    pub step_id: String,
    pub index: Option<usize>,
    pub tool_call: ToolCallPatch,
}

/// Text, reasoning or image fragments addressed to a step.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDelta {
    pub step_id: String,
    pub patches: Vec<SegmentPatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentUpdate {
    pub run_id: String,
    pub index: usize,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamErrorEvent {
    pub run_id: Option<String>,
    pub message: String,
}
