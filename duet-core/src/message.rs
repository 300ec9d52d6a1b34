use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Tool-call arguments: a string while still streaming, or an already
/// structured value once the provider sends it whole.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolArgs {
    Partial(String),
    Structured(Value),
}

impl Default for ToolArgs {
    fn default() -> Self {
        Self::Partial(String::new())
    }
}

impl ToolArgs {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(fragment) => Some(Self::Partial(fragment)),
            structured => Some(Self::Structured(structured)),
        }
    }

    /// String fragments concatenate; a structured value on either side is
    /// treated as complete and the incoming value wins.
    pub fn merge(&mut self, incoming: ToolArgs) {
        match (self, incoming) {
            (Self::Partial(existing), Self::Partial(fragment)) => existing.push_str(&fragment),
            (slot, incoming) => *slot = incoming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: ToolArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl ToolCall {
    fn from_patch(patch: ToolCallPatch, is_final: bool) -> Self {
        let mut tool_call = Self::default();
        tool_call.apply(patch, is_final);
        tool_call
    }

    fn apply(&mut self, patch: ToolCallPatch, is_final: bool) {
        if let Some(id) = patch.id.filter(|id| !id.is_empty()) {
            self.id = id;
        }
        if let Some(name) = patch.name.filter(|name| !name.is_empty()) {
            self.name = name;
        }
        if let Some(args) = patch.args {
            if is_final {
                self.args = args;
            } else {
                self.args.merge(args);
            }
        }
        if let Some(output) = patch.output {
            self.output = Some(output);
        }
        if is_final {
            self.progress = Some(1.0);
        }
    }
}

/// One typed, indexed unit of a message's content.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    Text { text: String },
    Reasoning { think: String },
    ToolCall { tool_call: ToolCall },
    ImageRef { url: String },
    AgentUpdate { payload: Value },
    Error { message: String },
}

impl ContentSegment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Text { .. } => SegmentKind::Text,
            Self::Reasoning { .. } => SegmentKind::Reasoning,
            Self::ToolCall { .. } => SegmentKind::ToolCall,
            Self::ImageRef { .. } => SegmentKind::ImageRef,
            Self::AgentUpdate { .. } => SegmentKind::AgentUpdate,
            Self::Error { .. } => SegmentKind::Error,
        }
    }

    pub(crate) fn from_patch(patch: SegmentPatch, is_final: bool) -> Self {
        match patch {
            SegmentPatch::Text(text) => Self::Text { text },
            SegmentPatch::Reasoning(think) => Self::Reasoning { think },
            SegmentPatch::ToolCall(patch) => Self::ToolCall {
                tool_call: ToolCall::from_patch(patch, is_final),
            },
            SegmentPatch::ImageRef(url) => Self::ImageRef { url },
            SegmentPatch::AgentUpdate(payload) => Self::AgentUpdate { payload },
            SegmentPatch::Error(message) => Self::Error { message },
        }
    }

    /// Merges `patch` into this segment; `Err` hands the patch back when the
    /// kinds disagree.
    pub(crate) fn merge(&mut self, patch: SegmentPatch, is_final: bool) -> Result<(), SegmentPatch> {
        match (self, patch) {
            (Self::Text { text }, SegmentPatch::Text(fragment)) => text.push_str(&fragment),
            (Self::Reasoning { think }, SegmentPatch::Reasoning(fragment)) => {
                think.push_str(&fragment);
            }
            (Self::ToolCall { tool_call }, SegmentPatch::ToolCall(patch)) => {
                tool_call.apply(patch, is_final);
            }
            (Self::ImageRef { url }, SegmentPatch::ImageRef(incoming)) => *url = incoming,
            (Self::AgentUpdate { payload }, SegmentPatch::AgentUpdate(incoming)) => {
                *payload = incoming;
            }
            (Self::Error { message }, SegmentPatch::Error(incoming)) => *message = incoming,
            (_, patch) => return Err(patch),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Text,
    Reasoning,
    ToolCall,
    ImageRef,
    AgentUpdate,
    Error,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
            Self::ToolCall => "tool_call",
            Self::ImageRef => "image_ref",
            Self::AgentUpdate => "agent_update",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCallPatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub args: Option<ToolArgs>,
    pub output: Option<String>,
}

/// A fragment to merge into the segment at some index.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentPatch {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCallPatch),
    ImageRef(String),
    AgentUpdate(Value),
    Error(String),
}

impl SegmentPatch {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Text(_) => SegmentKind::Text,
            Self::Reasoning(_) => SegmentKind::Reasoning,
            Self::ToolCall(_) => SegmentKind::ToolCall,
            Self::ImageRef(_) => SegmentKind::ImageRef,
            Self::AgentUpdate(_) => SegmentKind::AgentUpdate,
            Self::Error(_) => SegmentKind::Error,
        }
    }
}

/// The response under construction for one run.
///
/// `content` is indexed by the originating run step's `index`; slots that no
/// step has written yet are `None`. `text` mirrors the first text segment.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub run_id: String,
    pub parent_message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub content: Vec<Option<ContentSegment>>,
    #[serde(default)]
    pub text: String,
}

impl Message {
    /// The message a panel shows before any run step has been seen.
    pub fn placeholder(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        conversation_id: Option<String>,
        parent_message_id: Option<String>,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            run_id: message_id.clone(),
            message_id,
            parent_message_id,
            conversation_id,
            sender: sender.into(),
            content: Vec::new(),
            text: String::new(),
        }
    }

    /// Clones this placeholder with its identity rebound to `run_id`.
    pub fn for_run(&self, run_id: &str) -> Self {
        Self {
            message_id: run_id.to_string(),
            run_id: run_id.to_string(),
            parent_message_id: self.parent_message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender: self.sender.clone(),
            content: Vec::new(),
            text: String::new(),
        }
    }

    pub fn segment(&self, index: usize) -> Option<&ContentSegment> {
        self.content.get(index).and_then(Option::as_ref)
    }

    pub fn segments(&self) -> impl Iterator<Item = (usize, &ContentSegment)> {
        self.content
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|segment| (index, segment)))
    }

    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.segments().filter_map(|(_, segment)| match segment {
            ContentSegment::ToolCall { tool_call } => Some(tool_call),
            _ => None,
        })
    }

    pub fn first_text(&self) -> Option<&str> {
        self.segments().find_map(|(_, segment)| match segment {
            ContentSegment::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}
