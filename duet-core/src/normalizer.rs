//! Validates raw `{event, data}` pairs and turns them into [`StreamEvent`]s.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::assembler::MAX_SEGMENT_INDEX;
use crate::message::SegmentPatch;
use crate::message::ToolArgs;
use crate::message::ToolCallPatch;
use crate::protocol::AgentUpdate;
use crate::protocol::ContentDelta;
use crate::protocol::EVENT_AGENT_UPDATE;
use crate::protocol::EVENT_ERROR;
use crate::protocol::EVENT_MESSAGE_DELTA;
use crate::protocol::EVENT_REASONING_DELTA;
use crate::protocol::EVENT_RUN_STEP_COMPLETED;
use crate::protocol::EVENT_RUN_STEP_CREATED;
use crate::protocol::EVENT_RUN_STEP_DELTA;
use crate::protocol::RawEvent;
use crate::protocol::RunStepCompleted;
use crate::protocol::RunStepCreated;
use crate::protocol::RunStepDelta;
use crate::protocol::StepKind;
use crate::protocol::StreamErrorEvent;
use crate::protocol::StreamEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed `{event}` event: {reason}")]
    MalformedEvent { event: String, reason: String },
}

impl NormalizeError {
    fn malformed(event: &str, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

/// Pure; never panics on arbitrary input.
pub fn normalize(raw: RawEvent) -> Result<StreamEvent, NormalizeError> {
    let RawEvent { event, data } = raw;
    match event.as_str() {
        EVENT_RUN_STEP_CREATED => {
            let wire: RunStepCreatedWire = parse(&event, data)?;
            Ok(StreamEvent::RunStepCreated(RunStepCreated {
                index: segment_index(&event, wire.index)?,
                step_id: wire.id,
                run_id: wire.run_id,
                kind: StepKind::from_wire(&wire.step_details.kind),
                tool_calls: tool_call_patches(wire.step_details.tool_calls),
            }))
        }
        EVENT_RUN_STEP_DELTA => {
            let wire: RunStepDeltaWire = parse(&event, data)?;
            Ok(StreamEvent::RunStepDelta(RunStepDelta {
                step_id: wire.id,
                delta_type: wire.delta.kind,
                tool_calls: tool_call_patches(wire.delta.tool_calls),
            }))
        }
        EVENT_RUN_STEP_COMPLETED => {
            let wire: RunStepCompletedWire = parse(&event, data)?;
            Ok(StreamEvent::RunStepCompleted(RunStepCompleted {
                step_id: wire.result.id,
                index: wire
                    .result
                    .index
                    .map(|index| segment_index(&event, index))
                    .transpose()?,
                tool_call: wire.result.tool_call.into_patch(),
            }))
        }
        EVENT_MESSAGE_DELTA => {
            let delta = content_delta(&event, data, PartTarget::Message)?;
            Ok(StreamEvent::MessageDelta(delta))
        }
        EVENT_REASONING_DELTA => {
            let delta = content_delta(&event, data, PartTarget::Reasoning)?;
            Ok(StreamEvent::ReasoningDelta(delta))
        }
        EVENT_AGENT_UPDATE => {
            let wire: AgentUpdateWire = parse(&event, data)?;
            let body = wire.agent_update;
            let index = segment_index(&event, body.index)?;
            let mut payload = body.rest;
            payload.insert("runId".to_string(), Value::String(body.run_id.clone()));
            payload.insert("index".to_string(), Value::from(index));
            Ok(StreamEvent::AgentUpdate(AgentUpdate {
                run_id: body.run_id,
                index,
                payload: Value::Object(payload),
            }))
        }
        EVENT_ERROR => stream_error(&event, data).map(StreamEvent::Error),
        _ => Err(NormalizeError::malformed(&event, "unrecognized event name")),
    }
}

fn parse<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, NormalizeError> {
    if data.is_null() {
        return Err(NormalizeError::malformed(event, "missing data"));
    }
    serde_json::from_value(data).map_err(|err| NormalizeError::malformed(event, err.to_string()))
}

fn segment_index(event: &str, index: usize) -> Result<usize, NormalizeError> {
    if index > MAX_SEGMENT_INDEX {
        return Err(NormalizeError::malformed(
            event,
            format!("index {index} exceeds the maximum of {MAX_SEGMENT_INDEX}"),
        ));
    }
    Ok(index)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunStepCreatedWire {
    id: String,
    run_id: String,
    index: usize,
    step_details: StepDetailsWire,
}

#[derive(Deserialize)]
struct StepDetailsWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallWire>,
}

#[derive(Deserialize)]
struct RunStepDeltaWire {
    id: String,
    delta: StepDeltaWire,
}

#[derive(Deserialize)]
struct StepDeltaWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallWire>,
}

#[derive(Deserialize)]
struct RunStepCompletedWire {
    result: CompletedResultWire,
}

#[derive(Deserialize)]
struct CompletedResultWire {
    id: String,
    #[serde(default)]
    index: Option<usize>,
    tool_call: ToolCallWire,
}

/// Tool calls arrive flat (`name`, `args`) or OpenAI-style nested under
/// `function` (`name`, `arguments`).
#[derive(Deserialize, Default)]
struct ToolCallWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    function: Option<FunctionWire>,
}

#[derive(Deserialize)]
struct FunctionWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    output: Value,
}

impl ToolCallWire {
    fn into_patch(self) -> ToolCallPatch {
        let (mut name, mut args, mut output) = (self.name, self.args, self.output);
        if let Some(function) = self.function {
            name = name.or(function.name);
            if args.is_null() {
                args = function.arguments;
            }
            if output.is_null() {
                output = function.output;
            }
        }
        ToolCallPatch {
            id: self.id,
            name,
            args: ToolArgs::from_value(args),
            output: output_text(output),
        }
    }
}

fn output_text(output: Value) -> Option<String> {
    match output {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

fn tool_call_patches(wire: Vec<ToolCallWire>) -> Vec<ToolCallPatch> {
    wire.into_iter().map(ToolCallWire::into_patch).collect()
}

#[derive(Deserialize)]
struct ContentDeltaWire {
    id: String,
    delta: ContentBodyWire,
}

#[derive(Deserialize)]
struct ContentBodyWire {
    content: OneOrMany<PartWire>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PartWire {
    Text {
        text: TextValue,
    },
    Think {
        think: String,
    },
    ImageUrl {
        image_url: ImageUrlValue,
    },
    ImageFile {
        image_file: ImageFileValue,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextValue {
    Plain(String),
    Annotated { value: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageUrlValue {
    Plain(String),
    Object { url: String },
}

#[derive(Deserialize)]
struct ImageFileValue {
    #[serde(default)]
    filepath: Option<String>,
    file_id: String,
}

#[derive(Clone, Copy)]
enum PartTarget {
    Message,
    Reasoning,
}

impl PartWire {
    fn into_patch(self, target: PartTarget) -> Option<SegmentPatch> {
        let patch = match (self, target) {
            (Self::Text { text }, PartTarget::Message) => SegmentPatch::Text(text.into_string()),
            (Self::Text { text }, PartTarget::Reasoning) => {
                SegmentPatch::Reasoning(text.into_string())
            }
            (Self::Think { think }, _) => SegmentPatch::Reasoning(think),
            (Self::ImageUrl { image_url }, PartTarget::Message) => {
                SegmentPatch::ImageRef(image_url.into_url())
            }
            (Self::ImageFile { image_file }, PartTarget::Message) => {
                SegmentPatch::ImageRef(image_file.filepath.unwrap_or(image_file.file_id))
            }
            _ => return None,
        };
        Some(patch)
    }
}

impl TextValue {
    fn into_string(self) -> String {
        match self {
            Self::Plain(text) | Self::Annotated { value: text } => text,
        }
    }
}

impl ImageUrlValue {
    fn into_url(self) -> String {
        match self {
            Self::Plain(url) | Self::Object { url } => url,
        }
    }
}

fn content_delta(
    event: &str,
    data: Value,
    target: PartTarget,
) -> Result<ContentDelta, NormalizeError> {
    let wire: ContentDeltaWire = parse(event, data)?;
    let patches: Vec<SegmentPatch> = wire
        .delta
        .content
        .into_vec()
        .into_iter()
        .filter_map(|part| part.into_patch(target))
        .collect();
    if patches.is_empty() {
        return Err(NormalizeError::malformed(
            event,
            "delta.content carries no supported parts",
        ));
    }
    Ok(ContentDelta {
        step_id: wire.id,
        patches,
    })
}

#[derive(Deserialize)]
struct AgentUpdateWire {
    agent_update: AgentUpdateBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentUpdateBody {
    run_id: String,
    index: usize,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorWire {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    run_id: Option<String>,
}

fn stream_error(event: &str, data: Value) -> Result<StreamErrorEvent, NormalizeError> {
    if let Value::String(message) = data {
        return Ok(StreamErrorEvent {
            run_id: None,
            message,
        });
    }
    let wire: ErrorWire = parse(event, data)?;
    let message = wire
        .message
        .or_else(|| wire.error.and_then(output_text))
        .ok_or_else(|| NormalizeError::malformed(event, "missing `message` or `error`"))?;
    Ok(StreamErrorEvent {
        run_id: wire.run_id,
        message,
    })
}
