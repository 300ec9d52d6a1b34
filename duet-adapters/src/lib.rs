use std::fmt::Display;
use std::path::Path;

use bytes::Bytes;
use duet_core::RawEvent;
use duet_core::protocol::EVENT_RUN_STEP_CREATED;
use eventsource_stream::Event;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

/// Sentinel some servers send as the last `data:` line.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport stream failed: {0}")]
    Transport(String),
    #[error("adapter `{adapter}` could not decode frame: {reason}")]
    InvalidPayload {
        adapter: &'static str,
        reason: String,
    },
    #[error("failed to read transcript `{path}`: {source}")]
    Transcript {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maps one SSE frame onto a raw protocol event. `Ok(None)` means the frame
/// carries no event (keep-alives, end-of-stream markers).
pub trait TransportAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, frame: &Event) -> Result<Option<RawEvent>, AdapterError>;
}

/// `event:` carries the name, `data:` the JSON body.
#[derive(Debug, Default, Clone, Copy)]
pub struct SseEventAdapter;

impl TransportAdapter for SseEventAdapter {
    fn name(&self) -> &'static str {
        "sse-event"
    }

    fn decode(&self, frame: &Event) -> Result<Option<RawEvent>, AdapterError> {
        let data = frame.data.trim();
        if data == DONE_SENTINEL {
            return Ok(None);
        }
        let data = if data.is_empty() {
            Value::Null
        } else {
            parse_json(self.name(), data)?
        };
        Ok(Some(RawEvent::new(frame.event.clone(), data)))
    }
}

/// Every frame's `data:` is a whole `{"event": .., "data": ..}` envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeAdapter;

impl TransportAdapter for EnvelopeAdapter {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn decode(&self, frame: &Event) -> Result<Option<RawEvent>, AdapterError> {
        let data = frame.data.trim();
        if data.is_empty() || data == DONE_SENTINEL {
            return Ok(None);
        }
        let value = parse_json(self.name(), data)?;
        if value.get("event").is_none() {
            debug!(adapter = self.name(), "skipping frame without an event envelope");
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| AdapterError::InvalidPayload {
                adapter: self.name(),
                reason: err.to_string(),
            })
    }
}

fn parse_json(adapter: &'static str, data: &str) -> Result<Value, AdapterError> {
    serde_json::from_str(data).map_err(|err| AdapterError::InvalidPayload {
        adapter,
        reason: err.to_string(),
    })
}

/// Decodes a byte stream as SSE and maps each frame through `adapter`.
pub fn raw_events<S, B, E, A>(
    stream: S,
    adapter: A,
) -> impl Stream<Item = Result<RawEvent, AdapterError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    A: TransportAdapter,
{
    stream.eventsource().filter_map(move |frame| {
        let decoded = match frame {
            Ok(frame) => adapter.decode(&frame).transpose(),
            Err(err) => Some(Err(AdapterError::Transport(err.to_string()))),
        };
        futures::future::ready(decoded)
    })
}

/// Pumps decoded events into `tx` until the stream ends or the receiver is
/// dropped. Undecodable frames are logged and skipped; a transport failure
/// stops the pump. Returns the number of events forwarded.
pub async fn forward_events<S>(events: S, tx: mpsc::Sender<RawEvent>) -> Result<usize, AdapterError>
where
    S: Stream<Item = Result<RawEvent, AdapterError>>,
{
    let mut events = std::pin::pin!(events);
    let mut forwarded = 0;
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    debug!(forwarded, "event receiver dropped; stopping");
                    break;
                }
                forwarded += 1;
            }
            Err(error @ AdapterError::InvalidPayload { .. }) => {
                warn!(%error, "skipping undecodable frame");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(forwarded)
}

/// Reads a transcript with one `{"event": .., "data": ..}` object per line.
/// Lines that do not parse are logged and skipped.
pub async fn read_jsonl_transcript(path: &Path) -> Result<Vec<RawEvent>, AdapterError> {
    let contents = read_transcript(path).await?;
    let mut events = Vec::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(
                path = %path.display(),
                line = line_number + 1,
                %err,
                "skipping malformed transcript line"
            ),
        }
    }
    Ok(events)
}

/// Reads a recorded SSE body and decodes it with `adapter`.
pub async fn read_sse_transcript<A: TransportAdapter>(
    path: &Path,
    adapter: A,
) -> Result<Vec<RawEvent>, AdapterError> {
    let contents = read_transcript(path).await?;
    let body = futures::stream::iter([Ok::<Bytes, std::io::Error>(Bytes::from(contents))]);
    let decoded: Vec<Result<RawEvent, AdapterError>> = raw_events(body, adapter).collect().await;

    let mut events = Vec::with_capacity(decoded.len());
    for event in decoded {
        match event {
            Ok(event) => events.push(event),
            Err(error @ AdapterError::InvalidPayload { .. }) => {
                warn!(path = %path.display(), %error, "skipping undecodable frame");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(events)
}

/// Run id announced by the first `run-step-created` event, if any.
pub fn transcript_run_id(events: &[RawEvent]) -> Option<String> {
    events
        .iter()
        .filter(|event| event.event == EVENT_RUN_STEP_CREATED)
        .find_map(|event| event.data.get("runId")?.as_str().map(str::to_string))
}

async fn read_transcript(path: &Path) -> Result<String, AdapterError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AdapterError::Transcript {
            path: path.to_string_lossy().to_string(),
            source,
        })
}
