use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::message::Message;
use crate::protocol::Panel;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to serialize message `{message_id}`: {source}")]
    Serialize {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write saved messages to `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Receives each finished message once its run completes. Failures are
/// reported to the caller, which logs them; saves are never retried.
#[async_trait]
pub trait MessageSaver: Send + Sync {
    async fn save(&self, panel: Panel, message: &Message) -> Result<(), PersistError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMessage {
    pub saved_at: i64,
    pub panel: Panel,
    #[serde(flatten)]
    pub message: Message,
}

/// Appends one JSON line per saved message.
#[derive(Debug, Clone)]
pub struct JsonlMessageSaver {
    path: PathBuf,
    writer: Arc<Mutex<tokio::fs::File>>,
}

impl JsonlMessageSaver {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageSaver for JsonlMessageSaver {
    async fn save(&self, panel: Panel, message: &Message) -> Result<(), PersistError> {
        let record = SavedMessage {
            saved_at: unix_timestamp_now(),
            panel,
            message: message.clone(),
        };
        let mut serialized =
            serde_json::to_string(&record).map_err(|source| PersistError::Serialize {
                message_id: message.message_id.clone(),
                source,
            })?;
        serialized.push('\n');

        let io_error = |source| PersistError::Io {
            path: self.path.to_string_lossy().to_string(),
            source,
        };
        let mut writer = self.writer.lock().await;
        writer
            .write_all(serialized.as_bytes())
            .await
            .map_err(io_error)?;
        writer.flush().await.map_err(io_error)
    }
}

/// Keeps saved messages in memory, in save order.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageSaver {
    saved: Arc<Mutex<Vec<(Panel, Message)>>>,
}

impl MemoryMessageSaver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saved(&self) -> Vec<(Panel, Message)> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl MessageSaver for MemoryMessageSaver {
    async fn save(&self, panel: Panel, message: &Message) -> Result<(), PersistError> {
        self.saved.lock().await.push((panel, message.clone()));
        Ok(())
    }
}

fn unix_timestamp_now() -> i64 {
    let now = SystemTime::now();
    let Ok(duration_since_epoch) = now.duration_since(UNIX_EPOCH) else {
        return 0;
    };
    let secs = duration_since_epoch.as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
