//! Durable job state, one JSON record per job signature.
//!
//! Records are written to a temporary file, synced, then renamed over the
//! previous record, so a reader sees either the old record or the new one.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::job::JobSignature;
use crate::sync::cursor::{CursorStore, cmp_names};

pub const CHECKPOINT_VERSION: u32 = 1;
const KEY_HEX_LEN: usize = 12;
const FLUSH_EVERY: u32 = 50;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed checkpoint: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Folders,
    Files,
    Audit,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Folders => "folders",
            Phase::Files => "files",
            Phase::Audit => "audit",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub phase: Phase,
    #[serde(default)]
    pub folder_cursors: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    version: u32,
    job: JobSignature,
    #[serde(flatten)]
    state: JobState,
    #[serde(default)]
    updated_utc: Option<String>,
}

/// Stable short identifier of a job: the first hex digits of the SHA-256 of
/// the signature serialized with sorted keys.
pub fn job_key(signature: &JobSignature) -> Result<String, StateError> {
    let canonical = serde_json::to_value(signature)?;
    let digest = Sha256::digest(serde_json::to_vec(&canonical)?);
    let mut hex = format!("{digest:x}");
    hex.truncate(KEY_HEX_LEN);
    Ok(hex)
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, signature: &JobSignature) -> Result<PathBuf, StateError> {
        Ok(self
            .base_dir
            .join(format!("job-{}.json", job_key(signature)?)))
    }

    /// `None` when no record exists or the record belongs to another format
    /// version or another job.
    pub async fn load(&self, signature: &JobSignature) -> Result<Option<JobState>, StateError> {
        let path = self.path_for(signature)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: CheckpointRecord = serde_json::from_slice(&raw)?;
        if record.version != CHECKPOINT_VERSION || record.job != *signature {
            tracing::debug!(path = %path.display(), "ignoring checkpoint of another job");
            return Ok(None);
        }
        Ok(Some(record.state))
    }

    pub async fn save(&self, signature: &JobSignature, state: &JobState) -> Result<(), StateError> {
        let path = self.path_for(signature)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            job: signature.clone(),
            state: state.clone(),
            updated_utc: Some(OffsetDateTime::now_utc().format(&Rfc3339)?),
        };
        let payload = serde_json::to_vec_pretty(&record)?;

        let partial = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    pub async fn clear(&self, signature: &JobSignature) -> Result<(), StateError> {
        match tokio::fs::remove_file(self.path_for(signature)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

struct Tracked {
    state: JobState,
    unsaved: u32,
}

/// The live state of one job run, persisted through a [`CheckpointStore`].
///
/// Save failures are logged and swallowed: losing a checkpoint only costs
/// redundant work on the next resume.
pub struct JobCheckpoint {
    store: CheckpointStore,
    signature: JobSignature,
    tracked: Mutex<Tracked>,
}

impl JobCheckpoint {
    /// Opens the job's state, starting fresh when nothing usable is stored.
    /// The flag tells whether a previous run was resumed.
    pub async fn open(store: CheckpointStore, signature: JobSignature) -> (Self, bool) {
        let loaded = match store.load(&signature).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint unreadable; starting fresh");
                None
            }
        };
        let resumed = loaded.is_some();
        let checkpoint = Self {
            store,
            signature,
            tracked: Mutex::new(Tracked {
                state: loaded.unwrap_or_default(),
                unsaved: 0,
            }),
        };
        (checkpoint, resumed)
    }

    pub fn signature(&self) -> &JobSignature {
        &self.signature
    }

    pub async fn snapshot(&self) -> JobState {
        self.tracked.lock().await.state.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.tracked.lock().await.state.phase
    }

    pub async fn set_phase(&self, phase: Phase) {
        self.tracked.lock().await.state.phase = phase;
        self.save().await;
    }

    pub async fn save(&self) {
        let state = {
            let mut tracked = self.tracked.lock().await;
            tracked.unsaved = 0;
            tracked.state.clone()
        };
        if let Err(err) = self.store.save(&self.signature, &state).await {
            tracing::warn!(error = %err, "failed to save checkpoint");
        }
    }

    /// Deletes the stored record after a completed job.
    pub async fn discard(&self) {
        if let Err(err) = self.store.clear(&self.signature).await {
            tracing::warn!(error = %err, "failed to remove checkpoint");
        }
    }
}

#[async_trait]
impl CursorStore for JobCheckpoint {
    async fn get(&self, folder_id: &str) -> Option<String> {
        self.tracked
            .lock()
            .await
            .state
            .folder_cursors
            .get(folder_id)
            .cloned()
    }

    async fn set(&self, folder_id: &str, name: &str) {
        let flush = {
            let mut tracked = self.tracked.lock().await;
            let cursors = &mut tracked.state.folder_cursors;
            if cursors
                .get(folder_id)
                .is_some_and(|current| cmp_names(current, name).is_ge())
            {
                return;
            }
            cursors.insert(folder_id.to_string(), name.to_string());
            tracked.unsaved += 1;
            tracked.unsaved >= FLUSH_EVERY
        };
        if flush {
            self.save().await;
        }
    }

    async fn clear(&self, folder_id: &str) {
        let removed = self
            .tracked
            .lock()
            .await
            .state
            .folder_cursors
            .remove(folder_id)
            .is_some();
        if removed {
            self.save().await;
        }
    }
}
