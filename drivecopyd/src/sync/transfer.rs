//! Remote-to-remote file copy.
//!
//! Small files go through one download and one replace-upload. Larger files
//! use an upload session fed one ranged read at a time, so at most one chunk
//! is held in memory. The session's own view of received bytes is
//! authoritative whenever client bookkeeping and server disagree.

use bytes::Bytes;
use drivecopy_core::{ApiError, DriveClient, UploadSession, UploadStatus, is_session_gone};
use reqwest::StatusCode;
use thiserror::Error;

/// Upload session chunks must be multiples of this size, except the last.
pub const UPLOAD_ALIGNMENT: u64 = 320 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("range read at byte {offset} failed after {attempts} attempts")]
    RangeRead { offset: u64, attempts: u32 },
    #[error("upload stalled at byte {offset} of {total}: {last}")]
    Stalled { offset: u64, total: u64, last: String },
}

/// One file to copy: where it comes from and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub dest_drive: String,
    pub dest_parent: String,
    pub name: String,
    pub src_drive: String,
    pub src_item: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_bytes: u64,
    pub min_chunk_bytes: u64,
    pub small_file_bytes: u64,
    /// Ranged reads per chunk, each asking for half the previous length.
    pub range_attempts: u32,
    /// Consecutive loop iterations without progress before the file fails.
    pub max_stalls: u32,
    /// Extra whole-file attempts after a failure.
    pub file_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 8 * 1024 * 1024,
            min_chunk_bytes: 1024 * 1024,
            small_file_bytes: 4 * 1024 * 1024,
            range_attempts: 8,
            max_stalls: 8,
            file_retries: 0,
        }
    }
}

impl TransferConfig {
    pub fn normalized(mut self) -> Self {
        if self.chunk_bytes > UPLOAD_ALIGNMENT {
            self.chunk_bytes -= self.chunk_bytes % UPLOAD_ALIGNMENT;
        }
        self.chunk_bytes = self.chunk_bytes.max(1);
        self.min_chunk_bytes = self.min_chunk_bytes.clamp(1, self.chunk_bytes);
        self.range_attempts = self.range_attempts.max(1);
        self.max_stalls = self.max_stalls.max(1);
        self
    }
}

enum ChunkOutcome {
    Complete,
    Accepted(u64),
    SessionGone,
}

#[derive(Clone)]
pub struct TransferClient {
    drive: DriveClient,
    config: TransferConfig,
}

impl TransferClient {
    pub fn new(drive: DriveClient, config: TransferConfig) -> Self {
        Self {
            drive,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Copies `task`, returning the number of bytes written.
    pub async fn copy(&self, task: &TransferTask) -> Result<u64, TransferError> {
        let mut attempt = 0;
        loop {
            match self.copy_once(task).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < self.config.file_retries => {
                    attempt += 1;
                    tracing::warn!(name = %task.name, attempt, error = %err, "retrying file copy");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn copy_once(&self, task: &TransferTask) -> Result<u64, TransferError> {
        if task.size <= self.config.small_file_bytes {
            self.copy_small(task).await
        } else {
            self.copy_chunked(task).await
        }
    }

    async fn copy_small(&self, task: &TransferTask) -> Result<u64, TransferError> {
        let content = self
            .drive
            .download_content(&task.src_drive, &task.src_item)
            .await?;
        let len = content.len() as u64;
        self.drive
            .upload_small(&task.dest_drive, &task.dest_parent, &task.name, content)
            .await?;
        Ok(len)
    }

    async fn copy_chunked(&self, task: &TransferTask) -> Result<u64, TransferError> {
        let total = task.size;
        let mut session = self.open_session(task).await?;
        let mut offset = self
            .drive
            .upload_session_status(&session.upload_url)
            .await?
            .and_then(|status| status.next_offset())
            .filter(|next| *next < total)
            .unwrap_or(0);
        let mut stalls = 0;
        let mut last_problem = String::new();

        while offset < total {
            let before = offset;
            match self.send_chunk(task, &session, offset).await {
                Ok(ChunkOutcome::Complete) => return Ok(total),
                Ok(ChunkOutcome::Accepted(next)) => offset = next,
                Ok(ChunkOutcome::SessionGone) => {
                    tracing::debug!(name = %task.name, offset, "upload session expired");
                    last_problem = "upload session expired".to_string();
                    session = self.open_session(task).await?;
                    offset = 0;
                }
                Err(err) => {
                    tracing::debug!(name = %task.name, offset, error = %err, "chunk failed; probing session");
                    last_problem = err.to_string();
                    match self.drive.upload_session_status(&session.upload_url).await {
                        Ok(None) => {
                            session = self.open_session(task).await?;
                            offset = 0;
                        }
                        Ok(Some(status)) => {
                            if let Some(next) = status.next_offset() {
                                offset = next.min(total);
                            }
                        }
                        Err(probe) => {
                            tracing::debug!(name = %task.name, error = %probe, "session probe failed");
                        }
                    }
                }
            }

            if offset > before {
                stalls = 0;
            } else {
                stalls += 1;
                if stalls >= self.config.max_stalls {
                    return Err(TransferError::Stalled {
                        offset,
                        total,
                        last: last_problem,
                    });
                }
            }
        }
        Ok(total)
    }

    async fn open_session(&self, task: &TransferTask) -> Result<UploadSession, TransferError> {
        Ok(self
            .drive
            .create_upload_session(&task.dest_drive, &task.dest_parent, &task.name)
            .await?)
    }

    async fn send_chunk(
        &self,
        task: &TransferTask,
        session: &UploadSession,
        offset: u64,
    ) -> Result<ChunkOutcome, TransferError> {
        let wanted = self.config.chunk_bytes.min(task.size - offset);
        let chunk = self.read_range(task, offset, wanted).await?;
        let sent = chunk.len() as u64;
        let response = self
            .drive
            .upload_session_put(&session.upload_url, offset, task.size, chunk)
            .await?;

        Ok(match response.status {
            StatusCode::OK | StatusCode::CREATED => ChunkOutcome::Complete,
            status if is_session_gone(status) => ChunkOutcome::SessionGone,
            _ => {
                let next = response
                    .json::<UploadStatus>()
                    .ok()
                    .and_then(|status| status.next_offset())
                    .filter(|next| *next >= offset);
                ChunkOutcome::Accepted(next.unwrap_or(offset + sent))
            }
        })
    }

    /// Reads up to `len` bytes at `offset`, asking for less on each failed try.
    async fn read_range(
        &self,
        task: &TransferTask,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, TransferError> {
        let attempts = self.config.range_attempts;
        for attempt in 0..attempts {
            let mut try_len = self
                .config
                .chunk_bytes
                .checked_shr(attempt)
                .unwrap_or(0)
                .max(self.config.min_chunk_bytes)
                .min(len);
            if try_len < len && try_len > UPLOAD_ALIGNMENT {
                try_len -= try_len % UPLOAD_ALIGNMENT;
            }

            match self
                .drive
                .download_range(&task.src_drive, &task.src_item, offset, try_len)
                .await
            {
                Ok(response) => {
                    let window = if response.status == StatusCode::OK {
                        // Range ignored; the body is the whole item.
                        slice_window(response.body, offset, try_len)
                    } else {
                        slice_window(response.body, 0, try_len)
                    };
                    if let Some(window) = window {
                        return Ok(window);
                    }
                    tracing::debug!(name = %task.name, offset, try_len, "empty range response");
                }
                Err(err) => {
                    tracing::debug!(name = %task.name, offset, try_len, error = %err, "range read failed");
                }
            }
        }

        // A full download is only safe when the whole item fits in one chunk.
        let fits_one_chunk =
            task.size <= self.config.chunk_bytes.max(self.config.small_file_bytes);
        if offset == 0 && fits_one_chunk {
            let content = self
                .drive
                .download_content(&task.src_drive, &task.src_item)
                .await?;
            if let Some(window) = slice_window(content, 0, len) {
                return Ok(window);
            }
        }
        Err(TransferError::RangeRead { offset, attempts })
    }
}

fn slice_window(body: Bytes, start: u64, len: u64) -> Option<Bytes> {
    let start = usize::try_from(start).ok()?;
    if start >= body.len() {
        return None;
    }
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    let end = start.saturating_add(len).min(body.len());
    Some(body.slice(start..end))
}
