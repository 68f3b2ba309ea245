//! Depth-first mirror of a source folder tree.
//!
//! Traversal uses an explicit frame stack. In the file pass, meeting a
//! subfolder suspends the current folder: its walk (pending listing pages,
//! in-flight transfers, completion watermark) is parked in a `Continue`
//! frame underneath the subfolder's `Descend` frame, so the parent's cursor
//! can only move past the subfolder once its whole subtree has drained.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use drivecopy_core::{
    ApiError, DriveClient, DriveItem, FOLDER_FIELDS, LISTING_FIELDS, RemoteFile, clean_name,
};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::compare::is_already_mirrored;
use super::cursor::{CursorStore, Watermark, cmp_names};
use super::gate::ConcurrencyGate;
use super::stats::Stats;
use super::transfer::{TransferClient, TransferTask};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("listing '{path}' failed: {source}")]
    Listing {
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("destination folder '{path}' unavailable: {source}")]
    Folder {
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("probing destination '{path}' failed: {source}")]
    Probe {
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("deleting extra file '{path}' failed: {source}")]
    Delete {
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("transfer gate closed")]
    GateClosed,
}

/// Source subtree and destination location of a mirror job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub src_drive: String,
    pub src_root: String,
    pub dest_drive: String,
    pub dest_parent: String,
    /// Folder created under `dest_parent` to hold the copy. Empty means the
    /// parent itself.
    pub root_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Cancelled,
}

/// A source folder paired with its destination twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub src_id: String,
    pub dest_id: String,
    pub path: String,
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

pub(crate) fn display_path(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

struct FolderWalk {
    folder: FolderRef,
    cursor: Option<String>,
    next_page: Option<Url>,
    buffered: VecDeque<DriveItem>,
    extras: Option<HashMap<String, RemoteFile>>,
    watermark: Watermark,
    tasks: JoinSet<String>,
}

enum Frame {
    Descend(FolderRef),
    Continue { walk: Box<FolderWalk>, child: String },
}

enum WalkStep {
    Descend { folder: FolderRef, name: String },
    Drained,
    Cancelled,
}

pub struct Mirror {
    drive: DriveClient,
    transfer: TransferClient,
    gate: Arc<ConcurrencyGate>,
    stats: Arc<Stats>,
    cursors: Arc<dyn CursorStore>,
    cancel: CancellationToken,
    delete_extras: bool,
}

impl Mirror {
    pub fn new(
        drive: DriveClient,
        transfer: TransferClient,
        gate: Arc<ConcurrencyGate>,
        stats: Arc<Stats>,
        cursors: Arc<dyn CursorStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            drive,
            transfer,
            gate,
            stats,
            cursors,
            cancel,
            delete_extras: false,
        }
    }

    pub fn with_delete_extras(mut self, delete_extras: bool) -> Self {
        self.delete_extras = delete_extras;
        self
    }

    pub async fn destination_root(&self, target: &MirrorTarget) -> Result<FolderRef, MirrorError> {
        let root_name = target.root_name.trim();
        let dest_id = if root_name.is_empty() {
            target.dest_parent.clone()
        } else {
            self.drive
                .ensure_folder(&target.dest_drive, &target.dest_parent, root_name)
                .await
                .map_err(|source| MirrorError::Folder {
                    path: root_name.to_string(),
                    source,
                })?
        };
        Ok(FolderRef {
            src_id: target.src_root.clone(),
            dest_id,
            path: root_name.to_string(),
        })
    }

    /// Recreates the source folder structure at the destination. Writes
    /// nothing but folders, so an interrupted pass is simply run again.
    pub async fn mirror_folders(&self, target: &MirrorTarget) -> Result<PassOutcome, MirrorError> {
        let mut stack = vec![self.destination_root(target).await?];
        loop {
            if self.cancel.is_cancelled() {
                return Ok(PassOutcome::Cancelled);
            }
            let Some(folder) = stack.pop() else {
                return Ok(PassOutcome::Completed);
            };
            self.stats
                .log(format!("[DIR] {}", display_path(&folder.path)));

            let mut next = Some(
                self.drive
                    .children_url(&target.src_drive, &folder.src_id, FOLDER_FIELDS)
                    .map_err(|source| listing_error(&folder.path, source))?,
            );
            while let Some(url) = next {
                if self.cancel.is_cancelled() {
                    return Ok(PassOutcome::Cancelled);
                }
                let page = self
                    .drive
                    .list_children_page(&url)
                    .await
                    .map_err(|source| listing_error(&folder.path, source))?;
                for item in page.items.into_iter().filter(DriveItem::is_folder) {
                    let path = child_path(&folder.path, &item.name);
                    let dest_id = self
                        .drive
                        .ensure_folder(&target.dest_drive, &folder.dest_id, &item.name)
                        .await
                        .map_err(|source| MirrorError::Folder {
                            path: path.clone(),
                            source,
                        })?;
                    stack.push(FolderRef {
                        src_id: item.id,
                        dest_id,
                        path,
                    });
                }
                next = page.next_link;
            }
        }
    }

    /// Copies every file not already present at the destination, resuming
    /// from the stored folder cursors.
    pub async fn mirror_files(&self, target: &MirrorTarget) -> Result<PassOutcome, MirrorError> {
        let mut stack = vec![Frame::Descend(self.destination_root(target).await?)];

        while !self.cancel.is_cancelled() {
            let Some(frame) = stack.pop() else {
                return Ok(PassOutcome::Completed);
            };
            let mut walk = match frame {
                Frame::Descend(folder) => self.open_walk(folder, target).await?,
                Frame::Continue { mut walk, child } => {
                    walk.watermark.complete(&child);
                    self.advance_cursor(&mut walk).await;
                    *walk
                }
            };

            match self.step_walk(&mut walk, target).await? {
                WalkStep::Descend { folder, name } => {
                    stack.push(Frame::Continue {
                        walk: Box::new(walk),
                        child: name,
                    });
                    stack.push(Frame::Descend(folder));
                }
                WalkStep::Drained => self.close_walk(walk, target).await?,
                WalkStep::Cancelled => {
                    self.drain(&mut walk).await;
                    break;
                }
            }
        }

        while let Some(frame) = stack.pop() {
            if let Frame::Continue { mut walk, .. } = frame {
                self.drain(&mut walk).await;
            }
        }
        self.stats
            .log("[CANCEL] file pass stopped after in-flight transfers finished");
        Ok(PassOutcome::Cancelled)
    }

    async fn open_walk(
        &self,
        folder: FolderRef,
        target: &MirrorTarget,
    ) -> Result<FolderWalk, MirrorError> {
        self.stats
            .log(format!("[DIR] {}", display_path(&folder.path)));
        let extras = if self.delete_extras {
            Some(
                self.drive
                    .list_files_map(&target.dest_drive, &folder.dest_id)
                    .await
                    .map_err(|source| listing_error(&folder.path, source))?,
            )
        } else {
            None
        };
        let cursor = self.cursors.get(&folder.src_id).await;
        if let Some(cursor) = &cursor {
            tracing::debug!(path = %folder.path, %cursor, "resuming folder");
        }
        let first = self
            .drive
            .children_url(&target.src_drive, &folder.src_id, LISTING_FIELDS)
            .map_err(|source| listing_error(&folder.path, source))?;
        Ok(FolderWalk {
            folder,
            cursor,
            next_page: Some(first),
            buffered: VecDeque::new(),
            extras,
            watermark: Watermark::default(),
            tasks: JoinSet::new(),
        })
    }

    /// Advances `walk` until it meets a subfolder, runs out of children, or
    /// observes cancellation.
    async fn step_walk(
        &self,
        walk: &mut FolderWalk,
        target: &MirrorTarget,
    ) -> Result<WalkStep, MirrorError> {
        loop {
            self.reap(walk).await;

            let Some(item) = walk.buffered.pop_front() else {
                let Some(url) = walk.next_page.take() else {
                    return Ok(WalkStep::Drained);
                };
                if self.cancel.is_cancelled() {
                    walk.next_page = Some(url);
                    return Ok(WalkStep::Cancelled);
                }
                let page = self
                    .drive
                    .list_children_page(&url)
                    .await
                    .map_err(|source| listing_error(&walk.folder.path, source))?;
                walk.buffered.extend(page.items);
                walk.next_page = page.next_link;
                continue;
            };

            if let Some(extras) = walk.extras.as_mut() {
                extras.remove(&clean_name(&item.name));
            }
            if walk
                .cursor
                .as_deref()
                .is_some_and(|cursor| cmp_names(&item.name, cursor).is_le())
            {
                continue;
            }

            let path = child_path(&walk.folder.path, &item.name);
            if item.is_folder() {
                let dest_id = self
                    .drive
                    .ensure_folder(&target.dest_drive, &walk.folder.dest_id, &item.name)
                    .await
                    .map_err(|source| MirrorError::Folder {
                        path: path.clone(),
                        source,
                    })?;
                walk.watermark.admit(&item.name);
                return Ok(WalkStep::Descend {
                    folder: FolderRef {
                        src_id: item.id,
                        dest_id,
                        path,
                    },
                    name: item.name,
                });
            }

            if !self.submit_file(walk, item, path, target).await? {
                return Ok(WalkStep::Cancelled);
            }
        }
    }

    /// Skips the file when the destination already matches, otherwise hands
    /// it to the transfer pool. Blocks while the pool is saturated. Returns
    /// `false` when cancellation stopped the hand-off.
    async fn submit_file(
        &self,
        walk: &mut FolderWalk,
        item: DriveItem,
        path: String,
        target: &MirrorTarget,
    ) -> Result<bool, MirrorError> {
        self.stats.file_discovered();
        let src = item.to_remote_file();
        let existing = self
            .drive
            .try_get_file(&target.dest_drive, &walk.folder.dest_id, &item.name)
            .await
            .map_err(|source| MirrorError::Probe {
                path: path.clone(),
                source,
            })?;

        if existing
            .as_ref()
            .is_some_and(|dst| is_already_mirrored(&src, dst))
        {
            let basis = if src.hash.is_some() {
                "size + hash"
            } else {
                "size only"
            };
            self.stats.log(format!("  [SKIP] {path} ({basis})"));
            self.stats.file_completed(0);
            walk.watermark.admit(&item.name);
            walk.watermark.complete(&item.name);
            self.advance_cursor(walk).await;
            return Ok(true);
        }

        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(false),
            permit = self.gate.acquire() => permit.map_err(|_| MirrorError::GateClosed)?,
        };
        if self.cancel.is_cancelled() {
            return Ok(false);
        }

        walk.watermark.admit(&item.name);
        let task = TransferTask {
            dest_drive: target.dest_drive.clone(),
            dest_parent: walk.folder.dest_id.clone(),
            name: item.name.clone(),
            src_drive: target.src_drive.clone(),
            src_item: item.id,
            size: src.size,
        };
        let transfer = self.transfer.clone();
        let stats = self.stats.clone();
        walk.tasks.spawn(async move {
            let _permit = permit;
            match transfer.copy(&task).await {
                Ok(bytes) => {
                    stats.log(format!("  [COPY] {path} ({bytes} bytes)"));
                    stats.file_completed(bytes);
                }
                Err(err) => {
                    stats.warn(format!("  [FAIL] {path} -> {err}"));
                    stats.file_failed();
                }
            }
            task.name
        });
        Ok(true)
    }

    /// Collects finished transfers without waiting.
    async fn reap(&self, walk: &mut FolderWalk) {
        let mut finished = false;
        while let Some(joined) = walk.tasks.try_join_next() {
            self.record(&mut walk.watermark, &walk.folder.path, joined);
            finished = true;
        }
        if finished {
            self.advance_cursor(walk).await;
        }
    }

    /// Waits for every in-flight transfer of the folder.
    async fn drain(&self, walk: &mut FolderWalk) {
        while let Some(joined) = walk.tasks.join_next().await {
            self.record(&mut walk.watermark, &walk.folder.path, joined);
        }
        self.advance_cursor(walk).await;
    }

    fn record(&self, watermark: &mut Watermark, folder: &str, joined: Result<String, JoinError>) {
        match joined {
            Ok(name) => watermark.complete(&name),
            // The watermark stays behind the lost file, so it is retried on resume.
            Err(err) => self.stats.warn(format!(
                "  [FAIL] transfer in {} aborted: {err}",
                display_path(folder)
            )),
        }
    }

    async fn advance_cursor(&self, walk: &mut FolderWalk) {
        if let Some(name) = walk.watermark.advance() {
            self.cursors.set(&walk.folder.src_id, &name).await;
        }
    }

    async fn close_walk(
        &self,
        mut walk: FolderWalk,
        target: &MirrorTarget,
    ) -> Result<(), MirrorError> {
        self.drain(&mut walk).await;

        if let Some(extras) = walk.extras.take() {
            let mut extras: Vec<_> = extras.into_iter().collect();
            extras.sort_by(|left, right| left.0.cmp(&right.0));
            for (name, file) in extras {
                let path = child_path(&walk.folder.path, &name);
                self.drive
                    .delete_item(&target.dest_drive, &file.id)
                    .await
                    .map_err(|source| MirrorError::Delete {
                        path: path.clone(),
                        source,
                    })?;
                self.stats.log(format!("  [DELETE] {path}"));
            }
        }

        self.cursors.clear(&walk.folder.src_id).await;
        Ok(())
    }
}

fn listing_error(path: &str, source: ApiError) -> MirrorError {
    MirrorError::Listing {
        path: display_path(path).to_string(),
        source,
    }
}
