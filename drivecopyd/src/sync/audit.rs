//! Read-only verification walk run after the file pass.

use std::collections::HashMap;
use std::sync::Arc;

use drivecopy_core::{DriveClient, LISTING_FIELDS, RemoteFile, clean_name};
use tokio_util::sync::CancellationToken;

use super::compare::{Comparison, compare};
use super::mirror::{MirrorError, MirrorTarget, child_path, display_path};
use super::stats::Stats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub src_files: u64,
    pub dst_files_seen: u64,
    pub matched: u64,
    pub mismatched: u64,
    pub missing: u64,
}

impl AuditSummary {
    pub fn is_clean(&self) -> bool {
        self.mismatched == 0 && self.missing == 0
    }
}

/// Destination children of one folder, split by kind.
#[derive(Default)]
struct DestListing {
    files: HashMap<String, RemoteFile>,
    folders: HashMap<String, String>,
}

pub struct Auditor {
    drive: DriveClient,
    stats: Arc<Stats>,
    cancel: CancellationToken,
}

impl Auditor {
    pub fn new(drive: DriveClient, stats: Arc<Stats>, cancel: CancellationToken) -> Self {
        Self {
            drive,
            stats,
            cancel,
        }
    }

    /// Compares every source file with its destination twin. `None` when
    /// cancelled; partial counts are not reported.
    pub async fn run(&self, target: &MirrorTarget) -> Result<Option<AuditSummary>, MirrorError> {
        let root_name = target.root_name.trim();
        let dest_root = if root_name.is_empty() {
            Some(target.dest_parent.clone())
        } else {
            let found = self
                .drive
                .find_child_folder(&target.dest_drive, &target.dest_parent, root_name)
                .await
                .map_err(|source| MirrorError::Probe {
                    path: root_name.to_string(),
                    source,
                })?;
            if found.is_none() {
                self.stats
                    .warn("[AUDIT] Destination root missing; all files deemed missing.");
            }
            found
        };

        let mut summary = AuditSummary::default();
        let mut stack = vec![(target.src_root.clone(), dest_root, root_name.to_string())];
        while let Some((src_id, dest_id, path)) = stack.pop() {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            self.stats.log(format!("[AUDIT] {}", display_path(&path)));

            let dest = match &dest_id {
                Some(dest_id) => self.dest_listing(&target.dest_drive, dest_id, &path).await?,
                None => DestListing::default(),
            };

            let mut next = Some(
                self.drive
                    .children_url(&target.src_drive, &src_id, LISTING_FIELDS)
                    .map_err(|source| listing_error(&path, source))?,
            );
            while let Some(url) = next {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let page = self
                    .drive
                    .list_children_page(&url)
                    .await
                    .map_err(|source| listing_error(&path, source))?;
                for item in page.items {
                    let rel = child_path(&path, &item.name);
                    let dest_name = clean_name(&item.name);
                    if item.is_folder() {
                        stack.push((item.id, dest.folders.get(&dest_name).cloned(), rel));
                        continue;
                    }

                    summary.src_files += 1;
                    let src = item.to_remote_file();
                    let dst = dest.files.get(&dest_name);
                    if dst.is_some() {
                        summary.dst_files_seen += 1;
                    }
                    match compare(&src, dst) {
                        Comparison::Matched => summary.matched += 1,
                        Comparison::Mismatched => {
                            summary.mismatched += 1;
                            if let Some(dst) = dst {
                                self.stats.warn(format!(
                                    "  [AUDIT:MISMATCH] {rel} (src {}/{} vs dst {}/{})",
                                    src.size,
                                    src.hash.as_deref().unwrap_or("-"),
                                    dst.size,
                                    dst.hash.as_deref().unwrap_or("-"),
                                ));
                            }
                        }
                        Comparison::Missing => {
                            summary.missing += 1;
                            self.stats.warn(format!("  [AUDIT:MISSING] {rel}"));
                        }
                    }
                }
                next = page.next_link;
            }
        }

        self.stats.log(format!(
            "[AUDIT:SUMMARY] src_files={}, dst_files_seen={}, matched={}, mismatched={}, missing={}",
            summary.src_files,
            summary.dst_files_seen,
            summary.matched,
            summary.mismatched,
            summary.missing
        ));
        Ok(Some(summary))
    }

    async fn dest_listing(
        &self,
        drive: &str,
        folder: &str,
        path: &str,
    ) -> Result<DestListing, MirrorError> {
        let mut listing = DestListing::default();
        let children = self
            .drive
            .list_children_all(drive, folder, LISTING_FIELDS)
            .await
            .map_err(|source| listing_error(path, source))?;
        for item in children {
            if item.is_folder() {
                listing.folders.insert(item.name, item.id);
            } else {
                let file = item.to_remote_file();
                listing.files.insert(item.name, file);
            }
        }
        Ok(listing)
    }
}

fn listing_error(path: &str, source: drivecopy_core::ApiError) -> MirrorError {
    MirrorError::Listing {
        path: display_path(path).to_string(),
        source,
    }
}
