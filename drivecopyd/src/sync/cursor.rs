use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Order of child names in a `$orderby=name` listing: case-insensitive, with
/// the raw bytes breaking ties. Cursor checks must use the same order.
pub fn cmp_names(left: &str, right: &str) -> Ordering {
    left.chars()
        .flat_map(char::to_lowercase)
        .cmp(right.chars().flat_map(char::to_lowercase))
        .then_with(|| left.cmp(right))
}

/// Per-folder resume bookmarks: the greatest child name known to be handled.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, folder_id: &str) -> Option<String>;

    /// Stores `name` only when it is greater than the current cursor.
    async fn set(&self, folder_id: &str, name: &str);

    async fn clear(&self, folder_id: &str);
}

/// Cursor store that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryCursors {
    cursors: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl CursorStore for MemoryCursors {
    async fn get(&self, folder_id: &str) -> Option<String> {
        self.cursors.lock().await.get(folder_id).cloned()
    }

    async fn set(&self, folder_id: &str, name: &str) {
        let mut cursors = self.cursors.lock().await;
        if cursors
            .get(folder_id)
            .is_none_or(|current| cmp_names(current, name).is_lt())
        {
            cursors.insert(folder_id.to_string(), name.to_string());
        }
    }

    async fn clear(&self, folder_id: &str) {
        self.cursors.lock().await.remove(folder_id);
    }
}

/// Children of one folder in the order they were admitted, with their
/// completion flags. Work finishes out of order; the cursor may only move to
/// the end of the completed prefix.
#[derive(Debug, Default)]
pub struct Watermark {
    entries: VecDeque<(String, bool)>,
}

impl Watermark {
    pub fn admit(&mut self, name: &str) {
        self.entries.push_back((name.to_string(), false));
    }

    pub fn complete(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(entry, done)| !done && entry == name) {
            entry.1 = true;
        }
    }

    /// Drops the completed prefix and returns its last name.
    pub fn advance(&mut self) -> Option<String> {
        let mut last = None;
        while self.entries.front().is_some_and(|(_, done)| *done) {
            last = self.entries.pop_front().map(|(name, _)| name);
        }
        last
    }
}
