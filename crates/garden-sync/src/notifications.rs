use crate::error::SyncError;
use garden_core::{Notification, NotificationPage, PaginationInfo};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Local read mark awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMark {
    pub id: String,
    pub receiver_id: String,
    pub previous: bool,
}

/// Deduplicated notification set with two read projections.
///
/// Entries keep insertion order with the newest push at the head. The REST
/// snapshot is authoritative for ordering at fetch time; pushes only ever add
/// ids that are not known yet. `unread_count` and `pagination` are derived
/// from the set after every mutation.
#[derive(Debug, Clone)]
pub struct NotificationReconciler {
    entries: Vec<Notification>,
    ids: HashSet<String>,
    /// Server-side entries ahead of the loaded window.
    offset: usize,
    /// Server-side entries beyond the loaded window.
    unloaded: usize,
    page_size: usize,
    current_page: usize,
    pending_reads: HashMap<String, bool>,
    unread_count: usize,
    pagination: PaginationInfo,
}

impl NotificationReconciler {
    pub fn new(page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            offset: 0,
            unloaded: 0,
            page_size,
            current_page: 1,
            pending_reads: HashMap::new(),
            unread_count: 0,
            pagination: PaginationInfo::derive(0, page_size, 1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    pub fn pagination(&self) -> PaginationInfo {
        self.pagination
    }

    pub fn has_pending_read(&self, id: &str) -> bool {
        self.pending_reads.contains_key(id)
    }

    /// Replaces the known set wholesale. Optimistic marks still waiting on
    /// the server are re-applied on top of the snapshot.
    ///
    /// A snapshot for page `p` covers the listing from `(p - 1) * page_size`;
    /// [`page`](Self::page) slices against that window.
    pub fn replace_snapshot(&mut self, snapshot: NotificationPage) {
        let mut ids = HashSet::with_capacity(snapshot.notifications.len());
        let mut entries = Vec::with_capacity(snapshot.notifications.len());
        for mut notification in snapshot.notifications {
            if !ids.insert(notification.id.clone()) {
                continue;
            }
            if self.pending_reads.contains_key(&notification.id) {
                notification.read = true;
            }
            entries.push(notification);
        }
        self.entries = entries;
        self.ids = ids;
        self.offset = 0;
        self.unloaded = 0;
        if let Some(meta) = snapshot.pagination {
            if let Some(size) = meta.page_size.filter(|size| *size > 0) {
                self.page_size = size;
            }
            if let Some(page) = meta.current_page.filter(|page| *page > 0) {
                self.current_page = page;
                self.offset = ((page - 1) * self.page_size)
                    .min(meta.total_count.saturating_sub(self.entries.len()));
            }
            self.unloaded = meta
                .total_count
                .saturating_sub(self.offset + self.entries.len());
        }
        self.recompute();
    }

    /// Inserts a pushed notification at the head. Returns false when its id
    /// is already known.
    pub fn push(&mut self, notification: Notification) -> bool {
        if self.ids.contains(&notification.id) {
            debug!(
                event = "sync_notification_duplicate",
                notification_id = %notification.id
            );
            return false;
        }
        self.ids.insert(notification.id.clone());
        self.entries.insert(0, notification);
        self.recompute();
        true
    }

    /// Marks `id` read locally. Returns `None` when it is already read or a
    /// mark for it is still in flight, so at most one server round trip per
    /// id is outstanding.
    pub fn mark_read_optimistic(&mut self, id: &str) -> Result<Option<ReadMark>, SyncError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| SyncError::UnknownNotification(id.to_string()))?;
        if entry.read || self.pending_reads.contains_key(id) {
            return Ok(None);
        }
        let previous = entry.read;
        self.pending_reads.insert(id.to_string(), previous);
        entry.read = true;
        let mark = ReadMark {
            id: entry.id.clone(),
            receiver_id: entry.receiver_id.clone(),
            previous,
        };
        self.recompute();
        Ok(Some(mark))
    }

    /// Server accepted the mark. The entry ends up read whatever happened
    /// to it locally in the meantime.
    pub fn confirm_read(&mut self, id: &str) -> bool {
        let settled = self.pending_reads.remove(id).is_some();
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            if !entry.read {
                entry.read = true;
                self.recompute();
            }
        }
        settled
    }

    /// Restores the pre-mark flag. Does nothing when the mark was already
    /// settled by a confirmation or a remote read.
    pub fn rollback_read(&mut self, id: &str) -> bool {
        let Some(previous) = self.pending_reads.remove(id) else {
            return false;
        };
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) else {
            return false;
        };
        entry.read = previous;
        self.recompute();
        true
    }

    /// Read broadcast from another session. Settles any local mark.
    pub fn apply_remote_read(&mut self, id: &str) -> bool {
        self.pending_reads.remove(id);
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) if !entry.read => {
                entry.read = true;
                self.recompute();
                true
            }
            _ => false,
        }
    }

    /// Most recent `limit` entries by creation time, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let mut sorted: Vec<&Notification> = self.entries.iter().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sorted.into_iter().take(limit).cloned().collect()
    }

    /// 1-based page over the full listing. Pages outside the loaded window
    /// are empty.
    pub fn page(&self, page: usize, page_size: usize) -> Vec<Notification> {
        if page == 0 || page_size == 0 {
            return Vec::new();
        }
        let start = (page - 1).saturating_mul(page_size);
        let end = start.saturating_add(page_size);
        let from = start.max(self.offset) - self.offset;
        let to = end.saturating_sub(self.offset).min(self.entries.len());
        if from >= to {
            return Vec::new();
        }
        self.entries[from..to].to_vec()
    }

    /// Whether `page` has at least one entry in the loaded window.
    pub fn is_page_loaded(&self, page: usize, page_size: usize) -> bool {
        !self.page(page, page_size).is_empty()
    }

    pub fn current_page(&self) -> Vec<Notification> {
        self.page(self.pagination.current_page, self.pagination.page_size)
    }

    pub fn set_current_page(&mut self, page: usize) {
        self.current_page = page;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.unread_count = self.entries.iter().filter(|entry| !entry.read).count();
        self.pagination = PaginationInfo::derive(
            self.offset + self.entries.len() + self.unloaded,
            self.page_size,
            self.current_page,
        );
        self.current_page = self.pagination.current_page;
    }
}
