//! Deduplicated persistence queue
//!
//! Two sets, "new" and "updated". A record is in at most one of them at a
//! time; a record queued as new is never simultaneously queued as an update.
//! The locks here are narrower than the state manager's structural guard
//! because enqueues happen from handler code that does not hold it.

use parking_lot::Mutex;
use tracing::debug;

use super::records::QueuedRecord;

#[derive(Default)]
pub struct PersistenceQueue {
    added: Mutex<Vec<QueuedRecord>>,
    updated: Mutex<Vec<QueuedRecord>>,
}

impl PersistenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        let added = self.added.lock();
        let updated = self.updated.lock();
        added.is_empty() && updated.is_empty()
    }

    pub fn pending_new(&self) -> usize {
        self.added.lock().len()
    }

    pub fn track_new(&self, record: QueuedRecord) {
        let mut added = self.added.lock();
        let updated = self.updated.lock();

        let local_id = record.local_id();
        if !contains(&added, local_id) && !contains(&updated, local_id) {
            added.push(record);
        }
    }

    pub fn track_updated(&self, record: QueuedRecord) {
        let added = self.added.lock();
        let mut updated = self.updated.lock();

        let local_id = record.local_id();
        if !contains(&updated, local_id) && !contains(&added, local_id) {
            updated.push(record);
        }
    }

    /// Unpersisted new entries, ordered by creation time. Entries are left in
    /// the queue; callers remove them once an attempt has been made so a
    /// cancelled flush leaves the remainder intact.
    pub fn snapshot_new(&self) -> Vec<QueuedRecord> {
        let added = self.added.lock();
        let mut snapshot: Vec<QueuedRecord> = added
            .iter()
            .filter(|record| record.db_id().is_none())
            .cloned()
            .collect();
        snapshot.sort_by_key(|record| record.created_at());
        snapshot
    }

    pub fn snapshot_updated(&self) -> Vec<QueuedRecord> {
        self.updated.lock().clone()
    }

    pub fn remove_new(&self, local_id: u64) {
        let mut added = self.added.lock();
        added.retain(|record| record.local_id() != local_id);
    }

    pub fn remove_updated(&self, local_id: u64) {
        let mut updated = self.updated.lock();
        updated.retain(|record| record.local_id() != local_id);
    }

    /// Drop new entries that were persisted through some other path.
    pub fn prune_persisted_new(&self) {
        let mut added = self.added.lock();
        let before = added.len();
        added.retain(|record| record.db_id().is_none());

        if added.len() != before {
            debug!(pruned = before - added.len(), "pruned already-persisted new entries");
        }
    }
}

fn contains(records: &[QueuedRecord], local_id: u64) -> bool {
    records.iter().any(|record| record.local_id() == local_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::records::{shared, MatchRecord, QueuedRecord};

    #[test]
    fn new_entry_is_never_also_queued_as_update() {
        let queue = PersistenceQueue::new();
        let record = shared(MatchRecord::new(1, None));

        queue.track_new(QueuedRecord::Match(record.clone()));
        queue.track_updated(QueuedRecord::Match(record.clone()));

        assert_eq!(queue.snapshot_new().len(), 1);
        assert!(queue.snapshot_updated().is_empty());
    }

    #[test]
    fn duplicate_tracking_is_ignored() {
        let queue = PersistenceQueue::new();
        let record = shared(MatchRecord::new(1, None));

        queue.track_updated(QueuedRecord::Match(record.clone()));
        queue.track_updated(QueuedRecord::Match(record.clone()));

        assert_eq!(queue.snapshot_updated().len(), 1);
    }

    #[test]
    fn snapshot_new_orders_by_creation_time() {
        let queue = PersistenceQueue::new();
        let first = shared(MatchRecord::new(1, None));
        let second = shared(MatchRecord::new(2, None));
        second.lock().meta.created_at = first.lock().meta.created_at + chrono::Duration::seconds(5);

        queue.track_new(QueuedRecord::Match(second));
        queue.track_new(QueuedRecord::Match(first.clone()));

        let snapshot = queue.snapshot_new();
        assert_eq!(snapshot[0].local_id(), first.lock().meta.local_id);
    }

    #[test]
    fn snapshot_new_skips_persisted_records() {
        let queue = PersistenceQueue::new();
        let record = shared(MatchRecord::new(1, None));
        record.lock().meta.id = Some(9);

        queue.track_new(QueuedRecord::Match(record));
        assert!(queue.snapshot_new().is_empty());
    }

    #[test]
    fn removal_empties_the_queue() {
        let queue = PersistenceQueue::new();
        let record = shared(MatchRecord::new(1, None));
        let queued = QueuedRecord::Match(record);
        let local_id = queued.local_id();

        queue.track_new(queued);
        queue.remove_new(local_id);
        assert!(queue.is_empty());
    }
}
