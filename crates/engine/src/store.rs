//! Download record store
//!
//! Owns the id -> entry map. Every mutation goes through one mutex and ends by
//! publishing an immutable snapshot, so readers never wait on writers.

use bridge::{
    Category, DownloadEntry, DownloadEvent, DownloadFilter, DownloadId, DownloadStats,
    DownloadStatus, Driver,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Point-in-time view of all entries, in insertion order.
///
/// Entries are shared with the store until they next change, so publishing
/// copies pointers, not records.
pub type Snapshot = Arc<[Arc<DownloadEntry>]>;

type Entries = BTreeMap<DownloadId, Arc<DownloadEntry>>;

struct Inner {
    // Ids only grow, so key order is insertion order.
    entries: Entries,
    next_id: u64,
}

pub struct Store {
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<Snapshot>,
    events_tx: broadcast::Sender<DownloadEvent>,
}

/// Mutable view handed to [`Store::batch`] while the store lock is held
pub struct Batch<'a> {
    entries: &'a mut Entries,
    events: Vec<DownloadEvent>,
    changed: bool,
}

impl<'a> Batch<'a> {
    pub fn get(&self, id: DownloadId) -> Option<&DownloadEntry> {
        self.entries.get(&id).map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `f` to one entry; `None` if the id is gone
    pub fn modify<R>(
        &mut self,
        id: DownloadId,
        f: impl FnOnce(&mut DownloadEntry) -> R,
    ) -> Option<R> {
        self.modify_tracked(id, f).map(|(result, _)| result)
    }

    /// Like [`Batch::modify`], also reporting whether the entry changed
    pub fn modify_tracked<R>(
        &mut self,
        id: DownloadId,
        f: impl FnOnce(&mut DownloadEntry) -> R,
    ) -> Option<(R, bool)> {
        let slot = self.entries.get_mut(&id)?;
        let mut entry = DownloadEntry::clone(slot);
        let result = f(&mut entry);
        let changed = entry != **slot;
        if changed {
            *slot = Arc::new(entry);
            self.changed = true;
        }
        Some((result, changed))
    }

    /// Apply `f` to every entry in insertion order
    pub fn modify_each(
        &mut self,
        mut f: impl FnMut(&mut DownloadEntry, &mut Vec<DownloadEvent>),
    ) {
        for slot in self.entries.values_mut() {
            let mut entry = DownloadEntry::clone(slot);
            f(&mut entry, &mut self.events);
            if entry != **slot {
                *slot = Arc::new(entry);
                self.changed = true;
            }
        }
    }

    pub fn remove(&mut self, id: DownloadId) -> Option<Arc<DownloadEntry>> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Keep only entries matching `keep`; returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(&DownloadEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.changed = true;
        }
        dropped
    }

    /// Drop Completed and Failed entries, emitting `Removed` for each
    pub fn drop_finished(&mut self) -> usize {
        let mut removed = Vec::new();
        self.retain(|e| {
            if e.status.is_terminal() {
                removed.push(e.id);
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.emit(DownloadEvent::Removed { id: *id });
        }
        removed.len()
    }

    pub fn emit(&mut self, event: DownloadEvent) {
        self.events.push(event);
    }
}

impl Store {
    pub fn new(event_capacity: usize) -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot::from(Vec::new()));
        let (events_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
            snapshot_tx,
            events_tx,
        }
    }

    /// Create a Queued entry advanced by the tick
    pub fn insert(
        &self,
        name: impl Into<String>,
        category: Category,
        size_bytes: u64,
    ) -> DownloadId {
        self.insert_with(name, category, size_bytes, Driver::Simulated)
    }

    pub fn insert_with(
        &self,
        name: impl Into<String>,
        category: Category,
        size_bytes: u64,
        driver: Driver,
    ) -> DownloadId {
        let name = name.into();
        self.insert_many(std::iter::once((name, category, size_bytes, driver)))[0]
    }

    /// Create several entries under one lock and publish a single snapshot
    pub fn insert_many<I>(&self, requests: I) -> Vec<DownloadId>
    where
        I: IntoIterator<Item = (String, Category, u64, Driver)>,
    {
        let mut inner = self.inner.lock();
        let added_at_ms = now_ms();
        let mut ids = Vec::new();
        let mut events = Vec::new();

        for (name, category, size_bytes, driver) in requests {
            let id = DownloadId(inner.next_id);
            inner.next_id = inner.next_id.wrapping_add(1);

            events.push(DownloadEvent::Added {
                id,
                name: name.clone(),
                category,
            });
            let entry = DownloadEntry::new(id, name, category, size_bytes, driver, added_at_ms);
            inner.entries.insert(id, Arc::new(entry));
            ids.push(id);
        }

        if !ids.is_empty() {
            self.publish(&inner.entries);
        }
        for event in events {
            let _ = self.events_tx.send(event);
        }
        ids
    }

    /// Delete one entry; absent ids are ignored
    pub fn remove(&self, id: DownloadId) -> bool {
        self.batch(|batch| {
            let removed = batch.remove(id).is_some();
            if removed {
                batch.emit(DownloadEvent::Removed { id });
            }
            removed
        })
    }

    /// Delete everything; returns how many entries were dropped
    pub fn clear(&self) -> usize {
        self.batch(|batch| {
            let count = batch.retain(|_| false);
            if count > 0 {
                batch.emit(DownloadEvent::Cleared { count });
            }
            count
        })
    }

    /// Transform one entry atomically; `None` if the id is absent
    pub fn update<R>(
        &self,
        id: DownloadId,
        transform: impl FnOnce(&mut DownloadEntry) -> R,
    ) -> Option<R> {
        self.batch(|batch| batch.modify(id, transform))
    }

    /// Run `f` with exclusive access to all entries.
    ///
    /// A new snapshot is published only if something changed, and events
    /// emitted by `f` are broadcast in order before the lock is released.
    pub fn batch<R>(&self, f: impl FnOnce(&mut Batch<'_>) -> R) -> R {
        let mut inner = self.inner.lock();
        let mut batch = Batch {
            entries: &mut inner.entries,
            events: Vec::new(),
            changed: false,
        };
        let result = f(&mut batch);
        let Batch { changed, events, .. } = batch;

        if changed {
            debug_assert!(inner.entries.values().all(|e| holds_invariants(e)));
            self.publish(&inner.entries);
        }
        for event in events {
            let _ = self.events_tx.send(event);
        }
        result
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn get(&self, id: DownloadId) -> Option<DownloadEntry> {
        let snapshot = self.snapshot();
        let entry = snapshot.iter().find(|e| e.id == id)?;
        Some(DownloadEntry::clone(entry))
    }

    pub fn query(&self, filter: &DownloadFilter) -> Vec<DownloadEntry> {
        self.snapshot()
            .iter()
            .filter(|e| filter.matches(e))
            .map(|e| DownloadEntry::clone(e))
            .collect()
    }

    pub fn stats(&self) -> DownloadStats {
        DownloadStats::from_entries(self.snapshot().iter().map(|e| &**e))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events_tx.subscribe()
    }

    /// Drop Completed and Failed entries
    pub fn retain_unfinished(&self) -> usize {
        self.batch(|batch| batch.drop_finished())
    }

    fn publish(&self, entries: &Entries) {
        let snapshot: Snapshot = entries.values().cloned().collect();
        debug!("Publishing snapshot with {} entries", snapshot.len());
        self.snapshot_tx.send_replace(snapshot);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(256)
    }
}

fn holds_invariants(entry: &DownloadEntry) -> bool {
    (0.0..=100.0).contains(&entry.progress)
        && (entry.progress == 100.0) == (entry.status == DownloadStatus::Completed)
        && (entry.error.is_some() == (entry.status == DownloadStatus::Failed))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
