// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shadow descriptor table: local state for every redirected descriptor.
//!
//! The table lock only guards the map structure. Each entry has its own lock,
//! which callers hold for the whole remote round trip so that concurrent
//! operations on one descriptor apply their offset updates in order.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Layer-side record of a redirected descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowEntry {
    pub local_id: RawFd,
    pub remote_id: u64,
    /// Normalized absolute path the descriptor was opened with
    pub path: PathBuf,
    pub offset: u64,
    pub open_flags: i32,
}

impl ShadowEntry {
    pub fn new(local_id: RawFd, remote_id: u64, path: PathBuf, open_flags: i32) -> Self {
        Self {
            local_id,
            remote_id,
            path,
            offset: 0,
            open_flags,
        }
    }

    pub fn is_append(&self) -> bool {
        self.open_flags & libc::O_APPEND != 0
    }
}

pub type SharedEntry = Arc<Mutex<ShadowEntry>>;

enum Slot {
    Active(SharedEntry),
    /// Tombstone left behind by an eviction
    Evicted,
}

/// Result of looking up or removing a descriptor
pub enum Lookup<T> {
    Active(T),
    Evicted,
    Missing,
}

pub fn lock_entry(entry: &SharedEntry) -> MutexGuard<'_, ShadowEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ShadowTable {
    entries: Mutex<HashMap<RawFd, Slot>>,
}

impl ShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RawFd, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly opened descriptor, replacing any stale record.
    pub fn insert(&self, entry: ShadowEntry) -> SharedEntry {
        let local_id = entry.local_id;
        let shared = Arc::new(Mutex::new(entry));
        self.table().insert(local_id, Slot::Active(Arc::clone(&shared)));
        shared
    }

    pub fn lookup(&self, local_id: RawFd) -> Lookup<SharedEntry> {
        match self.table().get(&local_id) {
            Some(Slot::Active(entry)) => Lookup::Active(Arc::clone(entry)),
            Some(Slot::Evicted) => Lookup::Evicted,
            None => Lookup::Missing,
        }
    }

    pub fn contains(&self, local_id: RawFd) -> bool {
        self.table().contains_key(&local_id)
    }

    /// Replace `entry` with a tombstone, unless the descriptor has since
    /// been removed or re-registered.
    pub fn evict(&self, entry: &SharedEntry, local_id: RawFd) -> bool {
        let mut table = self.table();
        match table.get(&local_id) {
            Some(Slot::Active(current)) if Arc::ptr_eq(current, entry) => {
                table.insert(local_id, Slot::Evicted);
                true
            }
            _ => false,
        }
    }

    /// Drop the record of `local_id`. For an active entry this waits until
    /// in-flight operations on it release the entry lock.
    pub fn remove(&self, local_id: RawFd) -> Lookup<ShadowEntry> {
        let removed = self.table().remove(&local_id);
        match removed {
            Some(Slot::Active(entry)) => Lookup::Active(lock_entry(&entry).clone()),
            Some(Slot::Evicted) => Lookup::Evicted,
            None => Lookup::Missing,
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn entry(local_id: RawFd) -> ShadowEntry {
        ShadowEntry::new(local_id, 100 + local_id as u64, PathBuf::from("/app/test.txt"), 0)
    }

    #[test]
    fn insert_lookup_remove() {
        let table = ShadowTable::new();
        table.insert(entry(5));
        assert!(table.contains(5));

        let Lookup::Active(shared) = table.lookup(5) else {
            panic!("expected active entry");
        };
        lock_entry(&shared).offset = 42;

        let Lookup::Active(removed) = table.remove(5) else {
            panic!("expected active entry");
        };
        assert_eq!(removed.offset, 42);
        assert!(matches!(table.lookup(5), Lookup::Missing));
        assert!(table.is_empty());
    }

    #[test]
    fn eviction_leaves_tombstone_until_removed() {
        let table = ShadowTable::new();
        let shared = table.insert(entry(7));
        assert!(table.evict(&shared, 7));
        assert!(matches!(table.lookup(7), Lookup::Evicted));
        assert_eq!(table.len(), 1);
        assert!(matches!(table.remove(7), Lookup::Evicted));
        assert!(matches!(table.lookup(7), Lookup::Missing));
    }

    #[test]
    fn stale_eviction_does_not_clobber_new_entry() {
        let table = ShadowTable::new();
        let old = table.insert(entry(9));
        let _ = table.remove(9);
        table.insert(entry(9));

        assert!(!table.evict(&old, 9));
        assert!(matches!(table.lookup(9), Lookup::Active(_)));
    }

    #[test]
    fn append_flag_is_detected() {
        let mut e = entry(3);
        assert!(!e.is_append());
        e.open_flags = libc::O_WRONLY | libc::O_APPEND;
        assert!(e.is_append());
    }

    #[test]
    fn remove_waits_for_in_flight_operation() {
        let table = Arc::new(ShadowTable::new());
        let shared = table.insert(entry(11));
        let (locked_tx, locked_rx) = mpsc::channel();

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut guard = lock_entry(&shared);
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                guard.offset = 77;
            })
        };

        locked_rx.recv().unwrap();
        let Lookup::Active(removed) = table.remove(11) else {
            panic!("expected active entry");
        };
        assert_eq!(removed.offset, 77);
        worker.join().unwrap();
    }
}
