use super::MapSectionWorkRequest;
use crate::{JobNumber, TileKey};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Every request waiting on an in-flight generation, keyed by tile.
///
/// An entry exists exactly while one generation for that tile is queued or
/// running. The first request registered for a tile is its primary; later
/// ones join as waiters and share the primary's outcome.
#[derive(Default)]
pub struct PendingRequestTable {
    entries: RwLock<HashMap<TileKey, Vec<MapSectionWorkRequest>>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `item` against `key`.
    ///
    /// When no generation is in flight, `item` becomes the primary,
    /// `on_primary` runs on it under the write lock, and its result is
    /// returned. Otherwise `item` is marked pending, appended as a waiter, and
    /// `None` is returned.
    pub fn register<R>(
        &self,
        key: TileKey,
        mut item: MapSectionWorkRequest,
        on_primary: impl FnOnce(&mut MapSectionWorkRequest) -> R,
    ) -> Option<R> {
        match self.entries.write().entry(key) {
            Entry::Occupied(mut waiters) => {
                item.request.pending = true;
                waiters.get_mut().push(item);
                None
            }
            Entry::Vacant(slot) => {
                let primary = on_primary(&mut item);
                slot.insert(vec![item]);
                Some(primary)
            }
        }
    }

    /// Removes and returns every waiter for `key`, primary included.
    pub fn take_waiters(&self, key: &TileKey) -> Vec<MapSectionWorkRequest> {
        let entries = self.entries.upgradable_read();
        if !entries.contains_key(key) {
            return Vec::new();
        }
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        entries.remove(key).unwrap_or_default()
    }

    /// Whether a generation for `key` is in flight.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of requests of `job` waiting on a generation.
    pub fn count_for_job(&self, job: JobNumber) -> usize {
        self.entries
            .read()
            .values()
            .flatten()
            .filter(|item| item.job_number() == job)
            .count()
    }

    /// Number of waiting requests across all tiles.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of tiles with a generation in flight.
    pub fn tile_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Removes every waiter of every tile.
    pub fn drain(&self) -> Vec<MapSectionWorkRequest> {
        let entries = core::mem::take(&mut *self.entries.write());
        entries.into_values().flatten().collect()
    }
}
