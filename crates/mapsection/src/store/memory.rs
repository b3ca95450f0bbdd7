use super::MapSectionStore;
use crate::{
    BigVector, JobMapSectionLink, MapSectionResponse, RecordId, StoreError, SubdivisionId, TileKey,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Tables {
    sections: HashMap<RecordId, MapSectionResponse>,
    by_tile: HashMap<TileKey, RecordId>,
    links: HashSet<JobMapSectionLink>,
}

/// A [`MapSectionStore`] kept in process memory.
///
/// Saving a tile that is already on file updates the existing record instead
/// of creating a second one, and repeated links are stored once.
#[derive(Default)]
pub struct InMemoryMapSectionStore {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl InMemoryMapSectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section_count(&self) -> usize {
        self.tables.lock().sections.len()
    }

    pub fn link_count(&self) -> usize {
        self.tables.lock().links.len()
    }

    pub fn links_for_job(&self, job_number: crate::JobNumber) -> Vec<JobMapSectionLink> {
        self.tables
            .lock()
            .links
            .iter()
            .filter(|link| link.job_number == job_number)
            .cloned()
            .collect()
    }

    /// Stores a section directly, returning its id. Useful for seeding a cache.
    pub fn insert(&self, response: MapSectionResponse) -> RecordId {
        let mut tables = self.tables.lock();
        let key = response.tile_key();
        let existing = tables.by_tile.get(&key).cloned();
        let id = match existing {
            Some(id) => id,
            None => {
                let next = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let id = RecordId::new(format!("ms-{next}"));
                tables.by_tile.insert(key, id.clone());
                id
            }
        };
        let stored = MapSectionResponse {
            map_section_id: Some(id.clone()),
            request_cancelled: false,
            ..response
        };
        tables.sections.insert(id.clone(), stored);
        id
    }
}

#[async_trait]
impl MapSectionStore for InMemoryMapSectionStore {
    async fn fetch_tile(
        &self,
        subdivision_id: &SubdivisionId,
        block_position: &BigVector,
    ) -> Result<Option<MapSectionResponse>, StoreError> {
        let key = TileKey::new(subdivision_id.clone(), block_position.clone());
        let tables = self.tables.lock();
        Ok(tables
            .by_tile
            .get(&key)
            .and_then(|id| tables.sections.get(id))
            .cloned())
    }

    async fn save_tile(&self, response: &MapSectionResponse) -> Result<RecordId, StoreError> {
        Ok(self.insert(response.clone()))
    }

    async fn update_tile(
        &self,
        id: &RecordId,
        response: &MapSectionResponse,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let Some(existing) = tables.sections.get_mut(id) else {
            return Err(StoreError::NotFound { id: id.to_string() });
        };
        existing.map_calc_settings = response.map_calc_settings;
        existing.vectors = response.vectors.clone();
        existing.request_completed = response.request_completed;
        Ok(())
    }

    async fn save_job_link(&self, link: &JobMapSectionLink) -> Result<(), StoreError> {
        self.tables.lock().links.insert(link.clone());
        Ok(())
    }
}
