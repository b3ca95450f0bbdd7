mod memory;

pub use memory::*;

use crate::{BigVector, JobMapSectionLink, MapSectionResponse, RecordId, StoreError, SubdivisionId};
use async_trait::async_trait;

/// The document store map sections are cached in.
///
/// Writes may race with each other for the same tile, so implementations must
/// tolerate duplicate saves and links.
#[async_trait]
pub trait MapSectionStore: Send + Sync {
    /// Looks up the stored section for a block, if any.
    async fn fetch_tile(
        &self,
        subdivision_id: &SubdivisionId,
        block_position: &BigVector,
    ) -> Result<Option<MapSectionResponse>, StoreError>;

    /// Inserts a new section and returns its record id.
    async fn save_tile(&self, response: &MapSectionResponse) -> Result<RecordId, StoreError>;

    /// Replaces the payload of an existing record.
    async fn update_tile(
        &self,
        id: &RecordId,
        response: &MapSectionResponse,
    ) -> Result<(), StoreError>;

    /// Records that a job's owner uses a section.
    async fn save_job_link(&self, link: &JobMapSectionLink) -> Result<(), StoreError>;
}
