use super::{
    BigVector, MapCalcSettings, MapSectionVectors, OwnerType, RPoint, RSize, RecordId, SizeInt,
};
use crate::JobNumber;
use core::fmt;
use std::time::{Duration, Instant};

/// Identifier of the subdivision (coordinate frame at one sample spacing) a
/// block belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubdivisionId(pub String);

impl SubdivisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubdivisionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for SubdivisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a tile for deduplication.
///
/// Calculation settings are not part of the key: two requests
/// for the same block at different targets share one generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub subdivision_id: SubdivisionId,
    pub block_position: BigVector,
}

impl TileKey {
    pub const fn new(subdivision_id: SubdivisionId, block_position: BigVector) -> Self {
        Self {
            subdivision_id,
            block_position,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.subdivision_id, self.block_position)
    }
}

/// A request for one block of one job.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapSectionRequest {
    pub job_number: JobNumber,
    pub request_number: usize,
    pub owner_type: OwnerType,
    pub owner_id: Option<String>,

    pub subdivision_id: SubdivisionId,
    pub block_position: BigVector,
    pub map_position: RPoint,
    pub block_size: SizeInt,
    pub sample_point_delta: RSize,
    pub map_calc_settings: MapCalcSettings,

    /// Partial results carried in when a cached block must be refined.
    pub vectors: Option<MapSectionVectors>,
    /// Record id of the partial cached copy, if any.
    pub map_section_id: Option<RecordId>,
    pub increasing_iterations: bool,

    /// The reflected block, answered from this request's result instead of
    /// being generated on its own.
    pub mirror: Option<Box<MapSectionRequest>>,

    pub pending: bool,
    pub sent: bool,
    pub found_in_repo: bool,
    pub completed: bool,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub processing_start_time: Option<Instant>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub processing_end_time: Option<Instant>,
    pub generation_duration: Option<Duration>,
}

impl MapSectionRequest {
    pub fn new(
        job_number: JobNumber,
        request_number: usize,
        subdivision_id: SubdivisionId,
        block_position: BigVector,
        map_position: RPoint,
        sample_point_delta: RSize,
        map_calc_settings: MapCalcSettings,
    ) -> Self {
        Self {
            job_number,
            request_number,
            owner_type: OwnerType::default(),
            owner_id: None,
            subdivision_id,
            block_position,
            map_position,
            block_size: SizeInt::default(),
            sample_point_delta,
            map_calc_settings,
            vectors: None,
            map_section_id: None,
            increasing_iterations: false,
            mirror: None,
            pending: false,
            sent: false,
            found_in_repo: false,
            completed: false,
            processing_start_time: None,
            processing_end_time: None,
            generation_duration: None,
        }
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: SizeInt) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>, owner_type: OwnerType) -> Self {
        self.owner_id = Some(owner_id.into());
        self.owner_type = owner_type;
        self
    }

    /// Attaches `mirror`, which joins this request's job.
    #[must_use]
    pub fn with_mirror(mut self, mut mirror: MapSectionRequest) -> Self {
        mirror.job_number = self.job_number;
        mirror.mirror = None;
        self.mirror = Some(Box::new(mirror));
        self
    }

    /// Number of responses this request produces, its mirror included.
    pub fn response_count(&self) -> usize {
        1 + usize::from(self.mirror.is_some())
    }

    pub fn tile_key(&self) -> TileKey {
        TileKey::new(self.subdivision_id.clone(), self.block_position.clone())
    }

    pub const fn target_iterations(&self) -> u32 {
        self.map_calc_settings.target_iterations
    }

    /// Copies the request for hand-off to a compute engine, moving the partial
    /// payload out of `self` so it is not held twice. The mirror stays behind.
    pub(crate) fn clone_for_generation(&mut self) -> Self {
        let vectors = self.vectors.take();
        let mirror = self.mirror.take();
        let generation = Self {
            vectors,
            ..self.clone()
        };
        self.mirror = mirror;
        generation
    }

    /// Seeds this request with a partial result so generation resumes from it.
    pub(crate) fn seed_from(&mut self, vectors: &MapSectionVectors, record: Option<RecordId>) {
        self.vectors = Some(vectors.clone());
        if record.is_some() {
            self.map_section_id = record;
        }
        self.increasing_iterations = true;
    }

    /// Detaches the mirror, carrying over this request's progress flags.
    pub(crate) fn take_mirror(&mut self) -> Option<MapSectionRequest> {
        let mut mirror = *self.mirror.take()?;
        mirror.job_number = self.job_number;
        mirror.pending = self.pending;
        mirror.sent = self.sent;
        mirror.found_in_repo = self.found_in_repo;
        mirror.completed = self.completed;
        mirror.processing_start_time = self.processing_start_time;
        mirror.processing_end_time = self.processing_end_time;
        mirror.generation_duration = self.generation_duration;
        Some(mirror)
    }

    pub fn processing_duration(&self) -> Option<Duration> {
        match (self.processing_start_time, self.processing_end_time) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

impl fmt::Display for MapSectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} request {} {}@{}",
            self.job_number, self.request_number, self.subdivision_id, self.block_position
        )
    }
}
