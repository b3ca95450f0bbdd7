use super::{
    BigVector, MapCalcSettings, MapSectionRequest, OwnerType, SizeInt, SubdivisionId, TileKey,
};
use crate::{Error, JobNumber, Result};
use core::fmt;
use std::sync::Arc;

/// Identifier of a persisted map-section record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-pixel results for one block.
///
/// `done_flags` either has one entry per pixel or a single entry that stands
/// for the whole block.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapSectionVectors {
    pub block_size: SizeInt,
    pub counts: Vec<u32>,
    pub escape_velocities: Vec<u16>,
    pub done_flags: Vec<bool>,
}

impl MapSectionVectors {
    /// A fresh, all-zero payload with per-pixel done-flags.
    pub fn new(block_size: SizeInt) -> Self {
        let len = block_size.pixel_count();
        Self {
            block_size,
            counts: vec![0; len],
            escape_velocities: vec![0; len],
            done_flags: vec![false; len],
        }
    }

    /// Builds a payload from its parts, checking that the lengths agree with
    /// `block_size`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] when a vector has the wrong length.
    pub fn from_parts(
        block_size: SizeInt,
        counts: Vec<u32>,
        escape_velocities: Vec<u16>,
        done_flags: Vec<bool>,
    ) -> Result<Self> {
        let len = block_size.pixel_count();
        if counts.len() != len {
            return Err(Error::InvalidData {
                reason: format!("expected {len} counts, got {}", counts.len()),
            });
        }
        if escape_velocities.len() != len {
            return Err(Error::InvalidData {
                reason: format!(
                    "expected {len} escape velocities, got {}",
                    escape_velocities.len()
                ),
            });
        }
        if done_flags.len() != len && done_flags.len() != 1 {
            return Err(Error::InvalidData {
                reason: format!("expected 1 or {len} done flags, got {}", done_flags.len()),
            });
        }
        Ok(Self {
            block_size,
            counts,
            escape_velocities,
            done_flags,
        })
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn is_done(&self, index: usize) -> bool {
        match self.done_flags.as_slice() {
            [all] => *all,
            flags => flags.get(index).copied().unwrap_or(false),
        }
    }

    /// True when every pixel has escaped.
    ///
    /// A single-element flag array is read as all-or-nothing.
    pub fn all_done(&self) -> bool {
        match self.done_flags.as_slice() {
            [] => false,
            [all] => *all,
            flags => flags.iter().all(|done| *done),
        }
    }

    pub fn done_count(&self) -> usize {
        match self.done_flags.as_slice() {
            [all] if *all => self.len(),
            [_] => 0,
            flags => flags.iter().filter(|done| **done).count(),
        }
    }

    /// Expands a single-element flag array to one flag per pixel.
    pub fn expand_done_flags(&mut self) {
        if let [all] = self.done_flags.as_slice() {
            self.done_flags = vec![*all; self.len()];
        }
    }
}

/// Why a cached or generated response does not satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unsatisfied {
    /// No payload was produced or found.
    NoData,
    /// Generation was interrupted before reaching its target.
    Interrupted,
    /// The achieved target is below what was requested.
    BelowTarget { achieved: u32, requested: u32 },
}

impl fmt::Display for Unsatisfied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => f.write_str("no data"),
            Self::Interrupted => f.write_str("generation was interrupted"),
            Self::BelowTarget {
                achieved,
                requested,
            } => write!(f, "achieved {achieved} of {requested} iterations"),
        }
    }
}

/// The outcome for one tile, shared by every caller that asked for it.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapSectionResponse {
    pub map_section_id: Option<RecordId>,
    pub subdivision_id: SubdivisionId,
    pub block_position: BigVector,
    pub map_calc_settings: MapCalcSettings,
    pub vectors: Option<Arc<MapSectionVectors>>,
    pub request_completed: bool,
    pub request_cancelled: bool,
}

impl MapSectionResponse {
    pub fn new(
        request: &MapSectionRequest,
        map_calc_settings: MapCalcSettings,
        vectors: MapSectionVectors,
        request_completed: bool,
    ) -> Self {
        Self {
            map_section_id: request.map_section_id.clone(),
            subdivision_id: request.subdivision_id.clone(),
            block_position: request.block_position.clone(),
            map_calc_settings,
            vectors: Some(Arc::new(vectors)),
            request_completed,
            request_cancelled: false,
        }
    }

    /// A response without data, used when generation produced nothing.
    pub fn empty(request: &MapSectionRequest) -> Self {
        Self {
            map_section_id: request.map_section_id.clone(),
            subdivision_id: request.subdivision_id.clone(),
            block_position: request.block_position.clone(),
            map_calc_settings: request.map_calc_settings,
            vectors: None,
            request_completed: false,
            request_cancelled: false,
        }
    }

    pub fn cancelled(request: &MapSectionRequest) -> Self {
        Self {
            request_cancelled: true,
            ..Self::empty(request)
        }
    }

    /// The same outcome addressed to `mirror`'s block.
    ///
    /// The payload is shared, not copied; rows are stored in the primary
    /// block's orientation.
    pub fn for_mirror(&self, mirror: &MapSectionRequest) -> Self {
        Self {
            subdivision_id: mirror.subdivision_id.clone(),
            block_position: mirror.block_position.clone(),
            ..self.clone()
        }
    }

    pub fn tile_key(&self) -> TileKey {
        TileKey::new(self.subdivision_id.clone(), self.block_position.clone())
    }

    pub fn has_data(&self) -> bool {
        self.vectors.is_some()
    }

    pub fn all_rows_have_escaped(&self) -> bool {
        self.vectors.as_deref().is_some_and(MapSectionVectors::all_done)
    }

    /// Checks whether this response answers a request for
    /// `requested_iterations`.
    ///
    /// A fully escaped block satisfies any target. Otherwise the record must
    /// have run to completion with at least the requested target.
    ///
    /// # Errors
    ///
    /// Returns the reason the response falls short.
    pub fn satisfies(&self, requested_iterations: u32) -> core::result::Result<(), Unsatisfied> {
        if !self.has_data() {
            return Err(Unsatisfied::NoData);
        }
        if self.all_rows_have_escaped() {
            return Ok(());
        }
        if !self.request_completed {
            return Err(Unsatisfied::Interrupted);
        }
        let achieved = self.map_calc_settings.target_iterations;
        if achieved < requested_iterations {
            return Err(Unsatisfied::BelowTarget {
                achieved,
                requested: requested_iterations,
            });
        }
        Ok(())
    }
}

/// Links a job's owner document to a persisted map section.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobMapSectionLink {
    pub map_section_id: RecordId,
    pub owner_id: String,
    pub owner_type: OwnerType,
    pub job_number: JobNumber,
    pub subdivision_id: SubdivisionId,
    pub block_position: BigVector,
}

impl JobMapSectionLink {
    /// Builds the link for `request`, or `None` when it carries no owner.
    pub fn for_request(request: &MapSectionRequest, map_section_id: RecordId) -> Option<Self> {
        let owner_id = request.owner_id.clone()?;
        Some(Self {
            map_section_id,
            owner_id,
            owner_type: request.owner_type,
            job_number: request.job_number,
            subdivision_id: request.subdivision_id.clone(),
            block_position: request.block_position.clone(),
        })
    }
}

/// An owner still waiting for its link, because the map section it asked for
/// has not been given a record id yet.
///
/// Carries the block the owner asked for, which differs from the section's
/// own block when the owner is a mirror.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub owner_id: String,
    pub owner_type: OwnerType,
    pub job_number: JobNumber,
    pub subdivision_id: SubdivisionId,
    pub block_position: BigVector,
}

impl OwnerRef {
    pub fn for_request(request: &MapSectionRequest) -> Option<Self> {
        Some(Self {
            owner_id: request.owner_id.clone()?,
            owner_type: request.owner_type,
            job_number: request.job_number,
            subdivision_id: request.subdivision_id.clone(),
            block_position: request.block_position.clone(),
        })
    }

    pub fn into_link(self, map_section_id: RecordId) -> JobMapSectionLink {
        JobMapSectionLink {
            map_section_id,
            owner_id: self.owner_id,
            owner_type: self.owner_type,
            job_number: self.job_number,
            subdivision_id: self.subdivision_id,
            block_position: self.block_position,
        }
    }
}
