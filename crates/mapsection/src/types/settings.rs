use core::fmt;

/// Calculation settings a map section is requested with, or was produced with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapCalcSettings {
    /// Iteration ceiling per sample.
    pub target_iterations: u32,
    /// Squared-magnitude bailout threshold.
    pub threshold: u32,
}

impl MapCalcSettings {
    pub const DEFAULT_THRESHOLD: u32 = 4;

    pub const fn new(target_iterations: u32) -> Self {
        Self {
            target_iterations,
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    pub const fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }
}

impl Default for MapCalcSettings {
    fn default() -> Self {
        Self::new(400)
    }
}

/// The kind of document that owns a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OwnerType {
    #[default]
    Project,
    Poster,
    Undetermined,
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Project => "project",
            Self::Poster => "poster",
            Self::Undetermined => "undetermined",
        };
        f.write_str(name)
    }
}
