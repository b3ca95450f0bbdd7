//! The four pipeline stages.
//!
//! [`RequestProcessor`] owns the other three and is the only one callers
//! normally construct:
//!
//! ```text
//! add_work ─▶ request queue ─▶ store lookup ─┬─▶ hit ─────────────────────────┐
//!                                            └─▶ dedup ─▶ generator queue     │
//!                                                          │                  ▼
//!                                                          └─▶ fan-out ─▶ response ─▶ callback
//!                                                                   └─▶ persist
//! ```

mod generator;
mod pending;
mod persist;
mod pool;
mod request;
mod response;
#[cfg(test)]
mod tests;

pub use generator::*;
pub use pending::*;
pub use persist::*;
pub use request::*;
pub use response::*;

use crate::{MapSectionRequest, MapSectionResponse, WorkItem};

/// A caller's request together with the callback that receives its response.
pub type MapSectionWorkRequest = WorkItem<MapSectionRequest, MapSectionResponse>;
