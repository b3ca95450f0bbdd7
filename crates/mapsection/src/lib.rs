#![doc = include_str!("../README.md")]

mod config;
mod engine;
mod error;
mod jobs;
mod processor;
mod provider;
mod queue;
mod store;
mod types;
mod work_item;

pub use crate::config::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::jobs::*;
pub use crate::processor::*;
pub use crate::provider::*;
pub use crate::queue::*;
pub use crate::store::*;
pub use crate::types::*;
pub use crate::work_item::*;
