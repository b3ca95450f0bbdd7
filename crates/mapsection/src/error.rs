//! Error types for the map-section pipeline.
//!
//! This module defines the central [`Error`] enum, which captures every
//! reportable failure inside the pipeline, together with the narrower error
//! types raised by the pipeline's collaborators and its queues.
//!
//! ## Error Cases
//! - `Queue`: A bounded queue refused an operation (cancelled, closed, or
//!   corrupt).
//! - `Engine`: A compute engine failed to produce a map section.
//! - `Store`: The map-section store failed to read or write.
//! - `InvalidConfig`: A [`PipelineConfig`](crate::PipelineConfig) failed
//!   validation.
//! - `InvalidData`: A payload had inconsistent dimensions.
//! - `ChannelError`: An internal channel between stages was closed.
//! - `ServiceShutdown`: Work arrived while the pipeline was stopping.
//!
//! Cancellation of a job is *not* an error: cancelled requests are answered
//! with a response whose `request_cancelled` flag is set.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the map-section pipeline.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// A bounded work queue refused an operation.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A compute engine could not produce a map section.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The map-section store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The pipeline configuration is not usable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A map-section payload had inconsistent dimensions.
    #[error("Invalid data: {reason}")]
    InvalidData { reason: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The pipeline is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

/// Errors raised by the bounded queues that connect pipeline stages.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The shared cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// The queue no longer accepts new work.
    #[error("adding has been completed")]
    AddingCompleted,

    /// The queue no longer accepts new work and has been fully drained.
    #[error("queue is completed")]
    Completed,

    /// The queue's bookkeeping is inconsistent. Continuing would corrupt the
    /// scheduling order, so the consumer must stop.
    #[error("invalid queue state: {context}")]
    InvalidState { context: String },
}

/// Errors raised by a [`ComputeEngine`](crate::ComputeEngine).
#[derive(Clone, thiserror::Error, Debug)]
pub enum EngineError {
    /// The endpoint could not be reached or refused the call.
    #[error("endpoint {endpoint} is unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// The engine gave up because its cancellation token fired.
    #[error("generation was cancelled")]
    Cancelled,

    /// The engine ran but could not produce a result.
    #[error("generation failed: {reason}")]
    Failed { reason: String },
}

/// Errors raised by a [`MapSectionStore`](crate::MapSectionStore).
#[derive(Clone, thiserror::Error, Debug)]
pub enum StoreError {
    /// The backing store rejected or failed the operation.
    #[error("store backend failure: {reason}")]
    Backend { reason: String },

    /// An update referenced a record that does not exist.
    #[error("no map section with id {id}")]
    NotFound { id: String },
}
