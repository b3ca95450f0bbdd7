use crate::{Error, Result};
use std::time::Duration;

/// Tuning for a [`RequestProcessor`](crate::RequestProcessor) and the stages
/// it owns.
///
/// The defaults mirror a desktop deployment: generous queues between stages,
/// one request consumer, and a generator pool that uses every core but one.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the fair queue feeding the request workers.
    pub request_queue_capacity: usize,
    /// Capacity of the fair queue feeding the generator workers.
    pub generator_queue_capacity: usize,
    /// Capacity of the persistence channel.
    pub persist_queue_capacity: usize,
    /// Capacity of the response channel.
    pub response_queue_capacity: usize,
    /// Number of request workers.
    pub request_consumers: usize,
    /// Cores available to the generator pool; `None` asks the OS.
    pub parallelism: Option<usize>,
    /// When false, each local engine gets a single worker.
    pub use_all_cores: bool,
    /// When false, the store is neither read nor written.
    pub use_repo: bool,
    /// Upper bound on a graceful stop, per stage.
    pub stop_timeout: Duration,
}

impl PipelineConfig {
    pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 200;
    pub const DEFAULT_GENERATOR_QUEUE_CAPACITY: usize = 500;
    pub const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 200;
    pub const DEFAULT_RESPONSE_QUEUE_CAPACITY: usize = 200;
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(120);

    /// Resolved core count for the generator pool.
    pub fn parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Checks that every capacity and worker count is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("request_queue_capacity", self.request_queue_capacity),
            ("generator_queue_capacity", self.generator_queue_capacity),
            ("persist_queue_capacity", self.persist_queue_capacity),
            ("response_queue_capacity", self.response_queue_capacity),
            ("request_consumers", self.request_consumers),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::InvalidConfig {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }
        if self.parallelism == Some(0) {
            return Err(Error::InvalidConfig {
                reason: "parallelism must be greater than 0".to_string(),
            });
        }
        if self.stop_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "stop_timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_queue_capacity: Self::DEFAULT_REQUEST_QUEUE_CAPACITY,
            generator_queue_capacity: Self::DEFAULT_GENERATOR_QUEUE_CAPACITY,
            persist_queue_capacity: Self::DEFAULT_PERSIST_QUEUE_CAPACITY,
            response_queue_capacity: Self::DEFAULT_RESPONSE_QUEUE_CAPACITY,
            request_consumers: 1,
            parallelism: None,
            use_all_cores: true,
            use_repo: true,
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
        }
    }
}
