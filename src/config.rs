//! Projector tuning knobs.

use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ProjectorError;
use crate::filter::StopOn;

/// Smallest accepted [`ProjectorConfig::max_queue_time`].
pub const MIN_QUEUE_TIME: Duration = Duration::from_millis(10);

/// Largest accepted [`ProjectorConfig::max_batch_size`].
///
/// A batch is committed as one atomic write, and document stores cap the
/// size of a single transaction well below this.
pub const MAX_BATCH_SIZE: usize = 100_000;

/// Configuration for a [`Projector`](crate::Projector).
///
/// All fields have defaults accessible via [`ProjectorConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_projector::{ProjectorConfig, StopOn};
///
/// let config = ProjectorConfig {
///     max_batch_size: 3,
///     stop_on: Some(StopOn::new("IntegrationTest", "IntegrationTestEnded")),
///     ..ProjectorConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_queue_time, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Flush a batch once it holds this many events.
    ///
    /// Default: 100. Must be between 1 and [`MAX_BATCH_SIZE`].
    pub max_batch_size: usize,

    /// Flush a batch once its oldest event has waited this long.
    ///
    /// Default: 1 second. Must be at least [`MIN_QUEUE_TIME`].
    pub max_queue_time: Duration,

    /// Terminal event that ends the run successfully once committed.
    ///
    /// Default: `None` (run until the source ends or the projector is
    /// stopped).
    pub stop_on: Option<StopOn>,

    /// Maximum number of handler invocations in flight within a batch.
    ///
    /// Default: 4.
    pub handler_concurrency: usize,

    /// Capacity of the queue between the source and the batcher, as a
    /// multiple of `max_batch_size`.
    ///
    /// Default: 3.
    pub queue_capacity_factor: usize,

    /// Base delay for exponential backoff between pipeline restarts.
    ///
    /// Default: 500 milliseconds.
    pub restart_base_delay: Duration,

    /// Maximum delay between pipeline restarts.
    ///
    /// Default: 5 seconds.
    pub restart_max_delay: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_queue_time: Duration::from_secs(1),
            stop_on: None,
            handler_concurrency: 4,
            queue_capacity_factor: 3,
            restart_base_delay: Duration::from_millis(500),
            restart_max_delay: Duration::from_secs(5),
        }
    }
}

impl ProjectorConfig {
    /// Check the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectorError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), ProjectorError> {
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size must be greater than zero"));
        }
        if self.max_batch_size > MAX_BATCH_SIZE {
            return Err(invalid(format!(
                "max_batch_size must be at most {MAX_BATCH_SIZE}, got {}",
                self.max_batch_size
            )));
        }
        if self.max_queue_time < MIN_QUEUE_TIME {
            return Err(invalid(format!(
                "max_queue_time must be at least {MIN_QUEUE_TIME:?}, got {:?}",
                self.max_queue_time
            )));
        }
        if self.handler_concurrency == 0 {
            return Err(invalid("handler_concurrency must be greater than zero"));
        }
        if self.queue_capacity_factor == 0 {
            return Err(invalid("queue_capacity_factor must be greater than zero"));
        }
        let capacity = self.max_batch_size.checked_mul(self.queue_capacity_factor);
        if capacity.is_none_or(|c| c > Semaphore::MAX_PERMITS) {
            return Err(invalid(format!(
                "max_batch_size * queue_capacity_factor must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.restart_base_delay > self.restart_max_delay {
            return Err(invalid(
                "restart_base_delay must not exceed restart_max_delay",
            ));
        }
        Ok(())
    }

    /// Capacity of the bounded queue feeding the batcher.
    pub(crate) fn queue_capacity(&self) -> usize {
        self.max_batch_size.saturating_mul(self.queue_capacity_factor)
    }
}

fn invalid(reason: impl Into<String>) -> ProjectorError {
    ProjectorError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ProjectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), 300);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ProjectorConfig {
            max_batch_size: 0,
            ..ProjectorConfig::default()
        };
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let at_maximum = ProjectorConfig {
            max_batch_size: MAX_BATCH_SIZE,
            ..ProjectorConfig::default()
        };
        assert!(at_maximum.validate().is_ok());

        for max_batch_size in [MAX_BATCH_SIZE + 1, usize::MAX / 4, usize::MAX] {
            let config = ProjectorConfig {
                max_batch_size,
                ..ProjectorConfig::default()
            };
            let err = config.validate().expect_err("oversized batch");
            assert!(err.to_string().contains("max_batch_size"), "{err}");
        }
    }

    #[test]
    fn queue_capacity_overflow_is_rejected() {
        let config = ProjectorConfig {
            queue_capacity_factor: usize::MAX,
            ..ProjectorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProjectorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn queue_time_below_minimum_is_rejected() {
        let config = ProjectorConfig {
            max_queue_time: Duration::from_millis(1),
            ..ProjectorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProjectorError::InvalidConfig(_))
        ));

        let at_minimum = ProjectorConfig {
            max_queue_time: MIN_QUEUE_TIME,
            ..ProjectorConfig::default()
        };
        assert!(at_minimum.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_and_inverted_delays_are_rejected() {
        let no_handlers = ProjectorConfig {
            handler_concurrency: 0,
            ..ProjectorConfig::default()
        };
        assert!(no_handlers.validate().is_err());

        let inverted = ProjectorConfig {
            restart_base_delay: Duration::from_secs(10),
            restart_max_delay: Duration::from_secs(1),
            ..ProjectorConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
