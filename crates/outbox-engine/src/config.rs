//! Outbox engine configuration.

use std::time::Duration;

use crate::error::{OutboxError, Result};

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Configuration for the outbox engine and its schedulers.
///
/// The host application fills this struct from whatever configuration
/// source it uses and passes it to the engine. Defaults are production
/// ready.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delay between relay polls after the previous poll finished.
    pub poll_delay: Duration,

    /// Maximum duration of continuously relaying batches in one relay run.
    ///
    /// A single run must finish well inside the relay lock's maximum
    /// validity window, otherwise the lock could be revoked and a second
    /// instance could start an overlapping run. A long backlog is drained
    /// incrementally across multiple scheduled runs instead.
    pub continuous_relay_timeout: Duration,

    /// Maximum number of messages fetched per relay batch.
    pub relay_batch_size: u32,

    /// Maximum wait for the transport to finish sending one message on the
    /// post-commit path. Kept short to avoid stalling request-handling
    /// tasks when the transport is slow or unavailable.
    pub send_immediately_timeout: Duration,

    /// Maximum wait for the transport to start sending one message on the
    /// post-commit path.
    pub send_immediately_max_block: Duration,

    /// Maximum wait for the transport to finish sending one message on the
    /// relay path. Larger than the immediate profile so the relay still
    /// makes progress against a slow transport.
    pub send_scheduled_timeout: Duration,

    /// Maximum wait for the transport to start sending one message on the
    /// relay path.
    pub send_scheduled_max_block: Duration,

    /// Whether the scheduled relay runs at all.
    ///
    /// Disable on instances that serve requests only and run dedicated
    /// relay instances instead.
    pub scheduled_relay_enabled: bool,

    /// Interval between housekeeping runs.
    pub housekeeping_interval: Duration,

    /// Number of candidate ids deleted per housekeeping page; each page
    /// runs in its own transaction.
    pub housekeeping_page_size: u32,

    /// Hard cap on pages per housekeeping sweep, guaranteeing termination.
    pub housekeeping_max_pages: u32,

    /// How long successfully sent messages are kept before deletion.
    pub sent_retention: Duration,

    /// How long never-sent messages are kept before deletion. Catches
    /// messages that can never be processed, e.g. a permanently
    /// misconfigured cluster.
    pub unsent_retention: Duration,

    /// Interval between metrics gauge refreshes from the store.
    pub metrics_update_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(2),
            continuous_relay_timeout: Duration::from_secs(5 * 60),
            relay_batch_size: 5,
            send_immediately_timeout: Duration::from_secs(15),
            send_immediately_max_block: Duration::from_secs(5),
            send_scheduled_timeout: Duration::from_secs(60),
            send_scheduled_max_block: Duration::from_secs(15),
            scheduled_relay_enabled: true,
            housekeeping_interval: Duration::from_secs(24 * 60 * 60),
            housekeeping_page_size: 500,
            housekeeping_max_pages: 100_000,
            sent_retention: Duration::from_secs(2 * 24 * 60 * 60),
            unsent_retention: Duration::from_secs(30 * 24 * 60 * 60),
            metrics_update_interval: Duration::from_secs(10),
        }
    }
}

impl OutboxConfig {
    /// Expected maximum duration of one post-commit send attempt.
    ///
    /// Blocking budget plus transmission budget; the pre-commit safety
    /// delay is derived from this value.
    pub fn max_duration_send_immediately(&self) -> Duration {
        self.send_immediately_max_block + self.send_immediately_timeout
    }

    /// Expected maximum duration of one relay send attempt.
    pub fn max_duration_send_scheduled(&self) -> Duration {
        self.send_scheduled_max_block + self.send_scheduled_timeout
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Configuration`] for zero-sized batch, page or
    /// timing values that would stall or never terminate.
    pub fn validate(&self) -> Result<()> {
        if self.relay_batch_size == 0 {
            return Err(OutboxError::Configuration(
                "relay_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.housekeeping_page_size == 0 {
            return Err(OutboxError::Configuration(
                "housekeeping_page_size must be greater than 0".to_string(),
            ));
        }
        if self.housekeeping_max_pages == 0 {
            return Err(OutboxError::Configuration(
                "housekeeping_max_pages must be greater than 0".to_string(),
            ));
        }
        if self.continuous_relay_timeout.is_zero() {
            return Err(OutboxError::Configuration(
                "continuous_relay_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_duration_send_immediately().is_zero() {
            return Err(OutboxError::Configuration(
                "immediate send timeouts must be greater than zero".to_string(),
            ));
        }
        if self.max_duration_send_scheduled().is_zero() {
            return Err(OutboxError::Configuration(
                "scheduled send timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OutboxConfig::default().validate().is_ok());
    }

    #[test]
    fn default_values_match_documented_defaults() {
        let config = OutboxConfig::default();
        assert_eq!(config.poll_delay, Duration::from_secs(2));
        assert_eq!(config.continuous_relay_timeout, Duration::from_secs(300));
        assert_eq!(config.relay_batch_size, 5);
        assert_eq!(config.housekeeping_page_size, 500);
        assert_eq!(config.housekeeping_max_pages, 100_000);
        assert_eq!(config.sent_retention, Duration::from_secs(172_800));
        assert_eq!(config.unsent_retention, Duration::from_secs(2_592_000));
    }

    #[test]
    fn max_send_durations_combine_block_and_transmit_budgets() {
        let config = OutboxConfig::default();
        assert_eq!(config.max_duration_send_immediately(), Duration::from_secs(20));
        assert_eq!(config.max_duration_send_scheduled(), Duration::from_secs(75));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = OutboxConfig { relay_batch_size: 0, ..OutboxConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_page_cap_rejected() {
        let config = OutboxConfig { housekeeping_max_pages: 0, ..OutboxConfig::default() };
        assert!(config.validate().is_err());
    }
}
