//! Router configuration: `development()` / `production()` presets plus a
//! validated builder (§1 ambient stack), mirroring the host crate's
//! `message_router::config::RouterConfig` in shape: nutype-validated
//! fields, a `ConfigError::ValidationError` variant, a fluent builder that
//! validates on `build()`.

use serde::{Deserialize, Serialize};

use crate::domain_types::{
    ActionQueueCapacity, AreaId, ConnectionWorkListCapacity, ContainerId,
    GeneralWorkQueueCapacity, IoThreadCount, LinkCapacity, Q2Watermark, RouterId,
};
use crate::error::ConfigError;

/// Complete router-core configuration (§1 "Router-specific fields replace
/// the host's agent/conversation fields").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Number of I/O threads servicing listeners/connectors (§5
    /// "Scheduling model"), separate from the single core thread.
    pub io_thread_count: IoThreadCount,
    /// Capacity of the core's action queue, backed by a bounded
    /// `tokio::sync::mpsc` channel.
    pub action_queue_capacity: ActionQueueCapacity,
    /// Capacity of the general-work (FIFO callback) queue.
    pub general_work_queue_capacity: GeneralWorkQueueCapacity,
    /// Capacity of each connection's `work_list`.
    pub connection_work_list_capacity: ConnectionWorkListCapacity,
    /// Q2 low watermark: below this buffered-message count, a blocked
    /// receiver unblocks (§6 "Q2 flow control").
    pub q2_low_watermark: Q2Watermark,
    /// Q2 high watermark: at or above this count, a receiver blocks.
    pub q2_high_watermark: Q2Watermark,
    /// Default per-link undelivered/unsettled capacity ceiling, used when a
    /// link attach does not negotiate a smaller one.
    pub default_link_capacity: LinkCapacity,
    /// This router's id, stamped into outbound `ingress`/`trace`
    /// annotations.
    pub router_id: RouterId,
    /// This router's mesh area id.
    pub area_id: AreaId,
    /// This router's AMQP container-id.
    pub container_id: ContainerId,
}

impl RouterConfig {
    /// A development configuration: small queues, low watermarks, fast
    /// feedback on misbehaving tests.
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type;
    /// this would indicate a bug in this function, not caller input.
    #[must_use]
    pub fn development() -> Self {
        Self {
            io_thread_count: IoThreadCount::try_new(2).unwrap(),
            action_queue_capacity: ActionQueueCapacity::try_new(256).unwrap(),
            general_work_queue_capacity: GeneralWorkQueueCapacity::try_new(256).unwrap(),
            connection_work_list_capacity: ConnectionWorkListCapacity::try_new(32).unwrap(),
            q2_low_watermark: Q2Watermark::new(4),
            q2_high_watermark: Q2Watermark::new(8),
            default_link_capacity: LinkCapacity::try_new(64).unwrap(),
            router_id: RouterId::try_new("router-dev").unwrap(),
            area_id: AreaId::try_new("area-dev").unwrap(),
            container_id: ContainerId::try_new("meshrouterd-dev").unwrap(),
        }
    }

    /// A production configuration: larger queues and watermarks tuned for
    /// sustained throughput over fast local feedback.
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn production() -> Self {
        Self {
            io_thread_count: IoThreadCount::try_new(num_cpus::get()).unwrap(),
            action_queue_capacity: ActionQueueCapacity::try_new(65_536).unwrap(),
            general_work_queue_capacity: GeneralWorkQueueCapacity::try_new(65_536).unwrap(),
            connection_work_list_capacity: ConnectionWorkListCapacity::try_new(1024).unwrap(),
            q2_low_watermark: Q2Watermark::new(64),
            q2_high_watermark: Q2Watermark::new(256),
            default_link_capacity: LinkCapacity::try_new(4096).unwrap(),
            router_id: RouterId::try_new("router-prod").unwrap(),
            area_id: AreaId::try_new("area-prod").unwrap(),
            container_id: ContainerId::try_new("meshrouterd").unwrap(),
        }
    }

    /// A builder seeded with development defaults.
    #[must_use]
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::new()
    }

    /// Cross-field validation beyond what the individual nutype field
    /// validators already enforce.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the low watermark is not
    /// strictly below the high watermark (§6: "`LOWER < UPPER`").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.q2_low_watermark.into_inner() >= self.q2_high_watermark.into_inner() {
            return Err(ConfigError::ValidationError {
                field: "q2_low_watermark",
                reason: "must be strictly less than q2_high_watermark".to_string(),
            });
        }
        let max_io_threads = num_cpus::get() * 2;
        if self.io_thread_count.into_inner() > max_io_threads {
            return Err(ConfigError::ValidationError {
                field: "io_thread_count",
                reason: format!("should not exceed 2x CPU cores ({max_io_threads})"),
            });
        }
        Ok(())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Fluent builder for [`RouterConfig`], validated at [`Self::build`].
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    /// Starts from development defaults.
    #[must_use]
    pub fn new() -> Self {
        Self { config: RouterConfig::development() }
    }

    /// Overrides the I/O thread count.
    #[must_use]
    pub fn io_thread_count(mut self, count: IoThreadCount) -> Self {
        self.config.io_thread_count = count;
        self
    }

    /// Overrides the Q2 watermark pair.
    #[must_use]
    pub fn q2_watermarks(mut self, low: Q2Watermark, high: Q2Watermark) -> Self {
        self.config.q2_low_watermark = low;
        self.config.q2_high_watermark = high;
        self
    }

    /// Overrides the default per-link capacity.
    #[must_use]
    pub fn default_link_capacity(mut self, capacity: LinkCapacity) -> Self {
        self.config.default_link_capacity = capacity;
        self
    }

    /// Overrides the router id.
    #[must_use]
    pub fn router_id(mut self, router_id: RouterId) -> Self {
        self.config.router_id = router_id;
        self
    }

    /// Validates and produces the final configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the accumulated fields
    /// fail [`RouterConfig::validate`].
    pub fn build(self) -> Result<RouterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RouterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
