//! Fabric configuration for development and production deployments.
//!
//! Settings are grouped by subsystem and validated as a whole before any
//! component is constructed. Presets mirror the two deployment shapes the
//! fabric is run in: high-observability development and durable production.

use crate::domain_types::{
    ChannelCapacity, ConcurrencyLimit, ConnectionPoolSize, InboxLimit, MaxRetries, PoisonThreshold,
    RetryBaseMs, VisibilityTimeoutSecs,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed cross-validation.
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },
}

/// How telemetry is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerMode {
    /// Spans and metrics are dropped.
    None,
    /// Spans and metrics are emitted through the `tracing` subscriber of
    /// the host process.
    #[default]
    Embedded,
    /// Reserved for an external telemetry service; currently behaves like
    /// `Embedded` with a startup warning.
    Service,
}

/// LLM invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Capacity of the global concurrency semaphore shared by the agent
    /// runtime and every pattern executor.
    pub concurrency_limit: ConcurrencyLimit,
    /// Consecutive output-token-limit failures within one stage before the
    /// workflow circuit breaker opens.
    pub circuit_breaker_threshold: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: ConcurrencyLimit::default(),
            circuit_breaker_threshold: 3,
        }
    }
}

/// Message queue settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Visibility window for in-flight messages.
    pub visibility_timeout_seconds: VisibilityTimeoutSecs,
    /// Pending-message cap per recipient.
    pub inbox_limit: InboxLimit,
    /// Dequeue count past which a warning is emitted.
    pub poison_threshold: PoisonThreshold,
}

/// Critical-interrupt retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSettings {
    /// Maximum delivery attempts before a row is marked failed.
    pub retry_max: MaxRetries,
    /// Base of the exponential backoff schedule. Delays double per attempt
    /// and cap at 30 seconds.
    pub retry_base_ms: RetryBaseMs,
    /// Period of the acknowledged-row garbage collection sweep, in
    /// milliseconds.
    pub gc_interval_ms: u64,
    /// Age past acknowledgement after which a row may be collected, in
    /// seconds.
    pub ack_ttl_seconds: u64,
    /// Buffer capacity for broadcast subscriber inboxes.
    pub broadcast_buffer: ChannelCapacity,
}

impl Default for InterruptSettings {
    fn default() -> Self {
        Self {
            retry_max: MaxRetries::default(),
            retry_base_ms: RetryBaseMs::default(),
            gc_interval_ms: 60_000,
            ack_ttl_seconds: 3600,
            broadcast_buffer: ChannelCapacity::default(),
        }
    }
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Location of the SQLite database file.
    pub path: PathBuf,
    /// Connection pool size.
    pub pool_size: ConnectionPoolSize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/weft.db"),
            pool_size: ConnectionPoolSize::default(),
        }
    }
}

/// Complete fabric configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    pub llm: LlmSettings,
    pub queue: QueueSettings,
    pub interrupt: InterruptSettings,
    pub store: StoreSettings,
    pub tracer: TracerMode,
}

impl FabricConfig {
    /// Development preset: short visibility, frequent GC, small inboxes.
    ///
    /// # Panics
    ///
    /// Panics if a hardcoded value falls outside its domain-type range.
    #[must_use]
    pub fn development() -> Self {
        Self {
            llm: LlmSettings {
                concurrency_limit: ConcurrencyLimit::try_new(2).unwrap(),
                circuit_breaker_threshold: 2,
            },
            queue: QueueSettings {
                visibility_timeout_seconds: VisibilityTimeoutSecs::try_new(5).unwrap(),
                inbox_limit: InboxLimit::try_new(1_000).unwrap(),
                poison_threshold: PoisonThreshold::try_new(3).unwrap(),
            },
            interrupt: InterruptSettings {
                retry_max: MaxRetries::try_new(10).unwrap(),
                retry_base_ms: RetryBaseMs::try_new(100).unwrap(),
                gc_interval_ms: 10_000,
                ack_ttl_seconds: 60,
                broadcast_buffer: ChannelCapacity::try_new(100).unwrap(),
            },
            store: StoreSettings {
                path: PathBuf::from("./data/weft-dev.db"),
                pool_size: ConnectionPoolSize::try_new(5).unwrap(),
            },
            tracer: TracerMode::Embedded,
        }
    }

    /// Production preset: spec defaults throughout.
    ///
    /// # Panics
    ///
    /// Panics if a hardcoded value falls outside its domain-type range.
    #[must_use]
    pub fn production() -> Self {
        Self {
            llm: LlmSettings::default(),
            queue: QueueSettings::default(),
            interrupt: InterruptSettings::default(),
            store: StoreSettings {
                path: PathBuf::from("./data/weft.db"),
                pool_size: ConnectionPoolSize::try_new(20).unwrap(),
            },
            tracer: TracerMode::Embedded,
        }
    }

    /// Returns a builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> FabricConfigBuilder {
        FabricConfigBuilder::new()
    }

    /// The effective GC sweep period.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt.gc_interval_ms)
    }

    /// The acknowledged-row retention window.
    #[must_use]
    pub fn ack_ttl(&self) -> Duration {
        Duration::from_secs(self.interrupt.ack_ttl_seconds)
    }

    /// Validates cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interrupt.gc_interval_ms < 100 {
            return Err(ConfigError::Validation {
                field: "interrupt.gc_interval_ms".to_string(),
                reason: "must be at least 100ms".to_string(),
            });
        }
        if self.interrupt.ack_ttl_seconds == 0 {
            return Err(ConfigError::Validation {
                field: "interrupt.ack_ttl_seconds".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.llm.circuit_breaker_threshold == 0 {
            return Err(ConfigError::Validation {
                field: "llm.circuit_breaker_threshold".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                field: "store.path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for custom configurations.
#[derive(Debug, Clone, Default)]
pub struct FabricConfigBuilder {
    config: FabricConfig,
}

impl FabricConfigBuilder {
    /// Creates a builder seeded with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global LLM concurrency limit.
    #[must_use]
    pub fn concurrency_limit(mut self, limit: ConcurrencyLimit) -> Self {
        self.config.llm.concurrency_limit = limit;
        self
    }

    /// Sets the message visibility timeout.
    #[must_use]
    pub fn visibility_timeout(mut self, timeout: VisibilityTimeoutSecs) -> Self {
        self.config.queue.visibility_timeout_seconds = timeout;
        self
    }

    /// Sets the per-recipient inbox cap.
    #[must_use]
    pub fn inbox_limit(mut self, limit: InboxLimit) -> Self {
        self.config.queue.inbox_limit = limit;
        self
    }

    /// Sets the interrupt retry ceiling.
    #[must_use]
    pub fn retry_max(mut self, max: MaxRetries) -> Self {
        self.config.interrupt.retry_max = max;
        self
    }

    /// Sets the backoff base delay.
    #[must_use]
    pub fn retry_base(mut self, base: RetryBaseMs) -> Self {
        self.config.interrupt.retry_base_ms = base;
        self
    }

    /// Sets the store path.
    #[must_use]
    pub fn store_path(mut self, path: PathBuf) -> Self {
        self.config.store.path = path;
        self
    }

    /// Sets the tracer mode.
    #[must_use]
    pub fn tracer_mode(mut self, mode: TracerMode) -> Self {
        self.config.tracer = mode;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when cross-field checks fail.
    pub fn build(self) -> Result<FabricConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
