use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 900;

/// Multiplier applied to the batch size for the entry buffer and the fetch
/// stage burst, and per worker for the pool's fetch-order queue.
const BURST_FACTOR: usize = 3;

/// Runtime configuration for a block dispatcher.
///
/// All instances must be constructed via [`DispatcherConfig::builder`] or
/// [`DispatcherConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    batch_size: usize,
    worker_count: usize,
    fetch_timeout: Duration,
    process_timeout: Duration,
    metrics_interval: Duration,
}

pub struct DispatcherConfigParams {
    pub batch_size: usize,
    pub worker_count: usize,
    pub fetch_timeout: Duration,
    pub process_timeout: Duration,
    pub metrics_interval: Duration,
}

impl DispatcherConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: DispatcherConfigParams) -> Result<Self> {
        let DispatcherConfigParams {
            batch_size,
            worker_count,
            fetch_timeout,
            process_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            batch_size,
            worker_count,
            fetch_timeout,
            process_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Target number of blocks fetched ahead of processing.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of worker tasks; `0` or `1` selects the in-process dispatcher.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Per-fetch timeout enforced by the fetch stage.
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Per-block timeout enforced by the process stage.
    pub fn process_timeout(&self) -> Duration {
        self.process_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Capacity of the entry buffer ahead of the fetch stage.
    pub fn buffer_capacity(&self) -> usize {
        self.batch_size.saturating_mul(BURST_FACTOR)
    }

    /// Normal fetch-stage budget; the pump stops scheduling past this.
    pub fn fetch_budget(&self) -> usize {
        self.batch_size
    }

    /// Hard cap on concurrently admitted fetch tasks.
    pub fn fetch_burst(&self) -> usize {
        self.batch_size.saturating_mul(BURST_FACTOR)
    }

    /// Capacity of the process stage.
    pub fn process_capacity(&self) -> usize {
        self.batch_size
    }

    /// Capacity of the pool dispatcher's fetch-order queue.
    pub fn pool_queue_capacity(&self) -> usize {
        self.batch_size
            .saturating_mul(BURST_FACTOR)
            .saturating_mul(self.worker_count.max(1))
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.fetch_timeout.is_zero() {
            bail!("fetch_timeout must be greater than 0");
        }

        if self.process_timeout.is_zero() {
            bail!("process_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DispatcherConfigBuilder {
    batch_size: Option<usize>,
    worker_count: Option<usize>,
    fetch_timeout: Option<Duration>,
    process_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl DispatcherConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<DispatcherConfig> {
        let params = DispatcherConfigParams {
            batch_size: self.batch_size.context("batch_size is required")?,
            worker_count: self.worker_count.unwrap_or(0),
            fetch_timeout: self
                .fetch_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
            process_timeout: self
                .process_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        DispatcherConfig::new(params)
    }
}
