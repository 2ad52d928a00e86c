//! Configuration for the streaming service.

use std::time::Duration;

use anyhow::Context as _;

use crate::batching::BatchConfig;
use crate::queue::OverflowPolicy;

/// Default values for every recognized option.
pub mod defaults {
    use std::time::Duration;

    /// TTL for idle sessions.
    pub const SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Interval of the idle-session sweeper.
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

    /// Admission ceiling for concurrent streams.
    pub const MAX_CONCURRENT_STREAMS: usize = 1000;

    /// Seconds between heartbeat events.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

    /// Maximum events per session queue.
    pub const QUEUE_SIZE: usize = 1000;

    /// Events retained per session for replay.
    pub const EVENT_BUFFER_SIZE: usize = 100;

    /// Maximum events per batch.
    pub const BATCH_SIZE: usize = 10;

    /// Maximum delay before a batch flush.
    pub const BATCH_DELAY: Duration = Duration::from_millis(50);

    /// Prefix for exposed metric names.
    pub const METRICS_PREFIX: &str = "streamweaver";

    /// Minimum payload bytes before gzip kicks in.
    pub const COMPRESSION_THRESHOLD: usize = 1024;

    /// Interval of application-level WebSocket pings.
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);
}

/// Configuration for the streaming service.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// TTL for idle sessions.
    pub session_timeout: Duration,

    /// Interval of the idle-session sweeper.
    pub cleanup_interval: Duration,

    /// Admission ceiling for concurrent streams.
    pub max_concurrent_streams: usize,

    /// Whether heartbeat events are emitted.
    pub enable_heartbeat: bool,

    /// Interval between heartbeat events.
    pub heartbeat_interval: Duration,

    /// Maximum events per session queue. `0` means unbounded.
    pub queue_size: usize,

    /// Policy when a session queue overflows.
    pub backpressure_policy: OverflowPolicy,

    /// Whether reconnecting clients can replay missed events.
    pub enable_replay: bool,

    /// Events retained per session for replay.
    pub event_buffer_size: usize,

    /// Whether bursty events are coalesced.
    pub enable_batching: bool,

    /// Maximum events per batch.
    pub batch_size: usize,

    /// Maximum delay before a batch flush.
    pub batch_delay: Duration,

    /// Whether metrics are collected and exposed.
    pub enable_metrics: bool,

    /// Prefix for exposed metric names.
    pub metrics_prefix: String,

    /// Whether SSE payloads over the threshold are gzipped.
    pub enable_compression: bool,

    /// Minimum payload bytes before gzip kicks in.
    pub compression_threshold: usize,

    /// Interval of application-level WebSocket pings.
    pub ping_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_timeout: defaults::SESSION_TIMEOUT,
            cleanup_interval: defaults::CLEANUP_INTERVAL,
            max_concurrent_streams: defaults::MAX_CONCURRENT_STREAMS,
            enable_heartbeat: true,
            heartbeat_interval: defaults::HEARTBEAT_INTERVAL,
            queue_size: defaults::QUEUE_SIZE,
            backpressure_policy: OverflowPolicy::DropOldest,
            enable_replay: true,
            event_buffer_size: defaults::EVENT_BUFFER_SIZE,
            enable_batching: false,
            batch_size: defaults::BATCH_SIZE,
            batch_delay: defaults::BATCH_DELAY,
            enable_metrics: false,
            metrics_prefix: defaults::METRICS_PREFIX.to_string(),
            enable_compression: false,
            compression_threshold: defaults::COMPRESSION_THRESHOLD,
            ping_interval: defaults::PING_INTERVAL,
        }
    }
}

impl StreamConfig {
    /// Create configuration from `STREAMWEAVER_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error when a set variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("STREAMWEAVER_SESSION_TIMEOUT")? {
            config.session_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("STREAMWEAVER_CLEANUP_INTERVAL")? {
            config.cleanup_interval = Duration::from_secs(seconds);
        }
        if let Some(limit) = env_parse::<usize>("STREAMWEAVER_MAX_CONCURRENT_STREAMS")? {
            config.max_concurrent_streams = limit;
        }
        if let Some(enabled) = env_parse::<bool>("STREAMWEAVER_ENABLE_HEARTBEAT")? {
            config.enable_heartbeat = enabled;
        }
        if let Some(seconds) = env_parse::<u64>("STREAMWEAVER_HEARTBEAT_INTERVAL")? {
            config.heartbeat_interval = Duration::from_secs(seconds);
        }
        if let Some(size) = env_parse::<usize>("STREAMWEAVER_QUEUE_SIZE")? {
            config.queue_size = size;
        }
        if let Some(policy) = env_parse::<OverflowPolicy>("STREAMWEAVER_BACKPRESSURE_POLICY")? {
            config.backpressure_policy = policy;
        }
        if let Some(enabled) = env_parse::<bool>("STREAMWEAVER_ENABLE_REPLAY")? {
            config.enable_replay = enabled;
        }
        if let Some(size) = env_parse::<usize>("STREAMWEAVER_EVENT_BUFFER_SIZE")? {
            config.event_buffer_size = size;
        }
        if let Some(enabled) = env_parse::<bool>("STREAMWEAVER_ENABLE_BATCHING")? {
            config.enable_batching = enabled;
        }
        if let Some(size) = env_parse::<usize>("STREAMWEAVER_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(millis) = env_parse::<u64>("STREAMWEAVER_BATCH_DELAY_MS")? {
            config.batch_delay = Duration::from_millis(millis);
        }
        if let Some(enabled) = env_parse::<bool>("STREAMWEAVER_ENABLE_METRICS")? {
            config.enable_metrics = enabled;
        }
        if let Ok(prefix) = std::env::var("STREAMWEAVER_METRICS_PREFIX") {
            config.metrics_prefix = prefix;
        }
        if let Some(enabled) = env_parse::<bool>("STREAMWEAVER_ENABLE_COMPRESSION")? {
            config.enable_compression = enabled;
        }
        if let Some(bytes) = env_parse::<usize>("STREAMWEAVER_COMPRESSION_THRESHOLD")? {
            config.compression_threshold = bytes;
        }

        Ok(config)
    }

    /// Create a configuration with fast timers for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            session_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
            batch_delay: Duration::from_millis(20),
            ping_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Derive the batcher configuration.
    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            enabled: self.enable_batching,
            max_batch_size: self.batch_size,
            max_batch_delay: self.batch_delay,
            ..BatchConfig::default()
        }
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("invalid value for {key}: {raw}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_concurrent_streams, 1000);
        assert!(config.enable_heartbeat);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.queue_size, 1000);
        assert_eq!(config.backpressure_policy, OverflowPolicy::DropOldest);
        assert!(config.enable_replay);
        assert_eq!(config.event_buffer_size, 100);
        assert!(!config.enable_batching);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_delay, Duration::from_millis(50));
        assert!(!config.enable_metrics);
        assert_eq!(config.metrics_prefix, "streamweaver");
        assert!(!config.enable_compression);
        assert_eq!(config.compression_threshold, 1024);
    }

    #[test]
    fn test_batch_config_derivation() {
        let config = StreamConfig {
            enable_batching: true,
            batch_size: 7,
            batch_delay: Duration::from_millis(80),
            ..StreamConfig::default()
        };
        let batch = config.batch_config();
        assert!(batch.enabled);
        assert_eq!(batch.max_batch_size, 7);
        assert_eq!(batch.max_batch_delay, Duration::from_millis(80));
        assert!(batch
            .immediate_types
            .contains(&crate::events::EventType::WorkflowCompleted));
    }

    #[test]
    fn test_for_testing_shrinks_timers() {
        let config = StreamConfig::for_testing();
        assert!(config.heartbeat_interval < Duration::from_secs(1));
        assert!(config.cleanup_interval < Duration::from_secs(1));
    }
}
