use std::time::Duration;

use relay_config::RunnerConfig;

/// Runtime form of [`RunnerConfig`], with durations resolved.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub flush_threshold: usize,
    pub memory_limit: usize,
    pub line_channel_capacity: usize,
    pub completion_preview_chars: usize,
}

impl From<&RunnerConfig> for RunnerSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            flush_threshold: config.flush_threshold.max(1),
            memory_limit: config.memory_limit,
            line_channel_capacity: config.line_channel_capacity.max(1),
            completion_preview_chars: config.completion_preview_chars,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}
