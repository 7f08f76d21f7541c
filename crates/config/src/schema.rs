/// Config schema types (telegram, agent, runner, delivery).
use std::{collections::HashMap, path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    pub agent: AgentConfig,
    pub runner: RunnerConfig,
    pub delivery: DeliveryConfig,
}

/// Telegram bot connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,
    /// Long-polling timeout passed to `getUpdates` (seconds).
    pub poll_timeout_secs: u32,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("token", &"[REDACTED]")
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            poll_timeout_secs: 30,
        }
    }
}

impl TelegramConfig {
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// How the external agent process is invoked and reclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to spawn.
    pub program: String,
    /// Arguments placed before the task. `{model}` is replaced by `model`.
    /// The task itself is always appended after a `--` separator.
    pub args: Vec<String>,
    /// Model selector substituted into `args`.
    pub model: String,
    /// Extra environment merged over the inherited process environment.
    pub env: HashMap<String, String>,
    /// Working directory for the agent process.
    pub working_dir: Option<PathBuf>,
    /// Kill an attempt after this many seconds. Unset means no limit.
    pub attempt_timeout_secs: Option<u64>,
    /// Regex matched against full command lines of running processes during
    /// cleanup. Matching processes are killed. Unset disables the sweep.
    pub cleanup_pattern: Option<String>,
    /// Directory where the agent leaves per-run subdirectories. Every
    /// subdirectory is removed during cleanup. Unset disables the sweep.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "opencode".into(),
            args: vec![
                "run".into(),
                "--model".into(),
                "{model}".into(),
                "--format".into(),
                "json".into(),
            ],
            model: "opencode/minimax-m2.5-free".into(),
            env: HashMap::new(),
            working_dir: None,
            attempt_timeout_secs: None,
            cleanup_pattern: Some(r"opencode\s+run\b".into()),
            scratch_dir: Some(std::env::temp_dir().join("opencode")),
        }
    }
}

impl AgentConfig {
    /// Argument template with the model placeholder resolved.
    #[must_use]
    pub fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{model}", &self.model))
            .collect()
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }
}

/// Execution lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Pause between a failed attempt and the next one (seconds).
    pub retry_backoff_secs: u64,
    /// Silence after which buffered output is flushed and a liveness notice
    /// sent (seconds).
    pub heartbeat_interval_secs: u64,
    /// Characters buffered per category before an eager flush.
    pub flush_threshold: usize,
    /// Task/result pairs remembered per conversation.
    pub memory_limit: usize,
    /// Capacity of the stdout line channel between reader and executor.
    pub line_channel_capacity: usize,
    /// Characters of the result summary included in the completion notice.
    pub completion_preview_chars: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_secs: 5,
            heartbeat_interval_secs: 60,
            flush_threshold: 1000,
            memory_limit: 10,
            line_channel_capacity: 256,
            completion_preview_chars: 300,
        }
    }
}

/// Outbound delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Upper bound for one outbound message (characters).
    pub max_chunk_len: usize,
    /// Tries per chunk before it is dropped.
    pub send_attempts: u32,
    /// Pause between tries of the same chunk (ms).
    pub retry_delay_ms: u64,
    /// Pause after each sent chunk (ms).
    pub pace_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_chunk_len: 4000,
            send_attempts: 3,
            retry_delay_ms: 2000,
            pace_ms: 500,
        }
    }
}
