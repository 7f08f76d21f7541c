//! Configuration loading, env substitution, overrides and validation.
//!
//! Config files: `relay.toml`, `relay.yaml`, `relay.yml` or `relay.json`,
//! searched in `./` then `~/.config/relay/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in the raw
//! file text before parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config},
    schema::{AgentConfig, DeliveryConfig, RelayConfig, RunnerConfig, TelegramConfig},
    validate::{Diagnostic, Severity, ValidationResult},
};
