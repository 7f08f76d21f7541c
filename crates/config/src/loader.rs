use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, info, warn},
};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::RelayConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["relay.toml", "relay.yaml", "relay.yml", "relay.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./relay.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/relay/relay.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RelayConfig::default()` if no file is found or the file fails
/// to parse. Environment overrides are applied in every case.
pub fn discover_and_load() -> RelayConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => {
                    info!(path = %path.display(), "config loaded");
                    cfg
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    RelayConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            RelayConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/relay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "relay").map(|d| d.config_dir().to_path_buf())
}

/// Apply `RELAY_*` environment variables on top of a loaded config.
///
/// - `RELAY_TELEGRAM_TOKEN` → `telegram.token`
/// - `RELAY_AGENT_PROGRAM` → `agent.program`
/// - `RELAY_AGENT_MODEL` → `agent.model`
/// - `RELAY_SCRATCH_DIR` → `agent.scratch_dir`
pub fn apply_env_overrides(config: &mut RelayConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(token) = get("RELAY_TELEGRAM_TOKEN") {
        config.telegram.token = Secret::new(token);
    }
    if let Some(program) = get("RELAY_AGENT_PROGRAM") {
        config.agent.program = program;
    }
    if let Some(model) = get("RELAY_AGENT_MODEL") {
        config.agent.model = model;
    }
    if let Some(dir) = get("RELAY_SCRATCH_DIR") {
        config.agent.scratch_dir = Some(PathBuf::from(dir));
    }
}

fn parse_config(raw: &str, path: &Path) -> Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {secrecy::ExposeSecret, std::io::Write};

    use super::*;

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "relay.toml",
            "[agent]\nprogram = \"my-agent\"\n[delivery]\npace_ms = 0\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.agent.program, "my-agent");
        assert_eq!(cfg.delivery.pace_ms, 0);
        assert_eq!(cfg.delivery.max_chunk_len, 4000);
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = write_file(dir.path(), "relay.yaml", "runner:\n  max_retries: 1\n");
        assert_eq!(load_config(&yaml).unwrap().runner.max_retries, 1);

        let json = write_file(dir.path(), "relay.json", r#"{"runner":{"memory_limit":3}}"#);
        assert_eq!(load_config(&json).unwrap().runner.memory_limit, 3);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "relay.ini", "x=1");
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }

    #[test]
    fn env_overrides_replace_values() {
        let mut cfg = RelayConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "RELAY_TELEGRAM_TOKEN" => Some("42:XYZ".into()),
            "RELAY_AGENT_MODEL" => Some("vendor/other".into()),
            "RELAY_AGENT_PROGRAM" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.telegram.token.expose_secret(), "42:XYZ");
        assert_eq!(cfg.agent.model, "vendor/other");
        // Blank values are ignored.
        assert_eq!(cfg.agent.program, "opencode");
    }
}
