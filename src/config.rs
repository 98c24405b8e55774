/// Configuration system: TOML-based with sensible defaults.
/// Config file: `~/.config/atl-terminal/config.toml`

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub poller: PollerConfig,
    pub transcript: TranscriptConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable that understands the `supervise` subcommand. Defaults to
    /// the running executable.
    pub program: Option<PathBuf>,
    pub stop_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub output_timeout_ms: u64,
    pub request_poll_ms: u64,
    pub output_poll_ms: u64,
    pub kill_confirm_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub output_interval_ms: u64,
    pub health_interval_ms: u64,
    pub restart_after_failures: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    pub max_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            poller: PollerConfig::default(),
            transcript: TranscriptConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: None,
            stop_timeout_ms: 5_000,
            restart_delay_ms: 500,
            output_timeout_ms: 10,
            request_poll_ms: 100,
            output_poll_ms: 10,
            kill_confirm_ms: 500,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            output_interval_ms: 100,
            health_interval_ms: 3_000,
            restart_after_failures: 3,
        }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self { max_lines: 10_000 }
    }
}

impl Config {
    /// Config file path: `~/.config/atl-terminal/config.toml`
    pub fn path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from a specific file, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_str(&contents),
            Err(_) => Self::default(),
        }
    }

    /// Parse config from TOML string.
    pub fn from_str(s: &str) -> Self {
        toml::from_str(s).unwrap_or_else(|e| {
            log::warn!("ignoring invalid config: {e}");
            Self::default()
        })
    }
}

fn dirs_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".config").join("atl-terminal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.supervisor.stop_timeout_ms, 5_000);
        assert_eq!(cfg.supervisor.request_poll_ms, 100);
        assert_eq!(cfg.supervisor.kill_confirm_ms, 500);
        assert!(cfg.supervisor.program.is_none());
        assert_eq!(cfg.poller.health_interval_ms, 3_000);
        assert_eq!(cfg.transcript.max_lines, 10_000);
    }

    #[test]
    fn test_parse_empty_toml() {
        let cfg = Config::from_str("");
        assert_eq!(cfg.supervisor.restart_delay_ms, 500);
        assert_eq!(cfg.poller.output_interval_ms, 100);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg = Config::from_str(r#"
            [supervisor]
            program = "/usr/libexec/atl-terminal"
            stop_timeout_ms = 2000

            [poller]
            restart_after_failures = 10
        "#);
        assert_eq!(cfg.supervisor.program, Some(PathBuf::from("/usr/libexec/atl-terminal")));
        assert_eq!(cfg.supervisor.stop_timeout_ms, 2000);
        assert_eq!(cfg.poller.restart_after_failures, 10);
        // Defaults preserved for unset fields
        assert_eq!(cfg.supervisor.output_timeout_ms, 10);
        assert_eq!(cfg.poller.health_interval_ms, 3_000);
    }

    #[test]
    fn test_invalid_toml_falls_back() {
        let cfg = Config::from_str("this is not valid toml {{{}}}");
        assert_eq!(cfg.supervisor.stop_timeout_ms, 5_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("atl_test_config_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("config.toml");
        std::fs::write(&path, "[transcript]\nmax_lines = 50\n").unwrap();
        assert_eq!(Config::load_from(&path).transcript.max_lines, 50);
        assert_eq!(Config::load_from(&dir.join("missing.toml")).transcript.max_lines, 10_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_path() {
        let path = Config::path();
        assert!(path.to_str().unwrap().ends_with(".config/atl-terminal/config.toml"));
    }
}
