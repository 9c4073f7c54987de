use log::{error, info, LevelFilter};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Client ticks per second; timers below are expressed against this.
pub const TICKS_PER_SECOND: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ─── Persisted config ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoryConfig {
    pub mod_enabled: bool,
    /// Seconds a finished dialogue stays on screen before fading out.
    pub message_vanish_time: f64,
    /// Characters revealed per second by the typewriter.
    pub typing_speed: u32,
    pub fade_duration_ticks: u32,
    pub session_inactivity_ms: u64,
    pub session_cleanup_ms: u64,
    pub history_limit: usize,
    pub mirror_to_chat: bool,
    pub log_level: String,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            mod_enabled: true,
            message_vanish_time: 10.0,
            typing_speed: 10,
            fade_duration_ticks: 40,
            session_inactivity_ms: 5_000,
            session_cleanup_ms: 10_000,
            history_limit: 500,
            mirror_to_chat: false,
            log_level: "info".into(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl StoryConfig {
    /// Load from `path`, writing a default file when none exists.
    /// A broken file is logged and replaced by defaults in memory only.
    pub fn load_or_create(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config file found, creating default config");
                let config = Self::default();
                if let Err(e) = config.save_to(path) {
                    error!("Failed to save config: {}", e);
                }
                config
            }
            Err(e) => {
                error!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    /// Ticks a completed dialogue waits before fading out.
    pub fn vanish_ticks(&self) -> u32 {
        (self.message_vanish_time.max(0.0) * TICKS_PER_SECOND as f64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_client_timings() {
        let c = StoryConfig::default();
        assert!(c.mod_enabled);
        assert_eq!(c.vanish_ticks(), 200);
        assert_eq!(c.session_inactivity_ms, 5_000);
        assert_eq!(c.session_cleanup_ms, 10_000);
        assert_eq!(c.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn save_and_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = StoryConfig::default();
        config.mod_enabled = false;
        config.message_vanish_time = 2.5;
        config.save_to(&path).unwrap();

        let loaded = StoryConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.vanish_ticks(), 50);
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "typing_speed = 20\nlog_level = \"debug\"\n").unwrap();

        let loaded = StoryConfig::load_from(&path).unwrap();
        assert_eq!(loaded.typing_speed, 20);
        assert_eq!(loaded.level_filter(), LevelFilter::Debug);
        assert_eq!(loaded.history_limit, 500);
    }

    #[test]
    fn load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = StoryConfig::load_or_create(&path);
        assert_eq!(config, StoryConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mod_enabled = \"sometimes\"").unwrap();

        assert!(matches!(StoryConfig::load_from(&path), Err(ConfigError::Parse(_))));
        assert_eq!(StoryConfig::load_or_create(&path), StoryConfig::default());
    }

    #[test]
    fn unknown_log_level_defaults_to_info() {
        let config = StoryConfig {
            log_level: "chatty".into(),
            ..StoryConfig::default()
        };
        assert_eq!(config.level_filter(), LevelFilter::Info);
    }
}
