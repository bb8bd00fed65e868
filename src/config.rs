use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub autoblock: AutoblockConfig,

    #[serde(default)]
    pub usernames: UsernameConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults. Missing or
    /// partial config never hard-fails the security pipeline.
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/autoban/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("autoban/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.general.db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append event details to blocked-request messages
    #[serde(default)]
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            debug: false,
        }
    }
}

/// Signal aggregated by the rate limiter when deciding whether to ban.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMethod {
    #[default]
    FailedLogins,
}

/// Settings for the adaptive IP-banning feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoblockConfig {
    /// Whether autoblock is active at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub method: BlockMethod,

    /// Threat score within the window that triggers a ban
    #[serde(default = "default_threat_threshold")]
    pub threat_threshold: u32,

    /// Time window to aggregate failures over (minutes)
    #[serde(default = "default_timespan")]
    pub timespan_minutes: u32,

    /// First-offense ban duration (minutes)
    #[serde(default = "default_ban_1")]
    pub ban_1_minutes: u32,

    /// Second-offense ban duration (hours)
    #[serde(default = "default_ban_2")]
    pub ban_2_hours: u32,

    /// Third-offense ban duration (days)
    #[serde(default = "default_ban_3")]
    pub ban_3_days: u32,
}

impl Default for AutoblockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: BlockMethod::FailedLogins,
            threat_threshold: default_threat_threshold(),
            timespan_minutes: default_timespan(),
            ban_1_minutes: default_ban_1(),
            ban_2_hours: default_ban_2(),
            ban_3_days: default_ban_3(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsernameConfig {
    /// Whether login attempts with listed usernames are hard-blocked
    #[serde(default)]
    pub block_enabled: bool,

    /// Usernames to hard-block, compared case-insensitively
    #[serde(default)]
    pub block_list: Vec<String>,
}

impl UsernameConfig {
    /// Block list normalized the way comparisons expect it: trimmed,
    /// lowercased, deduplicated, original order kept.
    pub fn normalized_block_list(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.block_list
            .iter()
            .map(|u| u.trim().to_lowercase())
            .filter(|u| !u.is_empty() && seen.insert(u.clone()))
            .collect()
    }
}

/// Per-type row caps applied by the daily cleanup, plus the grace window for
/// expired allow/deny rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(rename = "404s", default = "default_retain_404s")]
    pub e404s: u64,

    #[serde(default = "default_retain_logins")]
    pub logins: u64,

    #[serde(default = "default_retain_allow_deny")]
    pub allow_deny: u64,

    #[serde(default = "default_retain_activity")]
    pub activity: u64,

    /// Days an expired allow/deny row is kept before the sweep deletes it
    #[serde(default = "default_grace_days")]
    pub grace_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            e404s: default_retain_404s(),
            logins: default_retain_logins(),
            allow_deny: default_retain_allow_deny(),
            activity: default_retain_activity(),
            grace_days: default_grace_days(),
        }
    }
}

// Default value functions
fn default_db_path() -> String {
    "/var/lib/autoban/autoban.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_threat_threshold() -> u32 {
    5
}

fn default_timespan() -> u32 {
    5 // minutes
}

fn default_ban_1() -> u32 {
    10 // minutes
}

fn default_ban_2() -> u32 {
    1 // hour
}

fn default_ban_3() -> u32 {
    1 // day
}

fn default_retain_404s() -> u64 {
    500
}

fn default_retain_logins() -> u64 {
    100
}

fn default_retain_allow_deny() -> u64 {
    10
}

fn default_retain_activity() -> u64 {
    1000
}

fn default_grace_days() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.autoblock.enabled);
        assert_eq!(config.autoblock.ban_1_minutes, 10);
        assert_eq!(config.autoblock.ban_2_hours, 1);
        assert_eq!(config.autoblock.ban_3_days, 1);
        assert_eq!(config.retention.e404s, 500);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.autoblock.threat_threshold,
            config.autoblock.threat_threshold
        );
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let parsed: Config = toml::from_str("[autoblock]\nthreat_threshold = 8\n").unwrap();
        assert_eq!(parsed.autoblock.threat_threshold, 8);
        assert_eq!(parsed.autoblock.timespan_minutes, 5);
        assert_eq!(parsed.retention.logins, 100);
    }

    #[test]
    fn test_block_list_normalization() {
        let usernames = UsernameConfig {
            block_enabled: true,
            block_list: vec![
                " Admin ".to_string(),
                "root".to_string(),
                "admin".to_string(),
                String::new(),
            ],
        };
        assert_eq!(usernames.normalized_block_list(), vec!["admin", "root"]);
    }
}
