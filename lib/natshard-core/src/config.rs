//! Central typed configuration (§6, §9 "Hidden coupling via module-level
//! config" re-architected as an explicit record passed to each component at
//! construction).

use crate::error::{ConfigError, MissingFieldSnafu, NotWritableSnafu, ParseSnafu, ReadSnafu};
use serde::Deserialize;
use snafu::ResultExt;
use std::path::{Path, PathBuf};

fn default_batch_size() -> usize {
    500
}
fn default_batch_timeout_sec() -> u64 {
    10
}
fn default_db_timeout_sec() -> u64 {
    5
}
fn default_journal_mode() -> String {
    "WAL".to_string()
}
fn default_synchronous() -> String {
    "NORMAL".to_string()
}
fn default_retention_days() -> u32 {
    0
}
fn default_syslog_port() -> u16 {
    514
}
fn default_noise_filters() -> Vec<String> {
    vec!["->8.8.8.8:53".to_string(), ":123->".to_string()]
}
fn default_query_result_limit() -> usize {
    10_000
}

/// Recognized options from §6's config table, plus the query engine's own
/// result-size guard (§4.3 "limit guard").
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hot_storage_dir: PathBuf,
    pub cold_storage_dir: PathBuf,

    #[serde(default = "default_users_db_path")]
    pub users_db_path: PathBuf,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_sec")]
    pub batch_timeout_sec: u64,

    #[serde(default = "default_noise_filters")]
    pub noise_filters: Vec<String>,

    #[serde(default = "default_db_timeout_sec")]
    pub db_timeout_sec: u64,

    #[serde(default = "default_journal_mode")]
    pub db_journal_mode: String,

    #[serde(default = "default_synchronous")]
    pub db_synchronous: String,

    #[serde(default = "default_retention_days")]
    pub log_retention_days: u32,

    #[serde(default)]
    pub enable_audit_log: bool,

    #[serde(default = "default_syslog_port")]
    pub syslog_port: u16,

    #[serde(default = "default_query_result_limit")]
    pub query_result_limit: usize,
}

fn default_users_db_path() -> PathBuf {
    PathBuf::from("users.db")
}

impl Config {
    /// Loads from a TOML file, then applies the handful of environment
    /// overrides operators expect to flip without editing a file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let mut config: Config = toml::from_str(&raw).context(ParseSnafu)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HOT_STORAGE_DIR") {
            self.hot_storage_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COLD_STORAGE_DIR") {
            self.cold_storage_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SYSLOG_PORT") {
            if let Ok(port) = v.parse() {
                self.syslog_port = port;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hot_storage_dir.as_os_str().is_empty() {
            return MissingFieldSnafu {
                field: "hot_storage_dir",
            }
            .fail();
        }
        if self.cold_storage_dir.as_os_str().is_empty() {
            return MissingFieldSnafu {
                field: "cold_storage_dir",
            }
            .fail();
        }
        for (field, dir) in [
            ("hot_storage_dir", &self.hot_storage_dir),
            ("cold_storage_dir", &self.cold_storage_dir),
        ] {
            std::fs::create_dir_all(dir).context(NotWritableSnafu {
                path_field: field,
                path: dir.clone(),
            })?;
        }
        Ok(())
    }

    pub fn hot_buffer_path(&self) -> PathBuf {
        self.hot_storage_dir.join("hot_logs.raw")
    }

    pub fn offset_path(&self) -> PathBuf {
        self.cold_storage_dir.join(".processor.offset")
    }

    pub fn shard_path(&self, date: chrono::NaiveDate) -> PathBuf {
        self.cold_storage_dir
            .join(format!("{}.db", date.format("%Y-%m-%d")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_defaults_for_optional_fields() {
        let toml = r#"
            hot_storage_dir = "/tmp/hot"
            cold_storage_dir = "/tmp/cold"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_timeout_sec, 10);
        assert_eq!(config.db_journal_mode, "WAL");
        assert_eq!(config.syslog_port, 514);
        assert_eq!(config.log_retention_days, 0);
    }

    #[test]
    fn derives_well_known_paths() {
        let toml = r#"
            hot_storage_dir = "/tmp/hot"
            cold_storage_dir = "/tmp/cold"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.hot_buffer_path(), PathBuf::from("/tmp/hot/hot_logs.raw"));
        assert_eq!(config.offset_path(), PathBuf::from("/tmp/cold/.processor.offset"));
        let date = chrono::NaiveDate::from_ymd_opt(2026, 12, 2).unwrap();
        assert_eq!(config.shard_path(date), PathBuf::from("/tmp/cold/2026-12-02.db"));
    }
}
