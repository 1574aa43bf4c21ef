//! RuntimeConfig - serde のプレーンなレコード、全フィールドにデフォルトあり
//!
//! 数値はデスクトッププロセス向けの出発点。調整済みの値ではないので、
//! デプロイごとに上書きする。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool_size: usize,
    pub watchdog_interval_ms: u64,
    pub leak_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    pub default_class: TaskClassConfig,
    pub task_classes: HashMap<String, TaskClassConfig>,
    pub cache: CacheConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            watchdog_interval_ms: 5_000,
            leak_grace_ms: 30_000,
            shutdown_grace_ms: 5_000,
            default_class: TaskClassConfig::default(),
            task_classes: HashMap::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Settings for `class`, or the default class when it is not listed.
    pub fn class(&self, class: &str) -> &TaskClassConfig {
        self.task_classes.get(class).unwrap_or(&self.default_class)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn leak_grace(&self) -> Duration {
        Duration::from_millis(self.leak_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskClassConfig {
    pub timeout_ms: u64,
    pub stall_threshold_ms: u64,
}

impl Default for TaskClassConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            stall_threshold_ms: 15_000,
        }
    }
}

impl TaskClassConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// Namespace -> TTL in seconds.
    pub namespaces: HashMap<String, u64>,
    pub sweep_interval_secs: u64,
    pub persistence: PersistenceConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            namespaces: HashMap::new(),
            sweep_interval_secs: 60,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub flush_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("offload-cache.jsonl"),
            flush_interval_secs: 300,
        }
    }
}

impl PersistenceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.pool_size, 4);
        assert_eq!(cfg.default_class.stall_threshold(), Duration::from_secs(15));
        assert!(!cfg.cache.persistence.enabled);
    }

    #[test]
    fn partial_sections_keep_their_other_defaults() {
        let cfg = RuntimeConfig::from_json_str(
            r#"{
                "pool_size": 2,
                "task_classes": { "probe": { "timeout_ms": 2000 } },
                "cache": { "namespaces": { "vt": 86400 }, "persistence": { "enabled": true } }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.class("probe").timeout(), Duration::from_secs(2));
        assert_eq!(cfg.class("probe").stall_threshold_ms, 15_000);
        assert_eq!(cfg.cache.namespaces["vt"], 86_400);
        assert_eq!(cfg.cache.default_ttl_secs, 3_600);
        assert!(cfg.cache.persistence.enabled);
        assert_eq!(cfg.cache.persistence.flush_interval_secs, 300);
    }

    #[rstest]
    #[case("probe", 2_000)]
    #[case("unlisted", 30_000)]
    fn unknown_classes_fall_back_to_default(#[case] class: &str, #[case] timeout_ms: u64) {
        let mut cfg = RuntimeConfig::default();
        cfg.task_classes.insert(
            "probe".to_string(),
            TaskClassConfig {
                timeout_ms: 2_000,
                stall_threshold_ms: 1_000,
            },
        );
        assert_eq!(cfg.class(class).timeout_ms, timeout_ms);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(RuntimeConfig::from_json_str("{ pool_size: }"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let path = std::env::temp_dir().join(format!("offload-missing-{}.json", ulid::Ulid::new()));
        assert!(matches!(RuntimeConfig::from_path(&path), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("offload-config-{}.json", ulid::Ulid::new()));
        fs::write(&path, r#"{ "shutdown_grace_ms": 250 }"#).unwrap();
        let cfg = RuntimeConfig::from_path(&path).unwrap();
        assert_eq!(cfg.shutdown_grace(), Duration::from_millis(250));
        fs::remove_file(&path).ok();
    }
}
