//! キャッシュ namespace ごとの TTL

use std::collections::HashMap;
use std::time::Duration;

use crate::config::CacheConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    default_ttl: Duration,
    namespaces: HashMap<String, Duration>,
}

impl CachePolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            namespaces: HashMap::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            namespaces: config
                .namespaces
                .iter()
                .map(|(namespace, secs)| (namespace.clone(), Duration::from_secs(*secs)))
                .collect(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
        self.namespaces.insert(namespace.into(), ttl);
        self
    }

    /// TTL for `namespace`, falling back to the default.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespaces.get(namespace).copied().unwrap_or(self.default_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}
