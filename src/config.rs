//! Cluster configuration and backend selection
//!
//! Configuration is read once at construction, either from defaults or from
//! `CHRONOMESH_*` environment variables, and the meta-store backend is
//! resolved from the `meta_storage` key.

use crate::metadata::{
    EngineKind, FileMetaStore, MemoryCoordinator, MetaStore, StorageEngineMeta,
};
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Configuration for a chronomesh front-end node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address this front-end announces to the cluster
    pub host: String,
    pub port: u16,
    /// Number of replicas per fragment beyond the master
    pub replica_num: usize,
    /// Fragment-split factor per engine used when rebalancing
    pub fragment_split_per_engine: usize,
    /// Prefix-frequency table size that triggers a flush
    pub prefix_flush_threshold: usize,
    /// Meta store backend: "file", "memory", "zookeeper", "etcd" or empty
    pub meta_storage: String,
    /// Persistence path for the file backend
    pub meta_storage_path: PathBuf,
    /// Static storage engine list: `host#port#kind#key=value#…`, comma separated
    pub storage_engine_list: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6888,
            replica_num: 1,
            fragment_split_per_engine: 10,
            prefix_flush_threshold: 100,
            meta_storage: "file".to_string(),
            meta_storage_path: PathBuf::from("chronomesh-meta.json"),
            storage_engine_list: String::new(),
            admin_username: "root".to_string(),
            admin_password: "root".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Build a configuration from `CHRONOMESH_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("CHRONOMESH_HOST", defaults.host),
            port: parse_env("CHRONOMESH_PORT", defaults.port)?,
            replica_num: parse_env("CHRONOMESH_REPLICA_NUM", defaults.replica_num)?,
            fragment_split_per_engine: parse_env(
                "CHRONOMESH_FRAGMENT_SPLIT_PER_ENGINE",
                defaults.fragment_split_per_engine,
            )?,
            prefix_flush_threshold: parse_env(
                "CHRONOMESH_PREFIX_FLUSH_THRESHOLD",
                defaults.prefix_flush_threshold,
            )?,
            meta_storage: env_or("CHRONOMESH_META_STORAGE", defaults.meta_storage),
            meta_storage_path: PathBuf::from(env_or(
                "CHRONOMESH_META_STORAGE_PATH",
                defaults.meta_storage_path.display().to_string(),
            )),
            storage_engine_list: env_or(
                "CHRONOMESH_STORAGE_ENGINE_LIST",
                defaults.storage_engine_list,
            ),
            admin_username: env_or("CHRONOMESH_ADMIN_USERNAME", defaults.admin_username),
            admin_password: env_or("CHRONOMESH_ADMIN_PASSWORD", defaults.admin_password),
        })
    }

    /// Parse the static storage engine list.
    ///
    /// Each entry is `host#port#kind` followed by `key=value` or
    /// `key="value"` parameter fields. Malformed entries are logged and
    /// skipped so one bad entry cannot take the node down.
    pub fn parse_storage_engines(&self, created_by: u64) -> Vec<StorageEngineMeta> {
        let mut engines = Vec::new();
        for entry in self.storage_engine_list.split(',') {
            if entry.is_empty() {
                continue;
            }
            let parts: Vec<&str> = entry.split('#').collect();
            if parts.len() < 3 {
                error!(entry, "unexpected storage engine entry");
                continue;
            }
            let host = parts[0].to_string();
            let port: u16 = match parts[1].parse() {
                Ok(port) => port,
                Err(_) => {
                    error!(entry, "storage engine entry has invalid port");
                    continue;
                }
            };
            let kind: EngineKind = parts[2].parse().unwrap_or(EngineKind::Unknown);
            let mut extra_params = HashMap::new();
            for field in &parts[3..] {
                if let Some((key, value)) = field.split_once('"') {
                    // key="value" form: the key keeps a trailing '=' to strip.
                    let key = key.trim_end_matches('=');
                    extra_params.insert(key.to_string(), value.trim_end_matches('"').to_string());
                } else if let Some((key, value)) = field.split_once('=') {
                    extra_params.insert(key.to_string(), value.to_string());
                } else {
                    error!(entry, field, "unexpected storage engine parameter");
                }
            }
            let mut engine = StorageEngineMeta::new(host, port, kind, extra_params, created_by);
            engine.id = engines.len() as u64;
            engines.push(engine);
        }
        engines
    }

    /// Resolve the meta store backend named by `meta_storage`.
    ///
    /// Empty or unknown values fall back to the file backend; the wire
    /// drivers for "zookeeper" and "etcd" are not part of this crate and
    /// selecting them fails construction.
    pub fn open_meta_store(&self) -> Result<Arc<dyn MetaStore>> {
        match self.meta_storage.as_str() {
            "file" => {
                info!("use file as meta storage");
                Ok(Arc::new(FileMetaStore::open(&self.meta_storage_path)?))
            }
            "" => {
                info!("meta storage not specified, use file as meta storage");
                Ok(Arc::new(FileMetaStore::open(&self.meta_storage_path)?))
            }
            "memory" => {
                info!("use in-process memory coordinator as meta storage");
                Ok(MemoryCoordinator::global().session())
            }
            "zookeeper" | "etcd" => Err(crate::Error::Config(format!(
                "meta storage '{}' requires the external coordination-service driver, \
                 which is not built into this crate",
                self.meta_storage
            ))),
            other => {
                warn!(backend = other, "unknown meta storage, use file as meta storage");
                Ok(Arc::new(FileMetaStore::open(&self.meta_storage_path)?))
            }
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_storage_engines_handles_both_parameter_forms() {
        let config = ClusterConfig {
            storage_engine_list:
                "127.0.0.1#8086#influxdb#token=abc#org=\"chronomesh\",127.0.0.2#9000#parquet"
                    .to_string(),
            ..Default::default()
        };
        let engines = config.parse_storage_engines(7);
        assert_eq!(engines.len(), 2);
        assert_eq!(engines[0].kind, EngineKind::InfluxDb);
        assert_eq!(engines[0].extra_params.get("token").unwrap(), "abc");
        assert_eq!(engines[0].extra_params.get("org").unwrap(), "chronomesh");
        assert_eq!(engines[0].created_by, 7);
        assert_eq!(engines[1].port, 9000);
        assert_eq!(engines[1].kind, EngineKind::Parquet);
    }

    #[test]
    fn parse_storage_engines_skips_malformed_entries() {
        let config = ClusterConfig {
            storage_engine_list: "no-port#nan#influxdb,127.0.0.1#8086#influxdb".to_string(),
            ..Default::default()
        };
        let engines = config.parse_storage_engines(1);
        assert_eq!(engines.len(), 1);
        assert_eq!(engines[0].host, "127.0.0.1");
    }

    #[test]
    fn empty_engine_list_yields_no_engines() {
        let config = ClusterConfig::default();
        assert!(config.parse_storage_engines(1).is_empty());
    }

    #[test]
    fn zookeeper_backend_requires_external_driver() {
        let config = ClusterConfig {
            meta_storage: "zookeeper".to_string(),
            ..Default::default()
        };
        let err = match config.open_meta_store() {
            Err(e) => e,
            Ok(_) => panic!("expected open_meta_store to fail"),
        };
        assert!(format!("{err}").contains("coordination-service driver"));
    }
}
