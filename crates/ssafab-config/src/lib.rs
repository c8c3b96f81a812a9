//! Configuration for the ssafab daemon.
//!
//! Two input formats are accepted: a sectioned TOML file (preferred)
//! and the legacy flat `key value` option file the original daemon
//! shipped with. Both resolve into the same [`FabricConfig`]; every
//! field has a built-in default so a missing file is not an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ssafab_types::NodeType;
use thiserror::Error;
use tracing::warn;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Main daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FabricConfig {
    pub log: LogConfig,
    pub node: NodeConfig,
    pub net: NetConfig,
    pub timing: TimingConfig,
    pub dump: DumpConfig,
    pub replication: ReplicationConfig,
    pub addr: AddrConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub log_file: PathBuf,
    pub log_level: u32,
    pub log_flush: bool,
    pub accum_log_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/ssafab.log"),
            log_level: 1,
            log_flush: true,
            accum_log_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// `core` or `combined` (core + access).
    pub node_type: String,
    pub lock_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_type: "core".to_string(),
            lock_file: PathBuf::from("/var/run/ssafab.pid"),
        }
    }
}

impl NodeConfig {
    pub fn parsed_node_type(&self) -> ConfigResult<NodeType> {
        NodeType::from_str(&self.node_type).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("node_type"),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    pub smdb_port: u16,
    pub prdb_port: u16,
    pub admin_port: u16,
    /// TCP keep-alive idle seconds; 0 disables keep-alive.
    pub keepalive: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            smdb_port: 7475,
            prdb_port: 7476,
            admin_port: 7477,
            keepalive: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds during which an Access node prefers its previous parent.
    pub join_timeout: u64,
    /// Base rejoin backoff in seconds; doubled per failure up to 120x.
    pub rejoin_timeout: u64,
    /// Reconnect interval in seconds.
    pub reconnect_timeout: u64,
    /// Reconnect attempts before escalating to a bad-parent rejoin.
    pub reconnect_max_count: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            join_timeout: 30,
            rejoin_timeout: 1,
            reconnect_timeout: 10,
            reconnect_max_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DumpConfig {
    pub smdb_dump: bool,
    pub err_smdb_dump: bool,
    pub prdb_dump: bool,
    pub smdb_dump_dir: PathBuf,
    pub prdb_dump_dir: PathBuf,
    /// Bitmask of tree layers included in the periodic tree dump:
    /// 1 core, 2 distribution, 4 access, 8 consumer. 0 disables.
    pub distrib_tree_level: u32,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            smdb_dump: false,
            err_smdb_dump: false,
            prdb_dump: false,
            smdb_dump_dir: PathBuf::from("/var/lib/ssafab/smdb_dump"),
            prdb_dump_dir: PathBuf::from("/var/lib/ssafab/prdb_dump"),
            distrib_tree_level: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Reserved. Incremental updates are not supported; this is forced
    /// off at load time.
    pub smdb_deltas: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AddrConfig {
    pub addr_preload: bool,
    pub addr_data_file: PathBuf,
}

impl Default for AddrConfig {
    fn default() -> Self {
        Self {
            addr_preload: false,
            addr_data_file: PathBuf::from("/etc/rdma/ssafab_hosts"),
        }
    }
}

impl FabricConfig {
    /// Loads a TOML config file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.sanitize();
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mut config: FabricConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.sanitize();
        Ok(config)
    }

    /// Loads the legacy flat `key value` option file.
    pub fn load_legacy(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            config.apply_legacy(key, value);
        }
        config.sanitize();
        Ok(config)
    }

    fn apply_legacy(&mut self, key: &str, value: &str) {
        let as_bool = || value.parse::<i64>().map(|v| v != 0).unwrap_or(false);
        match key.to_ascii_lowercase().as_str() {
            "log_file" => self.log.log_file = PathBuf::from(value),
            "log_level" => self.log.log_level = value.parse().unwrap_or(self.log.log_level),
            "log_flush" => self.log.log_flush = as_bool(),
            "accum_log_file" => self.log.accum_log_file = as_bool(),
            "lock_file" => self.node.lock_file = PathBuf::from(value),
            "node_type" => self.node.node_type = value.to_string(),
            "smdb_port" => self.net.smdb_port = value.parse().unwrap_or(self.net.smdb_port),
            "prdb_port" => self.net.prdb_port = value.parse().unwrap_or(self.net.prdb_port),
            "admin_port" => self.net.admin_port = value.parse().unwrap_or(self.net.admin_port),
            "keepalive" => self.net.keepalive = value.parse().unwrap_or(self.net.keepalive),
            "join_timeout" => {
                self.timing.join_timeout = value.parse().unwrap_or(self.timing.join_timeout);
            }
            "rejoin_timeout" => {
                self.timing.rejoin_timeout = value.parse().unwrap_or(self.timing.rejoin_timeout);
            }
            "reconnect_timeout" => {
                self.timing.reconnect_timeout =
                    value.parse().unwrap_or(self.timing.reconnect_timeout);
            }
            "reconnect_max_count" => {
                self.timing.reconnect_max_count =
                    value.parse().unwrap_or(self.timing.reconnect_max_count);
            }
            "smdb_dump" => self.dump.smdb_dump = as_bool(),
            "err_smdb_dump" => self.dump.err_smdb_dump = as_bool(),
            "prdb_dump" => self.dump.prdb_dump = as_bool(),
            "smdb_dump_dir" => self.dump.smdb_dump_dir = PathBuf::from(value),
            "prdb_dump_dir" => self.dump.prdb_dump_dir = PathBuf::from(value),
            "distrib_tree_level" => {
                self.dump.distrib_tree_level =
                    value.parse().unwrap_or(self.dump.distrib_tree_level);
            }
            "smdb_deltas" => self.replication.smdb_deltas = as_bool(),
            "addr_preload" => self.addr.addr_preload = as_bool(),
            "addr_data_file" => self.addr.addr_data_file = PathBuf::from(value),
            _ => warn!(key, "ignoring unknown config option"),
        }
    }

    /// Applies cross-field fixups after loading.
    fn sanitize(&mut self) {
        if self.replication.smdb_deltas {
            warn!(
                "incremental SMDB updates are not supported; \
                 falling back to full updates"
            );
            self.replication.smdb_deltas = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = FabricConfig::default();
        assert_eq!(config.net.smdb_port, 7475);
        assert_eq!(config.net.prdb_port, 7476);
        assert_eq!(config.net.admin_port, 7477);
        assert_eq!(config.net.keepalive, 60);
        assert_eq!(config.timing.join_timeout, 30);
        assert_eq!(config.timing.reconnect_max_count, 10);
        assert_eq!(config.dump.distrib_tree_level, 0);
        assert!(!config.replication.smdb_deltas);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = FabricConfig::load(Path::new("/nonexistent/ssafab.toml")).unwrap();
        assert_eq!(config, FabricConfig::default());
    }

    #[test]
    fn toml_overrides_and_deltas_forced_off() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[node]
node_type = "combined"

[net]
smdb_port = 17475

[replication]
smdb_deltas = true
"#
        )
        .unwrap();

        let config = FabricConfig::load(file.path()).unwrap();
        assert_eq!(config.net.smdb_port, 17475);
        assert_eq!(
            config.node.parsed_node_type().unwrap(),
            NodeType::CORE | NodeType::ACCESS
        );
        assert!(!config.replication.smdb_deltas, "deltas must be forced off");
    }

    #[test]
    fn legacy_flat_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "# comment line\n\
             node_type combined\n\
             smdb_port 8475\n\
             keepalive 0\n\
             distrib_tree_level 15\n\
             smdb_deltas 1\n\
             bogus_option 3\n"
        )
        .unwrap();

        let config = FabricConfig::load_legacy(file.path()).unwrap();
        assert_eq!(config.node.node_type, "combined");
        assert_eq!(config.net.smdb_port, 8475);
        assert_eq!(config.net.keepalive, 0);
        assert_eq!(config.dump.distrib_tree_level, 15);
        assert!(!config.replication.smdb_deltas);
    }

    #[test]
    fn bad_node_type_is_reported() {
        let config = NodeConfig {
            node_type: "leafy".into(),
            ..NodeConfig::default()
        };
        assert!(config.parsed_node_type().is_err());
    }
}
