//! TOML configuration for the sett daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and addresses.
    pub node: NodeSection,
    /// Remote cluster members.
    pub peers: Vec<PeerSection>,
    /// Replication tuning.
    pub replication: ReplicationSection,
    /// Maintenance (GC and log retention) tuning.
    pub maintenance: MaintenanceSection,
    /// Snapshot backups.
    pub backup: BackupSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node identifier as 32 hex chars. When empty, the first 16 bytes of
    /// the node's public signing key are used.
    pub id: String,
    /// Directory for persistent data (engine files + `node.key` sidecar).
    pub data_dir: PathBuf,
    /// Address for the admin HTTP API.
    pub admin_listen_addr: String,
    /// Reject new records without an expiry time.
    pub require_expiry: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".sett"))
            .unwrap_or_else(|| PathBuf::from(".sett"));
        Self {
            id: String::new(),
            data_dir,
            admin_listen_addr: "127.0.0.1:4841".to_string(),
            require_expiry: false,
        }
    }
}

/// One `[[peers]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    /// The peer's node id as 32 hex chars. When empty, derived from its
    /// public key like the local default.
    pub node_id: String,
    /// Dial address: `<endpoint_id>` or `<endpoint_id>@host:port`. When
    /// empty, the public key doubles as a relay-discoverable endpoint id.
    pub address: String,
    /// The peer's ed25519 public key as 64 hex chars.
    pub public_key: String,
}

/// `[replication]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Seconds between pulls from each peer.
    pub interval_secs: Option<u64>,
    /// Maximum entries per pull.
    pub batch: Option<u32>,
    /// Per-batch deadline in seconds.
    pub deadline_secs: Option<u64>,
}

/// `[maintenance]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    /// Seconds between GC/retention sweeps.
    pub interval_secs: Option<u64>,
    /// Hours log entries are retained. Must exceed the maximum tolerable
    /// peer downtime.
    pub log_retention_hours: Option<u64>,
    /// Hours tombstones are retained. Must exceed the longest legitimate
    /// record TTL plus replication lag.
    pub tombstone_retention_hours: Option<u64>,
}

/// `[backup]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// Enable periodic backups.
    pub enabled: bool,
    /// Backup destination endpoint. A filesystem path selects the built-in
    /// file store; an S3 endpoint requires an external client binding.
    pub endpoint: String,
    /// Bucket name where database backups are stored.
    pub bucket: String,
    /// Database backup object path prefix.
    pub prefix: String,
    /// Seconds between full backups.
    pub interval_secs: Option<u64>,
    /// Access key for the backup bucket (S3 endpoints).
    pub access_key_id: String,
    /// Secret key for the backup bucket (S3 endpoints).
    pub secret_access_key: String,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective replication poll interval.
    pub fn replication_interval(&self) -> Duration {
        Duration::from_secs(self.replication.interval_secs.unwrap_or(5))
    }

    /// Effective replication batch size.
    pub fn replication_batch(&self) -> u32 {
        self.replication.batch.unwrap_or(1000)
    }

    /// Effective per-batch replication deadline.
    pub fn replication_deadline(&self) -> Duration {
        Duration::from_secs(self.replication.deadline_secs.unwrap_or(30))
    }

    /// Effective maintenance sweep interval. Defaults to 5 minutes.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.interval_secs.unwrap_or(300))
    }

    /// Effective log retention. Defaults to 7 days.
    pub fn log_retention(&self) -> Duration {
        Duration::from_secs(self.maintenance.log_retention_hours.unwrap_or(7 * 24) * 3600)
    }

    /// Effective tombstone retention. Defaults to 14 days.
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(
            self.maintenance
                .tombstone_retention_hours
                .unwrap_or(14 * 24)
                * 3600,
        )
    }

    /// Effective backup interval. Defaults to 1 hour.
    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup.interval_secs.unwrap_or(3600))
    }
}
