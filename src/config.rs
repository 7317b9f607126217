//! Runtime configuration and the on-disk instance descriptor.

use crate::types::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node role: a primary accepts writes and serves the WAL stream; a follower
/// only applies replicated entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Primary,
    Follower,
}

impl std::str::FromStr for ReplicationMode {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(ReplicationMode::Primary),
            "follower" => Ok(ReplicationMode::Follower),
            other => Err(DatabaseError::ConfigError(format!(
                "invalid replication mode: {other} (expected primary|follower)"
            ))),
        }
    }
}

/// Runtime settings, loaded from `P8_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database directory (`P8_DB_PATH`).
    pub db_path: PathBuf,
    /// Tenant for CLI operations (`P8_TENANT_ID`).
    pub tenant_id: String,
    /// Provider tag, e.g. `openai:text-embedding-3-small`
    /// (`P8_DEFAULT_EMBEDDING_PROVIDER`).
    pub default_embedding_provider: String,
    /// Node role (`P8_REPLICATION_MODE`).
    pub replication_mode: ReplicationMode,
    /// Primary address for followers (`P8_REPLICATION_PRIMARY`).
    pub replication_primary: Option<String>,
    /// WAL retention horizon (`P8_WAL_RETENTION_HOURS`).
    pub wal_retention: Duration,
    /// Budget for operations that wait on external capabilities.
    pub operation_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("~/.rem/db"),
            tenant_id: "default".to_string(),
            default_embedding_provider: "openai:text-embedding-3-small".to_string(),
            replication_mode: ReplicationMode::Primary,
            replication_primary: None,
            wal_retention: Duration::from_secs(168 * 3600),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("P8_DB_PATH") {
            settings.db_path = PathBuf::from(shellexpand::tilde(&path).to_string());
        }
        if let Ok(tenant) = std::env::var("P8_TENANT_ID") {
            settings.tenant_id = tenant;
        }
        if let Ok(provider) = std::env::var("P8_DEFAULT_EMBEDDING_PROVIDER") {
            settings.default_embedding_provider = provider;
        }
        if let Ok(mode) = std::env::var("P8_REPLICATION_MODE") {
            settings.replication_mode = mode.parse()?;
        }
        if let Ok(primary) = std::env::var("P8_REPLICATION_PRIMARY") {
            settings.replication_primary = Some(primary);
        }
        if let Ok(hours) = std::env::var("P8_WAL_RETENTION_HOURS") {
            let hours: u64 = hours.parse().map_err(|_| {
                DatabaseError::ConfigError(format!("invalid P8_WAL_RETENTION_HOURS: {hours}"))
            })?;
            settings.wal_retention = Duration::from_secs(hours * 3600);
        }

        Ok(settings)
    }

    /// Store directory for one tenant: `{db_path}/{tenant}/`.
    pub fn tenant_store_path(&self, tenant: &str) -> PathBuf {
        self.db_path.join(tenant)
    }
}

/// Instance descriptor persisted as `{db_path}/meta.json`.
///
/// Records enough to refuse incompatible re-opens: core version, node role,
/// per-index HNSW parameters, and registered schema versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub core_version: String,
    pub replication_mode: ReplicationMode,
    /// `{tenant}/{schema}` -> parameters for that vector index.
    #[serde(default)]
    pub hnsw_indexes: HashMap<String, crate::index::hnsw::HnswParams>,
    /// `{tenant}/{short_name}` -> schema version.
    #[serde(default)]
    pub schema_versions: HashMap<String, String>,
}

impl InstanceMeta {
    pub fn new(replication_mode: ReplicationMode) -> Self {
        Self {
            core_version: env!("CARGO_PKG_VERSION").to_string(),
            replication_mode,
            hnsw_indexes: HashMap::new(),
            schema_versions: HashMap::new(),
        }
    }

    /// Load from `{db_path}/meta.json`, or create a fresh descriptor.
    pub fn load_or_init(db_path: &Path, mode: ReplicationMode) -> Result<Self> {
        let file = db_path.join("meta.json");
        if file.exists() {
            let content = std::fs::read_to_string(&file)?;
            let meta: InstanceMeta = serde_json::from_str(&content)
                .map_err(|e| DatabaseError::ConfigError(format!("invalid meta.json: {e}")))?;
            if meta.replication_mode != mode {
                return Err(DatabaseError::ConfigError(format!(
                    "instance was created as {:?} but opened as {:?}",
                    meta.replication_mode, mode
                )));
            }
            Ok(meta)
        } else {
            let meta = Self::new(mode);
            meta.save(db_path)?;
            Ok(meta)
        }
    }

    /// Persist to `{db_path}/meta.json`.
    pub fn save(&self, db_path: &Path) -> Result<()> {
        std::fs::create_dir_all(db_path)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(db_path.join("meta.json"), content)?;
        Ok(())
    }
}
