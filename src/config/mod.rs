// pgsqltool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::errors::AppError;

/// Reserved target name that fans a task out to every configured target.
pub const ALL_TARGETS: &str = "all";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "user";
const DEFAULT_PASSWORD: &str = "password";
const DEFAULT_DATABASE: &str = "database";
const DEFAULT_CHARSET: &str = "UTF8";

// Structs for deserializing the JSON config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonDbOptions {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonTargetConfig {
    #[serde(default)]
    pub db: JsonDbOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonTaskConfig {
    #[serde(default)]
    pub db: JsonDbOptions,
    #[serde(default)]
    pub targets: BTreeMap<String, JsonTargetConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    #[serde(default)]
    pub db: JsonDbOptions,
    #[serde(default)]
    pub tasks: BTreeMap<String, JsonTaskConfig>,
}

/// Fully resolved connection settings for one task/target pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
    pub charset: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: Some(DEFAULT_PASSWORD.to_string()),
            name: DEFAULT_DATABASE.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

impl ConnectionOptions {
    /// Layers a partial `db` block over these options. A `url` is applied
    /// first so explicit fields in the same block win over it.
    pub fn merge(&mut self, layer: &JsonDbOptions) -> crate::errors::Result<()> {
        if let Some(raw_url) = layer.url.as_deref().filter(|u| !u.trim().is_empty()) {
            self.apply_url(raw_url)?;
        }
        if let Some(host) = &layer.host {
            self.host = host.clone();
        }
        if let Some(port) = layer.port {
            self.port = port;
        }
        if let Some(user) = &layer.user {
            self.user = user.clone();
        }
        if let Some(password) = &layer.password {
            self.password = Some(password.clone()).filter(|p| !p.is_empty());
        }
        if let Some(name) = &layer.name {
            self.name = name.clone();
        }
        if let Some(charset) = &layer.charset {
            self.charset = charset.clone();
        }
        Ok(())
    }

    fn apply_url(&mut self, raw_url: &str) -> crate::errors::Result<()> {
        let parsed = Url::parse(raw_url)?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(AppError::Config(format!(
                "unsupported connection URL scheme '{}', expected postgres://",
                parsed.scheme()
            )));
        }
        if let Some(host) = parsed.host_str() {
            self.host = host.to_string();
        }
        if let Some(port) = parsed.port() {
            self.port = port;
        }
        if !parsed.username().is_empty() {
            self.user = parsed.username().to_string();
        }
        if let Some(password) = parsed.password() {
            self.password = Some(password.to_string());
        }
        let db_name = parsed.path().trim_start_matches('/');
        if !db_name.is_empty() {
            self.name = db_name.to_string();
        }
        Ok(())
    }

    /// Rejects settings no PostgreSQL client tool can work with.
    pub fn validate(&self) -> crate::errors::Result<()> {
        for (field, value) in [("host", &self.host), ("user", &self.user), ("name", &self.name)] {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("db.{} must not be empty", field)));
            }
        }
        if self.port == 0 {
            return Err(AppError::Config("db.port must not be 0".to_string()));
        }
        Ok(())
    }
}

// Per-task configuration handed to each flow by value
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub target: String,
    pub db: ConnectionOptions,
    pub file: PathBuf,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub target: String,
    pub db: ConnectionOptions,
    pub file: PathBuf,
    pub compressed: bool,
    pub stop_on_error: bool,
}

/// Configuration for tasks that only need a connection: drop and
/// drop-constraints.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub target: String,
    pub db: ConnectionOptions,
}

#[derive(Debug, Clone)]
pub struct MoveConstraintsConfig {
    pub target: String,
    pub source: ConnectionOptions,
    pub db: ConnectionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverwriteSource {
    Query(String),
    CsvFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct OverwriteConfig {
    pub target: String,
    pub db: ConnectionOptions,
    pub table: String,
    pub source: OverwriteSource,
    pub comment: Option<u8>,
    pub apply_to: Option<ConnectionOptions>,
}

#[derive(Debug, Clone)]
pub enum OperationConfig {
    Dump(DumpConfig),
    Load(LoadConfig),
    Drop(TargetConfig),
    DropConstraints(TargetConfig),
    MoveConstraints(MoveConstraintsConfig),
    Overwrite(OverwriteConfig),
}

impl OperationConfig {
    pub fn target(&self) -> &str {
        match self {
            OperationConfig::Dump(cfg) => cfg.target.as_str(),
            OperationConfig::Load(cfg) => &cfg.target,
            OperationConfig::Drop(cfg) | OperationConfig::DropConstraints(cfg) => &cfg.target,
            OperationConfig::MoveConstraints(cfg) => &cfg.target,
            OperationConfig::Overwrite(cfg) => &cfg.target,
        }
    }
}

/// Substitutes the first `%s` in a dump file pattern with the target name.
pub fn dump_file_for_target(pattern: &str, target: &str) -> PathBuf {
    PathBuf::from(pattern.replacen("%s", target, 1))
}

/// Dump and load files ending in `.gz` are gzip streams.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig =
            serde_json::from_str(content).map_err(AppError::SerdeJson)?;
        for (task, task_config) in &raw_json_config.tasks {
            if task_config.targets.contains_key(ALL_TARGETS) {
                return Err(AppError::Config(format!(
                    "task '{}' defines a target named '{}', which is reserved",
                    task, ALL_TARGETS
                ))
                .into());
            }
        }
        Ok(AppConfig { raw_json_config })
    }

    /// Names of the targets configured for `task`, in sorted order.
    pub fn targets_for(&self, task: &str) -> Vec<String> {
        self.raw_json_config
            .tasks
            .get(task)
            .map(|t| t.targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Merges defaults, the global `db` block, the task block and the target
    /// block into one validated set of connection options.
    pub fn resolve(&self, task: &str, target: &str) -> crate::errors::Result<ConnectionOptions> {
        let task_config = self.raw_json_config.tasks.get(task).ok_or_else(|| {
            AppError::Config(format!("no configuration for task '{}'", task))
        })?;
        let target_config = task_config.targets.get(target).ok_or_else(|| {
            AppError::Config(format!(
                "no target '{}' configured for task '{}'",
                target, task
            ))
        })?;

        let mut options = ConnectionOptions::default();
        options.merge(&self.raw_json_config.db)?;
        options.merge(&task_config.db)?;
        options.merge(&target_config.db)?;
        options.validate()?;
        Ok(options)
    }
}

/// Picks the config file: explicit flag, then `PGSQLTOOL_CONFIG`, then `pgsql.json`.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os("PGSQLTOOL_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("pgsql.json"))
}
