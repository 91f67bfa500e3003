use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};
use tracing::{info, warn};

use anyhow::{Context, Result, anyhow, bail};

use crate::{logger::LogSettings, worker::WorkerSettings};

/// Where settings come from. Keys are upper-case, e.g. `BOTS_SOURCE`.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Trimmed value, with empty strings treated as unset.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
    status: EnvFileStatus,
}

/// What happened to the `.env` file. Kept so it can be logged once a
/// subscriber is installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvFileStatus {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid { path: PathBuf, reason: String },
    NotFound,
}

impl EnvFileStatus {
    pub fn log(&self) {
        match self {
            EnvFileStatus::Loaded(path) => info!("Loaded .env from {}", path.display()),
            EnvFileStatus::Missing(path) => warn!("could not load .env from {}", path.display()),
            EnvFileStatus::Invalid { path, reason } => {
                warn!("could not parse .env at {}: {reason}", path.display())
            }
            EnvFileStatus::NotFound => {}
        }
    }
}

impl EnvConfigManager {
    /// Variables already set in the environment win over the file.
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        let status = match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => EnvFileStatus::Loaded(path.clone()),
                Err(e) => EnvFileStatus::Invalid {
                    path: path.clone(),
                    reason: e.to_string(),
                },
            },
            Some(path) => EnvFileStatus::Missing(path.clone()),
            None => match dotenvy::dotenv() {
                Ok(path) => EnvFileStatus::Loaded(path),
                Err(_) => EnvFileStatus::NotFound,
            },
        };

        Box::new(Self { env_file, status })
    }

    pub fn status(&self) -> &EnvFileStatus {
        &self.status
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// Fixed key/value pairs; used by tests and `--set`-style overrides.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Which backend feeds the configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotsSource {
    /// A JSON document on disk, watched for changes.
    File { path: PathBuf, poll_interval: Duration },
    /// Firebase Realtime Database streaming REST API.
    Firebase { db_url: String, auth: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Firebase,
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "firebase" => Ok(SourceKind::Firebase),
            other => Err(anyhow!("unknown BOTS_SOURCE `{other}`, expected `file` or `firebase`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source: BotsSource,
    /// Path of the bots object inside the tree.
    pub bots_root: String,
    pub health_enabled: bool,
    pub port: u16,
    pub worker: WorkerSettings,
    pub shutdown_timeout: Duration,
    pub log: LogSettings,
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Settings> {
        let db_url = config.get("FIREBASE_DB_URL").await;
        let kind = match config.get("BOTS_SOURCE").await {
            Some(kind) => kind.parse()?,
            None if db_url.is_some() => SourceKind::Firebase,
            None => SourceKind::File,
        };
        let source = match kind {
            SourceKind::File => BotsSource::File {
                path: config
                    .get("BOTS_FILE")
                    .await
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("bots.json")),
                poll_interval: Duration::from_millis(number(config, "POLL_INTERVAL_MS", 1000).await?),
            },
            SourceKind::Firebase => BotsSource::Firebase {
                db_url: db_url.context("BOTS_SOURCE=firebase needs FIREBASE_DB_URL")?,
                auth: config.get("FIREBASE_AUTH").await,
            },
        };

        let port = number(config, "PORT", 3000).await?;
        let port = u16::try_from(port).map_err(|_| anyhow!("PORT {port} is out of range"))?;

        Ok(Settings {
            source,
            bots_root: config.get("BOTS_ROOT").await.unwrap_or_else(|| "bots".to_string()),
            health_enabled: flag(config, "HEALTH_ENABLED", false).await?,
            port,
            worker: WorkerSettings {
                connect_timeout: secs(config, "CONNECT_TIMEOUT_SECS", 10).await?,
                request_timeout: secs(config, "REQUEST_TIMEOUT_SECS", 10).await?,
                stop_timeout: secs(config, "STOP_TIMEOUT_SECS", 5).await?,
            },
            shutdown_timeout: secs(config, "SHUTDOWN_TIMEOUT_SECS", 15).await?,
            log: LogSettings {
                log_level: config.get("LOG_LEVEL").await.unwrap_or_else(|| "info".to_string()),
                log_dir: config.get("LOG_DIR").await.map(PathBuf::from),
                otel_endpoint: config.get("OTEL_ENDPOINT").await,
            },
        })
    }
}

async fn number(config: &ConfigManager, key: &str, default: u64) -> Result<u64> {
    match config.get(key).await {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got `{raw}`")),
        None => Ok(default),
    }
}

async fn secs(config: &ConfigManager, key: &str, default: u64) -> Result<Duration> {
    let secs = number(config, key, default).await?;
    if secs == 0 {
        bail!("{key} must be at least 1");
    }
    Ok(Duration::from_secs(secs))
}

async fn flag(config: &ConfigManager, key: &str, default: bool) -> Result<bool> {
    match config.get(key).await.map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("{key} must be a boolean, got `{v}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    fn manager(pairs: &[(&str, &str)]) -> ConfigManager {
        let mut map = MapConfigManager::new();
        for (k, v) in pairs {
            map = map.with(k, v);
        }
        ConfigManager(map)
    }

    #[tokio::test]
    async fn test_map_config_manager_as_vec() {
        let mgr = MapConfigManager::new().with("a", "1").with("b", "2");
        let mut config = mgr.as_vec().await;
        config.sort();
        assert_eq!(
            config,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_defaults() {
        let settings = Settings::load(&manager(&[])).await.unwrap();
        assert_eq!(
            settings.source,
            BotsSource::File {
                path: PathBuf::from("bots.json"),
                poll_interval: Duration::from_secs(1),
            }
        );
        assert_eq!(settings.bots_root, "bots");
        assert!(!settings.health_enabled);
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.worker, WorkerSettings::default());
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(15));
        assert_eq!(settings.log, LogSettings::default());
    }

    #[tokio::test]
    async fn test_firebase_is_picked_when_url_is_set() {
        let settings = Settings::load(&manager(&[
            ("FIREBASE_DB_URL", "https://demo.firebaseio.com"),
            ("FIREBASE_AUTH", "secret"),
            ("HEALTH_ENABLED", "yes"),
            ("PORT", "8080"),
            ("CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .await
        .unwrap();
        assert_eq!(
            settings.source,
            BotsSource::Firebase {
                db_url: "https://demo.firebaseio.com".into(),
                auth: Some("secret".into()),
            }
        );
        assert!(settings.health_enabled);
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.worker.connect_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        assert!(Settings::load(&manager(&[("BOTS_SOURCE", "ftp")])).await.is_err());
        assert!(Settings::load(&manager(&[("BOTS_SOURCE", "firebase")])).await.is_err());
        assert!(Settings::load(&manager(&[("PORT", "70000")])).await.is_err());
        assert!(Settings::load(&manager(&[("STOP_TIMEOUT_SECS", "0")])).await.is_err());
        assert!(Settings::load(&manager(&[("HEALTH_ENABLED", "maybe")])).await.is_err());
        // blank counts as unset
        assert!(Settings::load(&manager(&[("PORT", "  ")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "BOTRUNNER_TEST_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(Some(env_path.clone()));
        assert_eq!(mgr.status(), &EnvFileStatus::Loaded(env_path));
        assert_eq!(mgr.get("BOTRUNNER_TEST_KEY").await, Some("abc123".to_string()));
        assert!(mgr.keys().await.contains(&"BOTRUNNER_TEST_KEY".to_string()));
    }

    #[tokio::test]
    async fn test_missing_env_file_is_reported_not_logged() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("absent.env");
        let mgr = EnvConfigManager::new(Some(env_path.clone()));
        assert_eq!(mgr.status(), &EnvFileStatus::Missing(env_path));
    }
}
