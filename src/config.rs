use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE_FILE: &str = "cache.db";
const DEFAULT_RECEIPT_WINDOW_MS: u64 = 1000;

/// Runtime config for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_file: String,
    /// Quiescence window for batched read receipts.
    pub read_receipt_window_ms: u64,
    /// Park outbox entries after this many failed deliveries. `None` retries
    /// forever.
    pub max_delivery_attempts: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            read_receipt_window_ms: DEFAULT_RECEIPT_WINDOW_MS,
            max_delivery_attempts: None,
        }
    }
}

/// On-disk representation. Every field is optional; missing ones fall back
/// to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub database_file: Option<String>,
    pub read_receipt_window_ms: Option<u64>,
    pub max_delivery_attempts: Option<u32>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsync")
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsync")
        .join("config.json")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig =
            serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data =
            serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(path, data).map_err(|e| format!("write config: {e}"))
    }
}

impl Config {
    /// Resolution order: env vars → config file → defaults.
    pub fn resolve() -> Self {
        let file = match FileConfig::load() {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Ignoring config file: {}", e);
                None
            }
        };
        Self::resolve_with(file, |key| std::env::var(key).ok())
    }

    /// Layer `env` over `file` over the defaults.
    pub fn resolve_with(
        file: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Config::default();

        let data_dir = env("CHATSYNC_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or(defaults.data_dir);
        let database_file = env("CHATSYNC_DB_FILE")
            .filter(|v| !v.is_empty())
            .or(file.database_file)
            .unwrap_or(defaults.database_file);
        let read_receipt_window_ms = parse_env(&env, "CHATSYNC_RECEIPT_WINDOW_MS")
            .or(file.read_receipt_window_ms)
            .unwrap_or(defaults.read_receipt_window_ms);
        let max_delivery_attempts = parse_env(&env, "CHATSYNC_MAX_ATTEMPTS")
            .or(file.max_delivery_attempts)
            .filter(|n| *n > 0);

        Config {
            data_dir,
            database_file,
            read_receipt_window_ms,
            max_delivery_attempts,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn read_receipt_window(&self) -> Duration {
        Duration::from_millis(self.read_receipt_window_ms)
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}: not a number: {:?}", key, raw);
            None
        }
    }
}
