use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "storyforge.toml";
pub const DATA_DIR_ENV: &str = "STORYFORGE_DATA_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_database_file")]
    pub database_file: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Base64-encoded 32-byte key for stored text fields. Derived from the
    /// host identity when absent.
    #[serde(default)]
    pub field_key: Option<String>,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_database_file() -> String {
    "storyforge.db".to_string()
}
fn default_queue_name() -> String {
    "agent_tasks".to_string()
}
fn default_lease_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_restart_backoff_ms() -> u64 {
    2000
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_file: default_database_file(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            field_key: None,
            providers: ProvidersConfig::default(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            anthropic_api_key: None,
            anthropic_base_url: default_anthropic_base_url(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

/// Root data directory. `STORYFORGE_DATA_DIR` wins over `~/.storyforge`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".storyforge")
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            Self::parse(&content)?
        } else {
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            Self::default()
        };
        config.apply_env();

        info!(
            "Loaded config: db={}, queue={}, lease={}s, openai={}, anthropic={}",
            config.database_file,
            config.queue.name,
            config.queue.lease_secs,
            config.providers.openai_api_key.is_some(),
            config.providers.anthropic_api_key.is_some()
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if self.providers.openai_api_key.is_none()
            && let Ok(key) = std::env::var("OPENAI_API_KEY")
        {
            self.providers.openai_api_key = Some(key);
        }
        if self.providers.anthropic_api_key.is_none()
            && let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
        {
            self.providers.anthropic_api_key = Some(key);
        }
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.database_file)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
