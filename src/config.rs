use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KotobaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`
    /// or `https://<resource>.openai.azure.com/openai/deployments/<name>`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Only sent to Azure endpoints.
    pub api_version: String,
    /// Upper bound on a whole upstream call, streaming included.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub system_prompt: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub header: String,
    /// Seeded as an active key when the key table is empty.
    pub initial_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    pub scan_user_text: bool,
    pub scan_reply_fallback: bool,
    pub event_buffer: usize,
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an expert Japanese language tutor specializing in kanji and vocabulary.
When the user sends Japanese text, provide:
1. A breakdown of every kanji appearing in the text.
2. For each kanji, a block in exactly this shape:
   [X]
   Readings: on-yomi, kun-yomi
   JLPT: N1-N5 or unknown
   Meaning: comma-separated English meanings
3. Grammar notes relevant to the sentence structure.
4. A natural English translation of the overall text.
5. At least one example sentence using a key vocabulary item.
Always write the kanji itself inside the square brackets so it can be indexed.";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_kotoba_dir()
            .join("kotoba.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o".into(),
            api_version: "2024-10-21".into(),
            timeout_secs: 120,
            connect_timeout_secs: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "X-Api-Key".into(),
            initial_access_key: None,
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            scan_user_text: true,
            scan_reply_fallback: true,
            event_buffer: 1,
        }
    }
}

/// Returns `~/.kotoba/`
pub fn default_kotoba_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kotoba")
}

/// Returns the default config file path: `~/.kotoba/config.toml`
pub fn default_config_path() -> PathBuf {
    default_kotoba_dir().join("config.toml")
}

impl KotobaConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            KotobaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `KOTOBA_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("KOTOBA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %val, "ignoring unparseable KOTOBA_PORT"),
            }
        }
        if let Ok(val) = std::env::var("KOTOBA_UPSTREAM_ENDPOINT") {
            self.upstream.endpoint = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_UPSTREAM_KEY") {
            self.upstream.api_key = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_UPSTREAM_MODEL") {
            self.upstream.model = val;
        }
        if let Ok(val) = std::env::var("KOTOBA_INITIAL_KEY") {
            self.auth.initial_access_key = Some(val);
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
