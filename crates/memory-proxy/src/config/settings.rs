use anyhow::Result;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UpstreamConfig {
    /// Origin of the chat completion provider, without a trailing path
    pub base_url: String,
    /// Injected as a bearer token when the caller sends no Authorization header
    #[serde(default)]
    pub api_key: Option<String>,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: String,
    pub redis_url: String,
    #[serde(default)]
    pub redis_key_prefix: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = Self::defaults()?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(Self::apply_legacy_env(builder, |key| std::env::var(key).ok())?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.body_limit_bytes", 10 * 1024 * 1024)?
            .set_default("upstream.base_url", "https://api.openai.com")?
            .set_default("upstream.connect_timeout_seconds", 10)?
            .set_default("storage.backend", "sqlite")?
            .set_default("storage.sqlite_path", "history.db")?
            .set_default("storage.redis_url", "redis://127.0.0.1:6379")?
            .set_default("storage.redis_key_prefix", "")?)
    }

    /// Plain variable names used by earlier deployments
    /// (TARGET_API_URL, MEMORY_TYPE, ...). They win over file and APP__ values.
    fn apply_legacy_env<F>(
        builder: ConfigBuilder<DefaultState>,
        lookup: F,
    ) -> Result<ConfigBuilder<DefaultState>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let backend = lookup("MEMORY_TYPE").map(|kind| {
            if kind.eq_ignore_ascii_case("redis") {
                "redis"
            } else {
                "sqlite"
            }
        });

        Ok(builder
            .set_override_option("upstream.base_url", lookup("TARGET_API_URL"))?
            .set_override_option("upstream.api_key", lookup("TARGET_API_KEY"))?
            .set_override_option("storage.backend", backend)?
            .set_override_option("storage.redis_url", lookup("REDIS_ADDR"))?
            .set_override_option("storage.sqlite_path", lookup("SQLITE_PATH"))?
            .set_override_option("server.port", lookup("PORT"))?)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let mut settings: Settings = builder.build()?.try_deserialize()?;

        settings.upstream.base_url = settings.upstream.base_url.trim_end_matches('/').to_string();
        if settings
            .upstream
            .api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            settings.upstream.api_key = None;
        }

        Ok(settings)
    }
}
