//! Layered service configuration.
//!
//! Values are read from the built-in defaults, then an optional `sibyl.toml`
//! (or the file given with `--config`), then `SIBYL_*` environment variables
//! with `__` separating sections, e.g. `SIBYL_SERVER__PORT=8080`.

use anyhow::{Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "sibyl";
pub const DEFAULT_JWT_SECRET: &str = "sibyl-development-secret";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub jwt: JwtSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub resolution: ResolutionSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Adds a permissive CORS layer.
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Ignored for in-memory databases, which always use one connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    #[serde(default = "default_jwt_secret")]
    pub secret: String,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// PBKDF2 iterations for newly stored password hashes.
    #[serde(default = "default_hash_rounds")]
    pub hash_rounds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_port() -> u16 {
    8080
}
const fn default_cors_enabled() -> bool {
    true
}
fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}
const fn default_max_connections() -> u32 {
    5
}
fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}
const fn default_ttl_hours() -> i64 {
    168
}
const fn default_hash_rounds() -> u32 {
    100_000
}
const fn default_max_requests() -> usize {
    100
}
const fn default_window_secs() -> u64 {
    60
}
const fn default_timeout_ms() -> u64 {
    5000
}
const fn default_max_retries() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            jwt: JwtSettings::default(),
            auth: AuthSettings::default(),
            rate_limit: RateLimitSettings::default(),
            resolution: ResolutionSettings::default(),
            log_level: default_log_level(),
        }
    }
}
impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}
impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}
impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: default_jwt_secret(),
            ttl_hours: default_ttl_hours(),
        }
    }
}
impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            hash_rounds: default_hash_rounds(),
        }
    }
}
impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}
impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
impl ResolutionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Loads `.env`, then the layered sources. An explicit `path` must exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix("SIBYL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }
    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("couldn't read configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
    pub fn uses_default_secret(&self) -> bool {
        self.jwt.secret == DEFAULT_JWT_SECRET
    }
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
