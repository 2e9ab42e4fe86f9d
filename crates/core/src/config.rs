//! Layered runtime configuration.
//!
//! Layers apply in order: built-in defaults, `lendroute.toml` (with `${VAR}`
//! expansion), `LENDROUTE_*` environment variables, then explicit
//! [`ConfigOverrides`]. The merged result is validated once at the end.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TOKEN_SECRET_BYTES: usize = 32;
const MIN_PORTAL_KEY_CHARS: usize = 16;
const DEFAULT_FILE_NAME: &str = "lendroute.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub approvals: ApprovalsConfig,
    pub notifications: NotificationsConfig,
    pub portal: PortalConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Prefix of the links sent in approval emails.
    pub public_base_url: String,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ApprovalsConfig {
    pub token_secret: SecretString,
    pub token_ttl_hours: u32,
    pub matrix_cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PortalConfig {
    pub api_keys: Vec<PortalApiKey>,
}

/// Bearer key accepted by the portal API, bound to one directory user.
#[derive(Clone, Debug)]
pub struct PortalApiKey {
    pub key: SecretString,
    pub user_id: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Highest-precedence values, usually supplied by the embedding binary or tests.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub public_base_url: Option<String>,
    pub token_secret: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{path} is not valid lendroute TOML: {source}")]
    Toml { path: PathBuf, source: toml::de::Error },
    #[error("config file {0} is required but does not exist")]
    FileNotFound(PathBuf),
    #[error("config references ${{{name}}} but it is not set")]
    UnsetVariable { name: String },
    #[error("config contains `${{` without a closing `}}`")]
    UnclosedVariable,
    #[error("{name} has an unusable value `{value}`")]
    BadEnvValue { name: String, value: String },
    #[error("invalid lendroute configuration: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://lendroute.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                public_base_url: "http://127.0.0.1:8080".to_string(),
                graceful_shutdown_secs: 15,
            },
            approvals: ApprovalsConfig {
                token_secret: SecretString::from(String::new()),
                // one week
                token_ttl_hours: 168,
                matrix_cache_ttl_secs: 3600,
            },
            notifications: NotificationsConfig { webhook_url: None, timeout_secs: 10 },
            portal: PortalConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let format = match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            other => {
                return Err(ConfigError::Validation(format!(
                    "logging.format `{other}` is not one of compact, pretty or json"
                )))
            }
        };
        Ok(format)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let LoadOptions { config_path, require_file, overrides } = options;
        let mut config = Self::default();

        match locate_file(config_path.as_deref()) {
            Some(path) => config.merge_file(read_file(&path)?),
            None if require_file => {
                return Err(ConfigError::FileNotFound(
                    config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_NAME)),
                ));
            }
            None => {}
        }

        config.merge_env()?;
        config.merge_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.approvals.token_ttl_hours))
    }

    pub fn matrix_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.approvals.matrix_cache_ttl_secs)
    }

    fn merge_file(&mut self, file: FileConfig) {
        let FileConfig { database, server, approvals, notifications, portal, logging } = file;

        if let Some(section) = database {
            take(&mut self.database.url, section.url);
            take(&mut self.database.max_connections, section.max_connections);
            take(&mut self.database.timeout_secs, section.timeout_secs);
        }
        if let Some(section) = server {
            take(&mut self.server.bind_address, section.bind_address);
            take(&mut self.server.port, section.port);
            take(&mut self.server.public_base_url, section.public_base_url);
            take(&mut self.server.graceful_shutdown_secs, section.graceful_shutdown_secs);
        }
        if let Some(section) = approvals {
            take(&mut self.approvals.token_secret, section.token_secret.map(SecretString::from));
            take(&mut self.approvals.token_ttl_hours, section.token_ttl_hours);
            take(&mut self.approvals.matrix_cache_ttl_secs, section.matrix_cache_ttl_secs);
        }
        if let Some(section) = notifications {
            take(&mut self.notifications.webhook_url, section.webhook_url.map(Some));
            take(&mut self.notifications.timeout_secs, section.timeout_secs);
        }
        if let Some(keys) = portal.and_then(|section| section.api_keys) {
            self.portal.api_keys = keys
                .into_iter()
                .map(|entry| PortalApiKey { key: entry.key.into(), user_id: entry.user_id })
                .collect();
        }
        if let Some(section) = logging {
            take(&mut self.logging.level, section.level);
            take(&mut self.logging.format, section.format);
        }
    }

    fn merge_env(&mut self) -> Result<(), ConfigError> {
        take(&mut self.database.url, env_value("LENDROUTE_DATABASE_URL")?);
        take(&mut self.database.max_connections, env_value("LENDROUTE_DATABASE_MAX_CONNECTIONS")?);
        take(&mut self.database.timeout_secs, env_value("LENDROUTE_DATABASE_TIMEOUT_SECS")?);

        take(&mut self.server.bind_address, env_value("LENDROUTE_SERVER_BIND_ADDRESS")?);
        take(&mut self.server.port, env_value("LENDROUTE_SERVER_PORT")?);
        take(&mut self.server.public_base_url, env_value("LENDROUTE_SERVER_PUBLIC_BASE_URL")?);
        take(
            &mut self.server.graceful_shutdown_secs,
            env_value("LENDROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS")?,
        );

        let secret = env_value::<String>("LENDROUTE_APPROVALS_TOKEN_SECRET")?;
        take(&mut self.approvals.token_secret, secret.map(SecretString::from));
        take(&mut self.approvals.token_ttl_hours, env_value("LENDROUTE_APPROVALS_TOKEN_TTL_HOURS")?);
        take(
            &mut self.approvals.matrix_cache_ttl_secs,
            env_value("LENDROUTE_APPROVALS_MATRIX_CACHE_TTL_SECS")?,
        );

        let webhook = env_value::<String>("LENDROUTE_NOTIFICATIONS_WEBHOOK_URL")?;
        take(&mut self.notifications.webhook_url, webhook.map(Some));
        take(
            &mut self.notifications.timeout_secs,
            env_value("LENDROUTE_NOTIFICATIONS_TIMEOUT_SECS")?,
        );

        if let Some(pairs) = env_value::<String>("LENDROUTE_PORTAL_API_KEYS")? {
            self.portal.api_keys = portal_keys_from_pairs(&pairs)?;
        }

        // The short LOG_* spellings are accepted as aliases.
        let level = env_value("LENDROUTE_LOGGING_LEVEL")?;
        take(&mut self.logging.level, level.or(env_value("LENDROUTE_LOG_LEVEL")?));
        let format = env_value("LENDROUTE_LOGGING_FORMAT")?;
        take(&mut self.logging.format, format.or(env_value("LENDROUTE_LOG_FORMAT")?));

        Ok(())
    }

    fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        take(&mut self.database.url, overrides.database_url);
        take(&mut self.logging.level, overrides.log_level);
        take(&mut self.server.port, overrides.port);
        take(&mut self.server.public_base_url, overrides.public_base_url);
        take(&mut self.approvals.token_secret, overrides.token_secret.map(SecretString::from));
        take(&mut self.notifications.webhook_url, overrides.webhook_url.map(Some));
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let database = &self.database;
        let url = database.url.trim();
        require(
            url.starts_with("sqlite:") || url == ":memory:",
            "database.url must point at SQLite (sqlite://path, sqlite::memory: or :memory:)",
        )?;
        require(database.max_connections > 0, "database.max_connections must be at least 1")?;
        require(
            (1..=300).contains(&database.timeout_secs),
            "database.timeout_secs must be between 1 and 300",
        )?;

        let server = &self.server;
        require(server.port > 0, "server.port must be at least 1")?;
        require(
            is_http_url(&server.public_base_url),
            "server.public_base_url must be an http(s) URL because approval links are built from it",
        )?;
        require(server.graceful_shutdown_secs > 0, "server.graceful_shutdown_secs must be at least 1")?;

        self.validate_token_secret()?;
        require(self.approvals.token_ttl_hours > 0, "approvals.token_ttl_hours must be at least 1")?;
        require(
            self.approvals.matrix_cache_ttl_secs > 0,
            "approvals.matrix_cache_ttl_secs must be at least 1",
        )?;

        let notifications = &self.notifications;
        if let Some(url) = &notifications.webhook_url {
            require(is_http_url(url), "notifications.webhook_url must be an http(s) URL")?;
        }
        require(
            (1..=120).contains(&notifications.timeout_secs),
            "notifications.timeout_secs must be between 1 and 120",
        )?;

        for (position, entry) in self.portal.api_keys.iter().enumerate() {
            if entry.key.expose_secret().trim().len() < MIN_PORTAL_KEY_CHARS {
                return Err(ConfigError::Validation(format!(
                    "portal.api_keys[{position}].key is shorter than {MIN_PORTAL_KEY_CHARS} characters"
                )));
            }
            if entry.user_id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "portal.api_keys[{position}].user_id is empty"
                )));
            }
        }

        let level = self.logging.level.trim().to_ascii_lowercase();
        require(
            matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error"),
            "logging.level must be trace, debug, info, warn or error",
        )
    }

    fn validate_token_secret(&self) -> Result<(), ConfigError> {
        let secret = self.approvals.token_secret.expose_secret();
        if secret.trim().is_empty() {
            return Err(ConfigError::Validation(
                "approvals.token_secret is required: export LENDROUTE_APPROVALS_TOKEN_SECRET with at least 32 random bytes, e.g. `openssl rand -base64 48`".to_string(),
            ));
        }
        if secret.len() < MIN_TOKEN_SECRET_BYTES {
            return Err(ConfigError::Validation(format!(
                "approvals.token_secret is {} bytes; at least {MIN_TOKEN_SECRET_BYTES} are needed",
                secret.len()
            )));
        }
        Ok(())
    }
}

fn take<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn require(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Validation(message.to_string()))
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}

fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.is_file().then(|| path.to_path_buf()),
        None => [Path::new(DEFAULT_FILE_NAME), Path::new("config/lendroute.toml")]
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(Path::to_path_buf),
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let expanded = expand_variables(&raw)?;
    toml::from_str(&expanded).map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })
}

/// Replaces every `${NAME}` with the value of the environment variable `NAME`.
fn expand_variables(raw: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find('}').ok_or(ConfigError::UnclosedVariable)?;
        let name = &after_open[..end];
        let value = env::var(name)
            .map_err(|_| ConfigError::UnsetVariable { name: name.to_string() })?;
        expanded.push_str(&value);
        rest = &after_open[end + 1..];
    }
    expanded.push_str(rest);

    Ok(expanded)
}

/// Blank variables count as unset.
fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = env::var(name).ok().filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::BadEnvValue { name: name.to_string(), value: raw })
}

/// Parses `key:user_id` pairs separated by commas.
fn portal_keys_from_pairs(pairs: &str) -> Result<Vec<PortalApiKey>, ConfigError> {
    let mut keys = Vec::new();
    for pair in pairs.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, user_id) = pair
            .split_once(':')
            .map(|(key, user_id)| (key.trim(), user_id.trim()))
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| ConfigError::BadEnvValue {
                name: "LENDROUTE_PORTAL_API_KEYS".to_string(),
                value: "<redacted>".to_string(),
            })?;
        keys.push(PortalApiKey { key: key.to_string().into(), user_id: user_id.to_string() });
    }
    Ok(keys)
}

/// On-disk shape of `lendroute.toml`; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database: Option<DatabaseSection>,
    server: Option<ServerSection>,
    approvals: Option<ApprovalsSection>,
    notifications: Option<NotificationsSection>,
    portal: Option<PortalSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    bind_address: Option<String>,
    port: Option<u16>,
    public_base_url: Option<String>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Default, Deserialize)]
struct ApprovalsSection {
    token_secret: Option<String>,
    token_ttl_hours: Option<u32>,
    matrix_cache_ttl_secs: Option<u64>,
}

impl std::fmt::Debug for ApprovalsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalsSection")
            .field("token_secret", &self.token_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("matrix_cache_ttl_secs", &self.matrix_cache_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsSection {
    webhook_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PortalSection {
    api_keys: Option<Vec<ApiKeyEntry>>,
}

#[derive(Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
}

impl std::fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyEntry").field("key", &"[REDACTED]").field("user_id", &self.user_id).finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    format: Option<LogFormat>,
}
