use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "expensio.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub currency: CurrencyConfig,
    pub workflow: WorkflowConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Time-to-live values, in seconds, for the advisory cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub expense_list_ttl_secs: u64,
    pub pending_approvals_ttl_secs: u64,
    pub currency_rate_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CurrencyConfig {
    pub api_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Reject approvals whose level is not `current_approval_level + 1` on
    /// sequential rules.
    pub enforce_sequential_order: bool,
    pub decision_lock_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
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

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub server_port: Option<u16>,
    pub currency_api_url: Option<String>,
    pub enforce_sequential_order: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://expensio.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            cache: CacheConfig {
                default_ttl_secs: 900,
                expense_list_ttl_secs: 900,
                pending_approvals_ttl_secs: 300,
                currency_rate_ttl_secs: 3600,
            },
            currency: CurrencyConfig {
                api_url: "https://api.exchangerate-api.com/v4/latest".to_string(),
                api_key: None,
                timeout_secs: 10,
            },
            workflow: WorkflowConfig {
                enforce_sequential_order: false,
                decision_lock_timeout_secs: 10,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Config file that `load` would read for these options, if any.
    pub fn resolved_path(options: &LoadOptions) -> Option<PathBuf> {
        resolve_config_path(options.config_path.as_deref())
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(value) = cache.default_ttl_secs {
                self.cache.default_ttl_secs = value;
            }
            if let Some(value) = cache.expense_list_ttl_secs {
                self.cache.expense_list_ttl_secs = value;
            }
            if let Some(value) = cache.pending_approvals_ttl_secs {
                self.cache.pending_approvals_ttl_secs = value;
            }
            if let Some(value) = cache.currency_rate_ttl_secs {
                self.cache.currency_rate_ttl_secs = value;
            }
        }

        if let Some(currency) = patch.currency {
            if let Some(api_url) = currency.api_url {
                self.currency.api_url = api_url;
            }
            if let Some(currency_api_key_value) = currency.api_key {
                self.currency.api_key = Some(secret_value(currency_api_key_value));
            }
            if let Some(timeout_secs) = currency.timeout_secs {
                self.currency.timeout_secs = timeout_secs;
            }
        }

        if let Some(workflow) = patch.workflow {
            if let Some(enforce) = workflow.enforce_sequential_order {
                self.workflow.enforce_sequential_order = enforce;
            }
            if let Some(timeout_secs) = workflow.decision_lock_timeout_secs {
                self.workflow.decision_lock_timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EXPENSIO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("EXPENSIO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("EXPENSIO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("EXPENSIO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPENSIO_CACHE_DEFAULT_TTL_SECS") {
            self.cache.default_ttl_secs = parse_u64("EXPENSIO_CACHE_DEFAULT_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_CACHE_EXPENSE_LIST_TTL_SECS") {
            self.cache.expense_list_ttl_secs =
                parse_u64("EXPENSIO_CACHE_EXPENSE_LIST_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_CACHE_PENDING_APPROVALS_TTL_SECS") {
            self.cache.pending_approvals_ttl_secs =
                parse_u64("EXPENSIO_CACHE_PENDING_APPROVALS_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_CACHE_CURRENCY_RATE_TTL_SECS") {
            self.cache.currency_rate_ttl_secs =
                parse_u64("EXPENSIO_CACHE_CURRENCY_RATE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPENSIO_CURRENCY_API_URL") {
            self.currency.api_url = value;
        }
        if let Some(value) = read_env("EXPENSIO_CURRENCY_API_KEY") {
            self.currency.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("EXPENSIO_CURRENCY_TIMEOUT_SECS") {
            self.currency.timeout_secs = parse_u64("EXPENSIO_CURRENCY_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER") {
            self.workflow.enforce_sequential_order =
                parse_bool("EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_WORKFLOW_DECISION_LOCK_TIMEOUT_SECS") {
            self.workflow.decision_lock_timeout_secs =
                parse_u64("EXPENSIO_WORKFLOW_DECISION_LOCK_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPENSIO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("EXPENSIO_SERVER_PORT") {
            self.server.port = parse_u16("EXPENSIO_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("EXPENSIO_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("EXPENSIO_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("EXPENSIO_LOGGING_LEVEL").or_else(|| read_env("EXPENSIO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("EXPENSIO_LOGGING_FORMAT").or_else(|| read_env("EXPENSIO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(api_url) = overrides.currency_api_url {
            self.currency.api_url = api_url;
        }
        if let Some(enforce) = overrides.enforce_sequential_order {
            self.workflow.enforce_sequential_order = enforce;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_cache(&self.cache)?;
        validate_currency(&self.currency)?;
        validate_workflow(&self.workflow)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config").join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    let ttls = [
        ("cache.default_ttl_secs", cache.default_ttl_secs),
        ("cache.expense_list_ttl_secs", cache.expense_list_ttl_secs),
        ("cache.pending_approvals_ttl_secs", cache.pending_approvals_ttl_secs),
        ("cache.currency_rate_ttl_secs", cache.currency_rate_ttl_secs),
    ];
    for (key, ttl) in ttls {
        if ttl == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }
    Ok(())
}

fn validate_currency(currency: &CurrencyConfig) -> Result<(), ConfigError> {
    let api_url = currency.api_url.trim();
    if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "currency.api_url must start with http:// or https://".to_string(),
        ));
    }

    if let Some(api_key) = &currency.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "currency.api_key must not be blank when set".to_string(),
            ));
        }
    }

    if currency.timeout_secs == 0 || currency.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "currency.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    if workflow.decision_lock_timeout_secs == 0 || workflow.decision_lock_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "workflow.decision_lock_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().to_ascii_lowercase().parse::<bool>().map_err(|_| {
        ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    cache: Option<CachePatch>,
    currency: Option<CurrencyPatch>,
    workflow: Option<WorkflowPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    default_ttl_secs: Option<u64>,
    expense_list_ttl_secs: Option<u64>,
    pending_approvals_ttl_secs: Option<u64>,
    currency_rate_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CurrencyPatch {
    api_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    enforce_sequential_order: Option<bool>,
    decision_lock_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_load_without_any_file_or_secret() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.cache.pending_approvals_ttl_secs == 300, "pending ttl default is 300")?;
        ensure(config.cache.currency_rate_ttl_secs == 3600, "currency ttl default is 3600")?;
        ensure(!config.workflow.enforce_sequential_order, "ordering is advisory by default")?;
        ensure(config.currency.api_key.is_none(), "api key is optional")?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_EXPENSIO_FX_KEY", "fx-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("expensio.toml");
            fs::write(
                &path,
                r#"
[currency]
api_key = "${TEST_EXPENSIO_FX_KEY}"

[workflow]
enforce_sequential_order = true
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.currency.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("fx-from-env".to_string()),
                "api key should be interpolated from environment",
            )?;
            ensure(config.workflow.enforce_sequential_order, "workflow flag should load")?;
            Ok(())
        })();

        clear_vars(&["TEST_EXPENSIO_FX_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("EXPENSIO_LOG_LEVEL", "warn");
        env::set_var("EXPENSIO_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["EXPENSIO_LOG_LEVEL", "EXPENSIO_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("EXPENSIO_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("EXPENSIO_CACHE_PENDING_APPROVALS_TTL_SECS", "120");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("expensio.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[cache]
pending_approvals_ttl_secs = 60
expense_list_ttl_secs = 600

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.cache.pending_approvals_ttl_secs == 120,
                "env ttl should win over file and defaults",
            )?;
            ensure(config.cache.expense_list_ttl_secs == 600, "file ttl should win over default")?;
            Ok(())
        })();

        clear_vars(&["EXPENSIO_DATABASE_URL", "EXPENSIO_CACHE_PENDING_APPROVALS_TTL_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("EXPENSIO_CURRENCY_API_URL", "ftp://rates.example.com");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("currency.api_url")
            );
            ensure(has_message, "validation failure should mention currency.api_url")
        })();

        clear_vars(&["EXPENSIO_CURRENCY_API_URL"]);
        result
    }

    #[test]
    fn invalid_boolean_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER", "sometimes");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER",
                "override error should name the variable",
            ),
            _ => Err("expected invalid env override".to_string()),
        };

        clear_vars(&["EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("EXPENSIO_CURRENCY_API_KEY", "fx-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("fx-secret-value"),
                "debug output should not contain currency api key",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["EXPENSIO_CURRENCY_API_KEY"]);
        result
    }
}
