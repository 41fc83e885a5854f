use std::env;
use std::fs;
use std::path::Path;

use expensio_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run(options: LoadOptions) -> CommandResult {
    let config_file_path = AppConfig::resolved_path(&options);
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let mut lines = vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    CommandResult::text(0, lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        Field {
            key: "database.url",
            value: config.database.url.clone(),
            env_keys: &["EXPENSIO_DATABASE_URL"],
        },
        Field {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_keys: &["EXPENSIO_DATABASE_MAX_CONNECTIONS"],
        },
        Field {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_keys: &["EXPENSIO_DATABASE_TIMEOUT_SECS"],
        },
        Field {
            key: "cache.default_ttl_secs",
            value: config.cache.default_ttl_secs.to_string(),
            env_keys: &["EXPENSIO_CACHE_DEFAULT_TTL_SECS"],
        },
        Field {
            key: "cache.expense_list_ttl_secs",
            value: config.cache.expense_list_ttl_secs.to_string(),
            env_keys: &["EXPENSIO_CACHE_EXPENSE_LIST_TTL_SECS"],
        },
        Field {
            key: "cache.pending_approvals_ttl_secs",
            value: config.cache.pending_approvals_ttl_secs.to_string(),
            env_keys: &["EXPENSIO_CACHE_PENDING_APPROVALS_TTL_SECS"],
        },
        Field {
            key: "cache.currency_rate_ttl_secs",
            value: config.cache.currency_rate_ttl_secs.to_string(),
            env_keys: &["EXPENSIO_CACHE_CURRENCY_RATE_TTL_SECS"],
        },
        Field {
            key: "currency.api_url",
            value: config.currency.api_url.clone(),
            env_keys: &["EXPENSIO_CURRENCY_API_URL"],
        },
        Field {
            key: "currency.api_key",
            value: config
                .currency
                .api_key
                .as_ref()
                .map(|key| redact_secret(key.expose_secret()))
                .unwrap_or_else(|| "<unset>".to_string()),
            env_keys: &["EXPENSIO_CURRENCY_API_KEY"],
        },
        Field {
            key: "currency.timeout_secs",
            value: config.currency.timeout_secs.to_string(),
            env_keys: &["EXPENSIO_CURRENCY_TIMEOUT_SECS"],
        },
        Field {
            key: "workflow.enforce_sequential_order",
            value: config.workflow.enforce_sequential_order.to_string(),
            env_keys: &["EXPENSIO_WORKFLOW_ENFORCE_SEQUENTIAL_ORDER"],
        },
        Field {
            key: "workflow.decision_lock_timeout_secs",
            value: config.workflow.decision_lock_timeout_secs.to_string(),
            env_keys: &["EXPENSIO_WORKFLOW_DECISION_LOCK_TIMEOUT_SECS"],
        },
        Field {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_keys: &["EXPENSIO_SERVER_BIND_ADDRESS"],
        },
        Field {
            key: "server.port",
            value: config.server.port.to_string(),
            env_keys: &["EXPENSIO_SERVER_PORT"],
        },
        Field {
            key: "server.graceful_shutdown_secs",
            value: config.server.graceful_shutdown_secs.to_string(),
            env_keys: &["EXPENSIO_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        },
        Field {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["EXPENSIO_LOGGING_LEVEL", "EXPENSIO_LOG_LEVEL"],
        },
        Field {
            key: "logging.format",
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
            env_keys: &["EXPENSIO_LOGGING_FORMAT", "EXPENSIO_LOG_FORMAT"],
        },
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(field: &Field, config_file_doc: Option<&Value>, config_file_path: Option<&Path>) -> String {
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(**key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps at most a short prefix so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.len() <= 8 {
        return "<redacted>".to_string();
    }

    let prefix: String = trimmed.chars().take(3).collect();
    format!("{prefix}***")
}
