use std::sync::Arc;

use axum::Router;
use expensio_core::audit::AuditSink;
use expensio_core::cache::{Cache, InMemoryCache};
use expensio_core::config::{AppConfig, ConfigError, LoadOptions};
use expensio_db::{connect_with_config, migrations, DbPool, Repositories};
use expensio_workflow::{
    CacheTtls, ExpenseService, ReadThrough, RuleService, WorkflowEngine, WorkflowSettings,
};
use thiserror::Error;
use tracing::info;

use crate::api::{self, ApiState};
use crate::audit::TracingAuditSink;
use crate::currency::ExchangeRateApiConverter;
use crate::health;

/// Fully wired process: every collaborator is built here, once, and handed to
/// the engine and services by constructor.
pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub cache: Arc<dyn Cache>,
    pub expenses: Arc<ExpenseService>,
    pub rules: Arc<RuleService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl Application {
    pub fn router(&self) -> Router {
        api::router(ApiState { expenses: self.expenses.clone(), rules: self.rules.clone() })
            .merge(health::router(self.db_pool.clone(), self.cache.clone()))
    }
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
    let read_through = ReadThrough::new(cache.clone());
    let ttls = CacheTtls::from(&config.cache);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let repos = Repositories::sql(db_pool.clone());

    let engine = Arc::new(WorkflowEngine::new(
        repos.clone(),
        read_through.clone(),
        ttls,
        audit.clone(),
        WorkflowSettings::from(&config.workflow),
    ));
    let converter = ExchangeRateApiConverter::new(&config.currency, read_through, ttls.currency_rate)
        .map_err(BootstrapError::HttpClient)?;
    let expenses = Arc::new(ExpenseService::new(engine, Arc::new(converter)));
    let rules = Arc::new(RuleService::new(repos, audit));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        enforce_sequential_order = config.workflow.enforce_sequential_order,
        "workflow engine wired"
    );

    Ok(Application { config, db_pool, cache, expenses, rules })
}
