//! Cache keys and the read-through helper shared by the engine and the expense
//! service. Every cache failure degrades to a miss and is logged, never returned.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use expensio_core::cache::Cache;
use expensio_core::config::CacheConfig;
use expensio_core::domain::user::{CompanyId, UserId};

pub fn pending_approvals_key(approver_id: &UserId) -> String {
    format!("approvals:pending:approver:{approver_id}")
}

pub fn pending_expenses_key(company_id: &CompanyId) -> String {
    format!("expenses:pending:company:{company_id}")
}

pub fn company_expenses_prefix(company_id: &CompanyId) -> String {
    format!("expenses:company:{company_id}:")
}

pub fn user_expenses_prefix(user_id: &UserId) -> String {
    format!("expenses:user:{user_id}:")
}

pub fn company_expenses_page_key(company_id: &CompanyId, page: u32, limit: u32) -> String {
    format!("{}page:{page}:limit:{limit}", company_expenses_prefix(company_id))
}

pub fn user_expenses_page_key(user_id: &UserId, page: u32, limit: u32) -> String {
    format!("{}page:{page}:limit:{limit}", user_expenses_prefix(user_id))
}

pub fn exchange_rate_key(from: &str, to: &str) -> String {
    format!("exchange_rate:{from}:{to}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheTtls {
    pub expense_list: Duration,
    pub pending_approvals: Duration,
    pub currency_rate: Duration,
}

impl From<&CacheConfig> for CacheTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            expense_list: Duration::from_secs(config.expense_list_ttl_secs),
            pending_approvals: Duration::from_secs(config.pending_approvals_ttl_secs),
            currency_rate: Duration::from_secs(config.currency_rate_ttl_secs),
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from(&expensio_core::config::AppConfig::default().cache)
    }
}

#[derive(Clone)]
pub struct ReadThrough {
    cache: Arc<dyn Cache>,
}

impl ReadThrough {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(event_name = "cache.decode_failed", cache_key = key, error = %error, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(event_name = "cache.unavailable", cache_key = key, error = %error, "cache read failed; falling through");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(event_name = "cache.encode_failed", cache_key = key, error = %error, "skipping cache write");
                return;
            }
        };
        if let Err(error) = self.cache.set(key, raw, ttl).await {
            warn!(event_name = "cache.unavailable", cache_key = key, error = %error, "cache write failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(error) = self.cache.delete(key).await {
            warn!(event_name = "cache.unavailable", cache_key = key, error = %error, "cache invalidation failed");
        }
    }

    pub async fn invalidate_prefix(&self, prefix: &str) {
        if let Err(error) = self.cache.delete_prefix(prefix).await {
            warn!(event_name = "cache.unavailable", cache_key = prefix, error = %error, "cache prefix invalidation failed");
        }
    }

    /// Drops every cached expense view for the company and the owner.
    pub async fn invalidate_expense_views(&self, company_id: &CompanyId, user_id: &UserId) {
        self.invalidate(&pending_expenses_key(company_id)).await;
        self.invalidate_prefix(&company_expenses_prefix(company_id)).await;
        self.invalidate_prefix(&user_expenses_prefix(user_id)).await;
    }
}
