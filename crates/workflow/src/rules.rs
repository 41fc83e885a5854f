use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use expensio_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use expensio_core::domain::rule::{ApprovalRule, RuleId, RulePolicy};
use expensio_core::domain::user::{Actor, CompanyId, UserRole};
use expensio_core::errors::ApplicationError;
use expensio_db::Repositories;

use crate::persistence;

/// Administration of the company rule store. The engine only ever reads rules;
/// replacing one here does not touch approvals already materialized.
pub struct RuleService {
    repos: Repositories,
    audit: Arc<dyn AuditSink>,
}

impl RuleService {
    pub fn new(repos: Repositories, audit: Arc<dyn AuditSink>) -> Self {
        Self { repos, audit }
    }

    pub async fn active_rule(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalRule>, ApplicationError> {
        self.repos.rules.find_active_for_company(company_id).await.map_err(persistence)
    }

    /// Stores `policy` as the caller's company rule, deactivating the previous one.
    pub async fn save_rule(
        &self,
        actor: &Actor,
        name: &str,
        policy: RulePolicy,
        correlation_id: &str,
    ) -> Result<ApprovalRule, ApplicationError> {
        if actor.role != UserRole::Admin {
            return Err(ApplicationError::Forbidden(
                "only administrators can configure approval rules".to_string(),
            ));
        }
        policy.validate()?;
        policy.materialize()?;

        let now = Utc::now();
        let rule = ApprovalRule {
            id: RuleId(Uuid::new_v4().to_string()),
            company_id: actor.company_id.clone(),
            name: name.trim().to_string(),
            policy,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.repos.rules.save_active(rule.clone()).await.map_err(persistence)?;

        info!(
            event_name = "workflow.rule.saved",
            correlation_id,
            company_id = %rule.company_id,
            rule_id = %rule.id.0,
            rule_kind = rule.policy.kind(),
            "approval rule replaced"
        );
        self.audit.emit(
            AuditEvent::new(
                None,
                correlation_id,
                "rule.saved",
                AuditCategory::Rule,
                actor.user_id.0.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("company_id", rule.company_id.0.clone())
            .with_metadata("rule_kind", rule.policy.kind()),
        );
        Ok(rule)
    }
}
