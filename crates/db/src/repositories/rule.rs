use sqlx::sqlite::SqliteRow;

use expensio_core::domain::rule::{ApprovalRule, RuleId, RulePolicy};
use expensio_core::domain::user::CompanyId;

use super::rows::{flag, text, timestamp};
use super::{ApprovalRuleRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApprovalRuleRepository {
    pool: DbPool,
}

impl SqlApprovalRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let policy_json = text(row, "policy_json")?;
    let policy: RulePolicy = serde_json::from_str(&policy_json)
        .map_err(|e| RepositoryError::Decode(format!("policy_json: {e}")))?;

    Ok(ApprovalRule {
        id: RuleId(text(row, "id")?),
        company_id: CompanyId(text(row, "company_id")?),
        name: text(row, "name")?,
        policy,
        is_active: flag(row, "is_active")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for SqlApprovalRuleRepository {
    async fn find_active_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, policy_json, is_active, created_at, updated_at
             FROM approval_rules WHERE company_id = ? AND is_active = 1",
        )
        .bind(&company_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn save_active(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let policy_json = serde_json::to_string(&rule.policy)
            .map_err(|e| RepositoryError::Decode(format!("policy_json: {e}")))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE approval_rules SET is_active = 0, updated_at = ?
             WHERE company_id = ? AND is_active = 1 AND id <> ?",
        )
        .bind(rule.updated_at.to_rfc3339())
        .bind(&rule.company_id.0)
        .bind(&rule.id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO approval_rules (id, company_id, name, policy_json, is_active,
                                         created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 policy_json = excluded.policy_json,
                 is_active = 1,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(policy_json)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }
}
