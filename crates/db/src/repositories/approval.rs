use sqlx::sqlite::SqliteRow;

use expensio_core::domain::approval::{Approval, ApprovalId, ApprovalStatus};
use expensio_core::domain::expense::ExpenseId;
use expensio_core::domain::user::UserId;

use super::rows::{optional_text, optional_timestamp, parsed, text, timestamp, to_i64, unsigned};
use super::{ApprovalRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_approval(row: &SqliteRow) -> Result<Approval, RepositoryError> {
    Ok(Approval {
        id: ApprovalId(text(row, "id")?),
        expense_id: ExpenseId(text(row, "expense_id")?),
        approver_id: UserId(text(row, "approver_id")?),
        level: unsigned(row, "level")?,
        status: parsed::<ApprovalStatus>(row, "status")?,
        comments: optional_text(row, "comments")?,
        decided_at: optional_timestamp(row, "decided_at")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn create_batch(&self, approvals: Vec<Approval>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for approval in &approvals {
            sqlx::query(
                "INSERT INTO approvals (id, expense_id, approver_id, level, status, comments,
                                        decided_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&approval.id.0)
            .bind(&approval.expense_id.0)
            .bind(&approval.approver_id.0)
            .bind(to_i64(approval.level))
            .bind(approval.status.as_str())
            .bind(&approval.comments)
            .bind(approval.decided_at.map(|at| at.to_rfc3339()))
            .bind(approval.created_at.to_rfc3339())
            .bind(approval.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, expense_id, approver_id, level, status, comments, decided_at,
                    created_at, updated_at
             FROM approvals WHERE expense_id = ?
             ORDER BY rowid ASC",
        )
        .bind(&expense_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect::<Result<Vec<_>, _>>()
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, expense_id, approver_id, level, status, comments, decided_at,
                    created_at, updated_at
             FROM approvals WHERE approver_id = ? AND status = 'pending'
             ORDER BY rowid ASC",
        )
        .bind(&approver_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect::<Result<Vec<_>, _>>()
    }
}

/// Decided-row write; only a row that is still pending is touched.
pub(super) async fn write_decision<'e, E>(
    executor: E,
    approval: &Approval,
) -> Result<bool, RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE approvals SET status = ?, comments = ?, decided_at = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(approval.status.as_str())
    .bind(&approval.comments)
    .bind(approval.decided_at.map(|at| at.to_rfc3339()))
    .bind(approval.updated_at.to_rfc3339())
    .bind(&approval.id.0)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use expensio_core::domain::approval::{Approval, ApprovalId};
    use expensio_core::domain::expense::ExpenseId;
    use expensio_core::domain::user::UserId;

    use super::SqlApprovalRepository;
    use crate::repositories::ApprovalRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample(id: &str, expense: &str, approver: &str, level: u32) -> Approval {
        Approval::pending(
            ApprovalId(id.to_string()),
            ExpenseId(expense.to_string()),
            UserId(approver.to_string()),
            level,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn history_keeps_creation_order() {
        let repo = SqlApprovalRepository::new(setup().await);
        repo.create_batch(vec![
            sample("APR-z", "EXP-1", "m1", 1),
            sample("APR-a", "EXP-1", "m2", 2),
            sample("APR-m", "EXP-2", "m1", 1),
        ])
        .await
        .expect("create");

        let history =
            repo.list_for_expense(&ExpenseId("EXP-1".to_string())).await.expect("history");
        let levels: Vec<_> = history.iter().map(|row| (row.approver_id.0.as_str(), row.level)).collect();
        assert_eq!(levels, vec![("m1", 1), ("m2", 2)]);

        let pending =
            repo.list_pending_for_approver(&UserId("m1".to_string())).await.expect("pending");
        let ids: Vec<_> = pending.iter().map(|row| row.id.0.as_str()).collect();
        assert_eq!(ids, vec!["APR-z", "APR-m"]);
    }
}
