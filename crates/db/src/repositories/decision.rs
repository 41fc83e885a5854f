use expensio_core::domain::approval::Approval;
use expensio_core::domain::expense::Expense;

use super::approval::write_decision;
use super::expense::write_if_version;
use super::{DecisionCommit, DecisionRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDecisionRepository {
    pool: DbPool,
}

impl SqlDecisionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DecisionRepository for SqlDecisionRepository {
    async fn commit(
        &self,
        approval: &Approval,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<DecisionCommit, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        if !write_decision(&mut *tx, approval).await? {
            tx.rollback().await?;
            return Ok(DecisionCommit::ApprovalDecided);
        }
        if !write_if_version(&mut *tx, expense, expected_version).await? {
            tx.rollback().await?;
            return Ok(DecisionCommit::ExpenseStale);
        }

        tx.commit().await?;
        Ok(DecisionCommit::Committed)
    }
}
