use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensio_core::domain::expense::{Expense, ExpenseCategory, ExpenseId, ExpenseStatus};
use expensio_core::domain::user::{CompanyId, UserId};

use super::rows::{decimal, optional_text, parsed, text, timestamp, to_i64, unsigned};
use super::{ExpenseRepository, Page, PageResult, RepositoryError};
use crate::DbPool;

const EXPENSE_COLUMNS: &str = "id, user_id, company_id, amount, currency, converted_amount,
    exchange_rate, category, description, expense_date, receipt_url, merchant, status,
    current_approval_level, version, created_at, updated_at";

pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn page_where(
        &self,
        column: &str,
        value: &str,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError> {
        let total: i64 =
            sqlx::query(&format!("SELECT COUNT(*) AS count FROM expenses WHERE {column} = ?"))
                .bind(value)
                .fetch_one(&self.pool)
                .await?
                .try_get("count")
                .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE {column} = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(value)
        .bind(to_i64(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(PageResult {
            items: rows.iter().map(row_to_expense).collect::<Result<Vec<_>, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

fn row_to_expense(row: &SqliteRow) -> Result<Expense, RepositoryError> {
    Ok(Expense {
        id: ExpenseId(text(row, "id")?),
        user_id: UserId(text(row, "user_id")?),
        company_id: CompanyId(text(row, "company_id")?),
        amount: decimal(row, "amount")?,
        currency: text(row, "currency")?,
        converted_amount: decimal(row, "converted_amount")?,
        exchange_rate: decimal(row, "exchange_rate")?,
        category: parsed::<ExpenseCategory>(row, "category")?,
        description: text(row, "description")?,
        expense_date: timestamp(row, "expense_date")?,
        receipt_url: optional_text(row, "receipt_url")?,
        merchant: optional_text(row, "merchant")?,
        status: parsed::<ExpenseStatus>(row, "status")?,
        current_approval_level: unsigned(row, "current_approval_level")?,
        version: unsigned(row, "version")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

/// Conditional expense write shared by the repository and decision transactions.
pub(super) async fn write_if_version<'e, E>(
    executor: E,
    expense: &Expense,
    expected_version: u32,
) -> Result<bool, RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE expenses SET
             amount = ?, currency = ?, converted_amount = ?, exchange_rate = ?,
             category = ?, description = ?, expense_date = ?, receipt_url = ?,
             merchant = ?, status = ?, current_approval_level = ?, version = ?,
             updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(expense.amount.to_string())
    .bind(&expense.currency)
    .bind(expense.converted_amount.to_string())
    .bind(expense.exchange_rate.to_string())
    .bind(expense.category.as_str())
    .bind(&expense.description)
    .bind(expense.expense_date.to_rfc3339())
    .bind(&expense.receipt_url)
    .bind(&expense.merchant)
    .bind(expense.status.as_str())
    .bind(to_i64(expense.current_approval_level))
    .bind(to_i64(expense.version))
    .bind(expense.updated_at.to_rfc3339())
    .bind(&expense.id.0)
    .bind(to_i64(expected_version))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait::async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_expense).transpose()
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO expenses ({EXPENSE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&expense.id.0)
        .bind(&expense.user_id.0)
        .bind(&expense.company_id.0)
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.converted_amount.to_string())
        .bind(expense.exchange_rate.to_string())
        .bind(expense.category.as_str())
        .bind(&expense.description)
        .bind(expense.expense_date.to_rfc3339())
        .bind(&expense.receipt_url)
        .bind(&expense.merchant)
        .bind(expense.status.as_str())
        .bind(to_i64(expense.current_approval_level))
        .bind(to_i64(expense.version))
        .bind(expense.created_at.to_rfc3339())
        .bind(expense.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_if_version(
        &self,
        expense: Expense,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        write_if_version(&self.pool, &expense, expected_version).await
    }

    async fn delete_pending(&self, id: &ExpenseId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ? AND status = 'pending'")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_user(
        &self,
        user_id: &UserId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError> {
        self.page_where("user_id", &user_id.0, page).await
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError> {
        self.page_where("company_id", &company_id.0, page).await
    }

    async fn list_pending_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses
             WHERE company_id = ? AND status = 'pending'
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_expense).collect::<Result<Vec<_>, _>>()
    }
}
