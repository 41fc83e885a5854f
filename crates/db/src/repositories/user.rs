use sqlx::sqlite::SqliteRow;

use expensio_core::domain::user::{Company, CompanyId, User, UserId, UserRole};

use super::rows::{flag, optional_text, parsed, text, timestamp};
use super::{CompanyRepository, RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User, RepositoryError> {
    Ok(User {
        id: UserId(text(row, "id")?),
        email: text(row, "email")?,
        first_name: text(row, "first_name")?,
        last_name: text(row, "last_name")?,
        role: parsed::<UserRole>(row, "role")?,
        company_id: CompanyId(text(row, "company_id")?),
        manager_id: optional_text(row, "manager_id")?.map(UserId),
        is_active: flag(row, "is_active")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, email, first_name, last_name, role, company_id, manager_id,
                    is_active, created_at, updated_at
             FROM users WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, email, first_name, last_name, role, company_id, manager_id,
                                is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 email = excluded.email,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name,
                 role = excluded.role,
                 company_id = excluded.company_id,
                 manager_id = excluded.manager_id,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&user.id.0)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .bind(&user.company_id.0)
        .bind(user.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(i64::from(user.is_active))
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct SqlCompanyRepository {
    pool: DbPool,
}

impl SqlCompanyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_company(row: &SqliteRow) -> Result<Company, RepositoryError> {
    Ok(Company {
        id: CompanyId(text(row, "id")?),
        name: text(row, "name")?,
        base_currency: text(row, "base_currency")?,
        country: text(row, "country")?,
        admin_user_id: UserId(text(row, "admin_user_id")?),
        is_active: flag(row, "is_active")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

#[async_trait::async_trait]
impl CompanyRepository for SqlCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, base_currency, country, admin_user_id, is_active,
                    created_at, updated_at
             FROM companies WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_company).transpose()
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO companies (id, name, base_currency, country, admin_user_id, is_active,
                                    created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 base_currency = excluded.base_currency,
                 country = excluded.country,
                 admin_user_id = excluded.admin_user_id,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(&company.base_currency)
        .bind(&company.country)
        .bind(&company.admin_user_id.0)
        .bind(i64::from(company.is_active))
        .bind(company.created_at.to_rfc3339())
        .bind(company.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
