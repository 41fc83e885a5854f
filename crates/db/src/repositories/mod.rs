use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use expensio_core::domain::approval::Approval;
use expensio_core::domain::expense::{Expense, ExpenseId};
use expensio_core::domain::rule::ApprovalRule;
use expensio_core::domain::user::{Company, CompanyId, User, UserId};

pub mod approval;
pub mod decision;
pub mod expense;
pub mod memory;
pub mod rule;
mod rows;
pub mod user;

pub use approval::SqlApprovalRepository;
pub use decision::SqlDecisionRepository;
pub use expense::SqlExpenseRepository;
pub use memory::{
    InMemoryApprovalRepository, InMemoryApprovalRuleRepository, InMemoryCompanyRepository,
    InMemoryDecisionRepository, InMemoryExpenseRepository, InMemoryUserRepository,
};
pub use rule::SqlApprovalRuleRepository;
pub use user::{SqlCompanyRepository, SqlUserRepository};

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// 1-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Self {
        Self { page: page.max(1), limit: limit.clamp(1, Self::MAX_LIMIT) }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;
    async fn save(&self, user: User) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError>;
    async fn save(&self, company: Company) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError>;

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError>;

    /// Writes `expense` only if the stored row still has `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn update_if_version(
        &self,
        expense: Expense,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    /// Deletes the row only while it is still pending.
    async fn delete_pending(&self, id: &ExpenseId) -> Result<bool, RepositoryError>;

    async fn list_by_user(
        &self,
        user_id: &UserId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError>;

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError>;

    async fn list_pending_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Expense>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn create_batch(&self, approvals: Vec<Approval>) -> Result<(), RepositoryError>;

    /// Every row for the expense, in creation order.
    async fn list_for_expense(&self, expense_id: &ExpenseId)
        -> Result<Vec<Approval>, RepositoryError>;

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError>;
}

/// How a decision commit ended. Anything but `Committed` wrote nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionCommit {
    Committed,
    /// The approval row had already been decided.
    ApprovalDecided,
    /// The expense no longer carries the expected version.
    ExpenseStale,
}

/// Writes a decided approval and the expense transition it causes as one unit,
/// so a failed decision never leaves a decided row on a pending expense.
#[async_trait]
pub trait DecisionRepository: Send + Sync {
    async fn commit(
        &self,
        approval: &Approval,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<DecisionCommit, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    async fn find_active_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalRule>, RepositoryError>;

    /// Stores `rule` as the company's only active rule.
    async fn save_active(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;
}

/// The repository set handed to services at composition time.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub companies: Arc<dyn CompanyRepository>,
    pub expenses: Arc<dyn ExpenseRepository>,
    pub approvals: Arc<dyn ApprovalRepository>,
    pub decisions: Arc<dyn DecisionRepository>,
    pub rules: Arc<dyn ApprovalRuleRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        let expenses = Arc::new(InMemoryExpenseRepository::default());
        let approvals = Arc::new(InMemoryApprovalRepository::default());
        Self {
            users: Arc::new(InMemoryUserRepository::default()),
            companies: Arc::new(InMemoryCompanyRepository::default()),
            decisions: Arc::new(InMemoryDecisionRepository::new(expenses.clone(), approvals.clone())),
            expenses,
            approvals,
            rules: Arc::new(InMemoryApprovalRuleRepository::default()),
        }
    }

    pub fn sql(pool: DbPool) -> Self {
        Self {
            users: Arc::new(SqlUserRepository::new(pool.clone())),
            companies: Arc::new(SqlCompanyRepository::new(pool.clone())),
            expenses: Arc::new(SqlExpenseRepository::new(pool.clone())),
            approvals: Arc::new(SqlApprovalRepository::new(pool.clone())),
            decisions: Arc::new(SqlDecisionRepository::new(pool.clone())),
            rules: Arc::new(SqlApprovalRuleRepository::new(pool)),
        }
    }
}
