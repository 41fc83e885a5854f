use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use expensio_core::domain::approval::Approval;
use expensio_core::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use expensio_core::domain::rule::ApprovalRule;
use expensio_core::domain::user::{Company, CompanyId, User, UserId};

use super::{
    ApprovalRepository, ApprovalRuleRepository, CompanyRepository, DecisionCommit,
    DecisionRepository, ExpenseRepository, Page, PageResult, RepositoryError, UserRepository,
};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id.0.clone(), user);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCompanyRepository {
    companies: RwLock<HashMap<String, Company>>,
}

#[async_trait::async_trait]
impl CompanyRepository for InMemoryCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let companies = self.companies.read().await;
        Ok(companies.get(&id.0).cloned())
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        let mut companies = self.companies.write().await;
        companies.insert(company.id.0.clone(), company);
        Ok(())
    }
}

/// Rows are kept in insertion order so listings can mirror SQL `rowid` ordering.
#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: RwLock<Vec<Expense>>,
}

fn newest_first(mut expenses: Vec<Expense>) -> Vec<Expense> {
    // stable sort; reverse first so later inserts win ties
    expenses.reverse();
    expenses.sort_by(|left, right| right.created_at.cmp(&left.created_at));
    expenses
}

fn paginate(expenses: Vec<Expense>, page: Page) -> PageResult<Expense> {
    let total = expenses.len() as u64;
    let items = expenses
        .into_iter()
        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
        .take(page.limit as usize)
        .collect();
    PageResult { items, total }
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.iter().find(|expense| &expense.id == id).cloned())
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        expenses.retain(|existing| existing.id != expense.id);
        expenses.push(expense);
        Ok(())
    }

    async fn update_if_version(
        &self,
        expense: Expense,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let Some(stored) = expenses.iter_mut().find(|stored| stored.id == expense.id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = expense;
        Ok(true)
    }

    async fn delete_pending(&self, id: &ExpenseId) -> Result<bool, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let before = expenses.len();
        expenses.retain(|expense| !(&expense.id == id && expense.status == ExpenseStatus::Pending));
        Ok(expenses.len() != before)
    }

    async fn list_by_user(
        &self,
        user_id: &UserId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        let matching =
            expenses.iter().filter(|expense| &expense.user_id == user_id).cloned().collect();
        Ok(paginate(newest_first(matching), page))
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        page: Page,
    ) -> Result<PageResult<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        let matching =
            expenses.iter().filter(|expense| &expense.company_id == company_id).cloned().collect();
        Ok(paginate(newest_first(matching), page))
    }

    async fn list_pending_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        let matching = expenses
            .iter()
            .filter(|expense| &expense.company_id == company_id && expense.is_pending())
            .cloned()
            .collect();
        Ok(newest_first(matching))
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRepository {
    approvals: RwLock<Vec<Approval>>,
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn create_batch(&self, batch: Vec<Approval>) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        approvals.extend(batch);
        Ok(())
    }

    async fn list_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.iter().filter(|approval| &approval.expense_id == expense_id).cloned().collect())
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .iter()
            .filter(|approval| &approval.approver_id == approver_id && approval.is_pending())
            .cloned()
            .collect())
    }
}

/// Decision writes over the in-memory expense and approval stores. Both write
/// locks are held for the whole commit, approvals first.
pub struct InMemoryDecisionRepository {
    expenses: Arc<InMemoryExpenseRepository>,
    approvals: Arc<InMemoryApprovalRepository>,
}

impl InMemoryDecisionRepository {
    pub fn new(
        expenses: Arc<InMemoryExpenseRepository>,
        approvals: Arc<InMemoryApprovalRepository>,
    ) -> Self {
        Self { expenses, approvals }
    }
}

#[async_trait::async_trait]
impl DecisionRepository for InMemoryDecisionRepository {
    async fn commit(
        &self,
        decided: &Approval,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<DecisionCommit, RepositoryError> {
        let mut approvals = self.approvals.approvals.write().await;
        let mut expenses = self.expenses.expenses.write().await;

        let Some(row) = approvals.iter_mut().find(|stored| stored.id == decided.id) else {
            return Ok(DecisionCommit::ApprovalDecided);
        };
        if !row.is_pending() {
            return Ok(DecisionCommit::ApprovalDecided);
        }
        let Some(stored) = expenses.iter_mut().find(|stored| stored.id == expense.id) else {
            return Ok(DecisionCommit::ExpenseStale);
        };
        if stored.version != expected_version {
            return Ok(DecisionCommit::ExpenseStale);
        }

        *row = decided.clone();
        *stored = expense.clone();
        Ok(DecisionCommit::Committed)
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRuleRepository {
    rules: RwLock<Vec<ApprovalRule>>,
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for InMemoryApprovalRuleRepository {
    async fn find_active_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.iter().find(|rule| &rule.company_id == company_id && rule.is_active).cloned())
    }

    async fn save_active(&self, mut rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        for existing in rules.iter_mut().filter(|existing| existing.company_id == rule.company_id) {
            existing.is_active = false;
        }
        rules.retain(|existing| existing.id != rule.id);
        rule.is_active = true;
        rules.push(rule);
        Ok(())
    }
}
