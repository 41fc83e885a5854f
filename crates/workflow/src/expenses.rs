//! Expense lifecycle outside the approval decision itself: submission (manual or
//! from OCR), edits and deletes while pending, and the cached listings.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use expensio_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use expensio_core::currency::{Conversion, CurrencyConverter};
use expensio_core::domain::expense::{CreateExpenseRequest, Expense, ExpenseId, ExpenseStatus};
use expensio_core::domain::ocr::OcrResult;
use expensio_core::domain::user::{Actor, Company, CompanyId, UserId, UserRole};
use expensio_core::errors::ApplicationError;
use expensio_db::Page;

use crate::cache::{company_expenses_page_key, pending_expenses_key, user_expenses_page_key};
use crate::engine::WorkflowEngine;
use crate::persistence;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpensePage {
    pub items: Vec<Expense>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

pub struct ExpenseService {
    engine: Arc<WorkflowEngine>,
    converter: Arc<dyn CurrencyConverter>,
}

impl ExpenseService {
    pub fn new(engine: Arc<WorkflowEngine>, converter: Arc<dyn CurrencyConverter>) -> Self {
        Self { engine, converter }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Persists a pending expense in the company base currency, then asks the
    /// engine for its approval rows. Approval setup failures never undo the
    /// expense; they leave it pending and are reported to operators.
    pub async fn create_expense(
        &self,
        actor: &Actor,
        request: CreateExpenseRequest,
        correlation_id: &str,
    ) -> Result<Expense, ApplicationError> {
        let repos = self.engine.repositories();
        let user = repos
            .users
            .find_by_id(&actor.user_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApplicationError::not_found("user", &actor.user_id))?;
        let company = self.company(&user.company_id).await?;

        request.validate()?;
        let currency = request.normalized_currency();
        let conversion = self.convert(&request, &currency, &company).await?;

        let now = Utc::now();
        let expense = Expense {
            id: ExpenseId(Uuid::new_v4().to_string()),
            user_id: user.id.clone(),
            company_id: company.id.clone(),
            amount: request.amount,
            currency,
            converted_amount: conversion.converted_amount,
            exchange_rate: conversion.rate,
            category: request.category,
            description: request.description.trim().to_string(),
            expense_date: request.expense_date,
            receipt_url: request.receipt_url,
            merchant: request.merchant,
            status: ExpenseStatus::Pending,
            current_approval_level: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        repos.expenses.insert(expense.clone()).await.map_err(persistence)?;

        info!(
            event_name = "expense.created",
            correlation_id,
            expense_id = %expense.id,
            user_id = %expense.user_id,
            converted_amount = %expense.converted_amount,
            "expense submitted"
        );
        self.engine.audit().emit(
            AuditEvent::new(
                Some(expense.id.clone()),
                correlation_id,
                "expense.created",
                AuditCategory::Expense,
                user.id.0.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("currency", expense.currency.clone()),
        );

        if let Err(error) = self.engine.initialize_approvals(&expense, correlation_id).await {
            warn!(
                event_name = "workflow.approvals.initialization_failed",
                correlation_id,
                expense_id = %expense.id,
                error = %error,
                "expense stays pending without approvals"
            );
            self.engine.audit().emit(
                AuditEvent::new(
                    Some(expense.id.clone()),
                    correlation_id,
                    "approval.initialization_failed",
                    AuditCategory::Workflow,
                    user.id.0.clone(),
                    AuditOutcome::Failed,
                )
                .with_metadata("error", error.to_string()),
            );
        }

        self.engine.cache().invalidate_expense_views(&expense.company_id, &expense.user_id).await;
        self.find(&expense.id).await
    }

    pub async fn create_expense_from_ocr(
        &self,
        actor: &Actor,
        ocr: &OcrResult,
        correlation_id: &str,
    ) -> Result<Expense, ApplicationError> {
        let request = CreateExpenseRequest::from_ocr(ocr, Utc::now())?;
        self.create_expense(actor, request, correlation_id).await
    }

    /// Employees see their own expenses; reviewers see any in their company.
    pub async fn get_expense(
        &self,
        actor: &Actor,
        expense_id: &ExpenseId,
    ) -> Result<Expense, ApplicationError> {
        let expense = self.find(expense_id).await?;
        if expense.company_id != actor.company_id {
            return Err(ApplicationError::not_found("expense", expense_id));
        }
        if !actor.role.can_review() && expense.user_id != actor.user_id {
            return Err(ApplicationError::Forbidden(
                "expense belongs to another user".to_string(),
            ));
        }
        Ok(expense)
    }

    /// Listing the caller is entitled to: the whole company for reviewers,
    /// their own submissions otherwise.
    pub async fn list_for_actor(
        &self,
        actor: &Actor,
        page: Page,
    ) -> Result<ExpensePage, ApplicationError> {
        if actor.role.can_review() {
            self.list_company_expenses(&actor.company_id, page).await
        } else {
            self.list_user_expenses(&actor.user_id, page).await
        }
    }

    pub async fn list_user_expenses(
        &self,
        user_id: &UserId,
        page: Page,
    ) -> Result<ExpensePage, ApplicationError> {
        let key = user_expenses_page_key(user_id, page.page, page.limit);
        if let Some(cached) = self.engine.cache().get_json::<ExpensePage>(&key).await {
            return Ok(cached);
        }

        let result =
            self.engine.repositories().expenses.list_by_user(user_id, page).await.map_err(persistence)?;
        let listing =
            ExpensePage { items: result.items, total: result.total, page: page.page, limit: page.limit };
        self.engine.cache().put_json(&key, &listing, self.engine.ttls().expense_list).await;
        Ok(listing)
    }

    pub async fn list_company_expenses(
        &self,
        company_id: &CompanyId,
        page: Page,
    ) -> Result<ExpensePage, ApplicationError> {
        let key = company_expenses_page_key(company_id, page.page, page.limit);
        if let Some(cached) = self.engine.cache().get_json::<ExpensePage>(&key).await {
            return Ok(cached);
        }

        let result = self
            .engine
            .repositories()
            .expenses
            .list_by_company(company_id, page)
            .await
            .map_err(persistence)?;
        let listing =
            ExpensePage { items: result.items, total: result.total, page: page.page, limit: page.limit };
        self.engine.cache().put_json(&key, &listing, self.engine.ttls().expense_list).await;
        Ok(listing)
    }

    /// Pending expenses of the company. Shorter TTL than the general listings.
    pub async fn pending_expenses_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Expense>, ApplicationError> {
        let key = pending_expenses_key(company_id);
        if let Some(cached) = self.engine.cache().get_json::<Vec<Expense>>(&key).await {
            return Ok(cached);
        }

        let pending = self
            .engine
            .repositories()
            .expenses
            .list_pending_by_company(company_id)
            .await
            .map_err(persistence)?;
        self.engine.cache().put_json(&key, &pending, self.engine.ttls().pending_approvals).await;
        Ok(pending)
    }

    /// Replaces the submitted fields of a pending expense. Status and approval
    /// level are left to the engine.
    pub async fn update_expense(
        &self,
        actor: &Actor,
        expense_id: &ExpenseId,
        request: CreateExpenseRequest,
        correlation_id: &str,
    ) -> Result<Expense, ApplicationError> {
        let _guard = self.lock(expense_id).await?;
        let current = self.find(expense_id).await?;
        self.ensure_owner(actor, &current, "update")?;
        ensure_editable(&current, "update")?;

        request.validate()?;
        let company = self.company(&current.company_id).await?;
        let currency = request.normalized_currency();
        let conversion = self.convert(&request, &currency, &company).await?;

        let mut updated = current.clone();
        updated.amount = request.amount;
        updated.currency = currency;
        updated.converted_amount = conversion.converted_amount;
        updated.exchange_rate = conversion.rate;
        updated.category = request.category;
        updated.description = request.description.trim().to_string();
        updated.expense_date = request.expense_date;
        updated.receipt_url = request.receipt_url;
        updated.merchant = request.merchant;
        updated.updated_at = Utc::now();
        updated.version = current.version + 1;

        let written = self
            .engine
            .repositories()
            .expenses
            .update_if_version(updated.clone(), current.version)
            .await
            .map_err(persistence)?;
        if !written {
            return Err(ApplicationError::Conflict(
                "expense was modified concurrently; reload and retry".to_string(),
            ));
        }

        info!(event_name = "expense.updated", correlation_id, expense_id = %expense_id, "expense updated");
        self.engine.cache().invalidate_expense_views(&updated.company_id, &updated.user_id).await;
        Ok(updated)
    }

    /// Removes a pending expense. Its approval rows stay in the ledger.
    pub async fn delete_expense(
        &self,
        actor: &Actor,
        expense_id: &ExpenseId,
        correlation_id: &str,
    ) -> Result<(), ApplicationError> {
        let _guard = self.lock(expense_id).await?;
        let current = self.find(expense_id).await?;
        self.ensure_owner(actor, &current, "delete")?;
        ensure_editable(&current, "delete")?;

        let deleted = self
            .engine
            .repositories()
            .expenses
            .delete_pending(expense_id)
            .await
            .map_err(persistence)?;
        if !deleted {
            return Err(ApplicationError::Conflict(
                "expense was resolved before it could be deleted".to_string(),
            ));
        }

        info!(event_name = "expense.deleted", correlation_id, expense_id = %expense_id, "expense deleted");
        self.engine.audit().emit(AuditEvent::new(
            Some(expense_id.clone()),
            correlation_id,
            "expense.deleted",
            AuditCategory::Expense,
            actor.user_id.0.clone(),
            AuditOutcome::Success,
        ));
        self.engine.cache().invalidate_expense_views(&current.company_id, &current.user_id).await;
        Ok(())
    }

    async fn find(&self, expense_id: &ExpenseId) -> Result<Expense, ApplicationError> {
        self.engine
            .repositories()
            .expenses
            .find_by_id(expense_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApplicationError::not_found("expense", expense_id))
    }

    async fn company(&self, company_id: &CompanyId) -> Result<Company, ApplicationError> {
        self.engine
            .repositories()
            .companies
            .find_by_id(company_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApplicationError::not_found("company", company_id))
    }

    async fn convert(
        &self,
        request: &CreateExpenseRequest,
        currency: &str,
        company: &Company,
    ) -> Result<Conversion, ApplicationError> {
        self.converter
            .convert(request.amount, currency, &company.base_currency)
            .await
            .map_err(|error| ApplicationError::Integration(format!("failed to convert currency: {error}")))
    }

    async fn lock(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<crate::locks::ExpenseGuard, ApplicationError> {
        self.engine.locks().acquire(expense_id).await.map_err(|_| {
            ApplicationError::Conflict(
                "another change to this expense is in progress; retry shortly".to_string(),
            )
        })
    }

    fn ensure_owner(
        &self,
        actor: &Actor,
        expense: &Expense,
        verb: &str,
    ) -> Result<(), ApplicationError> {
        if expense.company_id != actor.company_id {
            return Err(ApplicationError::not_found("expense", &expense.id));
        }
        if expense.user_id != actor.user_id && actor.role != UserRole::Admin {
            return Err(ApplicationError::Forbidden(format!(
                "only the submitter can {verb} this expense"
            )));
        }
        Ok(())
    }
}

fn ensure_editable(expense: &Expense, verb: &str) -> Result<(), ApplicationError> {
    expense.ensure_editable().map_err(|_| {
        ApplicationError::Conflict(format!("cannot {verb} expense that is already {}", expense.status))
    })
}
