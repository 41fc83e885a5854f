//! The approval workflow engine.
//!
//! The engine is the only writer of an expense's `status` and
//! `current_approval_level` after creation, and the only writer of approval
//! rows. Decisions for one expense are serialized by [`ExpenseLocks`] inside the
//! process and by conditional writes (`status = pending` on approvals,
//! `version` on expenses) across processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use expensio_core::approvals::{actionable_approval, is_satisfied, plan_approvals, ApprovalPlan};
use expensio_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use expensio_core::config::{AppConfig, WorkflowConfig};
use expensio_core::domain::approval::{Approval, ApprovalAction, ApprovalId};
use expensio_core::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use expensio_core::domain::rule::ApprovalRule;
use expensio_core::domain::user::UserId;
use expensio_core::errors::{ApplicationError, DomainError};
use expensio_db::{DecisionCommit, Repositories};

use crate::cache::{pending_approvals_key, CacheTtls, ReadThrough};
use crate::locks::ExpenseLocks;
use crate::persistence;

/// Decision commits attempted before giving up; a lost commit writes nothing.
const MAX_DECISION_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Reject approvers acting ahead of `current_approval_level + 1` on
    /// sequential rules. Off by default: ordering is advisory.
    pub enforce_sequential_order: bool,
    pub decision_lock_timeout: Duration,
}

impl From<&WorkflowConfig> for WorkflowSettings {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            enforce_sequential_order: config.enforce_sequential_order,
            decision_lock_timeout: Duration::from_secs(config.decision_lock_timeout_secs),
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default().workflow)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub expense: Expense,
    pub approval: Approval,
    /// True when this decision moved the expense out of pending.
    pub resolved: bool,
}

pub struct WorkflowEngine {
    repos: Repositories,
    cache: ReadThrough,
    ttls: CacheTtls,
    audit: Arc<dyn AuditSink>,
    locks: ExpenseLocks,
    settings: WorkflowSettings,
}

impl WorkflowEngine {
    pub fn new(
        repos: Repositories,
        cache: ReadThrough,
        ttls: CacheTtls,
        audit: Arc<dyn AuditSink>,
        settings: WorkflowSettings,
    ) -> Self {
        let locks = ExpenseLocks::new(settings.decision_lock_timeout);
        Self { repos, cache, ttls, audit, locks, settings }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn cache(&self) -> &ReadThrough {
        &self.cache
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn locks(&self) -> &ExpenseLocks {
        &self.locks
    }

    pub fn settings(&self) -> WorkflowSettings {
        self.settings
    }

    /// Creates the approval rows a freshly persisted pending expense needs, or
    /// approves it outright when the default path finds no manager.
    pub async fn initialize_approvals(
        &self,
        expense: &Expense,
        correlation_id: &str,
    ) -> Result<ApprovalPlan, ApplicationError> {
        if !expense.is_pending() {
            return Err(DomainError::AlreadyResolved { status: expense.status }.into());
        }

        let rule = self.active_rule(expense).await?;
        let manager = match &rule {
            Some(_) => None,
            None => {
                let submitter = self
                    .repos
                    .users
                    .find_by_id(&expense.user_id)
                    .await
                    .map_err(persistence)?
                    .ok_or_else(|| ApplicationError::not_found("user", &expense.user_id))?;
                submitter.manager_id
            }
        };

        let plan = plan_approvals(rule.as_ref(), manager.as_ref())?;
        match &plan {
            ApprovalPlan::AutoApprove => {
                let mut approved = expense.clone();
                approved.transition_to(ExpenseStatus::Approved)?;
                approved.version = expense.version + 1;
                let written = self
                    .repos
                    .expenses
                    .update_if_version(approved, expense.version)
                    .await
                    .map_err(persistence)?;
                if !written {
                    return Err(ApplicationError::Conflict(
                        "expense changed before it could be auto-approved".to_string(),
                    ));
                }

                info!(
                    event_name = "workflow.approvals.auto_approved",
                    correlation_id,
                    expense_id = %expense.id,
                    "submitter has no manager and company has no rule; expense approved"
                );
                self.audit.emit(AuditEvent::new(
                    Some(expense.id.clone()),
                    correlation_id,
                    "approval.auto_approved",
                    AuditCategory::Workflow,
                    expense.user_id.0.clone(),
                    AuditOutcome::Success,
                ));
            }
            ApprovalPlan::Approvers { approvals } => {
                let now = Utc::now();
                let rows: Vec<Approval> = approvals
                    .iter()
                    .map(|planned| {
                        Approval::pending(
                            ApprovalId(Uuid::new_v4().to_string()),
                            expense.id.clone(),
                            planned.approver_id.clone(),
                            planned.level,
                            now,
                        )
                    })
                    .collect();
                let approvers: Vec<UserId> = rows.iter().map(|row| row.approver_id.clone()).collect();
                self.repos.approvals.create_batch(rows).await.map_err(persistence)?;

                for approver in &approvers {
                    self.cache.invalidate(&pending_approvals_key(approver)).await;
                }

                info!(
                    event_name = "workflow.approvals.initialized",
                    correlation_id,
                    expense_id = %expense.id,
                    rule_kind = rule.as_ref().map(|rule| rule.policy.kind()).unwrap_or("manager"),
                    approval_count = approvers.len(),
                    "approval rows created"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(expense.id.clone()),
                        correlation_id,
                        "approval.initialized",
                        AuditCategory::Workflow,
                        expense.user_id.0.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("approval_count", approvers.len().to_string()),
                );
            }
        }

        self.cache.invalidate_expense_views(&expense.company_id, &expense.user_id).await;
        Ok(plan)
    }

    /// Records one approver's decision and drives the expense transition.
    ///
    /// The decided row and the expense transition are committed together. A
    /// commit that loses to another writer changes nothing and is re-evaluated
    /// against fresh state.
    pub async fn decide(
        &self,
        expense_id: &ExpenseId,
        approver_id: &UserId,
        action: ApprovalAction,
        comments: Option<String>,
        correlation_id: &str,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let _guard = self.locks.acquire(expense_id).await.map_err(|error| {
            warn!(
                event_name = "workflow.decision.lock_timeout",
                correlation_id,
                expense_id = %expense_id,
                error = %error,
                "could not serialize decision"
            );
            ApplicationError::Conflict(
                "another decision on this expense is in progress; retry shortly".to_string(),
            )
        })?;

        for attempt in 1..=MAX_DECISION_ATTEMPTS {
            let expense = self.load_expense(expense_id).await?;
            if !expense.is_pending() {
                self.reject_decision(&expense, approver_id, correlation_id, "already_resolved");
                return Err(DomainError::AlreadyResolved { status: expense.status }.into());
            }

            let approvals =
                self.repos.approvals.list_for_expense(expense_id).await.map_err(persistence)?;
            let rule = self.active_rule(&expense).await?;

            let mut approval = match actionable_approval(
                &expense,
                &approvals,
                approver_id,
                rule.as_ref(),
                self.settings.enforce_sequential_order,
            ) {
                Ok(approval) => approval.clone(),
                Err(ineligibility) => {
                    self.reject_decision(&expense, approver_id, correlation_id, ineligibility.message());
                    return Err(ApplicationError::NotEligible(ineligibility.message().to_string()));
                }
            };
            approval.decide(action, comments.clone(), Utc::now())?;
            let next = transition(&expense, &approval, &approvals, action, rule.as_ref())?;

            let commit = self
                .repos
                .decisions
                .commit(&approval, &next, expense.version)
                .await
                .map_err(persistence)?;
            match commit {
                DecisionCommit::Committed => {
                    self.after_decision(&next, &approval, correlation_id).await;
                    let resolved = !next.is_pending();
                    return Ok(DecisionOutcome { expense: next, approval, resolved });
                }
                DecisionCommit::ApprovalDecided => {
                    // another process decided this row between our read and write
                    self.reject_decision(&expense, approver_id, correlation_id, "approval_already_decided");
                    return Err(ApplicationError::NotEligible(
                        "no pending approval found for this user".to_string(),
                    ));
                }
                DecisionCommit::ExpenseStale => {
                    warn!(
                        event_name = "workflow.decision.version_conflict",
                        correlation_id,
                        expense_id = %expense_id,
                        attempt,
                        "expense changed underneath decision; re-evaluating"
                    );
                }
            }
        }

        Err(ApplicationError::Conflict(
            "expense was modified concurrently; retry the decision".to_string(),
        ))
    }

    async fn after_decision(&self, settled: &Expense, approval: &Approval, correlation_id: &str) {
        info!(
            event_name = "workflow.decision.recorded",
            correlation_id,
            expense_id = %settled.id,
            approver_id = %approval.approver_id,
            level = approval.level,
            status = %approval.status,
            "approval decision recorded"
        );

        self.cache.invalidate(&pending_approvals_key(&approval.approver_id)).await;
        self.cache.invalidate_expense_views(&settled.company_id, &settled.user_id).await;

        self.audit.emit(
            AuditEvent::new(
                Some(settled.id.clone()),
                correlation_id,
                "approval.decided",
                AuditCategory::Workflow,
                approval.approver_id.0.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("decision", approval.status.as_str())
            .with_metadata("level", approval.level.to_string()),
        );
        if !settled.is_pending() {
            info!(
                event_name = "workflow.expense.resolved",
                correlation_id,
                expense_id = %settled.id,
                status = %settled.status,
                "expense left pending"
            );
            self.audit.emit(
                AuditEvent::new(
                    Some(settled.id.clone()),
                    correlation_id,
                    "expense.resolved",
                    AuditCategory::Expense,
                    approval.approver_id.0.clone(),
                    AuditOutcome::Success,
                )
                .with_metadata("status", settled.status.as_str()),
            );
        }
    }

    /// Pending rows assigned to the approver, oldest first.
    pub async fn pending_approvals_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, ApplicationError> {
        let key = pending_approvals_key(approver_id);
        if let Some(cached) = self.cache.get_json::<Vec<Approval>>(&key).await {
            return Ok(cached);
        }

        let approvals = self
            .repos
            .approvals
            .list_pending_for_approver(approver_id)
            .await
            .map_err(persistence)?;
        self.cache.put_json(&key, &approvals, self.ttls.pending_approvals).await;
        Ok(approvals)
    }

    /// Every row of the expense in creation order, any status.
    pub async fn approval_history(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<Approval>, ApplicationError> {
        self.load_expense(expense_id).await?;
        self.repos.approvals.list_for_expense(expense_id).await.map_err(persistence)
    }

    async fn load_expense(&self, expense_id: &ExpenseId) -> Result<Expense, ApplicationError> {
        self.repos
            .expenses
            .find_by_id(expense_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApplicationError::not_found("expense", expense_id))
    }

    async fn active_rule(&self, expense: &Expense) -> Result<Option<ApprovalRule>, ApplicationError> {
        self.repos.rules.find_active_for_company(&expense.company_id).await.map_err(persistence)
    }

    fn reject_decision(
        &self,
        expense: &Expense,
        approver_id: &UserId,
        correlation_id: &str,
        reason: &str,
    ) {
        info!(
            event_name = "workflow.decision.rejected",
            correlation_id,
            expense_id = %expense.id,
            approver_id = %approver_id,
            reason,
            "decision precondition failed"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(expense.id.clone()),
                correlation_id,
                "approval.decision_rejected",
                AuditCategory::Workflow,
                approver_id.0.clone(),
                AuditOutcome::Rejected,
            )
            .with_metadata("reason", reason),
        );
    }
}

/// Expense state after `decided` is applied on top of `approvals`.
fn transition(
    expense: &Expense,
    decided: &Approval,
    approvals: &[Approval],
    action: ApprovalAction,
    rule: Option<&ApprovalRule>,
) -> Result<Expense, DomainError> {
    let mut next = expense.clone();
    match action {
        ApprovalAction::Reject => next.transition_to(ExpenseStatus::Rejected)?,
        ApprovalAction::Approve => {
            let settled: Vec<Approval> = approvals
                .iter()
                .map(|row| if row.id == decided.id { decided.clone() } else { row.clone() })
                .collect();
            if is_satisfied(rule, &settled) {
                next.transition_to(ExpenseStatus::Approved)?;
            } else {
                next.advance_level()?;
            }
        }
    }
    next.version = expense.version + 1;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use expensio_core::approvals::ApprovalPlan;
    use expensio_core::audit::InMemoryAuditSink;
    use expensio_core::cache::InMemoryCache;
    use expensio_core::domain::approval::{ApprovalAction, ApprovalStatus};
    use expensio_core::domain::expense::{Expense, ExpenseCategory, ExpenseId, ExpenseStatus};
    use expensio_core::domain::rule::{ApprovalRule, RuleId, RulePolicy};
    use expensio_core::domain::user::{CompanyId, User, UserId, UserRole};
    use expensio_core::errors::{ApplicationError, DomainError};
    use expensio_db::repositories::{
        InMemoryApprovalRepository, InMemoryDecisionRepository, InMemoryExpenseRepository,
    };
    use expensio_db::{ExpenseRepository, Page, PageResult, Repositories, RepositoryError};

    use super::{WorkflowEngine, WorkflowSettings};
    use crate::cache::{pending_approvals_key, CacheTtls, ReadThrough};

    struct Harness {
        engine: WorkflowEngine,
        repos: Repositories,
        audit: InMemoryAuditSink,
    }

    fn harness(settings: WorkflowSettings) -> Harness {
        harness_with(Repositories::in_memory(), settings)
    }

    fn harness_with(repos: Repositories, settings: WorkflowSettings) -> Harness {
        let audit = InMemoryAuditSink::default();
        let engine = WorkflowEngine::new(
            repos.clone(),
            ReadThrough::new(Arc::new(InMemoryCache::new())),
            CacheTtls::default(),
            Arc::new(audit.clone()),
            settings,
        );
        Harness { engine, repos, audit }
    }

    fn id(value: &str) -> UserId {
        UserId(value.to_string())
    }

    async fn seed_user(repos: &Repositories, user: &str, manager: Option<&str>) {
        let now = Utc::now();
        repos
            .users
            .save(User {
                id: id(user),
                email: format!("{user}@example.com"),
                first_name: user.to_string(),
                last_name: "Tester".to_string(),
                role: UserRole::Employee,
                company_id: CompanyId("c-1".to_string()),
                manager_id: manager.map(id),
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("save user");
    }

    async fn seed_rule(repos: &Repositories, policy: RulePolicy) {
        let now = Utc::now();
        repos
            .rules
            .save_active(ApprovalRule {
                id: RuleId("rule-1".to_string()),
                company_id: CompanyId("c-1".to_string()),
                name: "test rule".to_string(),
                policy,
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("save rule");
    }

    async fn submit(repos: &Repositories, expense_id: &str) -> Expense {
        let now = Utc::now();
        let expense = Expense {
            id: ExpenseId(expense_id.to_string()),
            user_id: id("e-1"),
            company_id: CompanyId("c-1".to_string()),
            amount: Decimal::from(250),
            currency: "USD".to_string(),
            converted_amount: Decimal::from(250),
            exchange_rate: Decimal::ONE,
            category: ExpenseCategory::Travel,
            description: "Client visit".to_string(),
            expense_date: now,
            receipt_url: None,
            merchant: None,
            status: ExpenseStatus::Pending,
            current_approval_level: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        repos.expenses.insert(expense.clone()).await.expect("insert expense");
        expense
    }

    async fn status_of(repos: &Repositories, expense_id: &str) -> Expense {
        repos
            .expenses
            .find_by_id(&ExpenseId(expense_id.to_string()))
            .await
            .expect("find")
            .expect("expense exists")
    }

    /// Expense store where another writer bumps the version right after each of
    /// the first `contended` reads of a pending expense.
    struct ContendedExpenses {
        inner: Arc<InMemoryExpenseRepository>,
        contended: AtomicU32,
    }

    #[async_trait]
    impl ExpenseRepository for ContendedExpenses {
        async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
            let found = self.inner.find_by_id(id).await?;
            if let Some(expense) = found.as_ref().filter(|expense| expense.is_pending()) {
                let contend = self
                    .contended
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if contend {
                    let mut bumped = expense.clone();
                    bumped.version += 1;
                    self.inner.update_if_version(bumped, expense.version).await?;
                }
            }
            Ok(found)
        }

        async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
            self.inner.insert(expense).await
        }

        async fn update_if_version(
            &self,
            expense: Expense,
            expected_version: u32,
        ) -> Result<bool, RepositoryError> {
            self.inner.update_if_version(expense, expected_version).await
        }

        async fn delete_pending(&self, id: &ExpenseId) -> Result<bool, RepositoryError> {
            self.inner.delete_pending(id).await
        }

        async fn list_by_user(
            &self,
            user_id: &UserId,
            page: Page,
        ) -> Result<PageResult<Expense>, RepositoryError> {
            self.inner.list_by_user(user_id, page).await
        }

        async fn list_by_company(
            &self,
            company_id: &CompanyId,
            page: Page,
        ) -> Result<PageResult<Expense>, RepositoryError> {
            self.inner.list_by_company(company_id, page).await
        }

        async fn list_pending_by_company(
            &self,
            company_id: &CompanyId,
        ) -> Result<Vec<Expense>, RepositoryError> {
            self.inner.list_pending_by_company(company_id).await
        }
    }

    fn contended_repositories(contended: u32) -> Repositories {
        let expenses = Arc::new(InMemoryExpenseRepository::default());
        let approvals = Arc::new(InMemoryApprovalRepository::default());
        let mut repos = Repositories::in_memory();
        repos.expenses =
            Arc::new(ContendedExpenses { inner: expenses.clone(), contended: AtomicU32::new(contended) });
        repos.approvals = approvals.clone();
        repos.decisions = Arc::new(InMemoryDecisionRepository::new(expenses, approvals));
        repos
    }

    fn sequential(approvers: &[&str]) -> RulePolicy {
        RulePolicy::Sequential { approvers: approvers.iter().map(|a| id(a)).collect() }
    }

    #[tokio::test]
    async fn sequential_rule_walks_levels_then_approves() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(&h.repos, sequential(&["m1", "m2"])).await;
        let expense = submit(&h.repos, "EXP-1").await;

        h.engine.initialize_approvals(&expense, "req-1").await.expect("init");
        let rows = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(
            rows.iter().map(|row| (row.approver_id.0.as_str(), row.level)).collect::<Vec<_>>(),
            vec![("m1", 1), ("m2", 2)]
        );

        let first = h
            .engine
            .decide(&expense.id, &id("m1"), ApprovalAction::Approve, None, "req-2")
            .await
            .expect("m1 approves");
        assert!(!first.resolved);
        assert_eq!(first.expense.status, ExpenseStatus::Pending);
        assert_eq!(first.expense.current_approval_level, 1);

        let second = h
            .engine
            .decide(&expense.id, &id("m2"), ApprovalAction::Approve, Some("ok".to_string()), "req-3")
            .await
            .expect("m2 approves");
        assert!(second.resolved);
        assert_eq!(second.expense.status, ExpenseStatus::Approved);
        assert_eq!(second.approval.comments.as_deref(), Some("ok"));

        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert!(history.iter().all(|row| row.status == ApprovalStatus::Approved));
        assert_eq!(h.audit.events_of_type("expense.resolved").len(), 1);
    }

    #[tokio::test]
    async fn single_reject_terminates_regardless_of_prior_approvals() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(
            &h.repos,
            RulePolicy::Percentage {
                allowed_approvers: vec![id("a"), id("b"), id("c")],
                percentage_required: Some(Decimal::from(100)),
            },
        )
        .await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        h.engine.decide(&expense.id, &id("a"), ApprovalAction::Approve, None, "req").await.expect("a");
        h.engine.decide(&expense.id, &id("b"), ApprovalAction::Approve, None, "req").await.expect("b");
        let outcome = h
            .engine
            .decide(&expense.id, &id("c"), ApprovalAction::Reject, Some("no".to_string()), "req")
            .await
            .expect("c rejects");

        assert!(outcome.resolved);
        assert_eq!(outcome.expense.status, ExpenseStatus::Rejected);
    }

    #[tokio::test]
    async fn resolved_expense_refuses_further_decisions() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(&h.repos, sequential(&["m1", "m2"])).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        h.engine.decide(&expense.id, &id("m1"), ApprovalAction::Reject, None, "req").await.expect("reject");
        let late = h.engine.decide(&expense.id, &id("m2"), ApprovalAction::Approve, None, "req").await;

        assert_eq!(
            late,
            Err(ApplicationError::Domain(DomainError::AlreadyResolved {
                status: ExpenseStatus::Rejected
            }))
        );
        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(history[1].status, ApprovalStatus::Pending);
        assert_eq!(status_of(&h.repos, "EXP-1").await.status, ExpenseStatus::Rejected);
    }

    #[tokio::test]
    async fn repeated_decision_by_the_same_approver_is_refused() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(&h.repos, sequential(&["m1", "m2"])).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        h.engine
            .decide(&expense.id, &id("m1"), ApprovalAction::Approve, Some("first".to_string()), "req")
            .await
            .expect("first decision");
        let again = h
            .engine
            .decide(&expense.id, &id("m1"), ApprovalAction::Reject, Some("second".to_string()), "req")
            .await;

        assert_eq!(
            again,
            Err(ApplicationError::NotEligible("no pending approval found for this user".to_string()))
        );
        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(history[0].status, ApprovalStatus::Approved);
        assert_eq!(history[0].comments.as_deref(), Some("first"));
        assert_eq!(h.audit.events_of_type("approval.decision_rejected").len(), 1);
    }

    #[tokio::test]
    async fn unassigned_user_and_missing_expense_are_refused() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let stranger =
            h.engine.decide(&expense.id, &id("intruder"), ApprovalAction::Approve, None, "req").await;
        assert!(matches!(stranger, Err(ApplicationError::NotEligible(_))));

        let missing = h
            .engine
            .decide(&ExpenseId("EXP-404".to_string()), &id("mgr"), ApprovalAction::Approve, None, "req")
            .await;
        assert!(matches!(missing, Err(ApplicationError::NotFound { entity: "expense", .. })));
    }

    #[tokio::test]
    async fn submitter_without_manager_or_rule_is_auto_approved() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        let expense = submit(&h.repos, "EXP-1").await;

        let plan = h.engine.initialize_approvals(&expense, "req").await.expect("init");

        assert_eq!(plan, ApprovalPlan::AutoApprove);
        assert_eq!(status_of(&h.repos, "EXP-1").await.status, ExpenseStatus::Approved);
        assert!(h.engine.approval_history(&expense.id).await.expect("history").is_empty());
        assert_eq!(h.audit.events_of_type("approval.auto_approved").len(), 1);
    }

    #[tokio::test]
    async fn manager_default_path_resolves_on_single_approval() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let outcome = h
            .engine
            .decide(&expense.id, &id("mgr"), ApprovalAction::Approve, None, "req")
            .await
            .expect("manager approves");
        assert_eq!(outcome.expense.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn percentage_threshold_resolves_on_third_of_four() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(
            &h.repos,
            RulePolicy::Percentage {
                allowed_approvers: vec![id("a"), id("b"), id("c"), id("d")],
                percentage_required: Some(Decimal::from(60)),
            },
        )
        .await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        for approver in ["a", "b"] {
            let outcome = h
                .engine
                .decide(&expense.id, &id(approver), ApprovalAction::Approve, None, "req")
                .await
                .expect("approve");
            assert_eq!(outcome.expense.status, ExpenseStatus::Pending);
        }
        let third = h
            .engine
            .decide(&expense.id, &id("c"), ApprovalAction::Approve, None, "req")
            .await
            .expect("approve");
        assert_eq!(third.expense.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn hybrid_specific_approver_short_circuits_pending_sequence() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(
            &h.repos,
            RulePolicy::Hybrid {
                sequential_approvers: vec![id("a"), id("b"), id("c")],
                allowed_approvers: Vec::new(),
                specific_approver: Some(id("d")),
                percentage_required: None,
            },
        )
        .await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let outcome = h
            .engine
            .decide(&expense.id, &id("d"), ApprovalAction::Approve, None, "req")
            .await
            .expect("d approves");

        assert_eq!(outcome.expense.status, ExpenseStatus::Approved);
        assert_eq!(outcome.approval.level, 4);
        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(history.iter().filter(|row| row.status == ApprovalStatus::Pending).count(), 3);
    }

    #[tokio::test]
    async fn misconfigured_rule_fails_initialization_without_rows() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        seed_rule(&h.repos, RulePolicy::SpecificApprover { approver: None }).await;
        let expense = submit(&h.repos, "EXP-1").await;

        let result = h.engine.initialize_approvals(&expense, "req").await;

        assert_eq!(
            result,
            Err(ApplicationError::Domain(DomainError::RuleConfiguration(
                "specific approver not configured".to_string()
            )))
        );
        assert_eq!(status_of(&h.repos, "EXP-1").await.status, ExpenseStatus::Pending);
        assert!(h.engine.approval_history(&expense.id).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn strict_ordering_blocks_out_of_sequence_approver() {
        let h = harness(WorkflowSettings { enforce_sequential_order: true, ..WorkflowSettings::default() });
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(&h.repos, sequential(&["m1", "m2"])).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let early = h.engine.decide(&expense.id, &id("m2"), ApprovalAction::Approve, None, "req").await;
        assert_eq!(early, Err(ApplicationError::NotEligible("approval is out of sequence".to_string())));

        h.engine.decide(&expense.id, &id("m1"), ApprovalAction::Approve, None, "req").await.expect("m1");
        let outcome = h
            .engine
            .decide(&expense.id, &id("m2"), ApprovalAction::Approve, None, "req")
            .await
            .expect("m2 in order");
        assert_eq!(outcome.expense.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn advisory_ordering_lets_later_level_act_first() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        seed_rule(&h.repos, sequential(&["m1", "m2"])).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let outcome = h
            .engine
            .decide(&expense.id, &id("m2"), ApprovalAction::Approve, None, "req")
            .await
            .expect("m2 acts first");
        assert_eq!(outcome.expense.status, ExpenseStatus::Pending);
        assert_eq!(outcome.expense.current_approval_level, 1);
    }

    #[tokio::test]
    async fn pending_approvals_cache_is_refreshed_after_decision() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let before = h.engine.pending_approvals_for_approver(&id("mgr")).await.expect("pending");
        assert_eq!(before.len(), 1);
        assert!(h
            .engine
            .cache()
            .get_json::<Vec<expensio_core::domain::approval::Approval>>(&pending_approvals_key(&id("mgr")))
            .await
            .is_some());

        h.engine.decide(&expense.id, &id("mgr"), ApprovalAction::Approve, None, "req").await.expect("approve");

        let after = h.engine.pending_approvals_for_approver(&id("mgr")).await.expect("pending");
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn concurrent_approvers_never_lose_the_final_transition() {
        let h = harness(WorkflowSettings::default());
        seed_user(&h.repos, "e-1", None).await;
        let approvers = ["a", "b", "c", "d", "e"];
        seed_rule(&h.repos, sequential(&approvers)).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let engine = Arc::new(h.engine);
        let mut tasks = Vec::new();
        for approver in approvers {
            let engine = Arc::clone(&engine);
            let expense_id = expense.id.clone();
            tasks.push(tokio::spawn(async move {
                engine.decide(&expense_id, &id(approver), ApprovalAction::Approve, None, "req").await
            }));
        }
        let mut resolutions = 0;
        for task in tasks {
            if task.await.expect("join").expect("decision").resolved {
                resolutions += 1;
            }
        }

        let stored = status_of(&h.repos, "EXP-1").await;
        assert_eq!(resolutions, 1);
        assert_eq!(stored.status, ExpenseStatus::Approved);
        assert_eq!(stored.current_approval_level, 4);
    }

    #[tokio::test]
    async fn exhausted_contention_leaves_both_records_untouched() {
        let h = harness_with(contended_repositories(3), WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let first = h.engine.decide(&expense.id, &id("mgr"), ApprovalAction::Approve, None, "req").await;
        assert!(matches!(first, Err(ApplicationError::Conflict(_))));

        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ApprovalStatus::Pending);
        assert_eq!(status_of(&h.repos, "EXP-1").await.status, ExpenseStatus::Pending);
        assert!(h.audit.events_of_type("approval.decided").is_empty());

        let retry = h
            .engine
            .decide(&expense.id, &id("mgr"), ApprovalAction::Approve, None, "req")
            .await
            .expect("retry succeeds once contention ends");
        assert!(retry.resolved);
        assert_eq!(status_of(&h.repos, "EXP-1").await.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn transient_contention_is_reevaluated_to_completion() {
        let h = harness_with(contended_repositories(2), WorkflowSettings::default());
        seed_user(&h.repos, "e-1", Some("mgr")).await;
        let expense = submit(&h.repos, "EXP-1").await;
        h.engine.initialize_approvals(&expense, "req").await.expect("init");

        let outcome = h
            .engine
            .decide(&expense.id, &id("mgr"), ApprovalAction::Reject, Some("duplicate".to_string()), "req")
            .await
            .expect("decision lands on the third attempt");

        assert!(outcome.resolved);
        let stored = status_of(&h.repos, "EXP-1").await;
        assert_eq!(stored.status, ExpenseStatus::Rejected);
        assert_eq!(stored.version, 4);
        let history = h.engine.approval_history(&expense.id).await.expect("history");
        assert_eq!(history[0].status, ApprovalStatus::Rejected);
        assert_eq!(history[0].comments.as_deref(), Some("duplicate"));
        assert_eq!(h.audit.events_of_type("approval.decided").len(), 1);
    }
}
