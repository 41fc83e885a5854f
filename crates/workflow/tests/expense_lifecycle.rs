use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use expensio_core::audit::InMemoryAuditSink;
use expensio_core::cache::InMemoryCache;
use expensio_core::currency::StaticRateConverter;
use expensio_core::domain::approval::{ApprovalAction, ApprovalStatus};
use expensio_core::domain::expense::{CreateExpenseRequest, ExpenseCategory, ExpenseStatus};
use expensio_core::domain::ocr::OcrResult;
use expensio_core::domain::rule::{ApprovalRule, RuleId, RulePolicy};
use expensio_core::domain::user::{Actor, Company, CompanyId, User, UserId, UserRole};
use expensio_core::errors::{ApplicationError, DomainError};
use expensio_db::{connect_with_settings, migrations, Page, Repositories};
use expensio_workflow::{CacheTtls, ExpenseService, ReadThrough, WorkflowEngine, WorkflowSettings};

struct World {
    service: ExpenseService,
    repos: Repositories,
    audit: InMemoryAuditSink,
}

fn world(repos: Repositories) -> World {
    let audit = InMemoryAuditSink::default();
    let engine = Arc::new(WorkflowEngine::new(
        repos.clone(),
        ReadThrough::new(Arc::new(InMemoryCache::new())),
        CacheTtls::default(),
        Arc::new(audit.clone()),
        WorkflowSettings::default(),
    ));
    let converter = StaticRateConverter::new().with_rate("EUR", "USD", Decimal::from_str("1.10").expect("rate"));
    World { service: ExpenseService::new(engine, Arc::new(converter)), repos, audit }
}

fn company_id() -> CompanyId {
    CompanyId("c-1".to_string())
}

async fn seed(repos: &Repositories, users: &[(&str, UserRole, Option<&str>)]) {
    let now = Utc::now();
    repos
        .companies
        .save(Company {
            id: company_id(),
            name: "Acme".to_string(),
            base_currency: "USD".to_string(),
            country: "US".to_string(),
            admin_user_id: UserId("admin".to_string()),
            is_active: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .expect("save company");

    for (id, role, manager) in users {
        repos
            .users
            .save(User {
                id: UserId(id.to_string()),
                email: format!("{id}@acme.test"),
                first_name: id.to_string(),
                last_name: "Acme".to_string(),
                role: *role,
                company_id: company_id(),
                manager_id: manager.map(|manager| UserId(manager.to_string())),
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("save user");
    }
}

async fn seed_rule(repos: &Repositories, policy: RulePolicy) {
    let now = Utc::now();
    repos
        .rules
        .save_active(ApprovalRule {
            id: RuleId("rule-1".to_string()),
            company_id: company_id(),
            name: "company rule".to_string(),
            policy,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .expect("save rule");
}

fn actor(id: &str, role: UserRole) -> Actor {
    Actor::new(UserId(id.to_string()), role, company_id())
}

fn request(amount: i64, currency: &str) -> CreateExpenseRequest {
    CreateExpenseRequest {
        amount: Decimal::from(amount),
        currency: currency.to_string(),
        category: ExpenseCategory::Travel,
        description: "Train to Lyon".to_string(),
        expense_date: Utc::now(),
        receipt_url: None,
        merchant: Some("SNCF".to_string()),
    }
}

#[tokio::test]
async fn submission_converts_currency_and_routes_to_manager() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr")), ("mgr", UserRole::Manager, None)]).await;

    let expense = w
        .service
        .create_expense(&actor("emp", UserRole::Employee), request(100, "eur"), "req-1")
        .await
        .expect("create");

    assert_eq!(expense.status, ExpenseStatus::Pending);
    assert_eq!(expense.currency, "EUR");
    assert_eq!(expense.converted_amount, Decimal::from(110));
    assert_eq!(expense.current_approval_level, 0);

    let pending = w
        .service
        .engine()
        .pending_approvals_for_approver(&UserId("mgr".to_string()))
        .await
        .expect("pending approvals");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].expense_id, expense.id);
}

#[tokio::test]
async fn top_level_submitter_is_approved_immediately() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("admin", UserRole::Admin, None)]).await;

    let expense = w
        .service
        .create_expense(&actor("admin", UserRole::Admin), request(40, "USD"), "req")
        .await
        .expect("create");

    assert_eq!(expense.status, ExpenseStatus::Approved);
    assert_eq!(expense.exchange_rate, Decimal::ONE);
    assert!(w.service.engine().approval_history(&expense.id).await.expect("history").is_empty());
}

#[tokio::test]
async fn unknown_user_and_failed_conversion_are_reported() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr"))]).await;

    let ghost = w.service.create_expense(&actor("ghost", UserRole::Employee), request(10, "USD"), "req").await;
    assert!(matches!(ghost, Err(ApplicationError::NotFound { entity: "user", .. })));

    let yen = w.service.create_expense(&actor("emp", UserRole::Employee), request(10, "JPY"), "req").await;
    assert!(matches!(yen, Err(ApplicationError::Integration(message)) if message.starts_with("failed to convert currency")));

    let negative = w.service.create_expense(&actor("emp", UserRole::Employee), request(-5, "USD"), "req").await;
    assert!(matches!(negative, Err(ApplicationError::Domain(DomainError::Validation(_)))));
}

#[tokio::test]
async fn broken_rule_leaves_expense_pending_and_is_audited() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr"))]).await;
    seed_rule(&w.repos, RulePolicy::SpecificApprover { approver: None }).await;

    let expense = w
        .service
        .create_expense(&actor("emp", UserRole::Employee), request(75, "USD"), "req-9")
        .await
        .expect("creation survives approval setup failure");

    assert_eq!(expense.status, ExpenseStatus::Pending);
    assert!(w.service.engine().approval_history(&expense.id).await.expect("history").is_empty());
    let failures = w.audit.events_of_type("approval.initialization_failed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].correlation_id, "req-9");
}

#[tokio::test]
async fn ocr_submission_prefills_the_request() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr"))]).await;

    let ocr = OcrResult {
        amount: Some(Decimal::from(18)),
        merchant: Some("Blue Bottle".to_string()),
        category: Some("coffee".to_string()),
        ..OcrResult::default()
    };
    let expense = w
        .service
        .create_expense_from_ocr(&actor("emp", UserRole::Employee), &ocr, "req")
        .await
        .expect("create from ocr");

    assert_eq!(expense.currency, "USD");
    assert_eq!(expense.category, ExpenseCategory::Other);
    assert_eq!(expense.description, "Auto-extracted from receipt: Blue Bottle");

    let missing_amount =
        w.service.create_expense_from_ocr(&actor("emp", UserRole::Employee), &OcrResult::default(), "req").await;
    assert!(matches!(missing_amount, Err(ApplicationError::Domain(DomainError::Validation(_)))));
}

#[tokio::test]
async fn edits_and_deletes_stop_once_resolved() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr")), ("mgr", UserRole::Manager, None)]).await;
    let employee = actor("emp", UserRole::Employee);

    let expense = w.service.create_expense(&employee, request(100, "USD"), "req").await.expect("create");
    let updated = w
        .service
        .update_expense(&employee, &expense.id, request(120, "EUR"), "req")
        .await
        .expect("update while pending");
    assert_eq!(updated.converted_amount, Decimal::from(132));
    assert_eq!(updated.status, ExpenseStatus::Pending);

    let stranger = w
        .service
        .update_expense(&actor("mgr", UserRole::Manager), &expense.id, request(1, "USD"), "req")
        .await;
    assert!(matches!(stranger, Err(ApplicationError::Forbidden(_))));

    w.service
        .engine()
        .decide(&expense.id, &UserId("mgr".to_string()), ApprovalAction::Approve, None, "req")
        .await
        .expect("approve");

    let late_update = w.service.update_expense(&employee, &expense.id, request(1, "USD"), "req").await;
    assert_eq!(
        late_update,
        Err(ApplicationError::Conflict("cannot update expense that is already approved".to_string()))
    );
    let late_delete = w.service.delete_expense(&employee, &expense.id, "req").await;
    assert_eq!(
        late_delete,
        Err(ApplicationError::Conflict("cannot delete expense that is already approved".to_string()))
    );

    let history = w.service.engine().approval_history(&expense.id).await.expect("history");
    assert_eq!(history[0].status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn pending_delete_keeps_approval_rows() {
    let w = world(Repositories::in_memory());
    seed(&w.repos, &[("emp", UserRole::Employee, Some("mgr"))]).await;
    let employee = actor("emp", UserRole::Employee);

    let expense = w.service.create_expense(&employee, request(30, "USD"), "req").await.expect("create");
    w.service.delete_expense(&employee, &expense.id, "req").await.expect("delete");

    let lookup = w.service.get_expense(&employee, &expense.id).await;
    assert!(matches!(lookup, Err(ApplicationError::NotFound { entity: "expense", .. })));
    let rows = w
        .repos
        .approvals
        .list_for_expense(&expense.id)
        .await
        .expect("approval rows");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn listings_are_scoped_by_role_and_refreshed_on_write() {
    let w = world(Repositories::in_memory());
    seed(
        &w.repos,
        &[
            ("emp", UserRole::Employee, Some("mgr")),
            ("other", UserRole::Employee, Some("mgr")),
            ("mgr", UserRole::Manager, None),
        ],
    )
    .await;
    let employee = actor("emp", UserRole::Employee);
    let manager = actor("mgr", UserRole::Manager);

    w.service.create_expense(&employee, request(10, "USD"), "req").await.expect("create");
    w.service.create_expense(&actor("other", UserRole::Employee), request(20, "USD"), "req").await.expect("create");

    let own = w.service.list_for_actor(&employee, Page::default()).await.expect("own listing");
    assert_eq!(own.total, 1);
    let company = w.service.list_for_actor(&manager, Page::default()).await.expect("company listing");
    assert_eq!(company.total, 2);

    w.service.create_expense(&employee, request(30, "USD"), "req").await.expect("create");
    let refreshed = w.service.list_for_actor(&employee, Page::default()).await.expect("own listing");
    assert_eq!(refreshed.total, 2);

    let pending = w.service.pending_expenses_for_company(&company_id()).await.expect("pending");
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].amount, Decimal::from(30));

    let other_user = w.service.get_expense(&employee, &pending[1].id).await;
    assert!(matches!(other_user, Err(ApplicationError::Forbidden(_))));
}

#[tokio::test]
async fn sequential_round_trip_against_sqlite() {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    let w = world(Repositories::sql(pool));
    seed(&w.repos, &[("emp", UserRole::Employee, None)]).await;
    seed_rule(
        &w.repos,
        RulePolicy::Sequential {
            approvers: vec![UserId("m1".to_string()), UserId("m2".to_string()), UserId("m3".to_string())],
        },
    )
    .await;

    let expense = w
        .service
        .create_expense(&actor("emp", UserRole::Employee), request(500, "EUR"), "req")
        .await
        .expect("create");
    for approver in ["m1", "m2", "m3"] {
        w.service
            .engine()
            .decide(&expense.id, &UserId(approver.to_string()), ApprovalAction::Approve, None, "req")
            .await
            .expect("approve");
    }

    let stored = w.service.get_expense(&actor("emp", UserRole::Employee), &expense.id).await.expect("get");
    assert_eq!(stored.status, ExpenseStatus::Approved);
    assert_eq!(stored.current_approval_level, 2);
    let history = w.service.engine().approval_history(&expense.id).await.expect("history");
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|row| row.status == ApprovalStatus::Approved));
}
