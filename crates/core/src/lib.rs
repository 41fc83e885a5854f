pub mod approvals;
pub mod audit;
pub mod cache;
pub mod config;
pub mod currency;
pub mod domain;
pub mod errors;

pub use approvals::{actionable_approval, is_satisfied, plan_approvals, ApprovalPlan, Ineligibility};
pub use cache::{Cache, CacheError, InMemoryCache};
pub use currency::{Conversion, ConversionError, CurrencyConverter, StaticRateConverter};
pub use domain::approval::{Approval, ApprovalAction, ApprovalId, ApprovalStatus};
pub use domain::expense::{
    CreateExpenseRequest, Expense, ExpenseCategory, ExpenseId, ExpenseStatus,
};
pub use domain::ocr::OcrResult;
pub use domain::rule::{ApprovalRule, PlannedApproval, RuleId, RulePolicy};
pub use domain::user::{Actor, Company, CompanyId, User, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
