pub mod cache;
pub mod engine;
pub mod expenses;
pub mod locks;
pub mod rules;

use expensio_core::errors::ApplicationError;
use expensio_db::RepositoryError;

pub use cache::{CacheTtls, ReadThrough};
pub use engine::{DecisionOutcome, WorkflowEngine, WorkflowSettings};
pub use expenses::{ExpensePage, ExpenseService};
pub use locks::{ExpenseGuard, ExpenseLocks, LockTimeout};
pub use rules::RuleService;

pub(crate) fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}
