use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::user::{CompanyId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl std::fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExpenseStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(DomainError::Validation(format!("unknown expense status `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    Travel,
    Meals,
    Accommodation,
    Transport,
    Supplies,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Travel => "travel",
            Self::Meals => "meals",
            Self::Accommodation => "accommodation",
            Self::Transport => "transport",
            Self::Supplies => "supplies",
            Self::Other => "other",
        }
    }

    /// Lenient mapping used for machine-extracted categories.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "travel" => Self::Travel,
            "meals" => Self::Meals,
            "accommodation" => Self::Accommodation,
            "transport" => Self::Transport,
            "supplies" => Self::Supplies,
            _ => Self::Other,
        }
    }
}

impl std::str::FromStr for ExpenseCategory {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "travel" => Ok(Self::Travel),
            "meals" => Ok(Self::Meals),
            "accommodation" => Ok(Self::Accommodation),
            "transport" => Ok(Self::Transport),
            "supplies" => Ok(Self::Supplies),
            "other" => Ok(Self::Other),
            other => Err(DomainError::Validation(format!("unknown expense category `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub amount: Decimal,
    pub currency: String,
    /// Amount in the company base currency.
    pub converted_amount: Decimal,
    pub exchange_rate: Decimal,
    pub category: ExpenseCategory,
    pub description: String,
    pub expense_date: DateTime<Utc>,
    pub receipt_url: Option<String>,
    pub merchant: Option<String>,
    pub status: ExpenseStatus,
    pub current_approval_level: u32,
    /// Optimistic concurrency token, bumped on every persisted write.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn is_pending(&self) -> bool {
        self.status == ExpenseStatus::Pending
    }

    pub fn can_transition_to(&self, next: ExpenseStatus) -> bool {
        matches!(
            (self.status, next),
            (ExpenseStatus::Pending, ExpenseStatus::Approved)
                | (ExpenseStatus::Pending, ExpenseStatus::Rejected)
        )
    }

    pub fn transition_to(&mut self, next: ExpenseStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            self.updated_at = Utc::now();
            return Ok(());
        }

        Err(DomainError::InvalidExpenseTransition { from: self.status, to: next })
    }

    /// Advisory progress counter; it never gates who may act next.
    pub fn advance_level(&mut self) -> Result<(), DomainError> {
        if !self.is_pending() {
            return Err(DomainError::InvariantViolation(format!(
                "cannot advance approval level of {} expense",
                self.status
            )));
        }
        self.current_approval_level += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Guard used by edits and deletes, which are only allowed while pending.
    pub fn ensure_editable(&self) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::AlreadyResolved { status: self.status });
        }
        Ok(())
    }
}

/// Caller-supplied fields for a new or edited expense.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateExpenseRequest {
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub expense_date: DateTime<Utc>,
    #[serde(default)]
    pub receipt_url: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
}

impl CreateExpenseRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.amount <= Decimal::ZERO {
            return Err(DomainError::Validation("amount must be greater than zero".to_string()));
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return Err(DomainError::Validation(format!(
                "currency `{}` is not an ISO 4217 code",
                self.currency
            )));
        }
        Ok(())
    }

    pub fn normalized_currency(&self) -> String {
        self.currency.trim().to_ascii_uppercase()
    }
}
