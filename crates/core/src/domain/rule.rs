use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::Approval;
use crate::domain::user::{CompanyId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub company_id: CompanyId,
    pub name: String,
    pub policy: RulePolicy,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a company decides that an expense is approved.
///
/// Each variant carries only the fields it reads. Absent optional fields disable
/// the matching satisfaction path instead of failing evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulePolicy {
    Sequential {
        approvers: Vec<UserId>,
    },
    Percentage {
        allowed_approvers: Vec<UserId>,
        #[serde(default)]
        percentage_required: Option<Decimal>,
    },
    SpecificApprover {
        #[serde(default)]
        approver: Option<UserId>,
    },
    Hybrid {
        #[serde(default)]
        sequential_approvers: Vec<UserId>,
        #[serde(default)]
        allowed_approvers: Vec<UserId>,
        #[serde(default)]
        specific_approver: Option<UserId>,
        #[serde(default)]
        percentage_required: Option<Decimal>,
    },
}

/// One approval row to be created when an expense enters the workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedApproval {
    pub approver_id: UserId,
    pub level: u32,
}

impl RulePolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sequential { .. } => "sequential",
            Self::Percentage { .. } => "percentage",
            Self::SpecificApprover { .. } => "specific_approver",
            Self::Hybrid { .. } => "hybrid",
        }
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::Sequential { .. })
    }

    /// Checks the shape an administrator may store. Missing optional fields are
    /// allowed; out-of-range thresholds are not.
    pub fn validate(&self) -> Result<(), DomainError> {
        let threshold = match self {
            Self::Percentage { percentage_required, .. }
            | Self::Hybrid { percentage_required, .. } => *percentage_required,
            _ => None,
        };
        if let Some(threshold) = threshold {
            if threshold < Decimal::ZERO || threshold > Decimal::ONE_HUNDRED {
                return Err(DomainError::Validation(format!(
                    "percentage_required {threshold} must be between 0 and 100"
                )));
            }
        }
        Ok(())
    }

    /// Approval rows to create for a new expense, levels numbered from 1.
    pub fn materialize(&self) -> Result<Vec<PlannedApproval>, DomainError> {
        let planned = match self {
            Self::Sequential { approvers } => number_from(1, approvers),
            Self::Percentage { allowed_approvers, .. } => number_from(1, allowed_approvers),
            Self::SpecificApprover { approver } => {
                let Some(approver) = approver else {
                    return Err(DomainError::RuleConfiguration(
                        "specific approver not configured".to_string(),
                    ));
                };
                number_from(1, std::slice::from_ref(approver))
            }
            Self::Hybrid {
                sequential_approvers,
                allowed_approvers,
                specific_approver,
                ..
            } => {
                let mut planned = number_from(1, sequential_approvers);
                let next = planned.len() as u32 + 1;
                planned.extend(number_from(next, allowed_approvers));

                if let Some(specific) = specific_approver {
                    if !planned.iter().any(|row| &row.approver_id == specific) {
                        let next = planned.len() as u32 + 1;
                        planned.push(PlannedApproval { approver_id: specific.clone(), level: next });
                    }
                }
                planned
            }
        };

        if planned.is_empty() {
            return Err(DomainError::RuleConfiguration(format!(
                "{} rule has no approvers configured",
                self.kind()
            )));
        }
        Ok(planned)
    }

    /// Whether the approval set, after an approve action, resolves the expense.
    pub fn is_satisfied(&self, approvals: &[Approval]) -> bool {
        match self {
            Self::Sequential { .. } => all_approved(approvals),
            Self::Percentage { percentage_required, .. } => {
                percentage_met(approvals, *percentage_required)
            }
            Self::SpecificApprover { approver } => specific_approved(approvals, approver.as_ref()),
            Self::Hybrid { specific_approver, percentage_required, .. } => {
                specific_approved(approvals, specific_approver.as_ref())
                    || percentage_met(approvals, *percentage_required)
                    || all_approved(approvals)
            }
        }
    }
}

/// Satisfaction used when the company has no active rule.
pub fn all_approved(approvals: &[Approval]) -> bool {
    !approvals.is_empty() && approvals.iter().all(Approval::is_approved)
}

fn percentage_met(approvals: &[Approval], required: Option<Decimal>) -> bool {
    let Some(required) = required else {
        return false;
    };
    if approvals.is_empty() {
        return false;
    }

    let approved = approvals.iter().filter(|approval| approval.is_approved()).count();
    // approved / total * 100 >= required, kept free of division
    Decimal::from(approved) * Decimal::ONE_HUNDRED >= required * Decimal::from(approvals.len())
}

fn specific_approved(approvals: &[Approval], approver: Option<&UserId>) -> bool {
    let Some(approver) = approver else {
        return false;
    };
    approvals.iter().any(|approval| &approval.approver_id == approver && approval.is_approved())
}

fn number_from(first_level: u32, approvers: &[UserId]) -> Vec<PlannedApproval> {
    approvers
        .iter()
        .zip(first_level..)
        .map(|(approver_id, level)| PlannedApproval { approver_id: approver_id.clone(), level })
        .collect()
}
