//! Rule-driven planning and evaluation of expense approvals.
//!
//! Both entry points dispatch over the company's optional [`ApprovalRule`]. When a
//! company has no active rule the submitter's manager is the single approver, and
//! a submitter without a manager is approved on the spot.

use serde::{Deserialize, Serialize};

use crate::domain::approval::{Approval, ApprovalStatus};
use crate::domain::expense::Expense;
use crate::domain::rule::{all_approved, ApprovalRule, PlannedApproval};
use crate::domain::user::UserId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalPlan {
    /// No rule and no manager: the expense resolves without approval rows.
    AutoApprove,
    Approvers { approvals: Vec<PlannedApproval> },
}

/// Decides which approval rows a new expense needs.
pub fn plan_approvals(
    rule: Option<&ApprovalRule>,
    submitter_manager: Option<&UserId>,
) -> Result<ApprovalPlan, DomainError> {
    if let Some(rule) = rule {
        return Ok(ApprovalPlan::Approvers { approvals: rule.policy.materialize()? });
    }

    Ok(match submitter_manager {
        Some(manager) => ApprovalPlan::Approvers {
            approvals: vec![PlannedApproval { approver_id: manager.clone(), level: 1 }],
        },
        None => ApprovalPlan::AutoApprove,
    })
}

/// Whether the current approval set resolves the expense as approved.
pub fn is_satisfied(rule: Option<&ApprovalRule>, approvals: &[Approval]) -> bool {
    match rule {
        Some(rule) => rule.policy.is_satisfied(approvals),
        None => all_approved(approvals),
    }
}

/// Why a caller may not act on an expense right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ineligibility {
    NoPendingApproval,
    OutOfSequence { level: u32, expected: u32 },
}

impl Ineligibility {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoPendingApproval => "no pending approval found for this user",
            Self::OutOfSequence { .. } => "approval is out of sequence",
        }
    }
}

/// Finds the caller's actionable approval row.
///
/// With `enforce_order` set and a sequential rule, the row must sit at
/// `current_approval_level + 1`.
pub fn actionable_approval<'a>(
    expense: &Expense,
    approvals: &'a [Approval],
    approver: &UserId,
    rule: Option<&ApprovalRule>,
    enforce_order: bool,
) -> Result<&'a Approval, Ineligibility> {
    let approval = approvals
        .iter()
        .find(|approval| &approval.approver_id == approver && approval.status == ApprovalStatus::Pending)
        .ok_or(Ineligibility::NoPendingApproval)?;

    let sequential = rule.map(|rule| rule.policy.is_sequential()).unwrap_or(false);
    if enforce_order && sequential {
        let expected = expense.current_approval_level + 1;
        if approval.level != expected {
            return Err(Ineligibility::OutOfSequence { level: approval.level, expected });
        }
    }

    Ok(approval)
}
