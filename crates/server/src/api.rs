//! JSON API over the expense and approval workflow.
//!
//! Endpoints (all under `/api/v1`, identity supplied by the upstream gateway via
//! `x-user-id`, `x-user-role` and `x-company-id`):
//! - `POST   /expenses`                       : submit an expense
//! - `GET    /expenses`                       : list (own, or company-wide for reviewers)
//! - `GET    /expenses/pending`               : pending expenses of the company (reviewers)
//! - `POST   /expenses/ocr`                   : submit from extracted receipt fields
//! - `GET    /expenses/{id}`                  : fetch one expense
//! - `PUT    /expenses/{id}`                  : edit while pending
//! - `DELETE /expenses/{id}`                  : delete while pending
//! - `GET    /approvals/pending`              : caller's pending approvals (reviewers)
//! - `POST   /approvals/{expense_id}/approve` : approve (reviewers)
//! - `POST   /approvals/{expense_id}/reject`  : reject (reviewers)
//! - `GET    /approvals/history/{expense_id}` : approval history of an expense
//! - `PUT    /approval-rule`                  : replace the company rule (admin)

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use expensio_core::domain::approval::{Approval, ApprovalAction};
use expensio_core::domain::expense::{CreateExpenseRequest, Expense, ExpenseId};
use expensio_core::domain::ocr::OcrResult;
use expensio_core::domain::rule::{ApprovalRule, RulePolicy};
use expensio_core::domain::user::{Actor, CompanyId, UserId, UserRole};
use expensio_core::errors::{ApplicationError, InterfaceError};
use expensio_db::Page;
use expensio_workflow::{ExpensePage, ExpenseService, RuleService};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const COMPANY_ID_HEADER: &str = "x-company-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub expenses: Arc<ExpenseService>,
    pub rules: Arc<RuleService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/expenses", post(create_expense).get(list_expenses))
        .route("/api/v1/expenses/pending", get(pending_expenses))
        .route("/api/v1/expenses/ocr", post(create_expense_from_ocr))
        .route(
            "/api/v1/expenses/{id}",
            get(get_expense).put(update_expense).delete(delete_expense),
        )
        .route("/api/v1/approvals/pending", get(pending_approvals))
        .route("/api/v1/approvals/{expense_id}/approve", post(approve_expense))
        .route("/api/v1/approvals/{expense_id}/reject", post(reject_expense))
        .route("/api/v1/approvals/history/{expense_id}", get(approval_history))
        .route("/api/v1/approval-rule", put(save_rule))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Envelope and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    fn data(data: T) -> Json<Self> {
        Json(Self { success: true, data: Some(data), message: None })
    }
}

impl Envelope<()> {
    fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self { success: true, data: None, message: Some(message.into()) })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    correlation_id: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    fn forbidden(correlation_id: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "insufficient permissions".to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self::from(error.into_interface(correlation_id))
    }
}

impl From<InterfaceError> for ApiError {
    fn from(error: InterfaceError) -> Self {
        let status = match &error {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %error.correlation_id(),
                error = %error,
                "request failed on a dependency"
            );
        }
        Self {
            status,
            message: error.user_message().to_string(),
            correlation_id: error.correlation_id().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            message: self.message,
            correlation_id: self.correlation_id,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Caller identity as asserted by the upstream identity layer.
#[derive(Clone, Debug)]
pub struct Authenticated {
    pub actor: Actor,
    pub correlation_id: String,
}

impl Authenticated {
    fn require_reviewer(&self) -> ApiResult<()> {
        if self.actor.role.can_review() {
            Ok(())
        } else {
            Err(ApiError::forbidden(&self.correlation_id))
        }
    }

    fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError::from_application(error, &self.correlation_id)
    }
}

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let correlation_id =
            header(CORRELATION_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
        let (Some(user_id), Some(role), Some(company_id)) =
            (header(USER_ID_HEADER), header(USER_ROLE_HEADER), header(COMPANY_ID_HEADER))
        else {
            return Err(ApiError::unauthorized("authentication required", &correlation_id));
        };
        let role = role.parse::<UserRole>().map_err(|reason| {
            warn!(event_name = "api.auth.invalid_role", correlation_id = %correlation_id, reason = %reason, "rejecting request");
            ApiError::unauthorized("invalid identity", &correlation_id)
        })?;

        Ok(Self {
            actor: Actor::new(UserId(user_id), role, CompanyId(company_id)),
            correlation_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    fn page(&self) -> Page {
        let default = Page::default();
        Page::new(self.page.unwrap_or(default.page), self.limit.unwrap_or(default.limit))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaveRuleRequest {
    pub name: String,
    pub policy: RulePolicy,
}

// ---------------------------------------------------------------------------
// Expense handlers
// ---------------------------------------------------------------------------

async fn create_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Json(request): Json<CreateExpenseRequest>,
) -> ApiResult<(StatusCode, Json<Envelope<Expense>>)> {
    let expense = state
        .expenses
        .create_expense(&auth.actor, request, &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok((StatusCode::CREATED, Envelope::data(expense)))
}

async fn create_expense_from_ocr(
    State(state): State<ApiState>,
    auth: Authenticated,
    Json(ocr): Json<OcrResult>,
) -> ApiResult<(StatusCode, Json<Envelope<Expense>>)> {
    let expense = state
        .expenses
        .create_expense_from_ocr(&auth.actor, &ocr, &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok((StatusCode::CREATED, Envelope::data(expense)))
}

async fn list_expenses(
    State(state): State<ApiState>,
    auth: Authenticated,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Envelope<ExpensePage>>> {
    let listing = state
        .expenses
        .list_for_actor(&auth.actor, query.page())
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(listing))
}

async fn pending_expenses(
    State(state): State<ApiState>,
    auth: Authenticated,
) -> ApiResult<Json<Envelope<Vec<Expense>>>> {
    auth.require_reviewer()?;
    let pending = state
        .expenses
        .pending_expenses_for_company(&auth.actor.company_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(pending))
}

async fn get_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Expense>>> {
    let expense = state
        .expenses
        .get_expense(&auth.actor, &ExpenseId(id))
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(expense))
}

async fn update_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(id): Path<String>,
    Json(request): Json<CreateExpenseRequest>,
) -> ApiResult<Json<Envelope<Expense>>> {
    let expense = state
        .expenses
        .update_expense(&auth.actor, &ExpenseId(id), request, &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(expense))
}

async fn delete_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<()>>> {
    state
        .expenses
        .delete_expense(&auth.actor, &ExpenseId(id), &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::message("Expense deleted successfully"))
}

// ---------------------------------------------------------------------------
// Approval handlers
// ---------------------------------------------------------------------------

async fn pending_approvals(
    State(state): State<ApiState>,
    auth: Authenticated,
) -> ApiResult<Json<Envelope<Vec<Approval>>>> {
    auth.require_reviewer()?;
    let approvals = state
        .expenses
        .engine()
        .pending_approvals_for_approver(&auth.actor.user_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(approvals))
}

async fn approve_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(expense_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Envelope<()>>> {
    decide(&state, &auth, expense_id, ApprovalAction::Approve, decision_comments(&body)).await?;
    Ok(Envelope::message("Expense approved successfully"))
}

async fn reject_expense(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(expense_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Envelope<()>>> {
    decide(&state, &auth, expense_id, ApprovalAction::Reject, decision_comments(&body)).await?;
    Ok(Envelope::message("Expense rejected successfully"))
}

/// The decision body is optional. An empty or unreadable body carries no comments.
fn decision_comments(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<DecisionRequest>(body)
        .ok()
        .and_then(|request| request.comments)
        .filter(|comments| !comments.trim().is_empty())
}

async fn decide(
    state: &ApiState,
    auth: &Authenticated,
    expense_id: String,
    action: ApprovalAction,
    comments: Option<String>,
) -> ApiResult<()> {
    auth.require_reviewer()?;
    state
        .expenses
        .engine()
        .decide(&ExpenseId(expense_id), &auth.actor.user_id, action, comments, &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(())
}

async fn approval_history(
    State(state): State<ApiState>,
    auth: Authenticated,
    Path(expense_id): Path<String>,
) -> ApiResult<Json<Envelope<Vec<Approval>>>> {
    let expense_id = ExpenseId(expense_id);
    state.expenses.get_expense(&auth.actor, &expense_id).await.map_err(|error| auth.fail(error))?;
    let history = state
        .expenses
        .engine()
        .approval_history(&expense_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(history))
}

async fn save_rule(
    State(state): State<ApiState>,
    auth: Authenticated,
    Json(request): Json<SaveRuleRequest>,
) -> ApiResult<Json<Envelope<ApprovalRule>>> {
    if auth.actor.role != UserRole::Admin {
        return Err(ApiError::forbidden(&auth.correlation_id));
    }
    let rule = state
        .rules
        .save_rule(&auth.actor, &request.name, request.policy, &auth.correlation_id)
        .await
        .map_err(|error| auth.fail(error))?;
    Ok(Envelope::data(rule))
}
