//! Approval decision routes.
//!
//! HTML Endpoints:
//! - `GET  /approvals/respond?token=..&decision=approve|reject&remarks=..` — email link
//!
//! JSON API Endpoints (Bearer API key):
//! - `POST /api/v1/requests/{id}/decision`   — portal decision
//! - `POST /api/v1/requests/{id}/route`      — route a submitted request
//! - `POST /api/v1/requests/{id}/reissue`    — send a fresh link for a pending request
//! - `GET  /api/v1/requests/{id}/approvers`  — union candidates from the matrix
//! - `GET  /api/v1/admin/matrix`             — current approval matrix
//! - `PUT  /api/v1/admin/matrix`             — replace the rule list

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use lendroute_core::approvals::{CascadeTier, ResolvedApprover};
use lendroute_core::domain::approver::{Approver, UserRole};
use lendroute_core::domain::request::{RequestId, RequestRecord, RequestStatus};
use lendroute_core::domain::rule::{ApprovalMatrix, ApprovalRule};
use lendroute_core::errors::{InterfaceError, InterfaceErrorKind};
use lendroute_core::matrix::{MatrixError, RuleViolation};
use lendroute_core::workflow::{ApprovalWorkflow, DecisionChannel, RoutedRequest, WorkflowError};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthManager, AuthResult};

const RESPOND_TEMPLATE: &str = "approvals/respond.html";

#[derive(Clone)]
pub struct ApprovalsState {
    workflow: Arc<ApprovalWorkflow>,
    auth: AuthManager,
    templates: Arc<Tera>,
}

impl ApprovalsState {
    pub fn new(workflow: Arc<ApprovalWorkflow>, auth: AuthManager) -> Self {
        Self { workflow, auth, templates: init_templates() }
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RespondQuery {
    pub token: Option<String>,
    pub decision: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approved: bool,
    pub remarks: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub channel: DecisionChannel,
    pub decided_by: Option<String>,
    pub overrode_routed_approver: bool,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub approver_id: String,
    pub approver_name: String,
    pub required_grade: u8,
    pub tier: CascadeTier,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl From<RoutedRequest> for RouteResponse {
    fn from(routed: RoutedRequest) -> Self {
        Self {
            request_id: routed.record.id,
            status: routed.record.status,
            approver_id: routed.assignment.approver.id,
            approver_name: routed.assignment.approver.name,
            required_grade: routed.assignment.required_grade,
            tier: routed.assignment.tier,
            token_expires_at: routed.record.approval_token_expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CandidatesResponse {
    pub request_id: RequestId,
    pub approvers: Vec<ResolvedApprover>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceMatrixRequest {
    pub rules: Vec<ApprovalRule>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RuleViolation>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn unauthorized(reason: &str, correlation_id: String) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ApiErrorBody { error: reason.to_owned(), correlation_id, violations: Vec::new() },
        }
    }

    fn invalid_matrix(violations: Vec<RuleViolation>, correlation_id: String) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: ApiErrorBody {
                error: "approval matrix rejected".to_owned(),
                correlation_id,
                violations,
            },
        }
    }
}

impl From<InterfaceError> for ApiError {
    fn from(value: InterfaceError) -> Self {
        if value.is_server_fault() {
            error!(
                event_name = "http.request.failed",
                correlation_id = %value.correlation_id,
                error = %value,
                "request failed"
            );
        }
        Self {
            status: status_for(&value),
            body: ApiErrorBody {
                error: value.user_message().to_owned(),
                correlation_id: value.correlation_id,
                violations: Vec::new(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_for(error: &InterfaceError) -> StatusCode {
    match error.kind {
        InterfaceErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        InterfaceErrorKind::Forbidden => StatusCode::FORBIDDEN,
        InterfaceErrorKind::NotFound => StatusCode::NOT_FOUND,
        InterfaceErrorKind::Conflict => StatusCode::CONFLICT,
        InterfaceErrorKind::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
        InterfaceErrorKind::LinkInvalid => StatusCode::GONE,
        InterfaceErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn init_templates() -> Arc<Tera> {
    let mut tera = Tera::default();
    if let Err(error) = tera.add_raw_template(
        RESPOND_TEMPLATE,
        include_str!("../../../templates/approvals/respond.html"),
    ) {
        warn!(error = %error, "failed to load approval page template; using plain fallback");
    }
    Arc::new(tera)
}

pub fn router(state: ApprovalsState) -> Router {
    Router::new()
        // HTML routes
        .route("/approvals/respond", get(respond))
        // JSON API routes
        .route("/api/v1/requests/{id}/decision", post(decide_request))
        .route("/api/v1/requests/{id}/route", post(route_request))
        .route("/api/v1/requests/{id}/reissue", post(reissue_link))
        .route("/api/v1/requests/{id}/approvers", get(list_candidates))
        .route("/api/v1/admin/matrix", get(get_matrix).put(replace_matrix))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// HTML Handlers
// ---------------------------------------------------------------------------

struct Page<'a> {
    title: &'a str,
    message: &'a str,
    request: Option<&'a RequestRecord>,
    token: Option<&'a str>,
    correlation_id: Option<&'a str>,
}

impl<'a> Page<'a> {
    fn new(title: &'a str, message: &'a str) -> Self {
        Self { title, message, request: None, token: None, correlation_id: None }
    }
}

fn render(templates: &Tera, status: StatusCode, page: Page<'_>) -> (StatusCode, Html<String>) {
    let mut context = Context::new();
    context.insert("title", page.title);
    context.insert("message", page.message);
    context.insert("request", &page.request);
    context.insert("token", page.token.unwrap_or_default());
    context.insert("correlation_id", page.correlation_id.unwrap_or_default());

    match templates.render(RESPOND_TEMPLATE, &context) {
        Ok(html) => (status, Html(html)),
        Err(error) => {
            error!(error = %error, "approval page render failed");
            (status, Html(format!("<h1>{}</h1><p>{}</p>", page.title, page.message)))
        }
    }
}

fn failure_page(templates: &Tera, error: WorkflowError) -> (StatusCode, Html<String>) {
    let interface = error.into_interface(correlation_id());
    let title = match interface.kind {
        InterfaceErrorKind::LinkInvalid => "Link no longer valid",
        _ => "Request could not be processed",
    };
    let page = Page {
        correlation_id: Some(interface.correlation_id.as_str()),
        ..Page::new(title, interface.user_message())
    };
    render(templates, status_for(&interface), page)
}

/// Email-link entry point. Without a `decision` it shows the pending request
/// and the two choices; with one it records the decision.
async fn respond(
    State(state): State<ApprovalsState>,
    Query(query): Query<RespondQuery>,
) -> (StatusCode, Html<String>) {
    let Some(token) = non_blank(query.token) else {
        return failure_page(&state.templates, WorkflowError::InvalidToken);
    };

    let approved = match non_blank(query.decision).as_deref() {
        None => {
            return match state.workflow.inspect_token(&token).await {
                Ok(record) => render(&state.templates, StatusCode::OK, Page {
                    request: Some(&record),
                    token: Some(&token),
                    ..Page::new(
                        "Loan approval",
                        "Review the request below and record your decision.",
                    )
                }),
                Err(error) => failure_page(&state.templates, error),
            };
        }
        Some("approve") => true,
        Some("reject") => false,
        Some(_) => {
            return render(
                &state.templates,
                StatusCode::BAD_REQUEST,
                Page::new("Unrecognised decision", "Choose either approve or reject."),
            );
        }
    };

    match state.workflow.decide_by_token(&token, approved, non_blank(query.remarks)).await {
        Ok(outcome) => {
            let title = if approved { "Request approved" } else { "Request rejected" };
            render(&state.templates, StatusCode::OK, Page {
                request: Some(&outcome.record),
                ..Page::new(title, "Your decision has been recorded and the applicant notified.")
            })
        }
        Err(error) => failure_page(&state.templates, error),
    }
}

// ---------------------------------------------------------------------------
// JSON API Handlers
// ---------------------------------------------------------------------------

async fn authenticate(
    state: &ApprovalsState,
    headers: &HeaderMap,
    correlation_id: &str,
) -> Result<Approver, ApiError> {
    let result = state
        .auth
        .authenticate(headers)
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id)))?;

    match result {
        AuthResult::Allowed(user) => Ok(user),
        AuthResult::Denied { reason } => {
            warn!(
                event_name = "http.auth.denied",
                correlation_id = %correlation_id,
                reason = reason,
                "portal request denied"
            );
            Err(ApiError::unauthorized(reason, correlation_id.to_owned()))
        }
    }
}

fn require(
    user: &Approver,
    permitted: fn(&UserRole) -> bool,
    correlation_id: &str,
) -> Result<(), ApiError> {
    if permitted(&user.role) {
        return Ok(());
    }
    Err(ApiError::from(InterfaceError::new(
        InterfaceErrorKind::Forbidden,
        format!("user {} lacks the required role", user.id),
        correlation_id,
    )))
}

async fn decide_request(
    Path(id): Path<String>,
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;

    let outcome = state
        .workflow
        .decide_by_portal(&RequestId(id), &user, body.approved, non_blank(body.remarks))
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id.as_str())))?;

    Ok(Json(DecisionResponse {
        request_id: outcome.record.id.clone(),
        status: outcome.record.status,
        channel: outcome.channel,
        decided_by: outcome.record.approved_by_name.clone(),
        overrode_routed_approver: outcome.overrode_routed_approver,
    }))
}

async fn route_request(
    Path(id): Path<String>,
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
) -> Result<Json<RouteResponse>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;
    require(&user, UserRole::can_decide, &correlation_id)?;

    let routed = state
        .workflow
        .route(&RequestId(id))
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id.as_str())))?;

    info!(
        event_name = "http.request.routed",
        correlation_id = %correlation_id,
        request_id = %routed.record.id,
        routed_by = %user.id,
        "request routed through the portal"
    );

    Ok(Json(RouteResponse::from(routed)))
}

async fn reissue_link(
    Path(id): Path<String>,
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
) -> Result<Json<RouteResponse>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;
    require(&user, UserRole::can_decide, &correlation_id)?;

    let routed = state
        .workflow
        .reissue_link(&RequestId(id))
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id.as_str())))?;

    info!(
        event_name = "http.request.link_reissued",
        correlation_id = %correlation_id,
        request_id = %routed.record.id,
        reissued_by = %user.id,
        "decision link reissued through the portal"
    );

    Ok(Json(RouteResponse::from(routed)))
}

async fn list_candidates(
    Path(id): Path<String>,
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
) -> Result<Json<CandidatesResponse>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;
    require(&user, UserRole::can_decide, &correlation_id)?;

    let request_id = RequestId(id);
    let approvers = state
        .workflow
        .candidate_approvers(&request_id)
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id.as_str())))?;

    Ok(Json(CandidatesResponse { request_id, approvers }))
}

async fn get_matrix(
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
) -> Result<Json<ApprovalMatrix>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;
    require(&user, UserRole::can_manage_matrix, &correlation_id)?;

    let matrix = state
        .workflow
        .matrix()
        .get()
        .await
        .map_err(|error| ApiError::from(error.into_interface(correlation_id.as_str())))?;

    Ok(Json(matrix.as_ref().clone()))
}

async fn replace_matrix(
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
    Json(body): Json<ReplaceMatrixRequest>,
) -> Result<Json<ApprovalMatrix>, ApiError> {
    let correlation_id = correlation_id();
    let user = authenticate(&state, &headers, &correlation_id).await?;
    require(&user, UserRole::can_manage_matrix, &correlation_id)?;

    match state.workflow.matrix().replace(body.rules, &user.id).await {
        Ok(matrix) => Ok(Json(matrix.as_ref().clone())),
        Err(MatrixError::Validation(violations)) => {
            Err(ApiError::invalid_matrix(violations, correlation_id))
        }
        Err(MatrixError::Application(error)) => {
            Err(ApiError::from(error.into_interface(correlation_id)))
        }
    }
}
