//! Approval state machine.
//!
//! A request moves `SUBMITTED -> UNDER_REVIEW -> {APPROVED, REJECTED}`. Routing
//! issues a token bound to the request; a decision arrives either with that
//! token (email link) or from an authenticated approver (portal). Both channels
//! end in the same conditional store write, so whichever commits first wins and
//! every later attempt sees `AlreadyDecided`.

pub mod error;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::approvals::{ApproverAssignment, ApproverResolver, ResolveError, ResolvedApprover};
use crate::domain::approver::Approver;
use crate::domain::request::{
    DecisionGuard, DecisionWrite, RequestId, RequestRecord, RequestStatus, ReviewAssignment,
};
use crate::matrix::ApprovalMatrixStore;
use crate::notify::{NotificationEvent, NotificationPort};
use crate::token::{ApprovalTokenService, TokenVerification, DEFAULT_TOKEN_TTL_HOURS};

pub use error::{DecisionChannel, WorkflowError};
pub use store::{InMemoryRequestStore, RequestStore};

const REQUEST_ID_CLAIM: &str = "request_id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub token_ttl: Duration,
    /// Base URL the email link is built on, without a trailing slash.
    pub public_base_url: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
            public_base_url: "http://127.0.0.1:8080".to_owned(),
        }
    }
}

impl WorkflowSettings {
    /// Tokens use the URL-safe base64 alphabet and go into the query as is.
    pub fn decision_link(&self, token: &str) -> String {
        format!("{}/approvals/respond?token={token}", self.public_base_url.trim_end_matches('/'))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedRequest {
    pub record: RequestRecord,
    pub assignment: ApproverAssignment,
    pub decision_link: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub record: RequestRecord,
    pub channel: DecisionChannel,
    /// True when a portal user decided a request routed to someone else.
    pub overrode_routed_approver: bool,
}

#[derive(Clone, Copy)]
enum Assignment {
    Initial,
    Reissue,
}

#[derive(Clone)]
pub struct ApprovalWorkflow {
    requests: Arc<dyn RequestStore>,
    resolver: ApproverResolver,
    tokens: ApprovalTokenService,
    notifier: Arc<dyn NotificationPort>,
    matrix: Arc<ApprovalMatrixStore>,
    settings: WorkflowSettings,
}

impl ApprovalWorkflow {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        resolver: ApproverResolver,
        tokens: ApprovalTokenService,
        notifier: Arc<dyn NotificationPort>,
        matrix: Arc<ApprovalMatrixStore>,
    ) -> Self {
        Self {
            requests,
            resolver,
            tokens,
            notifier,
            matrix,
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn requests(&self) -> &Arc<dyn RequestStore> {
        &self.requests
    }

    pub fn matrix(&self) -> &Arc<ApprovalMatrixStore> {
        &self.matrix
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Assigns a SUBMITTED request to a single approver found by the grade
    /// cascade, issues its decision token and announces it.
    pub async fn route(&self, request_id: &RequestId) -> Result<RoutedRequest, WorkflowError> {
        let record = self.load(request_id).await?;
        record.status.ensure_transition(RequestStatus::UnderReview).map_err(|_| {
            WorkflowError::InvalidTransition {
                request_id: request_id.clone(),
                from: record.status,
                to: RequestStatus::UnderReview,
            }
        })?;

        self.assign(record, Assignment::Initial).await
    }

    /// Sends a fresh decision link for a request that is still UNDER_REVIEW,
    /// typically after the first one expired. The approver is resolved again
    /// and the previous token stops working in the same write.
    pub async fn reissue_link(
        &self,
        request_id: &RequestId,
    ) -> Result<RoutedRequest, WorkflowError> {
        let record = self.load(request_id).await?;
        if record.status != RequestStatus::UnderReview {
            return Err(WorkflowError::InvalidTransition {
                request_id: request_id.clone(),
                from: record.status,
                to: RequestStatus::UnderReview,
            });
        }

        self.assign(record, Assignment::Reissue).await
    }

    async fn assign(
        &self,
        mut record: RequestRecord,
        kind: Assignment,
    ) -> Result<RoutedRequest, WorkflowError> {
        let request_id = record.id.clone();
        let assignment = self
            .resolver
            .determine_approver(record.applicant_grade, record.total_value)
            .await
            .map_err(|error| match error {
                ResolveError::NoApproverFound { applicant_grade, required_grade } => {
                    WorkflowError::NoApproverFound {
                        request_id: request_id.clone(),
                        applicant_grade,
                        required_grade,
                    }
                }
                ResolveError::Application(error) => WorkflowError::Application(error),
            })?;

        let mut claims = Map::new();
        claims.insert(REQUEST_ID_CLAIM.to_owned(), json!(request_id.0));
        claims.insert("approver_id".to_owned(), json!(assignment.approver.id));
        let issued = self.tokens.issue(claims, self.settings.token_ttl)?;

        let review = ReviewAssignment {
            approver_email: assignment.approver.email.clone(),
            approved_by_name: assignment.approver.name.clone(),
            approval_token: issued.token.clone(),
            approval_token_expires_at: issued.expires_at,
            assigned_at: Utc::now(),
        };
        let written = match kind {
            Assignment::Initial => self.requests.assign_for_review(&request_id, &review).await?,
            Assignment::Reissue => self.requests.reissue_review(&request_id, &review).await?,
        };
        if !written {
            let current = self.load(&request_id).await?;
            warn!(
                event_name = "approval.route.lost_race",
                request_id = %request_id,
                status = current.status.as_str(),
                reissue = matches!(kind, Assignment::Reissue),
                "request changed state while routing"
            );
            return Err(WorkflowError::InvalidTransition {
                request_id,
                from: current.status,
                to: RequestStatus::UnderReview,
            });
        }
        review.apply_to(&mut record);

        match kind {
            Assignment::Initial => info!(
                event_name = "approval.request.routed",
                request_id = %request_id,
                approver_id = %assignment.approver.id,
                required_grade = assignment.required_grade,
                tier = ?assignment.tier,
                expires_at = %issued.expires_at,
                "request routed for approval"
            ),
            Assignment::Reissue => info!(
                event_name = "approval.request.link_reissued",
                request_id = %request_id,
                approver_id = %assignment.approver.id,
                required_grade = assignment.required_grade,
                expires_at = %issued.expires_at,
                "decision link reissued"
            ),
        }

        let decision_link = self.settings.decision_link(&issued.token);
        let mut payload = Map::new();
        payload.insert("request".to_owned(), to_json(&record));
        payload.insert("approver".to_owned(), to_json(&assignment.approver));
        payload.insert("token".to_owned(), json!(issued.token));
        payload.insert("decision_link".to_owned(), json!(decision_link));
        payload.insert("expires_at".to_owned(), json!(issued.expires_at));
        payload.insert("required_grade".to_owned(), json!(assignment.required_grade));
        payload.insert("reissued".to_owned(), json!(matches!(kind, Assignment::Reissue)));
        self.send(NotificationEvent::ApprovalRequested, payload, &request_id).await;

        Ok(RoutedRequest { record, assignment, decision_link })
    }

    /// Decides the request holding exactly this token.
    pub async fn decide_by_token(
        &self,
        token: &str,
        approved: bool,
        remarks: Option<String>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        let now = Utc::now();
        let Some(mut record) = self.requests.find_by_token(token).await? else {
            let error = self.classify_unknown_token(token, now).await?;
            log_rejected(&error, None, DecisionChannel::EmailLink);
            return Err(error);
        };

        let write = DecisionWrite::new(approved, remarks, now);
        if let Err(error) = self.check_token(&record, token, now) {
            log_rejected(&error, Some(&record.id), DecisionChannel::EmailLink);
            return Err(error);
        }
        if let Err(error) = ensure_decidable(&record, write.status, DecisionChannel::EmailLink) {
            log_rejected(&error, Some(&record.id), DecisionChannel::EmailLink);
            return Err(error);
        }

        if !self.requests.apply_decision(&record.id, DecisionGuard::Token(token), &write).await? {
            let error = WorkflowError::AlreadyDecided {
                request_id: record.id.clone(),
                channel: DecisionChannel::EmailLink,
            };
            log_rejected(&error, Some(&record.id), DecisionChannel::EmailLink);
            return Err(error);
        }

        write.apply_to(&mut record);
        self.announce_decision(&record, DecisionChannel::EmailLink).await;
        Ok(DecisionOutcome {
            record,
            channel: DecisionChannel::EmailLink,
            overrode_routed_approver: false,
        })
    }

    /// Pending request a decision link points at, checked exactly as a
    /// decision would be but left untouched.
    pub async fn inspect_token(&self, token: &str) -> Result<RequestRecord, WorkflowError> {
        let now = Utc::now();
        let Some(record) = self.requests.find_by_token(token).await? else {
            return Err(self.classify_unknown_token(token, now).await?);
        };
        self.check_token(&record, token, now)?;
        ensure_decidable(&record, RequestStatus::Approved, DecisionChannel::EmailLink)?;
        Ok(record)
    }

    /// Decides a pending request on behalf of an authenticated user. Any
    /// approver-eligible user may act on any pending request and is recorded
    /// as the decider in place of the routed approver.
    pub async fn decide_by_portal(
        &self,
        request_id: &RequestId,
        acting_user: &Approver,
        approved: bool,
        remarks: Option<String>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        if !acting_user.role.can_decide() {
            let error = WorkflowError::NotAuthorized { user_id: acting_user.id.clone() };
            log_rejected(&error, Some(request_id), DecisionChannel::Portal);
            return Err(error);
        }

        let mut record = self.load(request_id).await?;
        let write = DecisionWrite::new(approved, remarks, Utc::now())
            .decided_by(acting_user.name.clone(), acting_user.email.clone());
        if let Err(error) = ensure_decidable(&record, write.status, DecisionChannel::Portal) {
            log_rejected(&error, Some(request_id), DecisionChannel::Portal);
            return Err(error);
        }

        if !self.requests.apply_decision(request_id, DecisionGuard::Pending, &write).await? {
            let error = WorkflowError::AlreadyDecided {
                request_id: request_id.clone(),
                channel: DecisionChannel::Portal,
            };
            log_rejected(&error, Some(request_id), DecisionChannel::Portal);
            return Err(error);
        }

        let overrode_routed_approver =
            record.approver_email.as_deref().is_some_and(|routed| routed != acting_user.email);
        if overrode_routed_approver {
            info!(
                event_name = "approval.portal.override",
                request_id = %request_id,
                acting_user_id = %acting_user.id,
                "portal decision replaces routed approver"
            );
        }

        write.apply_to(&mut record);
        self.announce_decision(&record, DecisionChannel::Portal).await;
        Ok(DecisionOutcome { record, channel: DecisionChannel::Portal, overrode_routed_approver })
    }

    /// Union of approvers named by every matching rule of the current matrix.
    pub async fn candidate_approvers(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ResolvedApprover>, WorkflowError> {
        let record = self.load(request_id).await?;
        let matrix = self.matrix.get().await?;
        let approvers = self.resolver.approvers_for_request(&matrix, &record.facts()).await?;
        debug!(
            event_name = "approval.candidates.resolved",
            request_id = %request_id,
            matrix_version = matrix.version,
            candidate_count = approvers.len(),
            "candidate approvers resolved"
        );
        Ok(approvers)
    }

    async fn load(&self, request_id: &RequestId) -> Result<RequestRecord, WorkflowError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.clone()))
    }

    fn check_token(
        &self,
        record: &RequestRecord,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let expired = || WorkflowError::ExpiredToken { request_id: record.id.clone() };

        if record.approval_token_expires_at.map_or(true, |expires_at| expires_at < now) {
            return Err(expired());
        }
        match self.tokens.verify_at(token, now) {
            TokenVerification::Valid(claims) => {
                let bound_to = claims.get(REQUEST_ID_CLAIM).and_then(Value::as_str);
                if bound_to == Some(record.id.0.as_str()) {
                    Ok(())
                } else {
                    Err(WorkflowError::InvalidToken)
                }
            }
            TokenVerification::Expired { .. } | TokenVerification::Malformed => Err(expired()),
        }
    }

    /// A token nobody holds is either spent (its request already reached a
    /// terminal state) or was never ours.
    async fn classify_unknown_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkflowError, WorkflowError> {
        let TokenVerification::Valid(claims) = self.tokens.verify_at(token, now) else {
            return Ok(WorkflowError::InvalidToken);
        };
        let Some(request_id) = claims.get(REQUEST_ID_CLAIM).and_then(Value::as_str) else {
            return Ok(WorkflowError::InvalidToken);
        };

        let request_id = RequestId(request_id.to_owned());
        match self.requests.find_by_id(&request_id).await? {
            Some(record) if record.status.is_terminal() => Ok(WorkflowError::AlreadyDecided {
                request_id,
                channel: DecisionChannel::EmailLink,
            }),
            _ => Ok(WorkflowError::InvalidToken),
        }
    }

    /// One notification to the applicant, one to whoever is recorded as the
    /// decider.
    async fn announce_decision(&self, record: &RequestRecord, channel: DecisionChannel) {
        info!(
            event_name = "approval.request.decided",
            request_id = %record.id,
            status = record.status.as_str(),
            channel = channel.as_str(),
            "approval decision recorded"
        );

        let mut decided = Map::new();
        decided.insert("recipient".to_owned(), json!(record.applicant_email));
        decided.insert("request".to_owned(), to_json(record));
        decided.insert("status".to_owned(), json!(record.status));
        decided.insert("channel".to_owned(), json!(channel));
        decided.insert("rejected_reason".to_owned(), json!(record.rejected_reason));
        decided.insert("approval_remarks".to_owned(), json!(record.approval_remarks));
        self.send(NotificationEvent::ApprovalDecided, decided, &record.id).await;

        let mut confirmed = Map::new();
        confirmed.insert("recipient".to_owned(), json!(record.approver_email));
        confirmed.insert("request".to_owned(), to_json(record));
        confirmed.insert("status".to_owned(), json!(record.status));
        confirmed.insert("channel".to_owned(), json!(channel));
        confirmed.insert("decided_by".to_owned(), json!(record.approved_by_name));
        self.send(NotificationEvent::ApprovalConfirmed, confirmed, &record.id).await;
    }

    async fn send(&self, event: NotificationEvent, payload: Map<String, Value>, request_id: &RequestId) {
        match self.notifier.notify(event, payload).await {
            Ok(()) => debug!(
                event_name = "approval.notification.sent",
                request_id = %request_id,
                notification = event.as_str(),
                "notification delivered"
            ),
            Err(error) => warn!(
                event_name = "approval.notification.failed",
                request_id = %request_id,
                notification = event.as_str(),
                error = %error,
                "notification delivery failed; decision stands"
            ),
        }
    }
}

fn ensure_decidable(
    record: &RequestRecord,
    target: RequestStatus,
    channel: DecisionChannel,
) -> Result<(), WorkflowError> {
    if record.status.is_terminal() {
        return Err(WorkflowError::AlreadyDecided { request_id: record.id.clone(), channel });
    }
    record.status.ensure_transition(target).map_err(|_| WorkflowError::InvalidTransition {
        request_id: record.id.clone(),
        from: record.status,
        to: target,
    })
}

fn log_rejected(error: &WorkflowError, request_id: Option<&RequestId>, channel: DecisionChannel) {
    warn!(
        event_name = "approval.decision.rejected",
        request_id = request_id.map(|id| id.0.as_str()).unwrap_or("unknown"),
        channel = channel.as_str(),
        reason = error.kind(),
        "approval decision rejected"
    );
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use secrecy::SecretString;

    use super::{
        ApprovalWorkflow, DecisionChannel, InMemoryRequestStore, RequestStore, WorkflowError,
        WorkflowSettings,
    };
    use crate::approvals::ApproverResolver;
    use crate::directory::InMemoryUserDirectory;
    use crate::domain::approver::{Approver, UserRole};
    use crate::domain::request::{RequestFacts, RequestId, RequestRecord, RequestStatus};
    use crate::matrix::{ApprovalMatrixStore, InMemoryMatrixSource};
    use crate::notify::{InMemoryNotificationPort, NotificationEvent};
    use crate::token::ApprovalTokenService;

    struct Harness {
        workflow: ApprovalWorkflow,
        store: Arc<InMemoryRequestStore>,
        notifier: InMemoryNotificationPort,
    }

    fn user(id: &str, role: UserRole, grade: Option<u8>) -> Approver {
        Approver {
            id: id.to_owned(),
            name: format!("User {id}"),
            email: format!("{id}@lender.test"),
            role,
            grade,
        }
    }

    fn request(id: &str, grade: u8, value: i64) -> RequestRecord {
        RequestRecord::submitted(
            RequestId(id.to_owned()),
            "u-applicant",
            "Ada Applicant",
            "ada@lender.test",
            RequestFacts {
                total_value: Decimal::new(value, 0),
                applicant_grade: grade,
                duration_days: 30,
                asset_categories: vec!["laptop".to_owned()],
            },
            Utc::now(),
        )
    }

    fn harness(users: Vec<Approver>, records: Vec<RequestRecord>) -> Harness {
        harness_with_ttl(users, records, Duration::hours(1))
    }

    fn harness_with_ttl(
        users: Vec<Approver>,
        records: Vec<RequestRecord>,
        token_ttl: Duration,
    ) -> Harness {
        let store = Arc::new(InMemoryRequestStore::with_records(records));
        let notifier = InMemoryNotificationPort::default();
        let secret = SecretString::from("workflow-test-secret-0123456789abcdef".to_owned());
        let tokens = ApprovalTokenService::new(&secret).expect("token service");
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            ApproverResolver::new(Arc::new(InMemoryUserDirectory::with_active(users))),
            tokens,
            Arc::new(notifier.clone()),
            Arc::new(ApprovalMatrixStore::new(Arc::new(InMemoryMatrixSource::default()))),
        )
        .with_settings(WorkflowSettings {
            token_ttl,
            public_base_url: "https://loans.lender.test/".to_owned(),
        });
        Harness { workflow, store, notifier }
    }

    async fn routed_token(workflow: &ApprovalWorkflow, id: &RequestId) -> String {
        let routed = workflow.route(id).await.expect("route");
        routed.record.approval_token.expect("token")
    }

    #[tokio::test]
    async fn route_assigns_cascade_approver_and_announces_link() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);

        let routed = h.workflow.route(&RequestId("LR-1".to_owned())).await.expect("route");

        assert_eq!(routed.record.status, RequestStatus::UnderReview);
        assert_eq!(routed.record.approver_email.as_deref(), Some("u-48@lender.test"));
        assert_eq!(routed.assignment.required_grade, 48);
        let token = routed.record.approval_token.clone().expect("token stored");
        assert_eq!(
            routed.decision_link,
            format!("https://loans.lender.test/approvals/respond?token={token}")
        );
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, NotificationEvent::ApprovalRequested);
        assert_eq!(sent[0].payload["token"], serde_json::json!(token));
        assert!(sent[0].payload["request"].get("approval_token").is_none());
    }

    #[tokio::test]
    async fn route_requires_submitted_status() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        h.workflow.route(&id).await.expect("first route");

        let error = h.workflow.route(&id).await.expect_err("second route");

        assert!(matches!(
            error,
            WorkflowError::InvalidTransition { from: RequestStatus::UnderReview, .. }
        ));
    }

    #[tokio::test]
    async fn route_without_any_approver_leaves_request_submitted() {
        let h = harness(vec![user("u-44", UserRole::Approver, Some(44))], vec![request(
            "LR-1", 44, 25_000,
        )]);
        let id = RequestId("LR-1".to_owned());

        let error = h.workflow.route(&id).await.expect_err("no approver");

        assert!(matches!(error, WorkflowError::NoApproverFound { required_grade: 54, .. }));
        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::Submitted);
        assert!(stored.approval_token.is_none());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn token_decision_approves_and_clears_token() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        let routed = h.workflow.route(&id).await.expect("route");
        let token = routed.record.approval_token.expect("token");

        let outcome = h.workflow.decide_by_token(&token, true, None).await.expect("decide");

        assert_eq!(outcome.record.status, RequestStatus::Approved);
        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::Approved);
        assert!(stored.approval_token.is_none());
        assert!(stored.approval_token_expires_at.is_none());
        assert!(stored.approved_at.is_some());
        assert_eq!(h.notifier.sent_events(), vec![
            NotificationEvent::ApprovalRequested,
            NotificationEvent::ApprovalDecided,
            NotificationEvent::ApprovalConfirmed,
        ]);
    }

    #[tokio::test]
    async fn rejection_by_token_records_remarks() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let routed = h.workflow.route(&RequestId("LR-1".to_owned())).await.expect("route");
        let token = routed.record.approval_token.expect("token");

        let outcome = h
            .workflow
            .decide_by_token(&token, false, Some("collateral missing".to_owned()))
            .await
            .expect("decide");

        assert_eq!(outcome.record.status, RequestStatus::Rejected);
        assert_eq!(outcome.record.rejected_reason.as_deref(), Some("collateral missing"));
        assert!(outcome.record.approved_at.is_none());
    }

    #[tokio::test]
    async fn reused_token_reports_already_decided() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let routed = h.workflow.route(&RequestId("LR-1".to_owned())).await.expect("route");
        let token = routed.record.approval_token.expect("token");
        h.workflow.decide_by_token(&token, true, None).await.expect("first");

        let error = h.workflow.decide_by_token(&token, false, None).await.expect_err("second");

        assert!(matches!(
            error,
            WorkflowError::AlreadyDecided { channel: DecisionChannel::EmailLink, .. }
        ));
    }

    #[tokio::test]
    async fn inspecting_a_link_leaves_the_request_pending() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let routed = h.workflow.route(&RequestId("LR-1".to_owned())).await.expect("route");
        let token = routed.record.approval_token.expect("token");

        let pending = h.workflow.inspect_token(&token).await.expect("inspect");
        assert_eq!(pending.status, RequestStatus::UnderReview);

        h.workflow.decide_by_token(&token, true, None).await.expect("decide");
        let error = h.workflow.inspect_token(&token).await.expect_err("spent");
        assert!(matches!(error, WorkflowError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let h = harness(Vec::new(), Vec::new());

        let error = h.workflow.decide_by_token("bogus", true, None).await.expect_err("invalid");

        assert_eq!(error, WorkflowError::InvalidToken);
    }

    #[tokio::test]
    async fn expired_token_is_refused_and_request_stays_pending() {
        let h = harness_with_ttl(
            vec![user("u-48", UserRole::Approver, Some(48))],
            vec![request("LR-1", 41, 8000)],
            Duration::seconds(-1),
        );
        let id = RequestId("LR-1".to_owned());
        let routed = h.workflow.route(&id).await.expect("route");
        let token = routed.record.approval_token.expect("token");

        let error = h.workflow.decide_by_token(&token, true, None).await.expect_err("expired");

        assert!(matches!(error, WorkflowError::ExpiredToken { .. }));
        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::UnderReview);
        assert_eq!(stored.approval_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn reissued_link_replaces_an_expired_one() {
        let h = harness_with_ttl(
            vec![user("u-48", UserRole::Approver, Some(48))],
            vec![request("LR-1", 41, 8000)],
            Duration::seconds(-1),
        );
        let id = RequestId("LR-1".to_owned());
        let expired = routed_token(&h.workflow, &id).await;
        let settings =
            WorkflowSettings { token_ttl: Duration::hours(1), ..h.workflow.settings().clone() };
        let workflow = h.workflow.clone().with_settings(settings);

        let reissued = workflow.reissue_link(&id).await.expect("reissue");

        let fresh = reissued.record.approval_token.expect("fresh token");
        assert_ne!(fresh, expired);
        assert_eq!(reissued.record.status, RequestStatus::UnderReview);
        assert_eq!(
            workflow.decide_by_token(&expired, true, None).await.expect_err("old link"),
            WorkflowError::InvalidToken
        );
        let outcome = workflow.decide_by_token(&fresh, true, None).await.expect("decide");
        assert_eq!(outcome.record.status, RequestStatus::Approved);
        assert_eq!(h.notifier.sent_events(), vec![
            NotificationEvent::ApprovalRequested,
            NotificationEvent::ApprovalRequested,
            NotificationEvent::ApprovalDecided,
            NotificationEvent::ApprovalConfirmed,
        ]);
    }

    #[tokio::test]
    async fn reissue_invalidates_a_link_that_had_not_expired() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        let first = routed_token(&h.workflow, &id).await;

        h.workflow.reissue_link(&id).await.expect("reissue");

        let error = h.workflow.inspect_token(&first).await.expect_err("replaced link");
        assert_eq!(error, WorkflowError::InvalidToken);
    }

    #[tokio::test]
    async fn reissue_requires_a_pending_request() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());

        let error = h.workflow.reissue_link(&id).await.expect_err("not routed");
        assert!(matches!(
            error,
            WorkflowError::InvalidTransition { from: RequestStatus::Submitted, .. }
        ));

        let token = routed_token(&h.workflow, &id).await;
        h.workflow.decide_by_token(&token, false, None).await.expect("decide");
        let error = h.workflow.reissue_link(&id).await.expect_err("decided");
        assert!(matches!(
            error,
            WorkflowError::InvalidTransition { from: RequestStatus::Rejected, .. }
        ));
        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert!(stored.approval_token.is_none());
    }

    #[tokio::test]
    async fn approval_by_token_keeps_remarks() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        let token = routed_token(&h.workflow, &id).await;

        h.workflow
            .decide_by_token(&token, true, Some("collateral verified".to_owned()))
            .await
            .expect("decide");

        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(stored.approval_remarks.as_deref(), Some("collateral verified"));
        let decided = h.notifier.sent().into_iter().find(|sent| {
            sent.event == NotificationEvent::ApprovalDecided
        });
        assert_eq!(
            decided.expect("decided notice").payload["approval_remarks"],
            serde_json::json!("collateral verified")
        );
    }

    #[tokio::test]
    async fn portal_decision_by_another_approver_overrides_routing() {
        let h = harness(
            vec![
                user("u-48", UserRole::Approver, Some(48)),
                user("u-admin", UserRole::Admin, Some(52)),
            ],
            vec![request("LR-1", 41, 8000)],
        );
        let id = RequestId("LR-1".to_owned());
        let routed = h.workflow.route(&id).await.expect("route");
        let token = routed.record.approval_token.expect("token");
        let admin = user("u-admin", UserRole::Admin, Some(52));

        let outcome =
            h.workflow.decide_by_portal(&id, &admin, true, None).await.expect("portal decision");

        assert!(outcome.overrode_routed_approver);
        assert_eq!(outcome.record.approved_by_name.as_deref(), Some("User u-admin"));
        assert_eq!(outcome.record.approver_email.as_deref(), Some("u-admin@lender.test"));

        let stale = h.workflow.decide_by_token(&token, false, None).await.expect_err("stale link");
        assert!(matches!(stale, WorkflowError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn portal_refuses_applicant_role() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        h.workflow.route(&id).await.expect("route");

        let error = h
            .workflow
            .decide_by_portal(&id, &user("u-9", UserRole::Applicant, Some(41)), true, None)
            .await
            .expect_err("not authorized");

        assert_eq!(error, WorkflowError::NotAuthorized { user_id: "u-9".to_owned() });
    }

    #[tokio::test]
    async fn portal_cannot_decide_unrouted_request() {
        let h = harness(Vec::new(), vec![request("LR-1", 41, 8000)]);

        let error = h
            .workflow
            .decide_by_portal(
                &RequestId("LR-1".to_owned()),
                &user("u-48", UserRole::Approver, Some(48)),
                true,
                None,
            )
            .await
            .expect_err("still submitted");

        assert!(matches!(
            error,
            WorkflowError::InvalidTransition { from: RequestStatus::Submitted, .. }
        ));
    }

    #[tokio::test]
    async fn notification_failure_does_not_undo_decision() {
        let h = harness(vec![user("u-48", UserRole::Approver, Some(48))], vec![request(
            "LR-1", 41, 8000,
        )]);
        let id = RequestId("LR-1".to_owned());
        let routed = h.workflow.route(&id).await.expect("route");
        h.notifier.set_failing(true);

        h.workflow
            .decide_by_token(&routed.record.approval_token.expect("token"), true, None)
            .await
            .expect("decision stands");

        let stored = h.store.find_by_id(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(h.notifier.sent().len(), 3);
    }

    #[tokio::test]
    async fn candidates_come_from_current_matrix() {
        let h = harness(
            vec![
                user("u-44", UserRole::Approver, Some(44)),
                user("u-48", UserRole::Approver, Some(48)),
            ],
            vec![request("LR-1", 42, 4000)],
        );

        let candidates =
            h.workflow.candidate_approvers(&RequestId("LR-1".to_owned())).await.expect("candidates");

        let ids: Vec<&str> = candidates.iter().map(|entry| entry.approver.id.as_str()).collect();
        assert_eq!(ids, vec!["u-44", "u-48"]);
    }
}
