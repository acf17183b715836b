use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        FromRequest, Path, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::contacts::ContactImporter;
use super::db::DbHandle;
use super::ghl::GhlClient;
use super::knowledge::KnowledgeBase;
use super::models::{
    ConnectionStatus, Diagnostics, LeadStatus, LeadUpdate, LeadUpsert, MessageStatus, NewDocument,
};
use super::oauth::{CallbackParams, OAuthFlow};
use super::tokens::TokenManager;
use super::webhook::{SIGNATURE_HEADER, WebhookProcessor};
use crate::config::NurtureConfig;
use crate::errors::{CrmError, GhlError};

const DEFAULT_EVENT_LIMIT: i64 = 100;
const MAX_EVENT_LIMIT: i64 = 500;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub oauth: OAuthFlow,
    pub tokens: TokenManager,
    pub webhooks: WebhookProcessor,
    pub importer: ContactImporter,
    pub knowledge: KnowledgeBase,
    pub client_id_configured: bool,
    pub webhook_secret_configured: bool,
}

impl AppState {
    pub fn new(db: DbHandle, config: &NurtureConfig, ghl: GhlClient) -> Self {
        let tokens = TokenManager::new(db.clone(), ghl.clone(), config.ghl.refresh_skew_secs);
        Self {
            oauth: OAuthFlow::new(
                db.clone(),
                ghl.clone(),
                config.frontend_base(),
                config.ghl.state_ttl_secs,
            ),
            webhooks: WebhookProcessor::new(db.clone(), config.webhook.secret.clone()),
            importer: ContactImporter::new(db.clone(), ghl.clone(), tokens.clone()),
            knowledge: KnowledgeBase::new(db.clone()),
            client_id_configured: ghl.has_client_id(),
            webhook_secret_configured: config
                .webhook
                .secret
                .as_deref()
                .is_some_and(|s| !s.is_empty()),
            tokens,
            db,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AuthorizeQuery {
    #[serde(rename = "locationId")]
    pub location_id: Option<String>,
}

#[derive(Deserialize)]
pub struct LeadListQuery {
    pub installation_id: Option<i64>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateLeadRequest {
    pub installation_id: i64,
    pub ghl_contact_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct UpdateLeadRequest {
    pub status: Option<String>,
    pub tags: Option<Vec<String>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct MessageListQuery {
    pub status: Option<String>,
    pub lead_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub approval_needed: Option<bool>,
}

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct ForceQuery {
    pub force: Option<bool>,
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub action: Option<String>,
}

#[derive(Deserialize)]
pub struct KnowledgeListQuery {
    pub installation_id: Option<i64>,
    pub q: Option<String>,
}

#[derive(Deserialize)]
pub struct EventListQuery {
    pub installation_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub refreshed: bool,
    pub message: String,
    pub token_expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct DiagnosticsResponse {
    #[serde(flatten)]
    pub diagnostics: Diagnostics,
    pub client_id_configured: bool,
    pub webhook_secret_configured: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        let msg = err.to_string();
        match err {
            CrmError::InstallationNotFound { .. }
            | CrmError::NoInstallation
            | CrmError::LeadNotFound { .. }
            | CrmError::MessageNotFound { .. }
            | CrmError::DocumentNotFound { .. }
            | CrmError::WebhookEventNotFound { .. } => ApiError::NotFound(msg),
            CrmError::InvalidTransition { .. } | CrmError::MessageLocked { .. } => {
                ApiError::Conflict(msg)
            }
            CrmError::InvalidState(_) | CrmError::BadRequest(_) => ApiError::BadRequest(msg),
            CrmError::InvalidSignature => ApiError::Unauthorized("Invalid signature".to_string()),
            CrmError::Config(_) | CrmError::Ghl(GhlError::MissingCredentials) => {
                ApiError::Internal(msg)
            }
            CrmError::Ghl(_) => ApiError::BadGateway(msg),
            CrmError::Database(e) => {
                error!(error = %format!("{:#}", e), "Database error");
                ApiError::Internal(msg)
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` body extractor whose rejection renders as `{"error": ...}`.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

fn db_err(e: anyhow::Error) -> ApiError {
    CrmError::from_db(e).into()
}

fn parse_status<T: FromStr<Err = String>>(raw: Option<&str>) -> ApiResult<Option<T>> {
    raw.filter(|s| !s.is_empty())
        .map(T::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT)
}

/// A 302 to `location`.
fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/oauth/authorize", get(oauth_authorize))
        .route("/oauth/callback", get(oauth_callback))
        .route("/webhooks/ghl", post(ghl_webhook))
        .route("/api/ghl/status", get(ghl_status))
        .route("/api/installations", get(list_installations))
        .route(
            "/api/installations/{id}",
            get(get_installation).delete(disconnect_installation),
        )
        .route("/api/installations/{id}/refresh", post(refresh_installation))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/{id}", get(get_lead).patch(update_lead))
        .route("/api/leads/{id}/messages", post(create_message))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/{id}", get(get_message).patch(edit_message))
        .route("/api/messages/{id}/approve", post(approve_message))
        .route("/api/messages/{id}/reject", post(reject_message))
        .route("/api/messages/{id}/schedule", post(schedule_message))
        .route("/api/messages/{id}/sent", post(mark_message_sent))
        .route("/api/contacts/import", post(import_contacts))
        .route("/api/knowledge", get(list_documents).post(create_document))
        .route(
            "/api/knowledge/{id}",
            get(get_document).delete(delete_document),
        )
        .route("/api/knowledge/{id}/reprocess", post(reprocess_document))
        .route("/api/webhook-events", get(list_webhook_events))
        .route("/api/webhook-events/{id}/replay", post(replay_webhook_event))
        .route("/api/billing-events", get(list_billing_events))
        .route("/health", get(health_check))
}

// ── OAuth ─────────────────────────────────────────────────────────────

async fn oauth_authorize(
    State(state): State<SharedState>,
    Query(query): Query<AuthorizeQuery>,
) -> ApiResult<Response> {
    let url = state
        .oauth
        .begin(query.location_id.filter(|s| !s.is_empty()))
        .await
        .map_err(|e| {
            error!(error = %e, "Cannot start OAuth flow");
            ApiError::from(e)
        })?;
    Ok(found(url))
}

async fn oauth_callback(
    State(state): State<SharedState>,
    query: Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    let result = match query {
        Ok(Query(params)) => state.oauth.complete(params).await,
        Err(rejection) => Err(CrmError::BadRequest(format!(
            "Malformed callback query: {}",
            rejection.body_text()
        ))),
    };
    if let Err(e) = &result {
        warn!(error = %e, "OAuth callback failed");
    }
    found(state.oauth.redirect_for(&result))
}

// ── Webhooks ──────────────────────────────────────────────────────────

async fn ghl_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    state.webhooks.verify(signature, &body)?;
    let outcome = state.webhooks.ingest(&body).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "event_id": outcome.event_id,
        "processed": outcome.processed,
    })))
}

async fn list_webhook_events(
    State(state): State<SharedState>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = clamp_limit(query.limit);
    let events = state
        .db
        .call(move |db| db.list_webhook_events(query.installation_id, limit))
        .await
        .map_err(db_err)?;
    Ok(Json(events))
}

async fn replay_webhook_event(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let event = state.webhooks.replay(id).await?;
    info!(event_id = id, processed = event.processed, "Webhook event replayed");
    Ok(Json(event))
}

async fn list_billing_events(
    State(state): State<SharedState>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = clamp_limit(query.limit);
    let events = state
        .db
        .call(move |db| db.list_billing_events(query.installation_id, limit))
        .await
        .map_err(db_err)?;
    Ok(Json(events))
}

// ── Installations ─────────────────────────────────────────────────────

async fn ghl_status(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let latest = state
        .db
        .call(|db| db.latest_installation())
        .await
        .map_err(db_err)?;
    let status = match latest {
        Some(installation) => ConnectionStatus::from_installation(&installation),
        None => ConnectionStatus::disconnected(),
    };
    Ok(Json(status))
}

async fn list_installations(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let installations = state
        .db
        .call(|db| db.list_installations())
        .await
        .map_err(db_err)?;
    Ok(Json(installations))
}

async fn get_installation(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let installation = state
        .db
        .call(move |db| db.require_installation(id))
        .await
        .map_err(db_err)?;
    Ok(Json(installation))
}

async fn disconnect_installation(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state
        .db
        .call(move |db| db.delete_installation(id))
        .await
        .map_err(db_err)?;
    if !deleted {
        return Err(CrmError::InstallationNotFound { id }.into());
    }
    info!(installation_id = id, "Installation disconnected");
    Ok(Json(serde_json::json!({"success": true})))
}

async fn refresh_installation(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    let outcome = if query.force.unwrap_or(false) {
        state.tokens.force_refresh(id).await?
    } else {
        state.tokens.ensure_fresh(id).await?
    };
    let refreshed = outcome.was_refreshed();
    let installation = outcome.into_installation();
    let message = if refreshed {
        "Token refreshed successfully"
    } else {
        "Token is still valid"
    };
    Ok(Json(RefreshResponse {
        success: true,
        refreshed,
        message: message.to_string(),
        token_expires_at: installation.token_expires_at,
    }))
}

async fn diagnostics(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let diagnostics = state
        .db
        .call(|db| db.diagnostics())
        .await
        .map_err(db_err)?;
    Ok(Json(DiagnosticsResponse {
        diagnostics,
        client_id_configured: state.client_id_configured,
        webhook_secret_configured: state.webhook_secret_configured,
    }))
}

// ── Leads ─────────────────────────────────────────────────────────────

async fn list_leads(
    State(state): State<SharedState>,
    Query(query): Query<LeadListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status: Option<LeadStatus> = parse_status(query.status.as_deref())?;
    let leads = state
        .db
        .call(move |db| db.list_leads(query.installation_id, status))
        .await
        .map_err(db_err)?;
    Ok(Json(leads))
}

async fn create_lead(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreateLeadRequest>,
) -> ApiResult<impl IntoResponse> {
    let upsert = LeadUpsert {
        installation_id: req.installation_id,
        ghl_contact_id: req
            .ghl_contact_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("manual-{}", Uuid::new_v4())),
        first_name: req.first_name,
        last_name: req.last_name,
        email: req.email,
        phone: req.phone,
        tags: req.tags,
        last_activity: None,
    };
    let lead = state
        .db
        .call(move |db| {
            db.require_installation(upsert.installation_id)?;
            db.upsert_lead(&upsert)
        })
        .await
        .map_err(db_err)?;
    info!(lead_id = lead.id, name = %lead.display_name(), "Lead created");
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let lead = state
        .db
        .call(move |db| db.get_lead(id))
        .await
        .map_err(db_err)?
        .ok_or(CrmError::LeadNotFound { id })?;
    Ok(Json(lead))
}

async fn update_lead(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<UpdateLeadRequest>,
) -> ApiResult<impl IntoResponse> {
    let update = LeadUpdate {
        status: parse_status(req.status.as_deref())?,
        tags: req.tags,
        last_activity: req.last_activity,
    };
    let lead = state
        .db
        .call(move |db| db.update_lead(id, &update))
        .await
        .map_err(db_err)?;
    Ok(Json(lead))
}

// ── Messages ──────────────────────────────────────────────────────────

async fn create_message(
    State(state): State<SharedState>,
    Path(lead_id): Path<i64>,
    ApiJson(req): ApiJson<CreateMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is required".into()));
    }
    let approval_needed = req.approval_needed.unwrap_or(true);
    let message = state
        .db
        .call(move |db| db.create_message(lead_id, &req.content, approval_needed))
        .await
        .map_err(db_err)?;
    info!(message_id = message.id, lead_id, "Draft message created");
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_messages(
    State(state): State<SharedState>,
    Query(query): Query<MessageListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status: Option<MessageStatus> = parse_status(query.status.as_deref())?;
    let messages = state
        .db
        .call(move |db| db.list_messages(status, query.lead_id))
        .await
        .map_err(db_err)?;
    Ok(Json(messages))
}

async fn get_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .db
        .call(move |db| db.get_message_with_lead(id))
        .await
        .map_err(db_err)?
        .ok_or(CrmError::MessageNotFound { id })?;
    Ok(Json(message))
}

async fn edit_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is required".into()));
    }
    let message = state
        .db
        .call(move |db| db.update_message_content(id, &req.content))
        .await
        .map_err(db_err)?;
    Ok(Json(message))
}

async fn transition(
    state: &SharedState,
    id: i64,
    to: MessageStatus,
    scheduled_for: Option<DateTime<Utc>>,
) -> ApiResult<Json<super::models::Message>> {
    let message = state
        .db
        .call(move |db| db.transition_message(id, to, scheduled_for))
        .await
        .map_err(|e| {
            let err = CrmError::from_db(e);
            if let CrmError::InvalidTransition { .. } = &err {
                warn!(message_id = id, error = %err, "Rejected message transition");
            }
            ApiError::from(err)
        })?;
    info!(message_id = id, status = to.as_str(), "Message transitioned");
    Ok(Json(message))
}

async fn approve_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    transition(&state, id, MessageStatus::Approved, None).await
}

async fn reject_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    transition(&state, id, MessageStatus::Rejected, None).await
}

async fn schedule_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let when = req
        .scheduled_for
        .ok_or_else(|| ApiError::BadRequest("scheduled_for is required".into()))?;
    transition(&state, id, MessageStatus::Scheduled, Some(when)).await
}

async fn mark_message_sent(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    transition(&state, id, MessageStatus::Sent, None).await
}

// ── Contact import ────────────────────────────────────────────────────

async fn import_contacts(
    State(state): State<SharedState>,
    Query(query): Query<ForceQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !body.is_empty() {
        let req: ImportRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;
        if let Some(action) = req.action.as_deref() {
            if action != "import" {
                return Err(ApiError::BadRequest(format!("Unsupported action: {}", action)));
            }
        }
    }
    let force = query.force.unwrap_or(false);
    let result = state.importer.import(force).await.map_err(|e| {
        error!(error = %e, force, "Contact import failed");
        ApiError::from(e)
    })?;
    Ok(Json(result))
}

// ── Knowledge base ────────────────────────────────────────────────────

async fn create_document(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewDocument>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.knowledge.create(req).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn list_documents(
    State(state): State<SharedState>,
    Query(query): Query<KnowledgeListQuery>,
) -> ApiResult<impl IntoResponse> {
    let docs = state
        .db
        .call(move |db| db.list_documents(query.installation_id, query.q.as_deref()))
        .await
        .map_err(db_err)?;
    Ok(Json(docs))
}

async fn get_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let doc = state
        .db
        .call(move |db| db.get_document(id))
        .await
        .map_err(db_err)?
        .ok_or(CrmError::DocumentNotFound { id })?;
    Ok(Json(doc))
}

async fn delete_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state
        .db
        .call(move |db| db.delete_document(id))
        .await
        .map_err(db_err)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CrmError::DocumentNotFound { id }.into())
    }
}

async fn reprocess_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.knowledge.reprocess(id).await?;
    Ok(Json(doc))
}

async fn health_check() -> &'static str {
    "ok"
}
