use crate::config::Config;
use crate::errors::{AppError, ResultExt};
use crate::events::{track_event, EventContext};
use crate::models::*;
use crate::orchestrator::{LeadOrchestrator, LeadSubmission};
use crate::repository::Repositories;
use crate::scoring::{compute_score, AnswerMap, ScoreResult};
use crate::validation::{constant_time_eq, mask_phone};
use crate::verification::PhoneVerifier;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
pub const DEFAULT_EVENT_LIMIT: usize = 100;
pub const MAX_EVENT_LIMIT: usize = 10_000;
pub const MAX_EVENT_NAME_LEN: usize = 64;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Storage handles (JSON files or PostgreSQL).
    pub repos: Repositories,
    /// Submission pipeline and admin lead operations.
    pub orchestrator: LeadOrchestrator,
    /// OTP issue/verify with time-windowed state.
    pub verifier: PhoneVerifier,
    /// Application configuration.
    pub config: Config,
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "punto-seguro-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Client IP: first `X-Forwarded-For` hop, then the socket peer.
pub fn requester_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AppError::Unauthorized("admin API disabled".to_string()));
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if constant_time_eq(provided, expected) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("invalid admin token".to_string()))
    }
}

fn admin_context(uri: &Uri, headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> EventContext {
    EventContext {
        user_agent: user_agent(headers),
        ip: requester_ip(headers, peer),
        ..EventContext::admin(uri.path())
    }
}

// ============ Public API ============

#[derive(Debug, Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    pub answers: HashMap<String, Value>,
    pub property_type: String,
}

fn answer_map(raw: HashMap<String, Value>) -> AnswerMap {
    raw.into_iter()
        .filter_map(|(question, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((question, s)),
            other => Some((question, other.to_string())),
        })
        .collect()
}

/// POST /api/score
///
/// Computes the IEI score for a questionnaire.
///
/// # Arguments
///
/// * `request` - Answers keyed by question id plus `property_type` (`vivienda` or `comercio`).
///
/// # Returns
///
/// * `Result<Json<ScoreResult>, AppError>` - Indexes, level, confidence and debug breakdown.
pub async fn score(Json(request): Json<ScoreRequest>) -> Result<Json<ScoreResult>, AppError> {
    tracing::info!("Scoring {} answers for {}", request.answers.len(), request.property_type);
    let result = compute_score(&answer_map(request.answers), &request.property_type)?;
    tracing::debug!("IEI total {} ({})", result.iei_total, result.level);
    Ok(Json(result))
}

/// POST /api/leads
///
/// Public lead submission. Runs the full create, assign and notify pipeline.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `input` - Form fields; `ref`/`tracking_code` credits a collaborator.
///
/// # Returns
///
/// * `Result<(StatusCode, Json<Value>), AppError>` - 201 with the lead id and assigned providers.
pub async fn submit_lead(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(input): Json<LeadInput>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let ip = requester_ip(&headers, peer.as_ref());
    tracing::info!("Lead submission from {}", ip.as_deref().unwrap_or("unknown"));

    let phone_verified = match input.phone.as_deref() {
        Some(phone) => {
            state
                .verifier
                .is_verified(phone, ip.as_deref().unwrap_or_default(), Utc::now())
                .await
        }
        None => false,
    };
    if state.config.require_phone_verification && !phone_verified {
        return Err(AppError::BadRequest("phone verification required".to_string()));
    }

    let outcome = state
        .orchestrator
        .submit(LeadSubmission {
            input,
            requester_ip: ip,
            phone_verified,
        })
        .await?;

    let provider_ids: Vec<&str> = outcome
        .assigned_providers
        .iter()
        .map(|p| p.id.as_str())
        .collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "lead_id": outcome.lead.id,
            "provider_count": provider_ids.len(),
            "provider_ids": provider_ids,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct OtpSendRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyRequest {
    pub phone: String,
    pub code: String,
}

/// POST /api/otp/send
///
/// Issues a one-time code for the phone, scoped to the caller IP.
pub async fn otp_send(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<OtpSendRequest>,
) -> Result<Json<Value>, AppError> {
    let ip = requester_ip(&headers, peer.as_ref()).unwrap_or_default();
    tracing::info!("OTP requested for {}", mask_phone(&request.phone));

    let issued = state
        .verifier
        .request_code(&request.phone, &ip, Utc::now())
        .await?;

    Ok(Json(json!({
        "ok": true,
        "phone": mask_phone(&issued.phone),
        "expires_at": issued.expires_at,
        "sends_remaining": issued.sends_remaining,
    })))
}

/// POST /api/otp/verify
pub async fn otp_verify(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<OtpVerifyRequest>,
) -> Result<Json<Value>, AppError> {
    let ip = requester_ip(&headers, peer.as_ref()).unwrap_or_default();
    tracing::info!("OTP verification for {}", mask_phone(&request.phone));

    state
        .verifier
        .verify_code(&request.phone, &ip, &request.code, Utc::now())
        .await?;

    Ok(Json(json!({ "ok": true, "verified": true })))
}

#[derive(Debug, Deserialize)]
pub struct ClientEventRequest {
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub path: Option<String>,
}

/// POST /api/events
///
/// Records a client analytics event.
pub async fn track_client_event(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Json(request): Json<ClientEventRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let event_name = request.event_name.trim();
    if event_name.is_empty() {
        return Err(AppError::BadRequest("event_name is required".to_string()));
    }
    if event_name.len() > MAX_EVENT_NAME_LEN {
        return Err(AppError::BadRequest(format!(
            "event_name must be at most {} characters",
            MAX_EVENT_NAME_LEN
        )));
    }
    tracing::info!("Client event {}", event_name);

    let context = EventContext {
        path: Some(request.path.unwrap_or_else(|| uri.path().to_string())),
        user_agent: user_agent(&headers),
        ip: requester_ip(&headers, peer.as_ref()),
        actor: None,
    };
    let event = track_event(
        state.repos.events.as_ref(),
        event_name,
        request.payload.unwrap_or_else(|| json!({})),
        context.to_value(),
    )
    .await
    .context("recording client event")?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "event_id": event.id })),
    ))
}

// ============ Admin: providers ============

/// GET /api/admin/providers
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let providers = state.repos.providers.list().await?;
    Ok(Json(json!({ "providers": providers })))
}

/// POST /api/admin/providers
///
/// # Arguments
///
/// * `state` - The application state.
/// * `input` - Provider fields; `zones` and `business_types` accept arrays or comma-separated strings.
///
/// # Returns
///
/// * `Result<(StatusCode, Json<Value>), AppError>` - 201 with the stored provider.
pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<ProviderInput>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Creating provider {:?}", input.name);
    let provider = state.repos.providers.create(input).await?;
    Ok((StatusCode::CREATED, Json(json!({ "provider": provider }))))
}

/// PUT /api/admin/providers/:id
pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<ProviderInput>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Updating provider {}", id);
    let provider = state
        .repos
        .providers
        .update(&id, input)
        .await?
        .ok_or_else(|| AppError::NotFound("Provider not found".to_string()))?;
    Ok(Json(json!({ "provider": provider })))
}

/// DELETE /api/admin/providers/:id
///
/// Refused with 409 while any lead references the provider.
pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Deleting provider {}", id);
    let ctx = admin_context(&uri, &headers, peer.as_ref());
    let provider = state.orchestrator.delete_provider(&id, &ctx).await?;
    Ok(Json(json!({ "ok": true, "provider_id": provider.id })))
}

// ============ Admin: leads ============

/// GET /api/admin/leads
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let leads = state.repos.leads.list().await?;
    Ok(Json(json!({ "leads": leads })))
}

/// GET /api/admin/leads/:id
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let lead = state
        .repos
        .leads
        .get_by_id(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("Lead not found".to_string()))?;
    Ok(Json(json!({ "lead": lead })))
}

#[derive(Debug, Deserialize)]
pub struct LeadUpdateRequest {
    pub status: Option<String>,
    pub notes: Option<String>,
}

/// PATCH /api/admin/leads/:id
///
/// Edits status and/or notes.
pub async fn patch_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<LeadUpdateRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Updating lead {}", id);
    let status = request
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<LeadStatus>())
        .transpose()
        .map_err(|_| AppError::BadRequest("Invalid status".to_string()))?;
    let lead = state.orchestrator.update_lead(&id, status, request.notes).await?;
    Ok(Json(json!({ "lead": lead })))
}

#[derive(Debug, Deserialize)]
pub struct ManualAssignRequest {
    #[serde(default)]
    pub provider_ids: Option<StringList>,
    #[serde(default)]
    pub note: Option<String>,
}

/// POST /api/admin/leads/:id/assign-manual
///
/// # Arguments
///
/// * `state` - The application state.
/// * `id` - Lead id.
/// * `request` - Up to `MAX_PROVIDERS_PER_LEAD` provider ids and an optional note.
///
/// # Returns
///
/// * `Result<Json<Value>, AppError>` - Updated lead plus warnings for inactive providers.
pub async fn assign_manual(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
    Json(request): Json<ManualAssignRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Manual assignment for lead {}", id);
    let ctx = admin_context(&uri, &headers, peer.as_ref());
    let provider_ids = request.provider_ids.map(StringList::into_vec).unwrap_or_default();
    let outcome = state
        .orchestrator
        .assign_manual(&id, provider_ids, request.note, &ctx)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "lead": outcome.lead,
        "warnings": outcome.warnings,
    })))
}

/// POST /api/admin/leads/:id/reassign-auto
pub async fn reassign_auto(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Automatic reassignment for lead {}", id);
    let ctx = admin_context(&uri, &headers, peer.as_ref());
    let outcome = state.orchestrator.reassign_auto(&id, &ctx).await?;
    Ok(Json(json!({
        "ok": true,
        "lead": outcome.lead,
        "provider_count": outcome.assigned_providers.len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct AnonymizeRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/admin/leads/:id/anonymize
pub async fn anonymize_lead(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
    body: Option<Json<AnonymizeRequest>>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Anonymizing lead {}", id);
    let ctx = admin_context(&uri, &headers, peer.as_ref());
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let lead = state
        .orchestrator
        .anonymize(&id, request.reason.as_deref(), &ctx)
        .await?;
    Ok(Json(json!({ "ok": true, "lead": lead })))
}

#[derive(Debug, Deserialize)]
pub struct CollaboratorAssignRequest {
    /// `null` or empty clears the attribution.
    #[serde(default, alias = "ref")]
    pub tracking_code: Option<String>,
}

/// POST /api/admin/leads/:id/collaborator
pub async fn set_lead_collaborator(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
    Json(request): Json<CollaboratorAssignRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Changing collaborator of lead {}", id);
    let ctx = admin_context(&uri, &headers, peer.as_ref());
    let lead = state
        .orchestrator
        .set_collaborator(&id, request.tracking_code.as_deref(), &ctx)
        .await?;
    Ok(Json(json!({ "ok": true, "lead": lead })))
}

// ============ Admin: collaborators ============

/// GET /api/admin/collaborators
pub async fn list_collaborators(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let collaborators = state.repos.collaborators.list().await?;
    Ok(Json(json!({ "collaborators": collaborators })))
}

/// POST /api/admin/collaborators
pub async fn create_collaborator(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CollaboratorInput>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Creating collaborator {:?}", input.tracking_code);
    let collaborator = state.repos.collaborators.create(input).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "collaborator": collaborator })),
    ))
}

/// PUT /api/admin/collaborators/:id
pub async fn update_collaborator(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<CollaboratorInput>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    tracing::info!("Updating collaborator {}", id);
    let collaborator = state
        .repos
        .collaborators
        .update(&id, input)
        .await?
        .ok_or_else(|| AppError::NotFound("Collaborator not found".to_string()))?;
    Ok(Json(json!({ "collaborator": collaborator })))
}

// ============ Admin: events & metrics ============

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/admin/events?limit=N
///
/// Most recent events first. `limit` defaults to 100 and is clamped to 1..=10000.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = state.repos.events.list(limit).await?;
    Ok(Json(json!({ "events": events })))
}

/// GET /api/admin/metrics
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let metrics = state.orchestrator.metrics().await?;
    Ok(Json(json!(metrics)))
}
