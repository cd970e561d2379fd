//! Chat endpoints. The tenant comes from the body `domain` or the request
//! headers; every operation is scoped to that tenant's partition.

use crate::models::{LogRequest, Message, MessageRole, Source};
use crate::services::chat::{ChatAnswer, SessionStarted};
use crate::services::tenant::DomainCandidates;
use crate::startup::AppState;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[validate(length(max = 253, message = "Domain is too long"))]
    pub domain: Option<String>,

    #[validate(length(min = 1, max = 64, message = "Employee ID is required"))]
    pub employee_id: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueryRequest {
    #[validate(length(max = 253, message = "Domain is too long"))]
    pub domain: Option<String>,

    #[validate(length(min = 1, max = 128, message = "Session ID is required"))]
    pub session_id: String,

    #[validate(length(min = 1, max = 4000, message = "Message must be 1-4000 characters"))]
    pub message: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LogRequestBody {
    #[validate(length(max = 253, message = "Domain is too long"))]
    pub domain: Option<String>,

    #[validate(length(min = 1, max = 128, message = "Session ID is required"))]
    pub session_id: String,

    #[validate(length(max = 2000, message = "Notes must be at most 2000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub domain: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    pub was_escalated: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for HistoryMessage {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            confidence: message.confidence,
            sources: message.sources,
            was_escalated: message.was_escalated,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRequestResponse {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<LogRequest> for LogRequestResponse {
    fn from(request: LogRequest) -> Self {
        Self {
            request_id: request.id,
            conversation_id: request.conversation_id,
            status: request.status,
            created_at: request.created_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/chat/session
pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionStarted>), AppError> {
    req.validate()?;

    let candidates = DomainCandidates::from_headers(&headers, req.domain.as_deref());
    let started = state
        .pipeline
        .start_session(&candidates, req.employee_id.trim())
        .await?;

    Ok((StatusCode::CREATED, Json(started)))
}

/// POST /api/chat/query
///
/// The turn runs on its own task, so a client that disconnects mid-turn
/// still gets both messages persisted and any escalation raised.
pub async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatQueryRequest>,
) -> Result<Json<ChatAnswer>, AppError> {
    req.validate()?;

    let candidates = DomainCandidates::from_headers(&headers, req.domain.as_deref());
    let pipeline = state.pipeline.clone();
    let turn = tokio::spawn(async move {
        pipeline
            .answer_query(&candidates, &req.session_id, &req.message)
            .await
    });

    let answer = turn
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Chat turn task failed: {}", e)))??;

    Ok(Json(answer))
}

/// GET /api/chat/history/:session_id
pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let candidates = DomainCandidates::from_headers(&headers, params.domain.as_deref());
    let messages = state.pipeline.history(&candidates, &session_id).await?;

    Ok(Json(HistoryResponse {
        session_id,
        messages: messages.into_iter().map(HistoryMessage::from).collect(),
    }))
}

/// POST /api/chat/log-request
pub async fn log_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LogRequestBody>,
) -> Result<(StatusCode, Json<LogRequestResponse>), AppError> {
    req.validate()?;

    let candidates = DomainCandidates::from_headers(&headers, req.domain.as_deref());
    let request = state
        .pipeline
        .request_log(&candidates, &req.session_id, req.notes.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(LogRequestResponse::from(request))))
}
