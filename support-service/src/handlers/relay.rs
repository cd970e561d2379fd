use crate::services::relay::telegram::{Update, WEBHOOK_SECRET_HEADER};
use crate::startup::AppState;
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
};
use service_core::error::AppError;

/// POST /api/relay/webhook
///
/// Acknowledges immediately; the update is handled in the background so the
/// bot API does not redeliver while an operator reply is being applied.
pub async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> Result<StatusCode, AppError> {
    let relay = state.webhook.clone().ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("Relay webhook is not enabled"))
    })?;

    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !relay.verify_webhook_secret(presented) {
        tracing::warn!("Relay webhook called with an invalid secret");
        return Err(AppError::Forbidden(anyhow::anyhow!("Invalid webhook secret")));
    }

    tokio::spawn(async move {
        relay.handle_update(update).await;
    });

    Ok(StatusCode::OK)
}
