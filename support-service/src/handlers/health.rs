use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness probe. Reports each dependency.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.stores.tenants.health_check().await;
    let cache = state.cache.health_check().await;

    match (&database, &cache) {
        (Ok(()), Ok(())) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": env!("CARGO_PKG_VERSION"),
                    "relay": state.relay.name(),
                })),
            )
        }
        _ => {
            let database_error = database.err().map(|e| e.to_string());
            let cache_error = cache.err().map(|e| e.to_string());
            tracing::warn!(?database_error, ?cache_error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "database": database_error.unwrap_or_else(|| "ok".to_string()),
                    "cache": cache_error.unwrap_or_else(|| "ok".to_string()),
                })),
            )
        }
    }
}

/// Readiness probe. Ready once storage, cache and the completion provider respond.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let (database, cache, provider) = tokio::join!(
        state.stores.tenants.health_check(),
        state.cache.health_check(),
        state.completer.health_check(),
    );

    match (database, cache, provider) {
        (Ok(()), Ok(()), Ok(())) => StatusCode::OK,
        (database, cache, provider) => {
            tracing::warn!(
                database_ok = database.is_ok(),
                cache_ok = cache.is_ok(),
                provider_ok = provider.is_ok(),
                "Readiness check failed"
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
