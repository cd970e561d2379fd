//! Application startup and lifecycle management.

use crate::config::{RelayMode, SupportConfig};
use crate::handlers;
use crate::services::cache::{CacheStore, RedisCache};
use crate::services::chat::ChatPipeline;
use crate::services::database::PgStore;
use crate::services::metrics::init_metrics;
use crate::services::providers::openai::OpenAiProvider;
use crate::services::providers::{CompletionProvider, EmbeddingProvider};
use crate::services::relay::protocol::HitlRelay;
use crate::services::relay::telegram::{start_polling, TelegramRelay};
use crate::services::relay::{DisabledRelay, RelayChannel, ReplyHandler};
use crate::services::repository::Stores;
use crate::services::tenant::{TenantResolver, DOMAIN_OVERRIDE_HEADER};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware, REQUEST_ID_HEADER};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SupportConfig,
    pub stores: Stores,
    pub cache: Arc<dyn CacheStore>,
    pub completer: Arc<dyn CompletionProvider>,
    pub pipeline: Arc<ChatPipeline>,
    pub hitl: Arc<HitlRelay>,
    pub relay: Arc<dyn RelayChannel>,
    /// Set only in webhook mode.
    pub webhook: Option<Arc<TelegramRelay>>,
}

impl AppState {
    pub fn new(
        config: SupportConfig,
        stores: Stores,
        cache: Arc<dyn CacheStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        completer: Arc<dyn CompletionProvider>,
        relay: Arc<dyn RelayChannel>,
        webhook: Option<Arc<TelegramRelay>>,
    ) -> Self {
        let resolver = Arc::new(TenantResolver::new(
            stores.tenants.clone(),
            Duration::from_secs(config.chat.tenant_cache_ttl_secs),
        ));

        let pipeline = Arc::new(ChatPipeline::new(
            &config,
            resolver,
            &stores,
            cache.clone(),
            embedder.clone(),
            completer.clone(),
            relay.clone(),
        ));

        let hitl = Arc::new(HitlRelay::new(
            stores.tenants.clone(),
            stores.escalations.clone(),
            stores.conversations.clone(),
            stores.knowledge.clone(),
            embedder,
        ));

        Self {
            config,
            stores,
            cache,
            completer,
            pipeline,
            hitl,
            relay,
            webhook,
        }
    }

    /// Hand operator replies to the HITL protocol.
    pub async fn start_relay(&self) -> Result<(), AppError> {
        let handler: Arc<dyn ReplyHandler> = self.hitl.clone();
        self.relay.start(handler).await.map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to start relay: {}", e))
        })
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SupportConfig) -> Result<Self, AppError> {
        init_metrics().map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to register metrics: {}", e))
        })?;

        let db = PgStore::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            config.providers.embedding_dimensions,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;
        let partitions = db.ensure_all_partitions().await?;
        tracing::info!(partitions, "Tenant partitions verified");

        let cache: Arc<dyn CacheStore> = Arc::new(RedisCache::new(&config.redis).await?);

        let provider = Arc::new(OpenAiProvider::new(config.providers.clone()).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("AI provider: {}", e))
        })?);
        tracing::info!(
            embedding_model = %config.providers.embedding_model,
            completion_model = %config.providers.completion_model,
            "Initialized AI provider"
        );

        let telegram = match config.relay.mode {
            RelayMode::Disabled => None,
            RelayMode::Polling | RelayMode::Webhook => Some(Arc::new(
                TelegramRelay::new(config.relay.clone())
                    .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
            )),
        };
        let relay: Arc<dyn RelayChannel> = match &telegram {
            Some(t) => t.clone(),
            None => Arc::new(DisabledRelay),
        };
        let webhook = telegram
            .clone()
            .filter(|t| t.mode() == RelayMode::Webhook);

        let state = AppState::new(
            config.clone(),
            Stores::shared(Arc::new(db)),
            cache,
            provider.clone(),
            provider,
            relay,
            webhook,
        );

        state.start_relay().await?;
        if let Some(t) = telegram.filter(|t| t.mode() == RelayMode::Polling) {
            start_polling(&t).await.map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to start relay polling: {}", e))
            })?;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::InternalError(anyhow::anyhow!("Failed to bind {}: {}", addr, e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?
            .port();

        tracing::info!(port, relay = state.relay.name(), "Support service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` resolves, then stop the relay.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let relay = self.state.relay.clone();
        let router = build_router(self.state);

        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        relay.stop().await;
        result
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| tracing::error!("Invalid CORS origin '{}': {}", o, e))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(DOMAIN_OVERRIDE_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.security.allowed_origins);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/api/chat/session", post(handlers::chat::start_session))
        .route("/api/chat/query", post(handlers::chat::query))
        .route("/api/chat/history/:session_id", get(handlers::chat::history))
        .route("/api/chat/log-request", post(handlers::chat::log_request))
        .route("/api/relay/webhook", post(handlers::relay::telegram_webhook))
        .with_state(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<axum::body::Body>))
        .layer(middleware::from_fn(request_id_middleware))
}
