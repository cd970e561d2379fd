//! Test helpers for support-service integration tests.
//!
//! Assembles the application from the in-memory store and cache, the mock
//! providers and the recording relay.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::sync::Arc;
use support_service::config::{
    ChatConfig, DatabaseConfig, Environment, ProviderConfig, RedisConfig, RelayConfig, RelayMode,
    SecurityConfig, SupportConfig,
};
use support_service::models::{
    AiConfig, NewKnowledgeEntry, PartitionHandle, SubjectProfile, Tenant, TenantStatus,
};
use support_service::services::cache::MemoryCache;
use support_service::services::chat::{ChatAnswer, SessionStarted};
use support_service::services::providers::mock::{MockCompletionProvider, MockEmbeddingProvider};
use support_service::services::relay::mock::RecordingRelay;
use support_service::services::tenant::DomainCandidates;
use support_service::services::{MemoryStore, Stores};
use support_service::startup::{build_router, AppState};
use tower::ServiceExt;
use uuid::Uuid;

pub const DIMENSIONS: usize = 4;
pub const ACME_DOMAIN: &str = "acme.com";
pub const ACME_PARTITION: &str = "company_acme";
pub const EMPLOYEE_ID: &str = "E100";
pub const DEFAULT_ANSWER: &str = "Your dental limit is 500 per year.";

/// Question whose embedding lines up with the seeded dental entries.
pub const DENTAL_QUESTION: &str = "What is my dental limit?";

/// Question with no related knowledge at all.
pub const UNKNOWN_QUESTION: &str = "Can I claim for skydiving lessons?";

pub fn test_config() -> SupportConfig {
    SupportConfig {
        common: CoreConfig { port: 0 },
        environment: Environment::Dev,
        service_name: "support-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        providers: ProviderConfig {
            api_base: "http://localhost".to_string(),
            api_key: "test".to_string(),
            embedding_model: "mock-embed".to_string(),
            embedding_dimensions: DIMENSIONS as u32,
            completion_model: "mock-chat".to_string(),
            max_tokens: 256,
            timeout_secs: 5,
            max_retries: 0,
        },
        relay: RelayConfig {
            mode: RelayMode::Disabled,
            bot_token: String::new(),
            operator_chat_id: String::new(),
            webhook_secret: None,
            api_base: "http://localhost".to_string(),
        },
        chat: ChatConfig::default(),
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
    }
}

pub fn acme_partition() -> PartitionHandle {
    PartitionHandle::parse(ACME_PARTITION).expect("valid partition")
}

pub fn acme_tenant() -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: "Acme Insurance".to_string(),
        domain: ACME_DOMAIN.to_string(),
        alternate_domains: vec!["acme-benefits.com".to_string()],
        partition: acme_partition(),
        status: TenantStatus::Active,
        ai: AiConfig::default(),
    }
}

pub fn employee() -> SubjectProfile {
    SubjectProfile {
        id: Uuid::new_v4(),
        employee_id: EMPLOYEE_ID.to_string(),
        name: "Mei Tan".to_string(),
        email: Some("mei.tan@acme.com".to_string()),
        department: Some("Finance".to_string()),
        policy_type: Some("Standard".to_string()),
        coverage_limit: Some(5000.0),
        is_active: true,
    }
}

/// Unit vector in the first axis rotated so its cosine with `[1,0,0,0]` is `similarity`.
pub fn vector_with_similarity(similarity: f32, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMENSIONS];
    v[0] = similarity;
    v[axis] = (1.0 - similarity * similarity).sqrt();
    v
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub embedder: Arc<MockEmbeddingProvider>,
    pub completer: Arc<MockCompletionProvider>,
    pub relay: Arc<RecordingRelay>,
    pub tenant: Tenant,
    pub subject: SubjectProfile,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SupportConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let tenant = acme_tenant();
        let subject = employee();
        store.seed_tenant(tenant.clone());
        store.seed_subject(&tenant.partition, subject.clone());

        let cache = Arc::new(MemoryCache::new());
        let embedder = Arc::new(MockEmbeddingProvider::new(DIMENSIONS));
        embedder.pin(DENTAL_QUESTION, vec![1.0, 0.0, 0.0, 0.0]);
        embedder.pin(UNKNOWN_QUESTION, vec![0.0, 0.0, 0.0, 1.0]);
        let completer = Arc::new(MockCompletionProvider::new(DEFAULT_ANSWER));
        let relay = Arc::new(RecordingRelay::new());

        let state = AppState::new(
            config,
            Stores::shared(store.clone()),
            cache.clone(),
            embedder.clone(),
            completer.clone(),
            relay.clone(),
            None,
        );
        state.start_relay().await.expect("relay starts");

        Self {
            state,
            store,
            cache,
            embedder,
            completer,
            relay,
            tenant,
            subject,
        }
    }

    pub fn partition(&self) -> PartitionHandle {
        self.tenant.partition.clone()
    }

    pub fn candidates(&self) -> DomainCandidates {
        DomainCandidates::from_values([ACME_DOMAIN])
    }

    /// Seed two dental-related entries and one for another plan.
    pub fn seed_dental_knowledge(&self) {
        let partition = self.partition();
        self.store.seed_knowledge(
            &partition,
            NewKnowledgeEntry {
                title: "Annual limits".to_string(),
                content: "Dental treatment is covered up to 500 per year.".to_string(),
                category: "benefits".to_string(),
                subcategory: Some("general".to_string()),
                source: "handbook".to_string(),
                embedding: vector_with_similarity(0.81, 1),
            },
        );
        self.store.seed_knowledge(
            &partition,
            NewKnowledgeEntry {
                title: "Dental coverage".to_string(),
                content: "Scaling and polishing are claimable twice a year.".to_string(),
                category: "benefits".to_string(),
                subcategory: Some("dental".to_string()),
                source: "handbook".to_string(),
                embedding: vector_with_similarity(0.76, 2),
            },
        );
        self.store.seed_knowledge(
            &partition,
            NewKnowledgeEntry {
                title: "Premium dental".to_string(),
                content: "Premium members get orthodontics cover.".to_string(),
                category: "benefits".to_string(),
                subcategory: Some("premium".to_string()),
                source: "handbook".to_string(),
                embedding: vector_with_similarity(0.9, 3),
            },
        );
    }

    pub async fn start_session(&self) -> SessionStarted {
        self.state
            .pipeline
            .start_session(&self.candidates(), EMPLOYEE_ID)
            .await
            .expect("session starts")
    }

    pub async fn ask(&self, session_id: &str, message: &str) -> Result<ChatAnswer, AppError> {
        self.state
            .pipeline
            .answer_query(&self.candidates(), session_id, message)
            .await
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("origin", format!("https://www.{}", ACME_DOMAIN))
            .body(Body::from(body.to_string()))
            .expect("request builds");
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", ACME_DOMAIN)
            .body(Body::empty())
            .expect("request builds");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router()
            .oneshot(request)
            .await
            .expect("router responds");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}
