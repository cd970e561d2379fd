//! The query-answering pipeline and the session-scoped chat operations.

use crate::config::{ChatConfig, SupportConfig};
use crate::models::{LogRequest, Message, NewMessage, Session, Source, SubjectProfile, Tenant};
use crate::services::cache::{CacheStore, CachedAnswer, ConversationCache};
use crate::services::escalation::{AnsweredTurn, EscalationEngine, EscalationOutcome};
use crate::services::metrics::{record_chat_query, record_confidence};
use crate::services::providers::{CompletionProvider, EmbeddingProvider};
use crate::services::rate_limit::RateLimiter;
use crate::services::relay::RelayChannel;
use crate::services::repository::{ConversationStore, Stores};
use crate::services::retriever::{KnowledgeRetriever, PolicyFilter, SearchParams};
use crate::services::synthesizer::{ResponseSynthesizer, SynthesisInput};
use crate::services::tenant::{DomainCandidates, TenantResolver};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: String,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAnswer {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<Source>,
    pub escalated: bool,
    pub session_id: String,
    pub conversation_id: Uuid,
}

pub struct ChatPipeline {
    resolver: Arc<TenantResolver>,
    conversations: Arc<dyn ConversationStore>,
    cache: ConversationCache,
    rate_limiter: RateLimiter,
    retriever: KnowledgeRetriever,
    synthesizer: ResponseSynthesizer,
    escalation: EscalationEngine,
    relay: Arc<dyn RelayChannel>,
    config: ChatConfig,
}

impl ChatPipeline {
    pub fn new(
        config: &SupportConfig,
        resolver: Arc<TenantResolver>,
        stores: &Stores,
        cache_store: Arc<dyn CacheStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        completer: Arc<dyn CompletionProvider>,
        relay: Arc<dyn RelayChannel>,
    ) -> Self {
        let chat = config.chat.clone();
        Self {
            resolver,
            conversations: stores.conversations.clone(),
            cache: ConversationCache::new(cache_store.clone(), chat.clone()),
            rate_limiter: RateLimiter::new(
                cache_store,
                chat.rate_limit_requests,
                chat.rate_limit_window_secs,
            ),
            retriever: KnowledgeRetriever::new(embedder, stores.knowledge.clone()),
            synthesizer: ResponseSynthesizer::new(
                completer,
                config.providers.max_tokens,
                chat.prompt_history_turns,
            ),
            escalation: EscalationEngine::new(
                stores.conversations.clone(),
                stores.escalations.clone(),
                relay.clone(),
            ),
            relay,
            config: chat,
        }
    }

    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    /// Open a conversation for an employee of the resolved tenant.
    #[instrument(skip(self, candidates))]
    pub async fn start_session(
        &self,
        candidates: &DomainCandidates,
        employee_id: &str,
    ) -> Result<SessionStarted, AppError> {
        let tenant = self.resolver.resolve(candidates).await?;
        let partition = &tenant.partition;

        let subject = self
            .conversations
            .find_subject_by_employee_id(partition, employee_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Employee '{}' not found", employee_id))
            })?;
        if !subject.is_active {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Employee '{}' is not active",
                employee_id
            )));
        }

        let mut session = Session::new(tenant.id, subject.id, Uuid::nil());
        session.conversation_id = self
            .conversations
            .create_conversation(partition, subject.id, &session.session_id)
            .await?;
        self.cache.put_session(&session).await?;

        info!(
            tenant_id = %tenant.id,
            conversation_id = %session.conversation_id,
            "Chat session started"
        );

        Ok(SessionStarted {
            session_id: session.session_id,
            conversation_id: session.conversation_id,
        })
    }

    /// Run one turn: answer, persist, decide escalation.
    #[instrument(skip(self, candidates, message), fields(session_id = %session_id))]
    pub async fn answer_query(
        &self,
        candidates: &DomainCandidates,
        session_id: &str,
        message: &str,
    ) -> Result<ChatAnswer, AppError> {
        let started = Instant::now();
        let query = message.trim();
        if query.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Message must not be empty")));
        }

        let tenant = self.resolver.resolve(candidates).await?;
        let mut session = self.load_session(&tenant, session_id).await?;

        let decision = self.rate_limiter.check(&session.subject_id.to_string()).await;
        if !decision.allowed {
            record_chat_query(&tenant.id.to_string(), "throttled", started.elapsed().as_secs_f64());
            return Err(AppError::TooManyRequests(
                "Too many messages, please slow down".to_string(),
                Some(decision.reset_at),
            ));
        }

        let subject = self.load_subject(&tenant, &session).await?;
        let conversation_id = session.conversation_id;
        let cache_key = ConversationCache::query_key(&tenant.partition, subject.id, query);

        if let Some(cached) = self.cache.cached_answer(&cache_key).await {
            self.persist_turn(&tenant, conversation_id, query, &cached.answer, cached.confidence, &cached.sources)
                .await?;
            self.escalation
                .intercept_contact(&tenant, conversation_id, query)
                .await?;
            self.finish_turn(&mut session).await?;
            record_chat_query(&tenant.id.to_string(), "cached", started.elapsed().as_secs_f64());

            return Ok(ChatAnswer {
                answer: cached.answer,
                confidence: cached.confidence,
                sources: cached.sources,
                escalated: false,
                session_id: session.session_id,
                conversation_id,
            });
        }

        let history = self.history_for(&tenant, conversation_id).await?;

        let retrieval = self
            .retriever
            .search(
                query,
                SearchParams {
                    partition: &tenant.partition,
                    top_k: tenant.ai.top_k,
                    similarity_threshold: tenant.ai.similarity_threshold,
                    policy: Some(PolicyFilter::new(&subject.policy_bucket())),
                },
            )
            .await?;

        let answer = self
            .synthesizer
            .answer(SynthesisInput {
                query,
                contexts: &retrieval.contexts,
                knowledge_exists: retrieval.knowledge_exists,
                subject: &subject,
                history: &history,
                ai: &tenant.ai,
            })
            .await?;

        self.persist_turn(&tenant, conversation_id, query, &answer.answer, answer.confidence, &answer.sources)
            .await?;

        let outcome = self
            .escalation
            .evaluate(AnsweredTurn {
                tenant: &tenant,
                conversation_id,
                subject: &subject,
                query,
                answer: &answer,
            })
            .await?;

        let label = match &outcome {
            EscalationOutcome::NotEscalated => {
                self.cache
                    .store_answer(
                        &cache_key,
                        &CachedAnswer {
                            answer: answer.answer.clone(),
                            confidence: answer.confidence,
                            sources: answer.sources.clone(),
                        },
                    )
                    .await;
                "answered"
            }
            EscalationOutcome::ContactAttached(_) => "contact_captured",
            EscalationOutcome::Escalated(_) => "escalated",
        };

        self.finish_turn(&mut session).await?;

        let tenant_label = tenant.id.to_string();
        record_confidence(&tenant_label, answer.confidence);
        record_chat_query(&tenant_label, label, started.elapsed().as_secs_f64());

        Ok(ChatAnswer {
            answer: answer.answer,
            confidence: answer.confidence,
            sources: answer.sources,
            escalated: outcome.escalated(),
            session_id: session.session_id,
            conversation_id,
        })
    }

    /// Recent messages of the session's conversation, oldest first.
    #[instrument(skip(self, candidates))]
    pub async fn history(
        &self,
        candidates: &DomainCandidates,
        session_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let tenant = self.resolver.resolve(candidates).await?;
        let session = self.load_session(&tenant, session_id).await?;
        self.history_for(&tenant, session.conversation_id).await
    }

    /// Record a Letter-of-Guarantee request. One per conversation.
    #[instrument(skip(self, candidates, notes))]
    pub async fn request_log(
        &self,
        candidates: &DomainCandidates,
        session_id: &str,
        notes: Option<&str>,
    ) -> Result<LogRequest, AppError> {
        let tenant = self.resolver.resolve(candidates).await?;
        let session = self.load_session(&tenant, session_id).await?;
        let subject = self.load_subject(&tenant, &session).await?;

        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let request = self
            .conversations
            .create_log_request(&tenant.partition, session.conversation_id, subject.id, notes)
            .await?;

        info!(log_request_id = %request.id, conversation_id = %request.conversation_id, "LOG request recorded");

        let relay = self.relay.clone();
        let notice = request.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.notify_log_request(&tenant, &subject, &notice).await {
                warn!(error = %e, log_request_id = %notice.id, "LOG notice not delivered");
            }
        });

        Ok(request)
    }

    async fn load_session(&self, tenant: &Tenant, session_id: &str) -> Result<Session, AppError> {
        match self.cache.get_session(session_id).await? {
            Some(session) if session.tenant_id == tenant.id => Ok(session),
            _ => Err(AppError::NotFound(anyhow::anyhow!(
                "Session '{}' not found or expired",
                session_id
            ))),
        }
    }

    async fn load_subject(&self, tenant: &Tenant, session: &Session) -> Result<SubjectProfile, AppError> {
        self.conversations
            .find_subject(&tenant.partition, session.subject_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Employee for session not found")))
    }

    async fn history_for(&self, tenant: &Tenant, conversation_id: Uuid) -> Result<Vec<Message>, AppError> {
        if let Some(history) = self.cache.history(conversation_id).await {
            return Ok(history);
        }
        let messages = self
            .conversations
            .recent_messages(&tenant.partition, conversation_id, self.config.history_limit)
            .await?;
        if !messages.is_empty() {
            self.cache.backfill_history(conversation_id, &messages).await;
        }
        Ok(messages)
    }

    /// Durable append of both messages, then the cache mirror.
    async fn persist_turn(
        &self,
        tenant: &Tenant,
        conversation_id: Uuid,
        query: &str,
        answer: &str,
        confidence: f64,
        sources: &[Source],
    ) -> Result<(), AppError> {
        let partition = &tenant.partition;
        let user = self
            .conversations
            .append_message(partition, &NewMessage::user(conversation_id, query))
            .await?;
        let assistant = self
            .conversations
            .append_message(
                partition,
                &NewMessage::assistant(conversation_id, answer, confidence, sources.to_vec()),
            )
            .await?;

        self.cache.append_history(&user).await;
        self.cache.append_history(&assistant).await;
        Ok(())
    }

    async fn finish_turn(&self, session: &mut Session) -> Result<(), AppError> {
        session.record_turn();
        self.cache.put_session(session).await
    }
}
