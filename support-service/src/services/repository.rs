//! Storage seams used by the pipeline.
//!
//! Every partition-scoped call takes the [`PartitionHandle`] produced by the
//! tenant resolver; implementations never derive a partition on their own.

use crate::models::{
    Context, ContactUpdate, Escalation, EscalationStatus, LogRequest, Message, NewKnowledgeEntry,
    NewMessage, PartitionHandle, SubjectProfile, Tenant,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Exact match on the canonical domain first, then the alternate domains.
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AppError>;

    async fn find_by_partition(&self, partition: &str) -> Result<Option<Tenant>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Entries with similarity >= `threshold`, most similar first.
    async fn similarity_search(
        &self,
        partition: &PartitionHandle,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Context>, AppError>;

    async fn increment_usage(&self, partition: &PartitionHandle, ids: &[Uuid])
        -> Result<(), AppError>;

    async fn insert_entry(
        &self,
        partition: &PartitionHandle,
        entry: &NewKnowledgeEntry,
    ) -> Result<Uuid, AppError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_subject(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
    ) -> Result<Option<SubjectProfile>, AppError>;

    async fn find_subject_by_employee_id(
        &self,
        partition: &PartitionHandle,
        employee_id: &str,
    ) -> Result<Option<SubjectProfile>, AppError>;

    async fn create_conversation(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
        session_id: &str,
    ) -> Result<Uuid, AppError>;

    async fn append_message(
        &self,
        partition: &PartitionHandle,
        message: &NewMessage,
    ) -> Result<Message, AppError>;

    /// Most recent `limit` messages in chronological order.
    async fn recent_messages(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError>;

    async fn latest_assistant_message_id(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Uuid>, AppError>;

    async fn mark_message_escalated(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError>;

    async fn mark_message_escalation_resolved(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError>;

    /// Fails with `Conflict` when the conversation already has a request.
    async fn create_log_request(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        subject_id: Uuid,
        notes: Option<&str>,
    ) -> Result<LogRequest, AppError>;
}

#[async_trait]
pub trait EscalationStore: Send + Sync {
    async fn insert_escalation(
        &self,
        partition: &PartitionHandle,
        escalation: &Escalation,
    ) -> Result<(), AppError>;

    async fn find_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
    ) -> Result<Option<Escalation>, AppError>;

    /// Newest pending escalation of the conversation, if any.
    async fn find_pending_for_conversation(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Escalation>, AppError>;

    async fn attach_contact(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        update: &ContactUpdate,
    ) -> Result<(), AppError>;

    /// Move a pending escalation to a terminal status. Returns `false` when the
    /// escalation was no longer pending, in which case nothing changed.
    async fn close_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        status: EscalationStatus,
        resolution: &str,
        resolved_by: &str,
    ) -> Result<bool, AppError>;

    async fn mark_added_to_kb(&self, partition: &PartitionHandle, id: Uuid)
        -> Result<(), AppError>;
}

/// The four storage seams, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub tenants: Arc<dyn TenantDirectory>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub escalations: Arc<dyn EscalationStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: TenantDirectory + KnowledgeStore + ConversationStore + EscalationStore + 'static,
    {
        Self {
            tenants: store.clone(),
            knowledge: store.clone(),
            conversations: store.clone(),
            escalations: store,
        }
    }
}
