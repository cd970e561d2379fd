//! In-process store used by tests and local runs without Postgres.

use crate::models::{
    Context, ContactUpdate, Escalation, EscalationStatus, KnowledgeEntry, LogRequest, Message,
    MessageRole, NewKnowledgeEntry, NewMessage, PartitionHandle, SubjectProfile, Tenant,
};
use crate::services::repository::{
    ConversationStore, EscalationStore, KnowledgeStore, TenantDirectory,
};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct PartitionData {
    subjects: Vec<SubjectProfile>,
    knowledge: Vec<KnowledgeEntry>,
    conversations: HashMap<Uuid, (Uuid, String)>,
    messages: Vec<Message>,
    resolved_messages: HashSet<Uuid>,
    escalations: Vec<Escalation>,
    log_requests: Vec<LogRequest>,
}

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    partitions: HashMap<String, PartitionData>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_knowledge_inserts: AtomicBool,
    fail_kb_flags: AtomicBool,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Memory store poisoned: {}", e)))
    }

    fn partition<'a>(state: &'a mut State, partition: &PartitionHandle) -> &'a mut PartitionData {
        state
            .partitions
            .entry(partition.name().to_string())
            .or_default()
    }

    pub fn seed_tenant(&self, tenant: Tenant) {
        if let Ok(mut state) = self.lock() {
            state.tenants.retain(|t| t.id != tenant.id);
            state.tenants.push(tenant);
        }
    }

    pub fn seed_subject(&self, partition: &PartitionHandle, subject: SubjectProfile) {
        if let Ok(mut state) = self.lock() {
            Self::partition(&mut state, partition).subjects.push(subject);
        }
    }

    pub fn seed_knowledge(&self, partition: &PartitionHandle, entry: NewKnowledgeEntry) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut state) = self.lock() {
            Self::partition(&mut state, partition)
                .knowledge
                .push(Self::materialize(id, entry));
        }
        id
    }

    pub fn knowledge_entries(&self, partition: &PartitionHandle) -> Vec<KnowledgeEntry> {
        self.lock()
            .map(|mut s| Self::partition(&mut s, partition).knowledge.clone())
            .unwrap_or_default()
    }

    pub fn escalations(&self, partition: &PartitionHandle) -> Vec<Escalation> {
        self.lock()
            .map(|mut s| Self::partition(&mut s, partition).escalations.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, partition: &PartitionHandle, conversation_id: Uuid) -> Vec<Message> {
        self.lock()
            .map(|mut s| {
                Self::partition(&mut s, partition)
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_escalation_resolved_on_message(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> bool {
        self.lock()
            .map(|mut s| {
                Self::partition(&mut s, partition)
                    .resolved_messages
                    .contains(&message_id)
            })
            .unwrap_or(false)
    }

    /// Make every subsequent `mark_added_to_kb` fail.
    pub fn fail_kb_flags(&self, fail: bool) {
        self.fail_kb_flags.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent knowledge insert fail.
    pub fn fail_knowledge_inserts(&self, fail: bool) {
        self.fail_knowledge_inserts.store(fail, Ordering::SeqCst);
    }

    fn materialize(id: Uuid, entry: NewKnowledgeEntry) -> KnowledgeEntry {
        KnowledgeEntry {
            id,
            title: entry.title,
            content: entry.content,
            category: entry.category,
            subcategory: entry.subcategory,
            source: entry.source,
            embedding: entry.embedding,
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AppError> {
        let state = self.lock()?;
        let exact = state.tenants.iter().find(|t| t.domain == domain);
        let found = exact.or_else(|| {
            state
                .tenants
                .iter()
                .find(|t| t.alternate_domains.iter().any(|d| d == domain))
        });
        Ok(found.cloned())
    }

    async fn find_by_partition(&self, partition: &str) -> Result<Option<Tenant>, AppError> {
        let state = self.lock()?;
        Ok(state
            .tenants
            .iter()
            .find(|t| t.partition.name() == partition)
            .cloned())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn similarity_search(
        &self,
        partition: &PartitionHandle,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Context>, AppError> {
        let mut state = self.lock()?;
        let data = Self::partition(&mut state, partition);

        let mut hits: Vec<Context> = data
            .knowledge
            .iter()
            .map(|e| Context {
                id: e.id,
                title: e.title.clone(),
                category: e.category.clone(),
                subcategory: e.subcategory.clone(),
                content: e.content.clone(),
                similarity: cosine_similarity(&e.embedding, embedding),
            })
            .filter(|c| c.similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn increment_usage(
        &self,
        partition: &PartitionHandle,
        ids: &[Uuid],
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        for entry in Self::partition(&mut state, partition)
            .knowledge
            .iter_mut()
            .filter(|e| ids.contains(&e.id))
        {
            entry.usage_count += 1;
            entry.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn insert_entry(
        &self,
        partition: &PartitionHandle,
        entry: &NewKnowledgeEntry,
    ) -> Result<Uuid, AppError> {
        if self.fail_knowledge_inserts.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "knowledge insert rejected"
            )));
        }
        let id = Uuid::new_v4();
        let mut state = self.lock()?;
        Self::partition(&mut state, partition)
            .knowledge
            .push(Self::materialize(id, entry.clone()));
        Ok(id)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_subject(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
    ) -> Result<Option<SubjectProfile>, AppError> {
        let mut state = self.lock()?;
        Ok(Self::partition(&mut state, partition)
            .subjects
            .iter()
            .find(|s| s.id == subject_id)
            .cloned())
    }

    async fn find_subject_by_employee_id(
        &self,
        partition: &PartitionHandle,
        employee_id: &str,
    ) -> Result<Option<SubjectProfile>, AppError> {
        let mut state = self.lock()?;
        Ok(Self::partition(&mut state, partition)
            .subjects
            .iter()
            .find(|s| s.employee_id == employee_id)
            .cloned())
    }

    async fn create_conversation(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
        session_id: &str,
    ) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let mut state = self.lock()?;
        Self::partition(&mut state, partition)
            .conversations
            .insert(id, (subject_id, session_id.to_string()));
        Ok(id)
    }

    async fn append_message(
        &self,
        partition: &PartitionHandle,
        message: &NewMessage,
    ) -> Result<Message, AppError> {
        let mut state = self.lock()?;
        let data = Self::partition(&mut state, partition);
        if !data.conversations.contains_key(&message.conversation_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Conversation {} not found",
                message.conversation_id
            )));
        }

        let stored = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content.clone(),
            confidence: message.confidence,
            sources: message.sources.clone(),
            was_escalated: false,
            created_at: Utc::now(),
        };
        data.messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let mut state = self.lock()?;
        let all: Vec<Message> = Self::partition(&mut state, partition)
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn latest_assistant_message_id(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        let mut state = self.lock()?;
        Ok(Self::partition(&mut state, partition)
            .messages
            .iter()
            .rev()
            .find(|m| m.conversation_id == conversation_id && m.role == MessageRole::Assistant)
            .map(|m| m.id))
    }

    async fn mark_message_escalated(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(m) = Self::partition(&mut state, partition)
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
        {
            m.was_escalated = true;
        }
        Ok(())
    }

    async fn mark_message_escalation_resolved(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        Self::partition(&mut state, partition)
            .resolved_messages
            .insert(message_id);
        Ok(())
    }

    async fn create_log_request(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        subject_id: Uuid,
        notes: Option<&str>,
    ) -> Result<LogRequest, AppError> {
        let mut state = self.lock()?;
        let data = Self::partition(&mut state, partition);
        if data
            .log_requests
            .iter()
            .any(|r| r.conversation_id == conversation_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A Letter of Guarantee request already exists for this conversation"
            )));
        }

        let request = LogRequest {
            id: Uuid::new_v4(),
            conversation_id,
            subject_id,
            notes: notes.map(str::to_string),
            status: "pending".to_string(),
            created_at: Utc::now(),
        };
        data.log_requests.push(request.clone());
        Ok(request)
    }
}

#[async_trait]
impl EscalationStore for MemoryStore {
    async fn insert_escalation(
        &self,
        partition: &PartitionHandle,
        escalation: &Escalation,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        Self::partition(&mut state, partition)
            .escalations
            .push(escalation.clone());
        Ok(())
    }

    async fn find_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
    ) -> Result<Option<Escalation>, AppError> {
        let mut state = self.lock()?;
        Ok(Self::partition(&mut state, partition)
            .escalations
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn find_pending_for_conversation(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Escalation>, AppError> {
        let mut state = self.lock()?;
        Ok(Self::partition(&mut state, partition)
            .escalations
            .iter()
            .rev()
            .find(|e| e.conversation_id == conversation_id && !e.status.is_terminal())
            .cloned())
    }

    async fn attach_contact(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        update: &ContactUpdate,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(e) = Self::partition(&mut state, partition)
            .escalations
            .iter_mut()
            .find(|e| e.id == id)
        {
            e.contact = Some(update.clone());
        }
        Ok(())
    }

    async fn close_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        status: EscalationStatus,
        resolution: &str,
        resolved_by: &str,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let Some(e) = Self::partition(&mut state, partition)
            .escalations
            .iter_mut()
            .find(|e| e.id == id && !e.status.is_terminal())
        else {
            return Ok(false);
        };

        e.status = status;
        e.resolution = Some(resolution.to_string());
        e.resolved_by = Some(resolved_by.to_string());
        e.resolved_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_added_to_kb(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
    ) -> Result<(), AppError> {
        if self.fail_kb_flags.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!("escalation update rejected")));
        }
        let mut state = self.lock()?;
        if let Some(e) = Self::partition(&mut state, partition)
            .escalations
            .iter_mut()
            .find(|e| e.id == id)
        {
            e.was_added_to_kb = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&v, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&v, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let store = MemoryStore::new();
        let a = PartitionHandle::parse("tenant_a").unwrap();
        let b = PartitionHandle::parse("tenant_b").unwrap();

        store.seed_knowledge(
            &a,
            NewKnowledgeEntry {
                title: "Dental".to_string(),
                content: "Covered".to_string(),
                category: "benefits".to_string(),
                subcategory: Some("dental".to_string()),
                source: "faq".to_string(),
                embedding: vec![1.0, 0.0],
            },
        );

        let hits_a = store.similarity_search(&a, &[1.0, 0.0], 0.5, 5).await.unwrap();
        let hits_b = store.similarity_search(&b, &[1.0, 0.0], 0.5, 5).await.unwrap();
        assert_eq!(hits_a.len(), 1);
        assert!(hits_b.is_empty());
    }

    #[tokio::test]
    async fn second_log_request_conflicts() {
        let store = MemoryStore::new();
        let p = PartitionHandle::parse("acme").unwrap();
        let conv = store.create_conversation(&p, Uuid::new_v4(), "s").await.unwrap();

        store.create_log_request(&p, conv, Uuid::new_v4(), None).await.unwrap();
        let err = store
            .create_log_request(&p, conv, Uuid::new_v4(), Some("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
