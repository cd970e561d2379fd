//! HITL wire protocol: correlation tags, operator commands and the
//! resolution flow that feeds answers back into the knowledge base.

use super::{OperatorReply, ReplyHandler};
use crate::models::{
    ContactUpdate, Escalation, EscalationStatus, LogRequest, NewKnowledgeEntry, PartitionHandle,
    SubjectProfile, Tenant, LEARNED_CATEGORY,
};
use crate::services::metrics::record_hitl_outcome;
use crate::services::providers::EmbeddingProvider;
use crate::services::repository::{
    ConversationStore, EscalationStore, KnowledgeStore, TenantDirectory,
};
use async_trait::async_trait;
use regex::Regex;
use service_core::error::AppError;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Resolution stored for skipped escalations.
pub const SKIPPED_RESOLUTION: &str = "[Skipped by operator]";

/// Knowledge entry source for operator-authored answers.
pub const HITL_SOURCE: &str = "hitl";

/// Longest notice the relay sends, in characters. Telegram rejects text
/// over 4096 and counts some emoji twice, hence the margin.
pub const MAX_NOTICE_CHARS: usize = 4000;

/// Longest excerpt of user or model text quoted in a notice.
const MAX_EXCERPT_CHARS: usize = 1500;

/// `text` cut to `max` characters, ending in an ellipsis when cut.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

/// Body clipped so that body plus tag fit in one notice. The tag always survives.
fn seal(body: &str, tag: &CorrelationTag) -> String {
    let tag = tag.encode();
    let room = MAX_NOTICE_CHARS.saturating_sub(tag.chars().count() + 1);
    format!("{}\n{}", clip(body.trim_end(), room), tag)
}

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        Regex::new(r"\[Escalation:\s*([0-9a-fA-F-]{36})(?:\|Schema:\s*([a-z0-9_]+))?\]")
            .expect("valid regex")
    })
}

/// `[Escalation: <uuid>|Schema: <partition>]`
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationTag {
    pub escalation_id: Uuid,
    pub partition: PartitionHandle,
}

impl CorrelationTag {
    pub fn new(escalation_id: Uuid, partition: PartitionHandle) -> Self {
        Self {
            escalation_id,
            partition,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "[Escalation: {}|Schema: {}]",
            self.escalation_id,
            self.partition.name()
        )
    }

    /// Find a tag anywhere in `text`. Tags without a schema address the
    /// public partition.
    pub fn parse(text: &str) -> Option<Self> {
        let captures = tag_pattern().captures(text)?;
        let escalation_id = Uuid::parse_str(captures.get(1)?.as_str()).ok()?;
        let partition = match captures.get(2) {
            Some(m) => PartitionHandle::parse(m.as_str()).ok()?,
            None => PartitionHandle::public(),
        };
        Some(Self {
            escalation_id,
            partition,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Skip,
    Confirm,
    Custom(String),
}

impl OperatorCommand {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.to_lowercase().as_str() {
            "skip" | "/skip" => Self::Skip,
            "correct" | "ok" | "✓" | "/correct" => Self::Confirm,
            _ => Self::Custom(trimmed.to_string()),
        }
    }
}

pub fn format_escalation_notice(tenant: &Tenant, escalation: &Escalation) -> String {
    let snapshot = &escalation.snapshot;
    let tag = CorrelationTag::new(escalation.id, tenant.partition.clone());

    let mut text = format!(
        "🔔 New escalation for {}\n\n\
         Employee: {} ({})\n\
         Policy: {}\n\
         Reason: {}\n\
         Knowledge match: {}\n\
         Confidence: {:.2}\n\n\
         Question:\n{}\n",
        tenant.name,
        snapshot.subject.name,
        snapshot.subject.employee_id,
        snapshot.subject.policy_bucket,
        snapshot.reason.as_str(),
        snapshot.knowledge_match.as_str(),
        snapshot.confidence,
        clip(&escalation.query, MAX_EXCERPT_CHARS),
    );

    if let Some(answer) = &snapshot.ai_answer {
        text.push_str(&format!("\nAI answer:\n{}\n", clip(answer, MAX_EXCERPT_CHARS)));
    }
    if !snapshot.sources.is_empty() {
        text.push_str("\nSources:\n");
        for source in &snapshot.sources {
            text.push_str(&format!("- {} ({:.2})\n", clip(&source.title, 120), source.similarity));
        }
    }

    text.push_str(
        "\nReply to this message with \"correct\" to approve the AI answer, \
         \"skip\" to dismiss, or type the correct answer.\n",
    );
    seal(&text, &tag)
}

pub fn format_contact_notice(tenant: &Tenant, escalation: &Escalation, contact: &ContactUpdate) -> String {
    let tag = CorrelationTag::new(escalation.id, tenant.partition.clone());
    let text = format!(
        "📞 Contact details received for escalation\n\n\
         Employee: {} ({})\n\
         Contact: {}\n\
         Question:\n{}\n",
        escalation.snapshot.subject.name,
        escalation.snapshot.subject.employee_id,
        clip(&contact.contact, 200),
        clip(&escalation.query, MAX_EXCERPT_CHARS),
    );
    seal(&text, &tag)
}

pub fn format_log_notice(tenant: &Tenant, subject: &SubjectProfile, request: &LogRequest) -> String {
    let mut text = format!(
        "📄 Letter of Guarantee request for {}\n\n\
         Employee: {} ({})\n\
         Policy: {}\n\
         Conversation: {}\n",
        tenant.name,
        subject.name,
        subject.employee_id,
        subject.policy_bucket(),
        request.conversation_id,
    );
    if let Some(email) = &subject.email {
        text.push_str(&format!("Email: {}\n", email));
    }
    if let Some(notes) = &request.notes {
        text.push_str(&format!("Notes: {}\n", clip(notes, MAX_EXCERPT_CHARS)));
    }
    clip(&text, MAX_NOTICE_CHARS)
}

/// Why an operator reply was not applied.
#[derive(Error, Debug)]
pub enum HitlRejection {
    #[error("No escalation reference found in the replied message")]
    MissingTag,

    #[error("Unknown partition '{0}'")]
    UnknownPartition(String),

    #[error("Escalation {0} not found")]
    EscalationNotFound(Uuid),

    #[error("Escalation {0} is already {1}")]
    AlreadyClosed(Uuid, EscalationStatus),

    #[error("Escalation {0} has no AI answer to confirm; reply with the correct answer instead")]
    NoAiAnswer(Uuid),

    #[error("Reply is empty")]
    EmptyReply,

    #[error("Storage error: {0}")]
    Storage(#[from] AppError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HitlOutcome {
    Resolved {
        escalation_id: Uuid,
        knowledge_entry: Option<Uuid>,
        knowledge_error: Option<String>,
    },
    Skipped {
        escalation_id: Uuid,
    },
}

impl HitlOutcome {
    pub fn feedback(&self) -> String {
        match self {
            Self::Resolved {
                escalation_id,
                knowledge_entry: Some(_),
                knowledge_error: None,
            } => format!(
                "✅ Escalation {} resolved and added to the knowledge base.",
                escalation_id
            ),
            Self::Resolved {
                escalation_id,
                knowledge_entry: Some(entry_id),
                knowledge_error: Some(e),
            } => format!(
                "⚠️ Escalation {} resolved and added to the knowledge base as {}, \
                 but the escalation could not be flagged as learned: {}",
                escalation_id, entry_id, e
            ),
            Self::Resolved {
                escalation_id,
                knowledge_error,
                ..
            } => format!(
                "⚠️ Escalation {} resolved, but the knowledge base update failed: {}",
                escalation_id,
                knowledge_error.as_deref().unwrap_or("unknown error")
            ),
            Self::Skipped { escalation_id } => {
                format!("⏭️ Escalation {} skipped.", escalation_id)
            }
        }
    }
}

/// Applies operator replies to escalations.
pub struct HitlRelay {
    tenants: Arc<dyn TenantDirectory>,
    escalations: Arc<dyn EscalationStore>,
    conversations: Arc<dyn ConversationStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl HitlRelay {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        escalations: Arc<dyn EscalationStore>,
        conversations: Arc<dyn ConversationStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            tenants,
            escalations,
            conversations,
            knowledge,
            embedder,
        }
    }

    #[instrument(skip(self, reply), fields(operator = %reply.operator))]
    pub async fn process(&self, reply: &OperatorReply) -> Result<HitlOutcome, HitlRejection> {
        let tag = CorrelationTag::parse(&reply.replied_to_text).ok_or(HitlRejection::MissingTag)?;
        let partition = &tag.partition;

        if partition.name() != PartitionHandle::PUBLIC
            && self.tenants.find_by_partition(partition.name()).await?.is_none()
        {
            return Err(HitlRejection::UnknownPartition(partition.name().to_string()));
        }

        let escalation = self
            .escalations
            .find_escalation(partition, tag.escalation_id)
            .await?
            .ok_or(HitlRejection::EscalationNotFound(tag.escalation_id))?;

        if escalation.status.is_terminal() {
            return Err(HitlRejection::AlreadyClosed(escalation.id, escalation.status));
        }

        let (status, resolution) = match OperatorCommand::parse(&reply.text) {
            OperatorCommand::Skip => (EscalationStatus::Skipped, SKIPPED_RESOLUTION.to_string()),
            OperatorCommand::Confirm => {
                let answer = escalation
                    .snapshot
                    .ai_answer
                    .clone()
                    .filter(|a| !a.trim().is_empty())
                    .ok_or(HitlRejection::NoAiAnswer(escalation.id))?;
                (EscalationStatus::Resolved, answer)
            }
            OperatorCommand::Custom(text) if text.is_empty() => return Err(HitlRejection::EmptyReply),
            OperatorCommand::Custom(text) => (EscalationStatus::Resolved, text),
        };

        let closed = self
            .escalations
            .close_escalation(partition, escalation.id, status, &resolution, &reply.operator)
            .await?;
        if !closed {
            // Closed by a concurrent reply between the read and the update.
            let current = self
                .escalations
                .find_escalation(partition, escalation.id)
                .await?
                .map(|e| e.status)
                .unwrap_or(EscalationStatus::Resolved);
            return Err(HitlRejection::AlreadyClosed(escalation.id, current));
        }

        info!(escalation_id = %escalation.id, status = %status, "Escalation closed by operator");

        if status == EscalationStatus::Skipped {
            return Ok(HitlOutcome::Skipped {
                escalation_id: escalation.id,
            });
        }

        let entry_id = match self.learn(partition, &escalation, &resolution).await {
            Ok(entry_id) => entry_id,
            Err(e) => {
                error!(escalation_id = %escalation.id, error = %e, "Knowledge base update failed");
                return Ok(HitlOutcome::Resolved {
                    escalation_id: escalation.id,
                    knowledge_entry: None,
                    knowledge_error: Some(e.to_string()),
                });
            }
        };

        // The entry exists from here on; a failed flag must not read as a failed insert.
        let flag_error = match self.escalations.mark_added_to_kb(partition, escalation.id).await {
            Ok(_) => None,
            Err(e) => {
                error!(escalation_id = %escalation.id, entry_id = %entry_id, error = %e, "Failed to flag escalation as learned");
                Some(e.to_string())
            }
        };

        if let Some(message_id) = escalation.last_message_id {
            if let Err(e) = self
                .conversations
                .mark_message_escalation_resolved(partition, message_id)
                .await
            {
                warn!(error = %e, message_id = %message_id, "Failed to flag message as resolved");
            }
        }

        Ok(HitlOutcome::Resolved {
            escalation_id: escalation.id,
            knowledge_entry: Some(entry_id),
            knowledge_error: flag_error,
        })
    }

    /// Write the resolved answer back as a learned knowledge entry.
    async fn learn(
        &self,
        partition: &PartitionHandle,
        escalation: &Escalation,
        resolution: &str,
    ) -> Result<Uuid, AppError> {
        let title = escalation.query.chars().take(200).collect::<String>();
        let content = format!("Question: {}\n\nAnswer: {}", escalation.query, resolution);
        let embedding = self
            .embedder
            .embed(&NewKnowledgeEntry::embedding_text(&title, &content))
            .await?;

        let entry_id = self
            .knowledge
            .insert_entry(
                partition,
                &NewKnowledgeEntry {
                    title,
                    content,
                    category: LEARNED_CATEGORY.to_string(),
                    subcategory: Some(escalation.snapshot.subject.policy_bucket.clone()),
                    source: HITL_SOURCE.to_string(),
                    embedding,
                },
            )
            .await?;

        Ok(entry_id)
    }
}

#[async_trait]
impl ReplyHandler for HitlRelay {
    async fn handle_reply(&self, reply: OperatorReply) -> Option<String> {
        match self.process(&reply).await {
            Ok(outcome) => {
                let label = match &outcome {
                    HitlOutcome::Skipped { .. } => "skipped",
                    HitlOutcome::Resolved {
                        knowledge_entry: Some(_),
                        knowledge_error: None,
                        ..
                    } => "resolved",
                    HitlOutcome::Resolved { .. } => "kb_failed",
                };
                record_hitl_outcome(label);
                Some(outcome.feedback())
            }
            Err(HitlRejection::MissingTag) => {
                // Ordinary chatter in the operator chat.
                None
            }
            Err(rejection) => {
                record_hitl_outcome("rejected");
                warn!(error = %rejection, "Operator reply rejected");
                Some(format!("❌ {}", rejection))
            }
        }
    }
}
