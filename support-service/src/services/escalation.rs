//! Escalation decision, contact interception and record creation.

use crate::models::{
    ContactUpdate, Escalation, EscalationReason, EscalationSnapshot, PartitionHandle,
    SubjectProfile, SubjectSnapshot, Tenant,
};
use crate::services::metrics::record_escalation;
use crate::services::relay::RelayChannel;
use crate::services::repository::{ConversationStore, EscalationStore};
use crate::services::synthesizer::{SynthesizedAnswer, PROMPT_CONTRACT};
use chrono::Utc;
use regex::Regex;
use service_core::error::AppError;
use std::sync::{Arc, OnceLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Minimum digit count for a phone-like string.
const MIN_PHONE_DIGITS: usize = 8;

struct ContactPatterns {
    email: Regex,
    phone: Regex,
    digits: Regex,
}

fn contact_patterns() -> &'static ContactPatterns {
    static PATTERNS: OnceLock<ContactPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ContactPatterns {
        email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid regex"),
        phone: Regex::new(r"\+?\d[\d\s\-()]{6,}\d").expect("valid regex"),
        digits: Regex::new(r"\d{8,}").expect("valid regex"),
    })
}

/// The contact string in `message`, if it carries an email address or a
/// phone-like number.
pub fn extract_contact(message: &str) -> Option<String> {
    let patterns = contact_patterns();

    if let Some(m) = patterns.email.find(message) {
        return Some(m.as_str().to_string());
    }

    let phone = patterns.phone.find_iter(message).find(|m| {
        m.as_str().chars().filter(char::is_ascii_digit).count() >= MIN_PHONE_DIGITS
    });
    if let Some(m) = phone {
        return Some(m.as_str().trim().to_string());
    }

    patterns.digits.find(message).map(|m| m.as_str().to_string())
}

/// Whether `answer` should be escalated. The privacy refusal never is.
/// The threshold is inclusive.
pub fn evaluate_trigger(answer: &str, confidence: f64, threshold: f64) -> Option<EscalationReason> {
    if PROMPT_CONTRACT.is_privacy_refusal(answer) {
        return None;
    }
    if PROMPT_CONTRACT.is_refusal(answer) {
        return Some(EscalationReason::RefusalPhrase);
    }
    if confidence <= threshold {
        return Some(EscalationReason::LowConfidence);
    }
    None
}

/// One answered turn, after both messages are persisted.
#[derive(Debug, Clone)]
pub struct AnsweredTurn<'a> {
    pub tenant: &'a Tenant,
    pub conversation_id: Uuid,
    pub subject: &'a SubjectProfile,
    pub query: &'a str,
    pub answer: &'a SynthesizedAnswer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    NotEscalated,
    /// Contact details merged into an existing pending escalation.
    ContactAttached(Escalation),
    Escalated(Escalation),
}

impl EscalationOutcome {
    pub fn escalated(&self) -> bool {
        matches!(self, Self::Escalated(_))
    }
}

pub struct EscalationEngine {
    conversations: Arc<dyn ConversationStore>,
    escalations: Arc<dyn EscalationStore>,
    relay: Arc<dyn RelayChannel>,
}

impl EscalationEngine {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        escalations: Arc<dyn EscalationStore>,
        relay: Arc<dyn RelayChannel>,
    ) -> Self {
        Self {
            conversations,
            escalations,
            relay,
        }
    }

    /// Decide what the turn does to escalation state. Contact interception
    /// runs first so a phone number sent after a refusal never opens a
    /// second escalation.
    #[instrument(skip_all, fields(tenant_id = %turn.tenant.id, conversation_id = %turn.conversation_id))]
    pub async fn evaluate(&self, turn: AnsweredTurn<'_>) -> Result<EscalationOutcome, AppError> {
        if let Some(escalation) = self
            .intercept_contact(turn.tenant, turn.conversation_id, turn.query)
            .await?
        {
            return Ok(EscalationOutcome::ContactAttached(escalation));
        }

        let Some(reason) = evaluate_trigger(
            &turn.answer.answer,
            turn.answer.confidence,
            turn.tenant.ai.escalation_threshold,
        ) else {
            return Ok(EscalationOutcome::NotEscalated);
        };

        let escalation = self.create(&turn, reason).await?;
        Ok(EscalationOutcome::Escalated(escalation))
    }

    /// Attach contact details in `message` to the conversation's pending
    /// escalation. Returns the updated escalation when both exist.
    pub async fn intercept_contact(
        &self,
        tenant: &Tenant,
        conversation_id: Uuid,
        message: &str,
    ) -> Result<Option<Escalation>, AppError> {
        let Some(contact) = extract_contact(message) else {
            return Ok(None);
        };
        let partition = &tenant.partition;

        let Some(mut pending) = self
            .escalations
            .find_pending_for_conversation(partition, conversation_id)
            .await?
        else {
            return Ok(None);
        };

        let update = ContactUpdate {
            contact,
            received_at: Utc::now(),
        };
        self.escalations
            .attach_contact(partition, pending.id, &update)
            .await?;
        pending.contact = Some(update.clone());

        info!(escalation_id = %pending.id, "Contact details attached to pending escalation");

        let relay = self.relay.clone();
        let tenant = tenant.clone();
        let escalation = pending.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.notify_contact_update(&tenant, &escalation, &update).await {
                warn!(error = %e, escalation_id = %escalation.id, "Contact notice not delivered");
            }
        });

        Ok(Some(pending))
    }

    async fn create(
        &self,
        turn: &AnsweredTurn<'_>,
        reason: EscalationReason,
    ) -> Result<Escalation, AppError> {
        let partition: &PartitionHandle = &turn.tenant.partition;
        let last_message_id = self
            .conversations
            .latest_assistant_message_id(partition, turn.conversation_id)
            .await?;

        let snapshot = EscalationSnapshot {
            reason,
            ai_answer: Some(turn.answer.answer.clone()),
            confidence: turn.answer.confidence,
            knowledge_match: turn.answer.knowledge_match,
            sources: turn.answer.sources.clone(),
            subject: SubjectSnapshot {
                subject_id: turn.subject.id,
                employee_id: turn.subject.employee_id.clone(),
                name: turn.subject.name.clone(),
                email: turn.subject.email.clone(),
                policy_bucket: turn.subject.policy_bucket(),
            },
        };

        let escalation = Escalation::new(
            turn.conversation_id,
            last_message_id,
            turn.subject.id,
            turn.query.to_string(),
            snapshot,
        );
        self.escalations
            .insert_escalation(partition, &escalation)
            .await?;

        if let Some(message_id) = last_message_id {
            self.conversations
                .mark_message_escalated(partition, message_id)
                .await?;
        }

        record_escalation(&turn.tenant.id.to_string(), reason.as_str());
        info!(
            escalation_id = %escalation.id,
            reason = reason.as_str(),
            confidence = turn.answer.confidence,
            "Escalation created"
        );

        let relay = self.relay.clone();
        let tenant = turn.tenant.clone();
        let notice = escalation.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.notify_escalation(&tenant, &notice).await {
                warn!(error = %e, escalation_id = %notice.id, "Escalation notice not delivered");
            }
        });

        Ok(escalation)
    }
}
