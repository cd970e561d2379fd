//! Escalation records and their lifecycle state.
//!
//! The persisted `context` column is a JSON object. In memory it is split into
//! the immutable [`EscalationSnapshot`] taken at creation and the optional
//! [`ContactUpdate`] appended later; the two are merged only when written.

use crate::models::Source;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Key under which a late contact update is stored in the context object.
pub const CONTACT_KEY: &str = "contact_from_chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Resolved,
    Skipped,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid escalation status: {}", s)),
        }
    }
}

/// Why the answer was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    RefusalPhrase,
    LowConfidence,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefusalPhrase => "refusal_phrase",
            Self::LowConfidence => "low_confidence",
        }
    }
}

/// Coarse retrieval quality label shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeMatch {
    NoKnowledge,
    PoorMatch,
    PartialMatch,
    GoodMatch,
}

impl KnowledgeMatch {
    pub fn classify(context_count: usize, knowledge_exists: bool) -> Self {
        match context_count {
            0 if knowledge_exists => Self::PoorMatch,
            0 => Self::NoKnowledge,
            1 => Self::PartialMatch,
            _ => Self::GoodMatch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoKnowledge => "no_knowledge",
            Self::PoorMatch => "poor_match",
            Self::PartialMatch => "partial_match",
            Self::GoodMatch => "good_match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: Uuid,
    pub employee_id: String,
    pub name: String,
    pub email: Option<String>,
    pub policy_bucket: String,
}

/// Provenance captured when the escalation is created. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSnapshot {
    pub reason: EscalationReason,
    pub ai_answer: Option<String>,
    pub confidence: f64,
    pub knowledge_match: KnowledgeMatch,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub subject: SubjectSnapshot,
}

/// Contact details the user supplied after the escalation was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub contact: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub last_message_id: Option<Uuid>,
    pub subject_id: Uuid,
    pub query: String,
    pub snapshot: EscalationSnapshot,
    pub contact: Option<ContactUpdate>,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub was_added_to_kb: bool,
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(
        conversation_id: Uuid,
        last_message_id: Option<Uuid>,
        subject_id: Uuid,
        query: String,
        snapshot: EscalationSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            last_message_id,
            subject_id,
            query,
            snapshot,
            contact: None,
            status: EscalationStatus::Pending,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            was_added_to_kb: false,
            created_at: Utc::now(),
        }
    }

    /// Storage form of the context column: snapshot fields plus the contact key.
    pub fn context_json(&self) -> Result<Value, AppError> {
        let mut value = serde_json::to_value(&self.snapshot)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        if let (Some(contact), Value::Object(map)) = (&self.contact, &mut value) {
            let contact = serde_json::to_value(contact)
                .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
            map.insert(CONTACT_KEY.to_string(), contact);
        }

        Ok(value)
    }

    /// Split a stored context object back into snapshot and contact update.
    pub fn split_context(
        mut context: Value,
    ) -> Result<(EscalationSnapshot, Option<ContactUpdate>), AppError> {
        let contact = match &mut context {
            Value::Object(map) => map.remove(CONTACT_KEY),
            _ => None,
        };

        let snapshot: EscalationSnapshot = serde_json::from_value(context).map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Malformed escalation context: {}", e))
        })?;

        let contact = match contact {
            Some(v) => Some(serde_json::from_value(v).map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Malformed contact update: {}", e))
            })?),
            None => None,
        };

        Ok((snapshot, contact))
    }
}

/// Row shape of the per-partition `escalations` table.
#[derive(Debug, Clone, FromRow)]
pub struct EscalationRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub employee_id: Uuid,
    pub query: String,
    pub context: Json<Value>,
    pub status: String,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub was_added_to_kb: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EscalationRow> for Escalation {
    type Error = AppError;

    fn try_from(row: EscalationRow) -> Result<Self, Self::Error> {
        let (snapshot, contact) = Escalation::split_context(row.context.0)?;
        let status = row
            .status
            .parse()
            .map_err(|e: String| AppError::DatabaseError(anyhow::anyhow!(e)))?;

        Ok(Escalation {
            id: row.id,
            conversation_id: row.conversation_id,
            last_message_id: row.message_id,
            subject_id: row.employee_id,
            query: row.query,
            snapshot,
            contact,
            status,
            resolution: row.resolution,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            was_added_to_kb: row.was_added_to_kb,
            created_at: row.created_at,
        })
    }
}
