//! Chat sessions, messages and the subject (employee) profile.

use crate::models::Source;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A cached chat session. Expires with a sliding TTL; the conversation id
/// anchors the durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,

    pub conversation_id: Uuid,

    /// Owning tenant. A session presented to any other tenant is treated as missing.
    pub tenant_id: Uuid,

    /// Employee the session belongs to.
    pub subject_id: Uuid,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,

    pub message_count: u32,

    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub url: String,
}

impl Session {
    pub fn new(tenant_id: Uuid, subject_id: Uuid, conversation_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            conversation_id,
            tenant_id,
            subject_id,
            created_at: now,
            last_activity: now,
            message_count: 0,
            attachments: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_turn(&mut self) {
        self.message_count += 2;
        self.touch();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("Invalid message role: {}", other)),
        }
    }
}

/// Append-only chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: MessageRole,
    pub content: String,
    pub confidence: Option<f64>,
    #[sqlx(json)]
    pub sources: Vec<Source>,
    pub was_escalated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub confidence: Option<f64>,
    pub sources: Vec<Source>,
}

impl NewMessage {
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            confidence: None,
            sources: Vec::new(),
        }
    }

    pub fn assistant(
        conversation_id: Uuid,
        content: impl Into<String>,
        confidence: f64,
        sources: Vec<Source>,
    ) -> Self {
        Self {
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            confidence: Some(confidence),
            sources,
        }
    }
}

/// Employee profile used to ground answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubjectProfile {
    pub id: Uuid,
    pub employee_id: String,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub policy_type: Option<String>,
    pub coverage_limit: Option<f64>,
    pub is_active: bool,
}

impl SubjectProfile {
    /// Lower-cased policy identifier, `general` when the employee has none.
    pub fn policy_bucket(&self) -> String {
        self.policy_type
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| crate::models::GENERAL_SUBCATEGORY.to_string())
    }
}

/// Letter-of-Guarantee request recorded once per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LogRequest {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub subject_id: Uuid,
    pub notes: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
