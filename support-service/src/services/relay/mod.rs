//! Operator relay: outbound escalation notices and inbound operator replies.
//!
//! The channel is an injected, long-lived collaborator with an explicit
//! `start`/`stop` lifecycle. The HITL protocol in [`protocol`] never talks to
//! a concrete transport.

pub mod mock;
pub mod protocol;
pub mod telegram;

use crate::models::{ContactUpdate, Escalation, LogRequest, SubjectProfile, Tenant};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay not configured: {0}")]
    NotConfigured(String),

    #[error("Relay API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Relay already started")]
    AlreadyStarted,
}

/// A reply an operator sent to one of our notices.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorReply {
    pub chat_id: String,
    pub message_id: i64,
    pub operator: String,
    pub text: String,
    /// Body of the notice being replied to; carries the correlation tag.
    pub replied_to_text: String,
}

/// Consumer of operator replies. Returns feedback to send back to the operator.
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn handle_reply(&self, reply: OperatorReply) -> Option<String>;
}

#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Begin delivering operator replies to `handler`.
    async fn start(&self, handler: Arc<dyn ReplyHandler>) -> Result<(), RelayError>;

    async fn stop(&self);

    async fn notify_escalation(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
    ) -> Result<(), RelayError>;

    async fn notify_contact_update(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
        contact: &ContactUpdate,
    ) -> Result<(), RelayError>;

    async fn notify_log_request(
        &self,
        tenant: &Tenant,
        subject: &SubjectProfile,
        request: &LogRequest,
    ) -> Result<(), RelayError>;

    /// Send `text` to `chat_id`, threaded under `reply_to` when given.
    async fn reply(&self, chat_id: &str, reply_to: Option<i64>, text: &str)
        -> Result<(), RelayError>;

    fn name(&self) -> &str;
}

/// Channel used when the relay is disabled. Notices are logged and dropped.
pub struct DisabledRelay;

#[async_trait]
impl RelayChannel for DisabledRelay {
    async fn start(&self, _handler: Arc<dyn ReplyHandler>) -> Result<(), RelayError> {
        tracing::info!("Operator relay disabled");
        Ok(())
    }

    async fn stop(&self) {}

    async fn notify_escalation(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
    ) -> Result<(), RelayError> {
        tracing::info!(
            tenant_id = %tenant.id,
            escalation_id = %escalation.id,
            "Relay disabled, escalation notice not sent"
        );
        Ok(())
    }

    async fn notify_contact_update(
        &self,
        _tenant: &Tenant,
        escalation: &Escalation,
        _contact: &ContactUpdate,
    ) -> Result<(), RelayError> {
        tracing::info!(escalation_id = %escalation.id, "Relay disabled, contact notice not sent");
        Ok(())
    }

    async fn notify_log_request(
        &self,
        _tenant: &Tenant,
        _subject: &SubjectProfile,
        request: &LogRequest,
    ) -> Result<(), RelayError> {
        tracing::info!(log_request_id = %request.id, "Relay disabled, LOG notice not sent");
        Ok(())
    }

    async fn reply(&self, _chat_id: &str, _reply_to: Option<i64>, _text: &str) -> Result<(), RelayError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "disabled"
    }
}
