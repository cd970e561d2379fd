//! In-process relay that records notices. Used by tests and local runs.

use super::protocol::{format_contact_notice, format_escalation_notice, format_log_notice};
use super::{OperatorReply, RelayChannel, RelayError, ReplyHandler};
use crate::models::{ContactUpdate, Escalation, LogRequest, SubjectProfile, Tenant};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Escalation { escalation_id: Uuid, text: String },
    Contact { escalation_id: Uuid, contact: String, text: String },
    LogRequest { request_id: Uuid, text: String },
    Reply { chat_id: String, reply_to: Option<i64>, text: String },
}

#[derive(Default)]
pub struct RecordingRelay {
    events: Mutex<Vec<RelayEvent>>,
    handler: Mutex<Option<Arc<dyn ReplyHandler>>>,
    failing: AtomicBool,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Text of the most recent escalation notice.
    pub fn last_escalation_notice(&self) -> Option<String> {
        self.events().into_iter().rev().find_map(|e| match e {
            RelayEvent::Escalation { text, .. } => Some(text),
            _ => None,
        })
    }

    /// Notices are sent from spawned tasks; wait until `count` have arrived.
    pub async fn wait_for_events(&self, count: usize) -> Vec<RelayEvent> {
        for _ in 0..100 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }

    /// Simulate an operator replying to `notice` and return the feedback sent.
    pub async fn operator_replies(&self, notice: &str, operator: &str, text: &str) -> Option<String> {
        let handler = self.handler.lock().ok().and_then(|h| h.clone())?;
        let feedback = handler
            .handle_reply(OperatorReply {
                chat_id: "operators".to_string(),
                message_id: 1,
                operator: operator.to_string(),
                text: text.to_string(),
                replied_to_text: notice.to_string(),
            })
            .await?;
        self.record(RelayEvent::Reply {
            chat_id: "operators".to_string(),
            reply_to: Some(1),
            text: feedback.clone(),
        });
        Some(feedback)
    }

    fn record(&self, event: RelayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn check(&self) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::NetworkError("relay unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayChannel for RecordingRelay {
    async fn start(&self, handler: Arc<dyn ReplyHandler>) -> Result<(), RelayError> {
        let mut slot = self
            .handler
            .lock()
            .map_err(|e| RelayError::ApiError(e.to_string()))?;
        *slot = Some(handler);
        Ok(())
    }

    async fn stop(&self) {
        if let Ok(mut slot) = self.handler.lock() {
            slot.take();
        }
    }

    async fn notify_escalation(&self, tenant: &Tenant, escalation: &Escalation) -> Result<(), RelayError> {
        self.check()?;
        self.record(RelayEvent::Escalation {
            escalation_id: escalation.id,
            text: format_escalation_notice(tenant, escalation),
        });
        Ok(())
    }

    async fn notify_contact_update(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
        contact: &ContactUpdate,
    ) -> Result<(), RelayError> {
        self.check()?;
        self.record(RelayEvent::Contact {
            escalation_id: escalation.id,
            contact: contact.contact.clone(),
            text: format_contact_notice(tenant, escalation, contact),
        });
        Ok(())
    }

    async fn notify_log_request(
        &self,
        tenant: &Tenant,
        subject: &SubjectProfile,
        request: &LogRequest,
    ) -> Result<(), RelayError> {
        self.check()?;
        self.record(RelayEvent::LogRequest {
            request_id: request.id,
            text: format_log_notice(tenant, subject, request),
        });
        Ok(())
    }

    async fn reply(&self, chat_id: &str, reply_to: Option<i64>, text: &str) -> Result<(), RelayError> {
        self.check()?;
        self.record(RelayEvent::Reply {
            chat_id: chat_id.to_string(),
            reply_to,
            text: text.to_string(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
