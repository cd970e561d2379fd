//! Telegram Bot API channel. Receives replies by long polling or webhook.

use super::protocol::{format_contact_notice, format_escalation_notice, format_log_notice};
use super::{OperatorReply, RelayChannel, RelayError, ReplyHandler};
use crate::config::{RelayConfig, RelayMode};
use crate::models::{ContactUpdate, Escalation, LogRequest, SubjectProfile, Tenant};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Header Telegram sets on webhook deliveries when a secret is registered.
pub const WEBHOOK_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl User {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

/// Extract an operator reply from an update. Only replies posted in the
/// operator chat count.
pub fn operator_reply(update: &Update, operator_chat_id: &str) -> Option<OperatorReply> {
    let message = update.message.as_ref()?;
    if message.chat.id.to_string() != operator_chat_id {
        return None;
    }
    let text = message.text.as_ref()?;
    let replied_to = message.reply_to_message.as_ref()?;
    let replied_to_text = replied_to.text.clone()?;

    Some(OperatorReply {
        chat_id: message.chat.id.to_string(),
        message_id: message.message_id,
        operator: message
            .from
            .as_ref()
            .map(User::display_name)
            .unwrap_or_else(|| "operator".to_string()),
        text: text.clone(),
        replied_to_text,
    })
}

pub struct TelegramRelay {
    config: RelayConfig,
    client: Client,
    handler: RwLock<Option<Arc<dyn ReplyHandler>>>,
    shutdown_token: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramRelay {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        if config.bot_token.is_empty() || config.operator_chat_id.is_empty() {
            return Err(RelayError::NotConfigured(
                "bot token and operator chat id are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .map_err(|e| RelayError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            handler: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
            poller: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> RelayMode {
        self.config.mode
    }

    /// Whether a webhook delivery carries the configured secret.
    pub fn verify_webhook_secret(&self, presented: Option<&str>) -> bool {
        match &self.config.webhook_secret {
            Some(secret) => presented == Some(secret.as_str()),
            None => true,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<R, RelayError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::NetworkError(e.to_string()))?;

        let status = response.status();
        let parsed: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| RelayError::ApiError(format!("{} ({}): {}", method, status, e)))?;

        if !parsed.ok {
            return Err(RelayError::ApiError(format!(
                "{} ({}): {}",
                method,
                status,
                parsed.description.unwrap_or_default()
            )));
        }

        parsed
            .result
            .ok_or_else(|| RelayError::ApiError(format!("{}: empty result", method)))
    }

    async fn send(&self, chat_id: &str, text: &str, reply_to: Option<i64>) -> Result<(), RelayError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id,
                    text,
                    reply_to_message_id: reply_to,
                },
            )
            .await?;
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, RelayError> {
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: POLL_TIMEOUT_SECS,
                allowed_updates: ["message"],
            },
        )
        .await
    }

    fn current_handler(&self) -> Option<Arc<dyn ReplyHandler>> {
        self.handler.read().ok().and_then(|h| h.clone())
    }

    /// Dispatch one update to the reply handler and send its feedback.
    pub async fn handle_update(&self, update: Update) {
        let Some(reply) = operator_reply(&update, &self.config.operator_chat_id) else {
            debug!(update_id = update.update_id, "Ignoring non-reply update");
            return;
        };
        let Some(handler) = self.current_handler() else {
            warn!("Operator reply received before relay start");
            return;
        };

        let chat_id = reply.chat_id.clone();
        let message_id = reply.message_id;
        if let Some(feedback) = handler.handle_reply(reply).await {
            if let Err(e) = self.send(&chat_id, &feedback, Some(message_id)).await {
                error!(error = %e, "Failed to send operator feedback");
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset = 0i64;
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        info!("Telegram long polling started");

        loop {
            let result = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                result = self.get_updates(offset) => result,
            };

            match result {
                Ok(updates) => {
                    backoff.reset();
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    warn!(error = %e, retry_in_ms = wait.as_millis() as u64, "getUpdates failed");
                    tokio::select! {
                        _ = self.shutdown_token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        info!("Telegram long polling stopped");
    }
}

/// Start the channel. Polling mode needs the owning `Arc` to spawn the loop.
pub async fn start_polling(relay: &Arc<TelegramRelay>) -> Result<(), RelayError> {
    let mut poller = relay.poller.lock().await;
    if poller.is_some() {
        return Err(RelayError::AlreadyStarted);
    }
    *poller = Some(tokio::spawn(relay.clone().poll_loop()));
    Ok(())
}

#[async_trait]
impl RelayChannel for TelegramRelay {
    async fn start(&self, handler: Arc<dyn ReplyHandler>) -> Result<(), RelayError> {
        let mut slot = self
            .handler
            .write()
            .map_err(|e| RelayError::ApiError(format!("handler lock poisoned: {}", e)))?;
        if slot.is_some() {
            return Err(RelayError::AlreadyStarted);
        }
        *slot = Some(handler);
        info!(mode = ?self.config.mode, "Telegram relay ready");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.poller.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Telegram poller did not stop cleanly");
            }
        }
    }

    async fn notify_escalation(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
    ) -> Result<(), RelayError> {
        let text = format_escalation_notice(tenant, escalation);
        self.send(&self.config.operator_chat_id, &text, None).await
    }

    async fn notify_contact_update(
        &self,
        tenant: &Tenant,
        escalation: &Escalation,
        contact: &ContactUpdate,
    ) -> Result<(), RelayError> {
        let text = format_contact_notice(tenant, escalation, contact);
        self.send(&self.config.operator_chat_id, &text, None).await
    }

    async fn notify_log_request(
        &self,
        tenant: &Tenant,
        subject: &SubjectProfile,
        request: &LogRequest,
    ) -> Result<(), RelayError> {
        let text = format_log_notice(tenant, subject, request);
        self.send(&self.config.operator_chat_id, &text, None).await
    }

    async fn reply(&self, chat_id: &str, reply_to: Option<i64>, text: &str) -> Result<(), RelayError> {
        self.send(chat_id, text, reply_to).await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(chat: i64, reply_to: Option<&str>) -> Update {
        let json = serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "chat": { "id": chat },
                "from": { "id": 7, "username": "ops_kim" },
                "text": "correct",
                "reply_to_message": reply_to.map(|t| serde_json::json!({
                    "message_id": 4,
                    "chat": { "id": chat },
                    "text": t
                }))
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn api_envelope_decodes_without_result() {
        let updates: ApiResponse<Vec<Update>> =
            serde_json::from_str(r#"{"ok":true,"result":[]}"#).unwrap();
        assert!(updates.ok);
        assert_eq!(updates.result.map(|r| r.len()), Some(0));

        let failed: ApiResponse<TelegramMessage> =
            serde_json::from_str(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
                .unwrap();
        assert!(!failed.ok);
        assert!(failed.result.is_none());
        assert_eq!(failed.description.as_deref(), Some("Bad Request: chat not found"));
    }

    #[test]
    fn extracts_reply_from_operator_chat() {
        let reply = operator_reply(&update(-100, Some("notice")), "-100").unwrap();
        assert_eq!(reply.operator, "ops_kim");
        assert_eq!(reply.text, "correct");
        assert_eq!(reply.replied_to_text, "notice");
        assert_eq!(reply.message_id, 5);
    }

    #[test]
    fn ignores_other_chats_and_plain_messages() {
        assert!(operator_reply(&update(-200, Some("notice")), "-100").is_none());
        assert!(operator_reply(&update(-100, None), "-100").is_none());
    }

    #[test]
    fn webhook_secret_is_optional() {
        let mut config = RelayConfig {
            mode: RelayMode::Webhook,
            bot_token: "t".to_string(),
            operator_chat_id: "-100".to_string(),
            webhook_secret: None,
            api_base: "http://localhost".to_string(),
        };
        let open = TelegramRelay::new(config.clone()).unwrap();
        assert!(open.verify_webhook_secret(None));

        config.webhook_secret = Some("s3cret".to_string());
        let guarded = TelegramRelay::new(config).unwrap();
        assert!(!guarded.verify_webhook_secret(None));
        assert!(!guarded.verify_webhook_secret(Some("nope")));
        assert!(guarded.verify_webhook_secret(Some("s3cret")));
    }
}
