//! Redis-backed cache for sessions, recent history and repeated answers.
//!
//! Key layout:
//! - `session:<id>`: JSON session, sliding TTL
//! - `history:<conversation>`: bounded list of JSON messages, newest last
//! - `query:<sha256>`: cached high-confidence answer
//! - `ratelimit:<subject>`: fixed-window counter

use crate::config::ChatConfig;
use crate::models::{Message, PartitionHandle, Session, Source};
use crate::services::metrics::record_cache_lookup;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Answers below this confidence are never cached.
pub const QUERY_CACHE_MIN_CONFIDENCE: f64 = 0.8;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), anyhow::Error>;

    /// Append to a list, keep only the newest `max_len` items and refresh the TTL.
    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl_secs: u64,
    ) -> Result<(), anyhow::Error>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>, anyhow::Error>;

    /// Increment a window counter. The TTL is set only by the first hit, so
    /// the window is fixed. Returns the new count and the remaining TTL.
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<(u64, u64), anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisCache {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get {}: {}", key, e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set {}: {}", key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete {}: {}", key, e))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to expire {}: {}", key, e))
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl_secs: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(-(max_len as i64))
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to append to {}: {}", key, e))
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", key, e))
    }

    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<(u64, u64), anyhow::Error> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to increment {}: {}", key, e))?;

        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to expire {}: {}", key, e))?;
        }

        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read TTL of {}: {}", key, e))?;

        // -1 means a counter left without expiry; give it one so it cannot block forever.
        if ttl < 0 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to expire {}: {}", key, e))?;
            return Ok((count, window_secs));
        }

        Ok((count, ttl as u64))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

enum Slot {
    Value(String),
    List(Vec<String>),
}

struct MemoryEntry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

/// In-process cache with TTL semantics close to Redis.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, MemoryEntry>) -> T,
    ) -> Result<T, anyhow::Error> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory cache mutex poisoned: {}", e))?;
        entries.retain(|_, e| e.live());
        Ok(f(&mut entries))
    }
}

fn deadline(ttl_secs: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_secs))
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.with_entries(|m| match m.get(key).map(|e| &e.slot) {
            Some(Slot::Value(v)) => Some(v.clone()),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        self.with_entries(|m| {
            m.insert(
                key.to_string(),
                MemoryEntry {
                    slot: Slot::Value(value.to_string()),
                    expires_at: deadline(ttl_secs),
                },
            );
        })
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.with_entries(|m| {
            m.remove(key);
        })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        self.with_entries(|m| {
            if let Some(e) = m.get_mut(key) {
                e.expires_at = deadline(ttl_secs);
            }
        })
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl_secs: u64,
    ) -> Result<(), anyhow::Error> {
        self.with_entries(|m| {
            let entry = m.entry(key.to_string()).or_insert_with(|| MemoryEntry {
                slot: Slot::List(Vec::new()),
                expires_at: None,
            });
            if !matches!(entry.slot, Slot::List(_)) {
                entry.slot = Slot::List(Vec::new());
            }
            if let Slot::List(items) = &mut entry.slot {
                items.push(value.to_string());
                let excess = items.len().saturating_sub(max_len);
                items.drain(..excess);
            }
            entry.expires_at = deadline(ttl_secs);
        })
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, anyhow::Error> {
        self.with_entries(|m| match m.get(key).map(|e| &e.slot) {
            Some(Slot::List(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<(u64, u64), anyhow::Error> {
        self.with_entries(|m| {
            let entry = m.entry(key.to_string()).or_insert_with(|| MemoryEntry {
                slot: Slot::Value("0".to_string()),
                expires_at: deadline(window_secs),
            });
            let count = match &entry.slot {
                Slot::Value(v) => v.parse::<u64>().unwrap_or(0) + 1,
                Slot::List(_) => 1,
            };
            entry.slot = Slot::Value(count.to_string());
            let ttl = entry
                .expires_at
                .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
                .unwrap_or(window_secs);
            (count, ttl)
        })
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Answer stored under a `query:` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<Source>,
}

/// Lower-case and collapse whitespace so trivially different phrasings share a key.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Typed access to the chat keys.
///
/// Sessions are authoritative, so their errors propagate. History and query
/// entries are accelerators; their failures are logged and read as misses.
#[derive(Clone)]
pub struct ConversationCache {
    store: Arc<dyn CacheStore>,
    config: ChatConfig,
}

impl ConversationCache {
    pub fn new(store: Arc<dyn CacheStore>, config: ChatConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn session_key(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub fn history_key(conversation_id: Uuid) -> String {
        format!("history:{}", conversation_id)
    }

    /// Partition and subject are part of the digest so a cached answer is
    /// never served to another tenant or employee.
    pub fn query_key(partition: &PartitionHandle, subject_id: Uuid, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(partition.name().as_bytes());
        hasher.update(b"|");
        hasher.update(subject_id.as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_query(text).as_bytes());
        format!("query:{}", hex::encode(hasher.finalize()))
    }

    pub async fn put_session(&self, session: &Session) -> Result<(), AppError> {
        let json = serde_json::to_string(session)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
        self.store
            .set_ex(
                &Self::session_key(&session.session_id),
                &json,
                self.config.session_ttl_secs,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Session write failed");
                AppError::ServiceUnavailable
            })
    }

    /// Load a session and slide its TTL.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, AppError> {
        let key = Self::session_key(session_id);
        let raw = self.store.get(&key).await.map_err(|e| {
            record_cache_lookup("session", "error");
            tracing::error!(error = %e, "Session read failed");
            AppError::ServiceUnavailable
        })?;

        let Some(raw) = raw else {
            record_cache_lookup("session", "miss");
            return Ok(None);
        };
        record_cache_lookup("session", "hit");

        let session: Session = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session");
                let _ = self.store.delete(&key).await;
                return Ok(None);
            }
        };

        if let Err(e) = self.store.expire(&key, self.config.session_ttl_secs).await {
            tracing::warn!(error = %e, "Failed to refresh session TTL");
        }
        Ok(Some(session))
    }

    /// Cached recent history, `None` on miss or cache failure.
    pub async fn history(&self, conversation_id: Uuid) -> Option<Vec<Message>> {
        let raw = match self.store.list_range(&Self::history_key(conversation_id)).await {
            Ok(raw) => raw,
            Err(e) => {
                record_cache_lookup("history", "error");
                tracing::warn!(error = %e, "History cache read failed");
                return None;
            }
        };
        if raw.is_empty() {
            record_cache_lookup("history", "miss");
            return None;
        }

        let messages: Result<Vec<Message>, _> =
            raw.iter().map(|r| serde_json::from_str(r)).collect();
        match messages {
            Ok(m) => {
                record_cache_lookup("history", "hit");
                Some(m)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable history cache");
                let _ = self.store.delete(&Self::history_key(conversation_id)).await;
                None
            }
        }
    }

    /// Append a durably stored message to the cached history.
    pub async fn append_history(&self, message: &Message) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize message for cache");
                return;
            }
        };
        if let Err(e) = self
            .store
            .push_bounded(
                &Self::history_key(message.conversation_id),
                &json,
                self.config.history_limit,
                self.config.session_ttl_secs,
            )
            .await
        {
            tracing::warn!(error = %e, "History cache append failed");
        }
    }

    /// Replace the cached history with messages loaded from the database.
    pub async fn backfill_history(&self, conversation_id: Uuid, messages: &[Message]) {
        if let Err(e) = self.store.delete(&Self::history_key(conversation_id)).await {
            tracing::warn!(error = %e, "History cache reset failed");
            return;
        }
        for message in messages {
            self.append_history(message).await;
        }
    }

    pub async fn cached_answer(&self, key: &str) -> Option<CachedAnswer> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(answer) => {
                    record_cache_lookup("query", "hit");
                    Some(answer)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable cached answer");
                    None
                }
            },
            Ok(None) => {
                record_cache_lookup("query", "miss");
                None
            }
            Err(e) => {
                record_cache_lookup("query", "error");
                tracing::warn!(error = %e, "Query cache read failed");
                None
            }
        }
    }

    /// Store an answer if it is confident enough. Returns whether it was stored.
    pub async fn store_answer(&self, key: &str, answer: &CachedAnswer) -> bool {
        if answer.confidence < QUERY_CACHE_MIN_CONFIDENCE {
            return false;
        }
        let json = match serde_json::to_string(answer) {
            Ok(j) => j,
            Err(_) => return false,
        };
        match self
            .store
            .set_ex(key, &json, self.config.query_cache_ttl_secs)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Query cache write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRole, Session};
    use chrono::Utc;

    fn cache() -> ConversationCache {
        ConversationCache::new(Arc::new(MemoryCache::new()), ChatConfig::default())
    }

    fn message(conversation_id: Uuid, n: usize) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: format!("message {}", n),
            confidence: None,
            sources: Vec::new(),
            was_escalated: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn query_key_depends_on_partition_and_subject() {
        let acme = PartitionHandle::parse("acme").unwrap();
        let globex = PartitionHandle::parse("globex").unwrap();
        let subject = Uuid::new_v4();

        let a = ConversationCache::query_key(&acme, subject, "Dental  Limit?");
        let b = ConversationCache::query_key(&acme, subject, "dental limit?");
        let c = ConversationCache::query_key(&globex, subject, "dental limit?");
        let d = ConversationCache::query_key(&acme, Uuid::new_v4(), "dental limit?");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("query:"));
    }

    #[tokio::test]
    async fn history_is_bounded_to_limit() {
        let cache = cache();
        let conv = Uuid::new_v4();
        for n in 0..25 {
            cache.append_history(&message(conv, n)).await;
        }

        let history = cache.history(conv).await.unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history.first().unwrap().content, "message 5");
        assert_eq!(history.last().unwrap().content, "message 24");
    }

    #[tokio::test]
    async fn low_confidence_answers_are_not_cached() {
        let cache = cache();
        let low = CachedAnswer {
            answer: "maybe".into(),
            confidence: 0.79,
            sources: vec![],
        };
        let high = CachedAnswer {
            confidence: 0.8,
            ..low.clone()
        };

        assert!(!cache.store_answer("query:low", &low).await);
        assert!(cache.cached_answer("query:low").await.is_none());
        assert!(cache.store_answer("query:high", &high).await);
        assert_eq!(cache.cached_answer("query:high").await.unwrap(), high);
    }

    #[tokio::test]
    async fn session_round_trip() {
        let cache = cache();
        let session = Session::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.put_session(&session).await.unwrap();

        let loaded = cache.get_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, session.conversation_id);
        assert!(cache.get_session("missing").await.unwrap().is_none());
    }
}
