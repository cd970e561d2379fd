//! Mock provider implementations for testing.

use super::{
    Completion, CompletionProvider, CompletionRequest, EmbeddingProvider, FinishReason,
    ProviderError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased alphanumeric token is hashed into one of `dimensions`
/// buckets, so texts sharing words are similar. Exact vectors can be pinned
/// per text with [`MockEmbeddingProvider::pin`].
pub struct MockEmbeddingProvider {
    dimensions: usize,
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            pinned: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        if let Ok(mut pinned) = self.pinned.lock() {
            pinned.insert(text.to_string(), vector);
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Vector the mock returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.pinned.lock().ok().and_then(|p| p.get(text).cloned()) {
            return v;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            // FNV-1a
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError(503, "mock outage".to_string()));
        }
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidRequest(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(self.vector_for(text))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Completion provider that replays scripted answers in order and records
/// every request it receives.
pub struct MockCompletionProvider {
    script: Mutex<VecDeque<Completion>>,
    default_answer: String,
    requests: Mutex<Vec<CompletionRequest>>,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockCompletionProvider {
    pub fn new(default_answer: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_answer: default_answer.into(),
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Queue the next answer.
    pub fn push_answer(&self, text: impl Into<String>) {
        self.push(text, FinishReason::Complete);
    }

    pub fn push(&self, text: impl Into<String>, finish_reason: FinishReason) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Completion {
                text: text.into(),
                finish_reason,
                input_tokens: 0,
                output_tokens: 0,
            });
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Simulated provider latency for every subsequent call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError(503, "mock outage".to_string()));
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        Ok(scripted.unwrap_or_else(|| Completion {
            text: self.default_answer.clone(),
            finish_reason: FinishReason::Complete,
            input_tokens: request.messages.iter().map(|m| m.content.len() as u32 / 4).sum(),
            output_tokens: self.default_answer.len() as u32 / 4,
        }))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::cosine_similarity;

    #[tokio::test]
    async fn shared_words_produce_similar_vectors() {
        let embedder = MockEmbeddingProvider::new(64);
        let a = embedder.embed("dental coverage limit").await.unwrap();
        let b = embedder.embed("What is my dental coverage limit?").await.unwrap();
        let c = embedder.embed("portal password reset").await.unwrap();

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn scripted_answers_replay_in_order() {
        let provider = MockCompletionProvider::new("fallback");
        provider.push_answer("first");

        let request = CompletionRequest {
            messages: vec![],
            model: None,
            temperature: 0.0,
            max_tokens: 10,
        };
        assert_eq!(provider.complete(&request).await.unwrap().text, "first");
        assert_eq!(provider.complete(&request).await.unwrap().text, "fallback");
        assert_eq!(provider.requests().len(), 2);
    }
}
