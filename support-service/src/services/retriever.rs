//! Knowledge retrieval: existence probe, thresholded search, policy filter.

use crate::models::{Context, PartitionHandle, GENERAL_SUBCATEGORY};
use crate::services::providers::EmbeddingProvider;
use crate::services::metrics::record_retrieval;
use crate::services::repository::KnowledgeStore;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Threshold of the existence probe.
pub const PROBE_THRESHOLD: f64 = 0.1;

/// Subcategories that apply to every plan.
pub const CROSS_PLAN_SUBCATEGORIES: &[&str] = &["dental", "optical", "claims", "maternity", "faq"];

/// Over-fetch factor applied when a policy filter will drop candidates.
const FILTER_OVERFETCH: usize = 3;

/// Keeps contexts that apply to the caller's policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyFilter {
    policy: String,
}

impl PolicyFilter {
    pub fn new(policy: &str) -> Self {
        Self {
            policy: policy.trim().to_lowercase(),
        }
    }

    pub fn admits(&self, context: &Context) -> bool {
        let Some(sub) = context.subcategory.as_deref().map(str::trim) else {
            return true;
        };
        if sub.is_empty() {
            return true;
        }
        let sub = sub.to_lowercase();
        sub == GENERAL_SUBCATEGORY
            || sub == self.policy
            || CROSS_PLAN_SUBCATEGORIES.contains(&sub.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub contexts: Vec<Context>,
    pub knowledge_exists: bool,
}

#[derive(Debug, Clone)]
pub struct SearchParams<'a> {
    pub partition: &'a PartitionHandle,
    pub top_k: usize,
    pub similarity_threshold: f64,
    pub policy: Option<PolicyFilter>,
}

pub struct KnowledgeRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
}

impl KnowledgeRetriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn KnowledgeStore>) -> Self {
        Self { embedder, store }
    }

    #[instrument(skip(self, query, params), fields(partition = %params.partition, top_k = params.top_k))]
    pub async fn search(
        &self,
        query: &str,
        params: SearchParams<'_>,
    ) -> Result<RetrievalResult, AppError> {
        if query.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Query text must not be empty"
            )));
        }

        let embedding = self.embedder.embed(query).await?;

        let limit = if params.policy.is_some() {
            params.top_k * FILTER_OVERFETCH
        } else {
            params.top_k
        };

        let (probe, candidates) = tokio::try_join!(
            self.store
                .similarity_search(params.partition, &embedding, PROBE_THRESHOLD, 1),
            self.store.similarity_search(
                params.partition,
                &embedding,
                params.similarity_threshold,
                limit,
            ),
        )?;

        let candidate_count = candidates.len();
        let mut contexts: Vec<Context> = match &params.policy {
            Some(filter) => candidates.into_iter().filter(|c| filter.admits(c)).collect(),
            None => candidates,
        };
        contexts.truncate(params.top_k);

        let knowledge_exists = !probe.is_empty() || !contexts.is_empty();
        record_retrieval(candidate_count, contexts.len());

        debug!(
            candidates = candidate_count,
            returned = contexts.len(),
            knowledge_exists,
            "Knowledge search complete"
        );

        if !contexts.is_empty() {
            let store = self.store.clone();
            let partition = params.partition.clone();
            let ids: Vec<_> = contexts.iter().map(|c| c.id).collect();
            tokio::spawn(async move {
                if let Err(e) = store.increment_usage(&partition, &ids).await {
                    warn!(error = %e, partition = %partition, "Failed to increment knowledge usage");
                }
            });
        }

        Ok(RetrievalResult {
            contexts,
            knowledge_exists,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(sub: Option<&str>, similarity: f64) -> Context {
        Context {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            category: "benefits".to_string(),
            subcategory: sub.map(str::to_string),
            content: "c".to_string(),
            similarity,
        }
    }

    #[test]
    fn policy_filter_admission_rules() {
        let filter = PolicyFilter::new("Standard");
        assert!(filter.admits(&ctx(None, 0.9)));
        assert!(filter.admits(&ctx(Some(""), 0.9)));
        assert!(filter.admits(&ctx(Some("General"), 0.9)));
        assert!(filter.admits(&ctx(Some("standard"), 0.9)));
        assert!(filter.admits(&ctx(Some("dental"), 0.9)));
        assert!(filter.admits(&ctx(Some("Optical"), 0.9)));
        assert!(!filter.admits(&ctx(Some("premium"), 0.9)));
    }
}
