//! Knowledge base entries and per-query retrieval results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Category given to entries learned from operator resolutions.
pub const LEARNED_CATEGORY: &str = "hitl_learning";

/// Subcategory used for entries that apply to every policy.
pub const GENERAL_SUBCATEGORY: &str = "general";

/// A retrieval result. Produced per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Context {
    pub id: Uuid,
    pub title: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub content: String,
    pub similarity: f64,
}

/// Citation returned to callers and snapshotted into escalations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub title: String,
    pub category: String,
    pub similarity: f64,
}

impl From<&Context> for Source {
    fn from(ctx: &Context) -> Self {
        Self {
            id: ctx.id,
            title: ctx.title.clone(),
            category: ctx.category.clone(),
            similarity: ctx.similarity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub source: String,
    pub embedding: Vec<f32>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for inserting a knowledge entry. The embedding must be computed from
/// the title and content being written.
#[derive(Debug, Clone)]
pub struct NewKnowledgeEntry {
    pub title: String,
    pub content: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub source: String,
    pub embedding: Vec<f32>,
}

impl NewKnowledgeEntry {
    /// Text that the embedding is computed from.
    pub fn embedding_text(title: &str, content: &str) -> String {
        format!("{}\n\n{}", title, content)
    }
}
