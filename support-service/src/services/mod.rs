//! Services module for support-service.

pub mod cache;
pub mod chat;
pub mod database;
pub mod escalation;
pub mod memory;
pub mod metrics;
pub mod providers;
pub mod rate_limit;
pub mod relay;
pub mod repository;
pub mod retriever;
pub mod synthesizer;
pub mod tenant;

pub use chat::ChatPipeline;
pub use database::PgStore;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use repository::Stores;
