//! HTTP handlers for the support service.

pub mod chat;
pub mod health;
pub mod metrics;
pub mod relay;
