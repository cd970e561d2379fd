//! Support Service - multi-tenant insurance support chat with retrieval-augmented
//! answers and operator escalation.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
