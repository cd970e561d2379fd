pub mod retry;

pub use retry::{RetryConfig, Transient, retry_call};
