//! Persistence Core - Foundation for lease-aware blob and queue persistence
//!
//! Provides the backend-agnostic error taxonomy, store configuration, the
//! message and lease value types, and the retry policy shared by every
//! storage operation.

pub mod config;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use telemetry::init_tracing;
pub use types::{LeaseId, Message};
