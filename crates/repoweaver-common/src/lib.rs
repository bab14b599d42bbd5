//! Common utilities and patterns shared across repoweaver crates
//!
//! Environment bootstrap, log subscriber setup, correlation IDs and
//! credential redaction for anything that ends up in logs or job rows.

pub mod init;
pub mod redact;
pub mod tracing;

pub use init::{LogFormat, initialize_environment, initialize_tracing};
pub use redact::redact_credentials;
pub use tracing::CorrelationId;
