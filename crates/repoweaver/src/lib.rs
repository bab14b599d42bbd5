//! Repoweaver orchestrator process
//!
//! Wiring for the `repoweaver` binary: configuration is loaded in `main`,
//! everything else is built in [`bootstrap`].

pub mod bootstrap;

pub use bootstrap::{BootstrapResult, Services, initialize_services, run, shutdown_signal};
