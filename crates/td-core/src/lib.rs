//! Shared domain types and configuration for termdeck.
//!
//! - `types`: terminal ids, process/agent state enums and the session event feed
//! - `config`: TOML configuration with per-section defaults and validation

pub mod config;
pub mod types;
