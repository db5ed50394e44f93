//! Shared types, error model, and configuration for Leadflow.
//!
//! This crate is the foundation depended on by all other Leadflow crates.
//! It provides:
//! - [`LeadflowError`], the unified error type
//! - Domain types ([`Company`], [`CompanyId`], [`LeadId`], [`LedgerEntry`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrmConfig, LedgerConfig, NotifierConfig, RegistryConfig, RunConfig, config_dir,
    config_file_path, init_config, init_config_at, load_config, load_config_from,
    resolve_secret,
};
pub use error::{LeadflowError, Result};
pub use types::{
    COMPANY_ID_LEN, Company, CompanyId, DeliveryOutcome, LeadId, LedgerEntry, LedgerOutcome,
    is_valid_email,
};
