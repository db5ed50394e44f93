//! Provider adapters: the company registry, the CRM, and the email notifier.
//!
//! The batch processor only sees the three traits below. The HTTP clients in
//! this crate implement them against the real providers; tests substitute
//! in-memory fakes.

mod crm;
mod http;
mod notifier;
mod registry;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadflow_shared::{Company, CompanyId, DeliveryOutcome, LeadId};

pub use crm::{CrmClient, CrmClientOptions};
pub use http::{RateLimitPolicy, is_retryable_status};
pub use notifier::{EmailNotifier, EmailNotifierOptions, render_contact_email};
pub use registry::{RegistryClient, RegistryClientOptions};

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// One registry record, either usable or rejected at the adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Valid(Company),
    /// The record could not be coerced into a [`Company`].
    Malformed { identifier: String, reason: String },
}

impl Candidate {
    /// Identifier exactly as the registry sent it.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Valid(company) => &company.identifier,
            Self::Malformed { identifier, .. } => identifier,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to the registry (or any read-only provider endpoint).
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),
}

/// Failure creating a lead.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    /// The CRM rejected the payload (400/422). Retrying will not help.
    #[error("lead rejected: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    /// The CRM already holds this company and did not say under which lead.
    #[error("lead already exists in CRM")]
    AlreadyExists,

    /// A 2xx answer we could not read a lead id from. The lead may exist.
    #[error("lead possibly created, response unusable: {0}")]
    Unconfirmed(String),
}

impl CrmError {
    /// Whether a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Unconfirmed(_) => true,
            Self::Upstream { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(is_retryable_status)
                .unwrap_or(false),
            Self::Validation(_) | Self::AlreadyExists => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of companies registered on a given date.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Every company registered on `date`. An error aborts the whole run.
    async fn fetch_created_on(&self, date: NaiveDate) -> Result<Vec<Candidate>, ConnectorError>;
}

/// Destination for new leads.
#[async_trait]
pub trait LeadSink: Send + Sync {
    /// Register `company` and return the CRM's lead id.
    async fn create_lead(&self, company: &Company, id: &CompanyId) -> Result<LeadId, CrmError>;
}

/// Sends the one-off contact email.
#[async_trait]
pub trait ContactNotifier: Send + Sync {
    /// Never fails the candidate: problems are reported in the outcome.
    async fn send_contact_email(&self, company: &Company, id: &CompanyId) -> DeliveryOutcome;
}
