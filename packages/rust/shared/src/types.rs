//! Core domain types for Leadflow runs and the duplicate ledger.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};

/// Number of digits in a normalized registry identifier.
pub const COMPANY_ID_LEN: usize = 14;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid email regex")
});

// ---------------------------------------------------------------------------
// CompanyId
// ---------------------------------------------------------------------------

/// Canonical, digits-only registry identifier.
///
/// Two records whose identifiers normalize to the same value are the same
/// company, whatever punctuation the source used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(String);

impl CompanyId {
    /// Strip formatting and require exactly [`COMPANY_ID_LEN`] digits.
    pub fn normalize(raw: &str) -> Result<Self> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.len() != COMPANY_ID_LEN {
            return Err(LeadflowError::validation(format!(
                "identifier {raw:?} has {} digits, expected {COMPANY_ID_LEN}",
                digits.len()
            )));
        }
        Ok(Self(digits))
    }

    /// The normalized digit string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify the two trailing modulo-11 check digits.
    pub fn has_valid_check_digits(&self) -> bool {
        let digits: Vec<u32> = self.0.chars().filter_map(|c| c.to_digit(10)).collect();
        if digits.iter().all(|d| *d == digits[0]) {
            return false;
        }

        let check = |len: usize, weights: &[u32]| -> u32 {
            let sum: u32 = digits[..len]
                .iter()
                .zip(weights)
                .map(|(d, w)| d * w)
                .sum();
            match sum % 11 {
                r if r < 2 => 0,
                r => 11 - r,
            }
        };

        let first = check(12, &[5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);
        let second = check(13, &[6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);
        digits[12] == first && digits[13] == second
    }

    /// Display form `NN.NNN.NNN/NNNN-NN`.
    pub fn formatted(&self) -> String {
        let s = &self.0;
        format!(
            "{}.{}.{}/{}-{}",
            &s[..2],
            &s[2..5],
            &s[5..8],
            &s[8..12],
            &s[12..]
        )
    }
}

impl std::fmt::Display for CompanyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CompanyId {
    type Err = LeadflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::normalize(s)
    }
}

// ---------------------------------------------------------------------------
// Company
// ---------------------------------------------------------------------------

/// A newly registered company as returned by the registry for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    /// Identifier exactly as the registry sent it (may be punctuated).
    pub identifier: String,
    /// Legal (registered) name.
    pub legal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_name: Option<String>,
    /// Contact email, already validated at the adapter boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Street, number, details and district joined into one line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub city: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Date the company was registered.
    pub registered_on: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_activity: Option<String>,
    /// Registry status text (e.g. `Ativa`).
    pub status: String,
}

impl Company {
    /// Name to greet the company by: trade name when present, legal name otherwise.
    pub fn display_name(&self) -> &str {
        self.trade_name.as_deref().unwrap_or(&self.legal_name)
    }
}

// ---------------------------------------------------------------------------
// LeadId
// ---------------------------------------------------------------------------

/// Identifier the CRM assigned to a lead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(pub String);

impl LeadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// DeliveryOutcome
// ---------------------------------------------------------------------------

/// Result of asking the notifier to send the contact email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    NoRecipient,
    Failed {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Processing outcome recorded for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Registered,
    DuplicateSkip,
    Failed,
}

impl LedgerOutcome {
    /// Stable storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::DuplicateSkip => "duplicate_skip",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerOutcome {
    type Err = LeadflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(Self::Registered),
            "duplicate_skip" | "duplicate-skip" => Ok(Self::DuplicateSkip),
            "failed" => Ok(Self::Failed),
            other => Err(LeadflowError::validation(format!(
                "unknown ledger outcome {other:?}"
            ))),
        }
    }
}

/// One row of the duplicate ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identifier: CompanyId,
    pub outcome: LedgerOutcome,
    /// Present iff `outcome` is `Registered`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<LeadId>,
    pub attempted_at: DateTime<Utc>,
    /// Present iff `outcome` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Why a `DuplicateSkip` entry was settled; absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Number of recorded attempts for this identifier.
    pub attempts: u32,
}

impl LedgerEntry {
    /// Settled entries are never sent to the CRM again.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.outcome,
            LedgerOutcome::Registered | LedgerOutcome::DuplicateSkip
        )
    }
}

/// Loose syntactic email check used at the adapter boundary.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}
