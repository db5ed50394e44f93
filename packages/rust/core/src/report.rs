//! Run report: what happened to every candidate of one run, and its summary.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use leadflow_shared::{DeliveryOutcome, LeadId};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Why a candidate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The identifier or record could not be normalized.
    Malformed,
    /// The CRM refused or could not be reached.
    Crm,
    /// The ledger could not be read.
    LedgerRead,
    /// The ledger could not be written.
    LedgerWrite,
    /// The ledger already holds a different lead for this identifier.
    ConsistencyViolation,
    /// The candidate task panicked.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Crm => "crm",
            Self::LedgerRead => "ledger_read",
            Self::LedgerWrite => "ledger_write",
            Self::ConsistencyViolation => "consistency_violation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateFailure {
    /// Normalized when possible, otherwise as received.
    pub identifier: String,
    pub kind: FailureKind,
    pub reason: String,
    /// Whether the next run is expected to succeed where this one did not.
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    NoRecipient,
    DeliveryFailed,
}

/// A registered candidate whose contact email did not go out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifierWarning {
    pub identifier: String,
    pub lead_id: LeadId,
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Final disposition of one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Registered {
        identifier: String,
        lead_id: LeadId,
        delivery: DeliveryOutcome,
    },
    Duplicate {
        identifier: String,
    },
    Failed(CandidateFailure),
    /// Never admitted because the run ran out of time.
    NotAttempted {
        identifier: String,
    },
}

impl CandidateOutcome {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Registered { identifier, .. }
            | Self::Duplicate { identifier }
            | Self::NotAttempted { identifier } => identifier,
            Self::Failed(failure) => &failure.identifier,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Duplicate { .. } => "duplicate",
            Self::Failed(_) => "failed",
            Self::NotAttempted { .. } => "not_attempted",
        }
    }
}

/// Everything one run did. Counts always add up to `found`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub found: usize,
    pub processed: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub timed_out: bool,
    pub emails_sent: usize,
    pub failures: Vec<CandidateFailure>,
    pub warnings: Vec<NotifierWarning>,
}

impl RunReport {
    pub(crate) fn begin(target_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7(),
            target_date,
            started_at: now,
            finished_at: now,
            found: 0,
            processed: 0,
            duplicate: 0,
            failed: 0,
            not_attempted: 0,
            timed_out: false,
            emails_sent: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Fold one candidate's outcome into the counts.
    pub(crate) fn record(&mut self, outcome: CandidateOutcome) {
        match outcome {
            CandidateOutcome::Registered {
                identifier,
                lead_id,
                delivery,
            } => {
                self.processed += 1;
                match delivery {
                    DeliveryOutcome::Sent { .. } => self.emails_sent += 1,
                    DeliveryOutcome::NoRecipient => self.warnings.push(NotifierWarning {
                        identifier,
                        lead_id,
                        kind: WarningKind::NoRecipient,
                        detail: None,
                    }),
                    DeliveryOutcome::Failed { reason } => self.warnings.push(NotifierWarning {
                        identifier,
                        lead_id,
                        kind: WarningKind::DeliveryFailed,
                        detail: Some(reason),
                    }),
                }
            }
            CandidateOutcome::Duplicate { .. } => self.duplicate += 1,
            CandidateOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
            CandidateOutcome::NotAttempted { .. } => self.not_attempted += 1,
        }
    }

    pub(crate) fn finish(&mut self, found: usize, timed_out: bool) {
        self.found = found;
        self.timed_out = timed_out;
        self.finished_at = Utc::now();
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    fn warnings_of(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Compact, serializable account of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub duration_ms: i64,
    pub found: usize,
    pub processed: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub timed_out: bool,
    pub emails_sent: usize,
    pub no_recipient: usize,
    pub delivery_failed: usize,
    pub retryable_failures: usize,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id,
            target_date: report.target_date,
            duration_ms: report.duration().num_milliseconds(),
            found: report.found,
            processed: report.processed,
            duplicate: report.duplicate,
            failed: report.failed,
            not_attempted: report.not_attempted,
            timed_out: report.timed_out,
            emails_sent: report.emails_sent,
            no_recipient: report.warnings_of(WarningKind::NoRecipient),
            delivery_failed: report.warnings_of(WarningKind::DeliveryFailed),
            retryable_failures: report.failures.iter().filter(|f| f.retryable).count(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} for {}", self.run_id, self.target_date)?;
        writeln!(f, "  found:          {}", self.found)?;
        writeln!(f, "  processed:      {}", self.processed)?;
        writeln!(f, "  duplicate:      {}", self.duplicate)?;
        writeln!(
            f,
            "  failed:         {} ({} retryable)",
            self.failed, self.retryable_failures
        )?;
        if self.not_attempted > 0 || self.timed_out {
            writeln!(f, "  not attempted:  {} (timed out)", self.not_attempted)?;
        }
        writeln!(
            f,
            "  emails:         {} sent, {} without address, {} failed",
            self.emails_sent, self.no_recipient, self.delivery_failed
        )?;
        write!(f, "  duration:       {} ms", self.duration_ms)
    }
}

/// Log the report: one summary event, then one warning per problem.
pub fn emit(report: &RunReport) {
    let summary = RunSummary::from(report);
    info!(
        run_id = %summary.run_id,
        target_date = %summary.target_date,
        found = summary.found,
        processed = summary.processed,
        duplicate = summary.duplicate,
        failed = summary.failed,
        not_attempted = summary.not_attempted,
        timed_out = summary.timed_out,
        emails_sent = summary.emails_sent,
        no_recipient = summary.no_recipient,
        delivery_failed = summary.delivery_failed,
        duration_ms = summary.duration_ms,
        "run summary"
    );

    for failure in &report.failures {
        warn!(
            identifier = %failure.identifier,
            kind = %failure.kind,
            retryable = failure.retryable,
            reason = %failure.reason,
            "candidate failed"
        );
    }
    for warning in &report.warnings {
        warn!(
            identifier = %warning.identifier,
            lead_id = %warning.lead_id,
            kind = ?warning.kind,
            detail = warning.detail.as_deref().unwrap_or(""),
            "contact email not sent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunReport {
        let mut report = RunReport::begin(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        report.record(CandidateOutcome::Registered {
            identifier: "11222333000181".into(),
            lead_id: LeadId::from("A"),
            delivery: DeliveryOutcome::Sent {
                message_id: Some("m-1".into()),
            },
        });
        report.record(CandidateOutcome::Registered {
            identifier: "12345678000195".into(),
            lead_id: LeadId::from("B"),
            delivery: DeliveryOutcome::NoRecipient,
        });
        report.record(CandidateOutcome::Duplicate {
            identifier: "12345678000190".into(),
        });
        report.record(CandidateOutcome::Failed(CandidateFailure {
            identifier: "00000000000191".into(),
            kind: FailureKind::Crm,
            reason: "upstream error (status 503): down".into(),
            retryable: true,
        }));
        report.record(CandidateOutcome::NotAttempted {
            identifier: "00000000000272".into(),
        });
        report.finish(5, true);
        report
    }

    #[test]
    fn counts_fold() {
        let report = sample();
        assert_eq!(report.processed, 2);
        assert_eq!(report.duplicate, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.not_attempted, 1);
        assert_eq!(
            report.processed + report.duplicate + report.failed + report.not_attempted,
            report.found
        );
        assert_eq!(report.emails_sent, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::NoRecipient);
    }

    #[test]
    fn summary_counts_and_display() {
        let summary = RunSummary::from(&sample());
        assert_eq!(summary.no_recipient, 1);
        assert_eq!(summary.delivery_failed, 0);
        assert_eq!(summary.retryable_failures, 1);

        let text = summary.to_string();
        assert!(text.contains("processed:      2"));
        assert!(text.contains("(timed out)"));
    }

    #[test]
    fn report_serializes_snake_case_kinds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["failures"][0]["kind"], "crm");
        assert_eq!(json["warnings"][0]["kind"], "no_recipient");
        assert!(json["warnings"][0].get("detail").is_none());
    }

    #[test]
    fn empty_report() {
        let mut report = RunReport::begin(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        report.finish(0, false);
        let summary = RunSummary::from(&report);
        assert_eq!(summary.found, 0);
        assert!(!summary.to_string().contains("not attempted"));
        emit(&report);
    }
}
