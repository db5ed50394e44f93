//! Run orchestration for Leadflow.
//!
//! This crate ties the registry, the duplicate ledger, the CRM and the email
//! notifier together into one daily batch, and summarizes what it did.

pub mod pipeline;
pub mod report;

pub use pipeline::{
    BatchProcessor, DEFAULT_MAX_IN_FLIGHT, ProgressReporter, RunError, RunOptions,
    SilentProgress,
};
pub use report::{
    CandidateFailure, CandidateOutcome, FailureKind, NotifierWarning, RunReport, RunSummary,
    WarningKind, emit,
};
