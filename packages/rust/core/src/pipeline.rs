//! Daily batch: registry → ledger check → CRM → ledger write → email.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use leadflow_connectors::{
    Candidate, ConnectorError, ContactNotifier, CrmError, LeadSink, RegistrySource,
};
use leadflow_shared::{Company, CompanyId, DeliveryOutcome, LeadflowError, LedgerOutcome};
use leadflow_storage::Ledger;

use crate::report::{CandidateFailure, CandidateOutcome, FailureKind, RunReport};

/// Default bound on candidates in flight at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Knobs for one [`BatchProcessor`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Candidates processed concurrently. Values below 1 are treated as 1.
    pub max_in_flight: usize,
    /// Wall-clock budget for admitting candidates. `None` means unbounded.
    pub run_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            run_timeout: None,
        }
    }
}

/// Errors that abort a run before any candidate is touched.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("registry fetch failed: {0}")]
    Registry(#[from] ConnectorError),
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once per candidate, in candidate order.
    fn candidate_done(&self, outcome: &CandidateOutcome, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn candidate_done(&self, _outcome: &CandidateOutcome, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// Collaborators shared by every candidate task.
struct Collaborators {
    ledger: Arc<Ledger>,
    crm: Arc<dyn LeadSink>,
    notifier: Arc<dyn ContactNotifier>,
}

/// Drives one run over the candidates registered on a target date.
pub struct BatchProcessor {
    registry: Arc<dyn RegistrySource>,
    shared: Arc<Collaborators>,
    opts: RunOptions,
}

/// Per-candidate slot, kept in candidate order.
enum Slot {
    Settled(CandidateOutcome),
    Running {
        identifier: String,
        handle: JoinHandle<CandidateOutcome>,
    },
}

impl BatchProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        registry: Arc<dyn RegistrySource>,
        crm: Arc<dyn LeadSink>,
        notifier: Arc<dyn ContactNotifier>,
        opts: RunOptions,
    ) -> Self {
        Self {
            registry,
            shared: Arc::new(Collaborators {
                ledger,
                crm,
                notifier,
            }),
            opts,
        }
    }

    /// Process every company registered on `target_date`.
    ///
    /// Only a registry failure is fatal. Everything that goes wrong with a
    /// single candidate ends up in the returned report.
    #[instrument(skip_all, fields(target_date = %target_date))]
    pub async fn run(
        &self,
        target_date: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport, RunError> {
        let mut report = RunReport::begin(target_date);
        let deadline = self.opts.run_timeout.map(|t| Instant::now() + t);
        info!(run_id = %report.run_id, "starting run");

        progress.phase("Fetching registry");
        let candidates = match self.registry.fetch_created_on(target_date).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "registry fetch failed, aborting run");
                return Err(e.into());
            }
        };
        let total = candidates.len();
        info!(found = total, "candidates fetched");

        progress.phase("Processing candidates");
        let (slots, timed_out) = self.admit(candidates, deadline).await;

        for (i, slot) in slots.into_iter().enumerate() {
            let outcome = match slot {
                Slot::Settled(outcome) => outcome,
                Slot::Running { identifier, handle } => match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(%identifier, error = %e, "candidate task failed");
                        CandidateOutcome::Failed(CandidateFailure {
                            identifier,
                            kind: FailureKind::Internal,
                            reason: e.to_string(),
                            retryable: true,
                        })
                    }
                },
            };
            progress.candidate_done(&outcome, i + 1, total);
            report.record(outcome);
        }

        report.finish(total, timed_out);
        progress.done(&report);
        Ok(report)
    }

    /// Admit candidates in order, spawning one task per admitted candidate.
    /// Returns the slots and whether the deadline cut admission short.
    async fn admit(
        &self,
        candidates: Vec<Candidate>,
        deadline: Option<Instant>,
    ) -> (Vec<Slot>, bool) {
        let semaphore = Arc::new(Semaphore::new(self.opts.max_in_flight.max(1)));
        let mut claimed: HashSet<CompanyId> = HashSet::new();
        let mut slots = Vec::with_capacity(candidates.len());
        let mut timed_out = false;

        for candidate in candidates {
            if timed_out || deadline.is_some_and(|d| Instant::now() >= d) {
                if !timed_out {
                    warn!("run timeout reached, no further candidates admitted");
                    timed_out = true;
                }
                slots.push(Slot::Settled(CandidateOutcome::NotAttempted {
                    identifier: candidate.identifier().to_string(),
                }));
                continue;
            }

            let company = match candidate {
                Candidate::Valid(company) => company,
                Candidate::Malformed { identifier, reason } => {
                    slots.push(Slot::Settled(malformed(identifier, reason)));
                    continue;
                }
            };

            let id = match CompanyId::normalize(&company.identifier) {
                Ok(id) => id,
                Err(e) => {
                    slots.push(Slot::Settled(malformed(
                        company.identifier.clone(),
                        e.to_string(),
                    )));
                    continue;
                }
            };

            if !claimed.insert(id.clone()) {
                debug!(identifier = %id, "repeated within batch");
                slots.push(Slot::Settled(CandidateOutcome::Duplicate {
                    identifier: id.to_string(),
                }));
                continue;
            }

            let Some(permit) = acquire(&semaphore, deadline).await else {
                warn!("run timeout reached, no further candidates admitted");
                timed_out = true;
                slots.push(Slot::Settled(CandidateOutcome::NotAttempted {
                    identifier: id.to_string(),
                }));
                continue;
            };

            let shared = Arc::clone(&self.shared);
            let identifier = id.to_string();
            let handle = tokio::spawn(async move {
                let outcome = process_candidate(&shared, company, id).await;
                drop(permit);
                outcome
            });
            slots.push(Slot::Running { identifier, handle });
        }

        (slots, timed_out)
    }
}

/// Wait for a slot, giving up at the deadline.
async fn acquire(
    semaphore: &Arc<Semaphore>,
    deadline: Option<Instant>,
) -> Option<OwnedSemaphorePermit> {
    let permit = Arc::clone(semaphore).acquire_owned();
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, permit).await.ok()?.ok(),
        None => permit.await.ok(),
    }
}

fn malformed(identifier: String, reason: String) -> CandidateOutcome {
    warn!(%identifier, %reason, "malformed candidate");
    CandidateOutcome::Failed(CandidateFailure {
        identifier,
        kind: FailureKind::Malformed,
        reason,
        retryable: false,
    })
}

fn failure(id: &CompanyId, kind: FailureKind, reason: String, retryable: bool) -> CandidateOutcome {
    CandidateOutcome::Failed(CandidateFailure {
        identifier: id.to_string(),
        kind,
        reason,
        retryable,
    })
}

/// One candidate, start to finish. Never panics on provider errors: every
/// path ends in an outcome, and every ledger write finishes before it returns.
async fn process_candidate(
    shared: &Collaborators,
    company: Company,
    id: CompanyId,
) -> CandidateOutcome {
    match is_settled(&shared.ledger, &id).await {
        Ok(true) => {
            info!(identifier = %id, outcome = "duplicate", "candidate skipped");
            return CandidateOutcome::Duplicate {
                identifier: id.to_string(),
            };
        }
        Ok(false) => {}
        Err(e) => {
            error!(identifier = %id, error = %e, "ledger lookup failed");
            return failure(&id, FailureKind::LedgerRead, e.to_string(), true);
        }
    }

    let lead_id = match shared.crm.create_lead(&company, &id).await {
        Ok(lead_id) => lead_id,
        Err(CrmError::AlreadyExists) => {
            return match shared
                .ledger
                .mark_duplicate(&id, "CRM already holds this company", Utc::now())
                .await
            {
                Ok(()) => {
                    info!(identifier = %id, outcome = "duplicate", "CRM already knows company");
                    CandidateOutcome::Duplicate {
                        identifier: id.to_string(),
                    }
                }
                Err(e) => {
                    error!(identifier = %id, error = %e, "ledger write failed");
                    failure(&id, FailureKind::LedgerWrite, e.to_string(), true)
                }
            };
        }
        Err(crm_err) => {
            let reason = crm_err.to_string();
            let retryable = crm_err.is_retryable();
            warn!(identifier = %id, error = %reason, retryable, "lead creation failed");
            if let Err(e) = shared.ledger.mark_failed(&id, &reason, Utc::now()).await {
                error!(identifier = %id, error = %e, "ledger write failed");
                return failure(
                    &id,
                    FailureKind::LedgerWrite,
                    format!("{reason}; ledger: {e}"),
                    true,
                );
            }
            return failure(&id, FailureKind::Crm, reason, retryable);
        }
    };

    match shared.ledger.mark_registered(&id, &lead_id, Utc::now()).await {
        Ok(()) => {}
        Err(e @ LeadflowError::ConsistencyViolation { .. }) => {
            error!(identifier = %id, lead_id = %lead_id, error = %e, "consistency violation");
            return failure(&id, FailureKind::ConsistencyViolation, e.to_string(), false);
        }
        Err(e) => {
            error!(
                identifier = %id,
                lead_id = %lead_id,
                error = %e,
                "lead created but ledger write failed"
            );
            return failure(&id, FailureKind::LedgerWrite, e.to_string(), true);
        }
    }

    let delivery = if company.email.is_some() {
        shared.notifier.send_contact_email(&company, &id).await
    } else {
        DeliveryOutcome::NoRecipient
    };

    info!(
        identifier = %id,
        lead_id = %lead_id,
        outcome = "registered",
        delivery = ?delivery,
        "candidate registered"
    );
    CandidateOutcome::Registered {
        identifier: id.to_string(),
        lead_id,
        delivery,
    }
}

/// Registered or explicitly skipped entries are never sent to the CRM again.
async fn is_settled(ledger: &Ledger, id: &CompanyId) -> leadflow_shared::Result<bool> {
    if ledger.exists(id).await? {
        return Ok(true);
    }
    Ok(matches!(
        ledger.get(id).await?.map(|entry| entry.outcome),
        Some(LedgerOutcome::DuplicateSkip)
    ))
}
