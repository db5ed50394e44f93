//! libSQL-backed duplicate ledger (embedded, local file).
//!
//! The [`Ledger`] maps a normalized company identifier to the outcome of its
//! last processing attempt. It is the only state that outlives a run.
//!
//! **Write rules:**
//! - Every write is a single statement on a single identifier, so each key is
//!   its own atomic unit and a crash mid-batch never tears an entry.
//! - A `registered` entry is never overwritten. Re-recording the same lead is
//!   a no-op; a different lead is a [`LeadflowError::ConsistencyViolation`].
//! - `synchronous = FULL` means a write that returned `Ok` survives a kill.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use leadflow_shared::{
    CompanyId, LeadId, LeadflowError, LedgerEntry, LedgerOutcome, Result,
};
use libsql::{Connection, Database, params};
use serde::Serialize;
use tracing::{debug, error};

/// Durable ledger handle wrapping a libSQL database.
pub struct Ledger {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Entry counts per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub registered: u64,
    pub duplicate_skip: u64,
    pub failed: u64,
}

impl LedgerStats {
    pub fn total(&self) -> u64 {
        self.registered + self.duplicate_skip + self.failed
    }
}

const ENTRY_COLUMNS: &str =
    "identifier, outcome, lead_id, attempted_at, failure_reason, note, attempts";

impl Ledger {
    /// Open or create a ledger at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LeadflowError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let ledger = Self {
            db,
            conn,
            readonly: false,
        };
        ledger.configure_durability().await?;
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    /// Open an existing ledger at `path` in read-only mode (audit commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LeadflowError::Storage(format!(
                "ledger not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// WAL plus full fsync on commit.
    async fn configure_durability(&self) -> Result<()> {
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = FULL"] {
            let mut rows = self
                .conn
                .query(pragma, params![])
                .await
                .map_err(|e| LeadflowError::Storage(format!("{pragma}: {e}")))?;
            // Drain the single status row, if any.
            while let Ok(Some(_)) = rows.next().await {}
        }
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LeadflowError::Storage(
                "ledger is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// True iff `identifier` is recorded as `registered`.
    ///
    /// Failed and duplicate-skip entries do not count.
    pub async fn exists(&self, identifier: &CompanyId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM ledger WHERE identifier = ?1 AND outcome = 'registered'",
                params![identifier.as_str()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(LeadflowError::Storage(e.to_string())),
        }
    }

    /// Fetch the entry for `identifier`, if any.
    pub async fn get(&self, identifier: &CompanyId) -> Result<Option<LedgerEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger WHERE identifier = ?1"),
                params![identifier.as_str()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LeadflowError::Storage(e.to_string())),
        }
    }

    /// List entries, most recent attempt first, optionally filtered by outcome.
    pub async fn list(
        &self,
        outcome: Option<LedgerOutcome>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>> {
        let mut rows = match outcome {
            Some(outcome) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM ledger WHERE outcome = ?1
                             ORDER BY attempted_at DESC, identifier LIMIT ?2"
                        ),
                        params![outcome.as_str(), limit],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM ledger
                             ORDER BY attempted_at DESC, identifier LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_entry(&row)?);
        }
        Ok(results)
    }

    /// Count entries per outcome.
    pub async fn stats(&self) -> Result<LedgerStats> {
        let mut rows = self
            .conn
            .query(
                "SELECT outcome, COUNT(*) FROM ledger GROUP BY outcome",
                params![],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let mut stats = LedgerStats::default();
        while let Ok(Some(row)) = rows.next().await {
            let outcome: String = row
                .get(0)
                .map_err(|e| LeadflowError::Storage(e.to_string()))?;
            let count = row
                .get::<i64>(1)
                .map_err(|e| LeadflowError::Storage(e.to_string()))? as u64;
            match outcome.parse::<LedgerOutcome>()? {
                LedgerOutcome::Registered => stats.registered = count,
                LedgerOutcome::DuplicateSkip => stats.duplicate_skip = count,
                LedgerOutcome::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record `identifier` as registered under `lead_id`.
    ///
    /// Idempotent for the same lead. A different lead for an identifier that
    /// is already registered is reported, never written.
    pub async fn mark_registered(
        &self,
        identifier: &CompanyId,
        lead_id: &LeadId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO ledger (identifier, outcome, lead_id, attempted_at, failure_reason, attempts)
                 VALUES (?1, 'registered', ?2, ?3, NULL, 1)
                 ON CONFLICT(identifier) DO UPDATE SET
                   outcome = 'registered',
                   lead_id = excluded.lead_id,
                   attempted_at = excluded.attempted_at,
                   failure_reason = NULL,
                   note = NULL,
                   attempts = ledger.attempts + 1
                 WHERE ledger.outcome <> 'registered'",
                params![identifier.as_str(), lead_id.as_str(), at.to_rfc3339()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        if changed > 0 {
            debug!(%identifier, %lead_id, "ledger: registered");
            return Ok(());
        }

        // Already registered: only the same lead is acceptable.
        let existing = self
            .get(identifier)
            .await?
            .and_then(|entry| entry.lead_id)
            .ok_or_else(|| {
                LeadflowError::Storage(format!(
                    "registered entry for {identifier} vanished during upsert"
                ))
            })?;

        if existing == *lead_id {
            debug!(%identifier, %lead_id, "ledger: already registered with same lead");
            Ok(())
        } else {
            error!(
                %identifier,
                existing = %existing,
                attempted = %lead_id,
                "ledger consistency violation"
            );
            Err(LeadflowError::ConsistencyViolation {
                identifier: identifier.to_string(),
                existing: existing.0,
                attempted: lead_id.0.clone(),
            })
        }
    }

    /// Record a failed attempt, replacing any earlier failure reason.
    pub async fn mark_failed(
        &self,
        identifier: &CompanyId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO ledger (identifier, outcome, lead_id, attempted_at, failure_reason, attempts)
                 VALUES (?1, 'failed', NULL, ?2, ?3, 1)
                 ON CONFLICT(identifier) DO UPDATE SET
                   outcome = 'failed',
                   lead_id = NULL,
                   attempted_at = excluded.attempted_at,
                   failure_reason = excluded.failure_reason,
                   note = NULL,
                   attempts = ledger.attempts + 1
                 WHERE ledger.outcome <> 'registered'",
                params![identifier.as_str(), at.to_rfc3339(), reason],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        if changed == 0 {
            return Err(LeadflowError::AlreadyRegistered {
                identifier: identifier.to_string(),
            });
        }
        debug!(%identifier, reason, "ledger: failed");
        Ok(())
    }

    /// Settle `identifier` without a lead: the CRM already knows the company,
    /// or an operator abandoned it. Settled entries are skipped by later runs.
    pub async fn mark_duplicate(
        &self,
        identifier: &CompanyId,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO ledger (identifier, outcome, lead_id, attempted_at, note, attempts)
                 VALUES (?1, 'duplicate_skip', NULL, ?2, ?3, 1)
                 ON CONFLICT(identifier) DO UPDATE SET
                   outcome = 'duplicate_skip',
                   lead_id = NULL,
                   attempted_at = excluded.attempted_at,
                   failure_reason = NULL,
                   note = excluded.note,
                   attempts = ledger.attempts + 1
                 WHERE ledger.outcome <> 'registered'",
                params![identifier.as_str(), at.to_rfc3339(), note],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        if changed == 0 {
            return Err(LeadflowError::AlreadyRegistered {
                identifier: identifier.to_string(),
            });
        }
        debug!(%identifier, note, "ledger: duplicate_skip");
        Ok(())
    }
}

/// Convert a database row to a [`LedgerEntry`].
fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry> {
    let identifier: String = row
        .get(0)
        .map_err(|e| LeadflowError::Storage(e.to_string()))?;
    let outcome: String = row
        .get(1)
        .map_err(|e| LeadflowError::Storage(e.to_string()))?;
    let attempted_at: String = row
        .get(3)
        .map_err(|e| LeadflowError::Storage(e.to_string()))?;

    Ok(LedgerEntry {
        identifier: CompanyId::normalize(&identifier)?,
        outcome: outcome.parse()?,
        lead_id: row.get::<String>(2).ok().map(LeadId),
        attempted_at: DateTime::parse_from_rfc3339(&attempted_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| LeadflowError::Storage(format!("invalid date: {e}")))?,
        failure_reason: row.get::<String>(4).ok(),
        note: row.get::<String>(5).ok(),
        attempts: row.get::<u32>(6).unwrap_or(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("leadflow_test_{}.db", Uuid::now_v7()))
    }

    /// Create a temp file ledger for testing.
    async fn test_ledger() -> Ledger {
        Ledger::open(&temp_path()).await.expect("open test db")
    }

    fn id(raw: &str) -> CompanyId {
        CompanyId::normalize(raw).unwrap()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let ledger = test_ledger().await;
        assert_eq!(ledger.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_path();
        let first = Ledger::open(&tmp).await.expect("first open");
        drop(first);
        let second = Ledger::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn empty_ledger_has_nothing() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        assert!(!ledger.exists(&x).await.unwrap());
        assert!(ledger.get(&x).await.unwrap().is_none());
        assert_eq!(ledger.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn register_then_exists() {
        let ledger = test_ledger().await;
        let x = id("11.222.333/0001-81");
        ledger
            .mark_registered(&x, &LeadId::from("lead-1"), Utc::now())
            .await
            .expect("register");

        assert!(ledger.exists(&x).await.unwrap());
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.outcome, LedgerOutcome::Registered);
        assert_eq!(entry.lead_id, Some(LeadId::from("lead-1")));
        assert!(entry.failure_reason.is_none());
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn same_lead_rewrite_is_noop() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        let first_at = Utc::now() - Duration::hours(1);
        ledger
            .mark_registered(&x, &LeadId::from("A"), first_at)
            .await
            .unwrap();
        ledger
            .mark_registered(&x, &LeadId::from("A"), Utc::now())
            .await
            .expect("idempotent rewrite");

        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.attempted_at.timestamp(), first_at.timestamp());
    }

    #[tokio::test]
    async fn different_lead_is_consistency_violation() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger
            .mark_registered(&x, &LeadId::from("A"), Utc::now())
            .await
            .unwrap();

        let err = ledger
            .mark_registered(&x, &LeadId::from("B"), Utc::now())
            .await
            .unwrap_err();
        match err {
            LeadflowError::ConsistencyViolation {
                existing, attempted, ..
            } => {
                assert_eq!(existing, "A");
                assert_eq!(attempted, "B");
            }
            other => panic!("expected consistency violation, got {other}"),
        }

        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.lead_id, Some(LeadId::from("A")));
    }

    #[tokio::test]
    async fn failed_is_not_duplicate_and_keeps_latest_reason() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger.mark_failed(&x, "crm timeout", Utc::now()).await.unwrap();
        assert!(!ledger.exists(&x).await.unwrap());

        ledger.mark_failed(&x, "crm 503", Utc::now()).await.unwrap();
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.outcome, LedgerOutcome::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("crm 503"));
        assert_eq!(entry.attempts, 2);
        assert!(!entry.is_settled());
    }

    #[tokio::test]
    async fn failed_then_registered() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger.mark_failed(&x, "crm down", Utc::now()).await.unwrap();
        ledger
            .mark_registered(&x, &LeadId::from("lead-9"), Utc::now())
            .await
            .unwrap();

        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.outcome, LedgerOutcome::Registered);
        assert!(entry.failure_reason.is_none());
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn registered_cannot_be_downgraded() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger
            .mark_registered(&x, &LeadId::from("A"), Utc::now())
            .await
            .unwrap();

        let err = ledger
            .mark_failed(&x, "late failure", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::AlreadyRegistered { .. }));
        let err = ledger
            .mark_duplicate(&x, "abandoned", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::AlreadyRegistered { .. }));

        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.lead_id, Some(LeadId::from("A")));
        assert!(entry.failure_reason.is_none());
        assert!(entry.note.is_none());
    }

    #[tokio::test]
    async fn duplicate_skip_is_settled_but_not_registered() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger.mark_failed(&x, "crm 400", Utc::now()).await.unwrap();
        ledger
            .mark_duplicate(&x, "abandoned by operator", Utc::now())
            .await
            .unwrap();

        assert!(!ledger.exists(&x).await.unwrap());
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.outcome, LedgerOutcome::DuplicateSkip);
        assert!(entry.is_settled());
        assert!(entry.failure_reason.is_none());
        assert_eq!(entry.note.as_deref(), Some("abandoned by operator"));
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn failure_reason_only_on_failed_entries() {
        let ledger = test_ledger().await;
        let x = id("11222333000181");
        ledger
            .mark_duplicate(&x, "CRM already holds this company", Utc::now())
            .await
            .unwrap();
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert!(entry.failure_reason.is_none());
        assert_eq!(entry.note.as_deref(), Some("CRM already holds this company"));

        ledger.mark_failed(&x, "crm 503", Utc::now()).await.unwrap();
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert_eq!(entry.failure_reason.as_deref(), Some("crm 503"));
        assert!(entry.note.is_none());

        ledger
            .mark_registered(&x, &LeadId::from("A"), Utc::now())
            .await
            .unwrap();
        let entry = ledger.get(&x).await.unwrap().unwrap();
        assert!(entry.failure_reason.is_none());
        assert!(entry.note.is_none());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let tmp = temp_path();
        {
            let ledger = Ledger::open(&tmp).await.unwrap();
            ledger
                .mark_registered(&id("11222333000181"), &LeadId::from("A"), Utc::now())
                .await
                .unwrap();
            ledger
                .mark_failed(&id("12345678000195"), "crm 500", Utc::now())
                .await
                .unwrap();
        }

        let reopened = Ledger::open(&tmp).await.unwrap();
        assert!(reopened.exists(&id("11222333000181")).await.unwrap());
        assert!(!reopened.exists(&id("12345678000195")).await.unwrap());
        let stats = reopened.stats().await.unwrap();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn list_filters_by_outcome() {
        let ledger = test_ledger().await;
        ledger
            .mark_registered(&id("11222333000181"), &LeadId::from("A"), Utc::now())
            .await
            .unwrap();
        ledger
            .mark_failed(&id("12345678000195"), "crm 500", Utc::now())
            .await
            .unwrap();

        let all = ledger.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let failed = ledger.list(Some(LedgerOutcome::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].identifier, id("12345678000195"));

        let limited = ledger.list(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_path();
        let rw = Ledger::open(&tmp).await.unwrap();
        rw.mark_registered(&id("11222333000181"), &LeadId::from("A"), Utc::now())
            .await
            .unwrap();
        drop(rw);

        let ro = Ledger::open_readonly(&tmp).await.unwrap();
        assert!(ro.exists(&id("11222333000181")).await.unwrap());
        let result = ro
            .mark_failed(&id("12345678000195"), "x", Utc::now())
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let result = Ledger::open_readonly(&temp_path()).await;
        assert!(result.is_err());
    }
}
