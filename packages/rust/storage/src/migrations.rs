//! SQL migration definitions for the ledger database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: ledger keyed by normalized identifier",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per normalized company identifier
CREATE TABLE IF NOT EXISTS ledger (
    identifier     TEXT PRIMARY KEY,
    outcome        TEXT NOT NULL
                   CHECK (outcome IN ('registered', 'duplicate_skip', 'failed')),
    lead_id        TEXT,
    attempted_at   TEXT NOT NULL,
    failure_reason TEXT,
    note           TEXT,
    attempts       INTEGER NOT NULL DEFAULT 1,
    CHECK ((outcome = 'registered') = (lead_id IS NOT NULL)),
    CHECK ((outcome = 'failed') = (failure_reason IS NOT NULL)),
    CHECK (outcome = 'duplicate_skip' OR note IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_ledger_outcome ON ledger(outcome);
CREATE INDEX IF NOT EXISTS idx_ledger_attempted_at ON ledger(attempted_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
