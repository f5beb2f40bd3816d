#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use correction_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AuditEntry, AuditReplay, BonusInput, BonusReceipt,
    Correction, CorrectionId, Project, ProjectId, UserId, AUDIT_REPLAY_CONTRACT_VERSION,
    OPERATION_RECORD_BONUS,
};
use log::{error, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS projects (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0)
);

CREATE TABLE IF NOT EXISTS corrections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  project_id INTEGER NOT NULL,
  score INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id),
  FOREIGN KEY (project_id) REFERENCES projects(id)
);

CREATE TRIGGER IF NOT EXISTS trg_corrections_no_update
BEFORE UPDATE ON corrections
BEGIN
  SELECT RAISE(FAIL, 'corrections is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_corrections_no_delete
BEFORE DELETE ON corrections
BEGIN
  SELECT RAISE(FAIL, 'corrections is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_corrections_user_seq
  ON corrections(user_id, id);
CREATE INDEX IF NOT EXISTS idx_corrections_project_seq
  ON corrections(project_id, id);

CREATE TABLE IF NOT EXISTS recorder_calls (
  operation TEXT PRIMARY KEY,
  call_count INTEGER NOT NULL CHECK (call_count >= 0)
);

CREATE TABLE IF NOT EXISTS recorder_audit (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  operation TEXT NOT NULL,
  input_json TEXT NOT NULL,
  output_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_recorder_audit_no_update
BEFORE UPDATE ON recorder_audit
BEGIN
  SELECT RAISE(FAIL, 'recorder_audit is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_recorder_audit_no_delete
BEFORE DELETE ON recorder_audit
BEGIN
  SELECT RAISE(FAIL, 'recorder_audit is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_recorder_audit_operation_seq
  ON recorder_audit(operation, entry_seq);
";

pub struct SqliteCorrectionStore {
    conn: Connection,
}

/// Optional narrowing for [`SqliteCorrectionStore::list_corrections`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectionFilter {
    pub user_id: Option<UserId>,
    pub project_name: Option<String>,
    pub limit: Option<usize>,
}

impl SqliteCorrectionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let started_at = Instant::now();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        info!(
            "event=db_open module=ledger_store status=ok path={} duration_ms={}",
            path.display(),
            started_at.elapsed().as_millis()
        );

        Ok(Self { conn })
    }

    /// Applies the ledger schema after checking the host-owned `users` table.
    ///
    /// `users` belongs to the surrounding platform; this store never creates
    /// or alters it, it only verifies that corrections can reference it.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        ensure_host_schema_compatibility(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        info!(
            "event=db_migrate module=ledger_store status=ok version={}",
            LEDGER_MIGRATION_VERSION
        );

        Ok(())
    }

    /// Appends one bonus correction, creating the named project on first use.
    ///
    /// The project upsert, the correction insert, and the audit-trail writes
    /// share a single immediate transaction, so a failed call leaves no rows
    /// behind and concurrent writers on the same new project name cannot
    /// race the lookup.
    pub fn record_bonus(&mut self, input: &BonusInput) -> Result<BonusReceipt> {
        input
            .validate()
            .map_err(|err| anyhow!("bonus validation failed: {err}"))?;

        let started_at = Instant::now();
        match self.record_bonus_tx(input) {
            Ok(receipt) => {
                info!(
                    "event=record_bonus module=ledger_store status=ok user_id={} project_id={} correction_id={} project_created={} duration_ms={}",
                    receipt.correction.user_id,
                    receipt.project.id,
                    receipt.correction.id,
                    receipt.project_created,
                    started_at.elapsed().as_millis()
                );
                Ok(receipt)
            }
            Err(err) => {
                error!(
                    "event=record_bonus module=ledger_store status=error user_id={} duration_ms={} error={:#}",
                    input.user_id,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn record_bonus_tx(&mut self, input: &BonusInput) -> Result<BonusReceipt> {
        let recorded_at = now_utc();
        let recorded_at_text = format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start bonus transaction")?;

        let created_rows = tx
            .execute(
                "INSERT INTO projects(name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                params![input.project_name],
            )
            .context("failed to upsert project")?;
        let project_created = created_rows > 0;

        let project_id: i64 = tx
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![input.project_name],
                |row| row.get(0),
            )
            .context("failed to resolve project id")?;

        tx.execute(
            "INSERT INTO corrections(user_id, project_id, score, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![input.user_id.0, project_id, input.score, recorded_at_text],
        )
        .context("failed to append correction")?;
        let correction_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO recorder_calls(operation, call_count) VALUES (?1, 1)
             ON CONFLICT(operation) DO UPDATE SET call_count = call_count + 1",
            params![OPERATION_RECORD_BONUS],
        )
        .context("failed to bump recorder call counter")?;

        let input_payload = serde_json::to_string(&json!({
            "user_id": input.user_id,
            "project_name": input.project_name,
            "score": input.score,
        }))
        .context("failed to serialize recorder input payload")?;
        let output_payload = serde_json::to_string(&json!({
            "correction_id": correction_id,
            "project_id": project_id,
            "project_created": project_created,
        }))
        .context("failed to serialize recorder output payload")?;

        tx.execute(
            "INSERT INTO recorder_audit(entry_id, operation, input_json, output_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Ulid::new().to_string(),
                OPERATION_RECORD_BONUS,
                input_payload,
                output_payload,
                recorded_at_text,
            ],
        )
        .context("failed to append recorder audit entry")?;

        tx.commit().context("failed to commit bonus transaction")?;

        Ok(BonusReceipt {
            correction: Correction {
                id: CorrectionId(correction_id),
                user_id: input.user_id,
                project_id: ProjectId(project_id),
                score: input.score,
                recorded_at,
            },
            project: Project {
                id: ProjectId(project_id),
                name: input.project_name.clone(),
            },
            project_created,
        })
    }

    pub fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let project = self
            .conn
            .query_row(
                "SELECT id, name FROM projects WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Project {
                        id: ProjectId(row.get(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("failed to look up project by name")?;

        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM projects ORDER BY id ASC")?;

        let rows = stmt.query_map([], |row| {
            Ok(Project {
                id: ProjectId(row.get(0)?),
                name: row.get(1)?,
            })
        })?;

        collect_rows(rows)
    }

    pub fn list_corrections(&self, filter: &CorrectionFilter) -> Result<Vec<Correction>> {
        let mut query = "SELECT id, user_id, project_id, score, recorded_at
             FROM corrections"
            .to_string();

        let mut clauses: Vec<&str> = Vec::new();
        let mut bind_values: Vec<SqlValue> = Vec::new();

        if let Some(user_id) = filter.user_id {
            clauses.push("user_id = ?");
            bind_values.push(SqlValue::Integer(user_id.0));
        }

        if let Some(project_name) = filter.project_name.as_deref() {
            clauses.push("project_id IN (SELECT id FROM projects WHERE name = ?)");
            bind_values.push(SqlValue::Text(project_name.to_string()));
        }

        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }

        query.push_str(" ORDER BY id ASC");

        if let Some(raw_limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(bind_values), parse_correction_row)?;

        collect_rows(rows)
    }

    /// Mean score over a user's corrections, optionally narrowed to one
    /// project. Returns `None` when no matching correction exists.
    pub fn average_score(&self, user_id: UserId, project_name: Option<&str>) -> Result<Option<f64>> {
        let average = match project_name {
            Some(name) => self.conn.query_row(
                "SELECT AVG(score) FROM corrections
                 WHERE user_id = ?1
                   AND project_id IN (SELECT id FROM projects WHERE name = ?2)",
                params![user_id.0, name],
                |row| row.get::<_, Option<f64>>(0),
            ),
            None => self.conn.query_row(
                "SELECT AVG(score) FROM corrections WHERE user_id = ?1",
                params![user_id.0],
                |row| row.get::<_, Option<f64>>(0),
            ),
        }
        .context("failed to compute average score")?;

        Ok(average)
    }

    pub fn call_count(&self, operation: &str) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT call_count FROM recorder_calls WHERE operation = ?1",
                params![operation],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to query recorder call counter")?;

        let raw = count.unwrap_or(0);
        u64::try_from(raw).with_context(|| format!("invalid recorder call_count: {raw}"))
    }

    /// Replays the audit history for one operation: lifetime call counter
    /// plus per-call input/output payloads in append order.
    pub fn audit_replay(&self, operation: &str, limit: Option<usize>) -> Result<AuditReplay> {
        let calls_recorded = self.call_count(operation)?;

        let mut query = "SELECT entry_seq, entry_id, operation, input_json, output_json, recorded_at
             FROM recorder_audit
             WHERE operation = ?1
             ORDER BY entry_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![operation], parse_audit_row)?;
        let entries = collect_rows(rows)?;

        Ok(AuditReplay {
            contract_version: AUDIT_REPLAY_CONTRACT_VERSION.to_string(),
            operation: operation.to_string(),
            calls_recorded,
            entries,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_correction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Correction> {
    let recorded_at_raw: String = row.get(4)?;
    let recorded_at = parse_rfc3339_utc(&recorded_at_raw).map_err(|err| to_sql_error(4, &err))?;

    Ok(Correction {
        id: CorrectionId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        project_id: ProjectId(row.get(2)?),
        score: row.get(3)?,
        recorded_at,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entry_id_raw: String = row.get(1)?;
    let input_raw: String = row.get(3)?;
    let output_raw: String = row.get(4)?;
    let recorded_at_raw: String = row.get(5)?;

    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid entry_id ULID: {entry_id_raw}"),
            )),
        )
    })?;

    let input_json: Value = serde_json::from_str(&input_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let output_json: Value = serde_json::from_str(&output_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;

    let recorded_at = parse_rfc3339_utc(&recorded_at_raw).map_err(|err| to_sql_error(5, &err))?;

    Ok(AuditEntry {
        entry_seq: row.get(0)?,
        entry_id,
        operation: row.get(2)?,
        input_json,
        output_json,
        recorded_at,
    })
}

fn to_sql_error(column: usize, err: &correction_ledger_core::LedgerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn ensure_host_schema_compatibility(conn: &Connection) -> Result<()> {
    let has_users = table_exists(conn, "users")?;
    if !has_users {
        return Err(anyhow!("host schema check failed: expected table users"));
    }

    ensure_table_has_columns(conn, "users", &["id"])?;
    ensure_unique_id_column(conn, "users")?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "host schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn ensure_unique_id_column(conn: &Connection, table_name: &str) -> Result<()> {
    // An INTEGER PRIMARY KEY id aliases the rowid and appears in no index,
    // so the table_info pk flag has to be consulted before scanning indexes.
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut pk_columns = Vec::new();
    while let Some(row) = rows.next()? {
        let column: String = row.get(1)?;
        let pk_position: i64 = row.get(5)?;
        if pk_position > 0 {
            pk_columns.push((pk_position, column));
        }
    }
    pk_columns.sort();

    if pk_columns.len() == 1 && pk_columns[0].1 == "id" {
        return Ok(());
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        if index_columns(conn, &index_name)? == ["id"] {
            return Ok(());
        }
    }

    Err(anyhow!(
        "host schema check failed: expected {table_name}.id to be unique"
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

/// Creates a minimal host `users` table and one row, for tests and demos
/// that run against a fresh database instead of the real platform schema.
pub fn seed_minimal_users_table(conn: &Connection, user_id: UserId, name: &str) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
         );",
    )
    .context("failed to create minimal users table")?;

    conn.execute(
        "INSERT OR IGNORE INTO users(id, name) VALUES (?1, ?2)",
        params![user_id.0, name],
    )
    .context("failed to seed users row")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteCorrectionStore {
        let store = must(SqliteCorrectionStore::open(Path::new(":memory:")));
        must(seed_minimal_users_table(store.connection(), UserId(1), "Bob"));
        must(seed_minimal_users_table(
            store.connection(),
            UserId(2),
            "Jeanne",
        ));
        must(store.migrate());
        store
    }

    fn bonus(user_id: i64, project_name: &str, score: i64) -> BonusInput {
        BonusInput {
            user_id: UserId(user_id),
            project_name: project_name.to_string(),
            score,
        }
    }

    fn count_rows(store: &SqliteCorrectionStore, table: &str) -> i64 {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let result = store
            .connection()
            .query_row(&query, [], |row| row.get::<_, i64>(0));
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn recording_into_empty_store_creates_project_and_correction() {
        let mut store = fixture_store();

        let receipt = must(store.record_bonus(&bonus(1, "C is fun", 100)));

        assert!(receipt.project_created);
        assert_eq!(receipt.project.name, "C is fun");
        assert_eq!(receipt.correction.user_id, UserId(1));
        assert_eq!(receipt.correction.project_id, receipt.project.id);
        assert_eq!(receipt.correction.score, 100);

        let stored = match must(store.find_project("C is fun")) {
            Some(value) => value,
            None => panic!("project row missing after record"),
        };
        assert_eq!(stored.id, receipt.project.id);

        let corrections = must(store.list_corrections(&CorrectionFilter::default()));
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0], receipt.correction);
    }

    #[test]
    fn recording_against_existing_project_reuses_its_id() {
        let mut store = fixture_store();
        let inserted = store.connection().execute(
            "INSERT INTO projects(id, name) VALUES (5, 'Old school blues')",
            [],
        );
        if let Err(err) = inserted {
            panic!("test failure: {err}");
        }

        let receipt = must(store.record_bonus(&bonus(2, "Old school blues", 50)));

        assert!(!receipt.project_created);
        assert_eq!(receipt.project.id, ProjectId(5));
        assert_eq!(receipt.correction.project_id, ProjectId(5));
        assert_eq!(count_rows(&store, "projects"), 1);
        assert_eq!(count_rows(&store, "corrections"), 1);
    }

    #[test]
    fn repeated_bonuses_append_distinct_corrections() {
        let mut store = fixture_store();

        let first = must(store.record_bonus(&bonus(1, "Python is cool", 80)));
        let second = must(store.record_bonus(&bonus(1, "Python is cool", 80)));

        assert!(first.project_created);
        assert!(!second.project_created);
        assert_ne!(first.correction.id, second.correction.id);
        assert_eq!(first.correction.project_id, second.correction.project_id);
        assert_eq!(count_rows(&store, "projects"), 1);
        assert_eq!(count_rows(&store, "corrections"), 2);
    }

    #[test]
    fn recording_with_unknown_user_fails_and_persists_nothing() {
        let mut store = fixture_store();

        let result = store.record_bonus(&bonus(999, "Bonus project", 100));

        let err = match result {
            Ok(_) => panic!("expected foreign key failure for unknown user"),
            Err(err) => err,
        };
        let rendered = format!("{err:#}");
        assert!(rendered.contains("failed to append correction"));
        assert!(rendered.contains("FOREIGN KEY constraint failed"));

        assert!(must(store.find_project("Bonus project")).is_none());
        assert_eq!(count_rows(&store, "corrections"), 0);
        assert_eq!(count_rows(&store, "recorder_audit"), 0);
        assert_eq!(must(store.call_count(OPERATION_RECORD_BONUS)), 0);
    }

    #[test]
    fn project_name_matching_is_exact() {
        let mut store = fixture_store();

        let lower = must(store.record_bonus(&bonus(1, "c is fun", 60)));
        let upper = must(store.record_bonus(&bonus(1, "C is fun", 70)));

        assert!(lower.project_created);
        assert!(upper.project_created);
        assert_ne!(lower.project.id, upper.project.id);
        assert_eq!(count_rows(&store, "projects"), 2);
    }

    #[test]
    fn duplicate_project_names_rejected_at_schema_level() {
        let mut store = fixture_store();
        must(store.record_bonus(&bonus(1, "C is fun", 100)));

        let duplicate = store
            .connection()
            .execute("INSERT INTO projects(name) VALUES ('C is fun')", []);

        assert!(duplicate.is_err());
    }

    #[test]
    fn corrections_are_append_only() {
        let mut store = fixture_store();
        let receipt = must(store.record_bonus(&bonus(1, "C is fun", 100)));

        let update_result = store.connection().execute(
            "UPDATE corrections SET score = 0 WHERE id = ?1",
            params![receipt.correction.id.0],
        );
        assert!(update_result.is_err());

        let delete_result = store.connection().execute(
            "DELETE FROM corrections WHERE id = ?1",
            params![receipt.correction.id.0],
        );
        assert!(delete_result.is_err());

        assert_eq!(count_rows(&store, "corrections"), 1);
    }

    #[test]
    fn empty_project_name_is_rejected_before_any_write() {
        let mut store = fixture_store();

        let result = store.record_bonus(&bonus(1, "   ", 100));

        let err = match result {
            Ok(_) => panic!("expected validation failure for blank project name"),
            Err(err) => err,
        };
        assert!(format!("{err}").contains("bonus validation failed"));
        assert_eq!(count_rows(&store, "corrections"), 0);
        assert_eq!(must(store.call_count(OPERATION_RECORD_BONUS)), 0);
    }

    #[test]
    fn migrate_requires_host_users_table() {
        let store = must(SqliteCorrectionStore::open(Path::new(":memory:")));

        let err = match store.migrate() {
            Ok(()) => panic!("expected migrate to fail without users table"),
            Err(err) => err,
        };

        assert!(format!("{err}").contains("expected table users"));
    }

    #[test]
    fn migrate_requires_users_id_column() {
        let store = must(SqliteCorrectionStore::open(Path::new(":memory:")));
        let created = store
            .connection()
            .execute_batch("CREATE TABLE users (uid INTEGER PRIMARY KEY, name TEXT);");
        if let Err(err) = created {
            panic!("test failure: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected migrate to fail without users.id"),
            Err(err) => err,
        };

        assert!(format!("{err}").contains("missing column users.id"));
    }

    #[test]
    fn migrate_rejects_non_unique_users_id() {
        let store = must(SqliteCorrectionStore::open(Path::new(":memory:")));
        let created = store
            .connection()
            .execute_batch("CREATE TABLE users (uid INTEGER PRIMARY KEY, id INTEGER NOT NULL);");
        if let Err(err) = created {
            panic!("test failure: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected migrate to fail for non-unique users.id"),
            Err(err) => err,
        };

        assert!(format!("{err}").contains("expected users.id to be unique"));
    }

    #[test]
    fn migrate_accepts_unique_index_on_users_id() {
        let store = must(SqliteCorrectionStore::open(Path::new(":memory:")));
        let created = store.connection().execute_batch(
            "CREATE TABLE users (uid INTEGER PRIMARY KEY, id INTEGER NOT NULL);
             CREATE UNIQUE INDEX idx_users_id ON users(id);",
        );
        if let Err(err) = created {
            panic!("test failure: {err}");
        }

        must(store.migrate());
    }

    #[test]
    fn audit_trail_records_every_call() {
        let mut store = fixture_store();

        let first = must(store.record_bonus(&bonus(1, "C is fun", 100)));
        let second = must(store.record_bonus(&bonus(1, "C is fun", 90)));
        let third = must(store.record_bonus(&bonus(2, "Python is cool", 80)));

        assert_eq!(must(store.call_count(OPERATION_RECORD_BONUS)), 3);

        let replay = must(store.audit_replay(OPERATION_RECORD_BONUS, None));
        assert_eq!(replay.contract_version, "audit_replay.v1");
        assert_eq!(replay.operation, OPERATION_RECORD_BONUS);
        assert_eq!(replay.calls_recorded, 3);
        assert_eq!(replay.entries.len(), 3);

        let expected = [&first, &second, &third];
        for (entry, receipt) in replay.entries.iter().zip(expected) {
            assert_eq!(entry.operation, OPERATION_RECORD_BONUS);
            assert_eq!(
                entry.input_json["project_name"],
                receipt.project.name.as_str()
            );
            assert_eq!(entry.input_json["score"], receipt.correction.score);
            assert_eq!(entry.output_json["correction_id"], receipt.correction.id.0);
            assert_eq!(entry.output_json["project_id"], receipt.project.id.0);
        }

        let seqs: Vec<i64> = replay.entries.iter().map(|entry| entry.entry_seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn audit_replay_limit_keeps_full_counter() {
        let mut store = fixture_store();
        must(store.record_bonus(&bonus(1, "C is fun", 100)));
        must(store.record_bonus(&bonus(1, "C is fun", 90)));
        must(store.record_bonus(&bonus(1, "C is fun", 80)));

        let replay = must(store.audit_replay(OPERATION_RECORD_BONUS, Some(2)));

        assert_eq!(replay.calls_recorded, 3);
        assert_eq!(replay.entries.len(), 2);
    }

    #[test]
    fn audit_replay_for_unknown_operation_is_empty() {
        let store = fixture_store();

        let replay = must(store.audit_replay("drop_bonus", None));

        assert_eq!(replay.calls_recorded, 0);
        assert!(replay.entries.is_empty());
    }

    #[test]
    fn average_score_handles_filters_and_absence() {
        let mut store = fixture_store();
        must(store.record_bonus(&bonus(1, "C is fun", 80)));
        must(store.record_bonus(&bonus(1, "C is fun", 100)));
        must(store.record_bonus(&bonus(1, "Python is cool", 50)));

        let overall = match must(store.average_score(UserId(1), None)) {
            Some(value) => value,
            None => panic!("expected an overall average"),
        };
        assert!((overall - 230.0 / 3.0).abs() < 1e-9);

        let scoped = match must(store.average_score(UserId(1), Some("C is fun"))) {
            Some(value) => value,
            None => panic!("expected a project average"),
        };
        assert!((scoped - 90.0).abs() < 1e-9);

        assert!(must(store.average_score(UserId(2), None)).is_none());
    }

    #[test]
    fn list_corrections_applies_filters() {
        let mut store = fixture_store();
        must(store.record_bonus(&bonus(1, "C is fun", 100)));
        must(store.record_bonus(&bonus(2, "C is fun", 90)));
        must(store.record_bonus(&bonus(1, "Python is cool", 80)));

        let for_user = must(store.list_corrections(&CorrectionFilter {
            user_id: Some(UserId(1)),
            ..CorrectionFilter::default()
        }));
        assert_eq!(for_user.len(), 2);
        assert!(for_user
            .iter()
            .all(|correction| correction.user_id == UserId(1)));

        let for_project = must(store.list_corrections(&CorrectionFilter {
            project_name: Some("C is fun".to_string()),
            ..CorrectionFilter::default()
        }));
        assert_eq!(for_project.len(), 2);

        let combined = must(store.list_corrections(&CorrectionFilter {
            user_id: Some(UserId(1)),
            project_name: Some("C is fun".to_string()),
            limit: Some(10),
        }));
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].score, 100);

        let limited = must(store.list_corrections(&CorrectionFilter {
            limit: Some(2),
            ..CorrectionFilter::default()
        }));
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn find_project_returns_none_for_unknown_name() {
        let store = fixture_store();

        assert!(must(store.find_project("Unknown project")).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_find_or_create_keeps_project_ids_stable(
            calls in prop::collection::vec((1i64..=2, 0usize..4, -50i64..=200), 1..60)
        ) {
            let mut store = fixture_store();
            let names = ["C is fun", "Python is cool", "Bonus project", "New bonus"];
            let mut known_ids: BTreeMap<&str, i64> = BTreeMap::new();

            for (user_id, name_index, score) in calls.iter().copied() {
                let name = names[name_index];
                let receipt = must(store.record_bonus(&bonus(user_id, name, score)));

                match known_ids.get(name) {
                    Some(&existing) => {
                        assert!(!receipt.project_created);
                        assert_eq!(receipt.project.id.0, existing);
                    }
                    None => {
                        assert!(receipt.project_created);
                        known_ids.insert(name, receipt.project.id.0);
                    }
                }
                assert_eq!(receipt.correction.project_id, receipt.project.id);
            }

            let call_total = must(store.call_count(OPERATION_RECORD_BONUS));
            assert_eq!(call_total as usize, calls.len());
            assert_eq!(count_rows(&store, "corrections") as usize, calls.len());
            assert_eq!(count_rows(&store, "projects") as usize, known_ids.len());
        }
    }
}
