//! SQLite backing store for BreedGraph.
//!
//! Every unit of work holds its own [`SqliteStore`] and runs inside one
//! `BEGIN IMMEDIATE` transaction, which SQLite executes serializably. The
//! per-aggregate stores in the submodules borrow the connection and never open
//! transactions themselves.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use breedgraph_core::DomainError;
use rusqlite::{params, Connection, DatabaseName, ErrorCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod accounts;
pub mod controls;
pub mod ontology;
pub mod organisations;

pub use accounts::AccountStore;
pub use controls::ControlStore;
pub use ontology::{
    EntryQuery, LifecycleKind, OntologyPersistence, RelationshipQuery, SqliteOntologyPersistence,
};
pub use organisations::OrganisationStore;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS counters (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL CHECK (value >= 0)
);

INSERT OR IGNORE INTO counters(name, value) VALUES
  ('user', 0), ('team', 0), ('ontology_entry', 0), ('ontology_relationship', 0);

CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  name_lower TEXT NOT NULL UNIQUE,
  fullname TEXT,
  email TEXT NOT NULL,
  email_lower TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  email_verified INTEGER NOT NULL DEFAULT 0,
  ontology_role TEXT NOT NULL CHECK (ontology_role IN ('VIEWER','CONTRIBUTOR','EDITOR','ADMIN'))
);

CREATE TABLE IF NOT EXISTS allowed_emails (
  user_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  email TEXT NOT NULL,
  email_lower TEXT NOT NULL,
  PRIMARY KEY (user_id, email_lower),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS teams (
  id INTEGER PRIMARY KEY,
  parent_id INTEGER,
  name TEXT NOT NULL,
  name_lower TEXT NOT NULL,
  fullname TEXT,
  FOREIGN KEY (parent_id) REFERENCES teams(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_teams_parent_name
  ON teams(COALESCE(parent_id, 0), name_lower);

CREATE TABLE IF NOT EXISTS affiliations (
  team_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  access TEXT NOT NULL CHECK (access IN ('READ','WRITE','CURATE','ADMIN')),
  authorisation TEXT NOT NULL CHECK (authorisation IN ('REQUESTED','AUTHORISED','RETIRED','DENIED')),
  heritable INTEGER NOT NULL,
  PRIMARY KEY (team_id, user_id, access),
  FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE,
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS controls (
  label TEXT NOT NULL,
  model_id INTEGER NOT NULL,
  team_id INTEGER NOT NULL,
  release TEXT NOT NULL CHECK (release IN ('PRIVATE','REGISTERED','PUBLIC')),
  time TEXT NOT NULL,
  PRIMARY KEY (label, model_id, team_id),
  FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS control_writes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  label TEXT NOT NULL,
  model_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ontology_entries (
  id INTEGER PRIMARY KEY,
  label TEXT NOT NULL,
  name TEXT NOT NULL,
  name_lower TEXT NOT NULL,
  abbreviation TEXT,
  abbreviation_lower TEXT,
  description TEXT,
  synonyms_json TEXT NOT NULL,
  authors_json TEXT NOT NULL,
  references_json TEXT NOT NULL,
  kind_json TEXT NOT NULL,
  UNIQUE (label, name_lower)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ontology_entries_abbreviation
  ON ontology_entries(label, abbreviation_lower)
  WHERE abbreviation_lower IS NOT NULL;

CREATE TABLE IF NOT EXISTS ontology_relationships (
  id INTEGER PRIMARY KEY,
  source_id INTEGER NOT NULL,
  target_id INTEGER NOT NULL,
  label TEXT NOT NULL,
  rank INTEGER CHECK (rank IS NULL OR rank >= 0),
  UNIQUE (source_id, target_id, label),
  CHECK (source_id <> target_id),
  FOREIGN KEY (source_id) REFERENCES ontology_entries(id),
  FOREIGN KEY (target_id) REFERENCES ontology_entries(id)
);

CREATE TABLE IF NOT EXISTS lifecycles (
  kind TEXT NOT NULL CHECK (kind IN ('entry','relationship')),
  entity_id INTEGER NOT NULL,
  drafted INTEGER,
  activated INTEGER,
  deprecated INTEGER,
  removed INTEGER,
  PRIMARY KEY (kind, entity_id)
);

CREATE TABLE IF NOT EXISTS lifecycle_writes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  entity_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lifecycle_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  entity_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  phase TEXT NOT NULL CHECK (phase IN ('DRAFT','ACTIVE','DEPRECATED','REMOVED')),
  version INTEGER NOT NULL,
  time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ontology_commits (
  version INTEGER PRIMARY KEY,
  comment TEXT,
  licence INTEGER,
  copyright INTEGER,
  time TEXT NOT NULL,
  user_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_teams_parent ON teams(parent_id);
CREATE INDEX IF NOT EXISTS idx_affiliations_user ON affiliations(user_id);
CREATE INDEX IF NOT EXISTS idx_control_writes_model ON control_writes(label, model_id);
CREATE INDEX IF NOT EXISTS idx_relationships_source ON ontology_relationships(label, source_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON ontology_relationships(label, target_id);
CREATE INDEX IF NOT EXISTS idx_lifecycle_writes_entity ON lifecycle_writes(kind, entity_id);
CREATE INDEX IF NOT EXISTS idx_lifecycle_audit_entity ON lifecycle_audit(kind, entity_id);
";

/// Tables whose rows mean the store holds data.
const DATA_TABLES: &[&str] = &["users", "teams", "ontology_entries", "ontology_commits"];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Id sequences kept in the `counters` table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Counter {
    User,
    Team,
    OntologyEntry,
    OntologyRelationship,
}

impl Counter {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
            Self::OntologyEntry => "ontology_entry",
            Self::OntologyRelationship => "ontology_relationship",
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed BreedGraph store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Install tables, uniqueness constraints and id counters.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        Ok(())
    }

    /// True when no users, teams, entries or commits exist yet.
    ///
    /// # Errors
    /// Returns an error when the probe queries fail.
    pub fn db_is_empty(&self) -> Result<bool> {
        for table in DATA_TABLES {
            if !table_exists(&self.conn, table)? {
                continue;
            }
            let any: i64 = self
                .conn
                .query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table})"), [], |row| row.get(0))
                .with_context(|| format!("failed to probe table {table}"))?;
            if any == 1 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Start the unit-of-work transaction, taking the write lock up front.
    ///
    /// A busy database is retried `retries` times before giving up with
    /// [`DomainError::TooManyRetries`].
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn begin_immediate(&self, retries: u32) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            match self.conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => return Ok(()),
                Err(err) if is_busy(&err) && attempt < retries => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                }
                Err(err) if is_busy(&err) => {
                    return Err(DomainError::TooManyRetries(format!(
                        "database stayed busy after {retries} retries"
                    ))
                    .into());
                }
                Err(err) => return Err(err).context("failed to begin immediate transaction"),
            }
        }
    }

    /// # Errors
    /// Returns an error when the commit fails; the transaction is then still open.
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT").context("failed to commit transaction")
    }

    /// # Errors
    /// Returns an error when the rollback fails.
    pub fn rollback(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK").context("failed to roll back transaction")
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

/// Take the next id from `counter`; ids start at 1.
///
/// # Errors
/// Returns an error when the counter row is missing or cannot be updated.
pub fn next_id(conn: &Connection, counter: Counter) -> Result<i64> {
    conn.query_row(
        "UPDATE counters SET value = value + 1 WHERE name = ?1 RETURNING value",
        params![counter.as_str()],
        |row| row.get::<_, i64>(0),
    )
    .with_context(|| format!("failed to advance counter {}", counter.as_str()))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Map a UNIQUE violation to [`DomainError::IdentityExists`]; other failures keep
/// their SQLite error with `context` attached.
pub(crate) fn unique_violation(err: rusqlite::Error, context: String) -> anyhow::Error {
    let unique = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    );
    if unique {
        DomainError::IdentityExists(context).into()
    } else {
        anyhow::Error::new(err).context(context)
    }
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// `?1, ?2, ...` for an `IN (...)` list of `count` parameters.
pub(crate) fn placeholders(count: usize) -> String {
    placeholders_from(1, count)
}

pub(crate) fn placeholders_from(first: usize, count: usize) -> String {
    (first..first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use anyhow::Result;

    use super::SqliteStore;

    pub fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ulid::Ulid;

    use super::test_support::memory_store;
    use super::*;

    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_status()?.pending_versions, vec![1]);
        store.migrate()?;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn counters_start_at_one_and_are_independent() -> Result<()> {
        let store = memory_store()?;
        assert_eq!(next_id(store.conn(), Counter::User)?, 1);
        assert_eq!(next_id(store.conn(), Counter::User)?, 2);
        assert_eq!(next_id(store.conn(), Counter::OntologyEntry)?, 1);
        Ok(())
    }

    #[test]
    fn fresh_database_is_empty() -> Result<()> {
        let store = memory_store()?;
        assert!(store.db_is_empty()?);
        store.conn().execute(
            "INSERT INTO teams(id, parent_id, name, name_lower) VALUES (1, NULL, 'R', 'r')",
            [],
        )?;
        assert!(!store.db_is_empty()?);
        Ok(())
    }

    #[test]
    fn rollback_discards_the_transaction() -> Result<()> {
        let store = memory_store()?;
        store.begin_immediate(0)?;
        assert!(store.in_transaction());
        next_id(store.conn(), Counter::Team)?;
        store.rollback()?;
        assert!(!store.in_transaction());
        assert_eq!(next_id(store.conn(), Counter::Team)?, 1);
        Ok(())
    }

    #[test]
    fn team_names_are_unique_per_parent_case_insensitively() -> Result<()> {
        let store = memory_store()?;
        let conn = store.conn();
        conn.execute("INSERT INTO teams(id, parent_id, name, name_lower) VALUES (1, NULL, 'R', 'r')", [])?;
        conn.execute("INSERT INTO teams(id, parent_id, name, name_lower) VALUES (2, 1, 'A', 'a')", [])?;
        let clash = conn
            .execute("INSERT INTO teams(id, parent_id, name, name_lower) VALUES (3, 1, 'a', 'a')", [])
            .map_err(|err| unique_violation(err, "team a".to_string()));
        let Err(err) = clash else {
            return Err(anyhow!("duplicate sibling name was accepted"));
        };
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::IdentityExists(_))));
        conn.execute("INSERT INTO teams(id, parent_id, name, name_lower) VALUES (4, 2, 'a', 'a')", [])?;
        Ok(())
    }

    #[test]
    fn busy_database_surfaces_too_many_retries() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("breedgraph-busy-{}.sqlite3", Ulid::new()));
        let mut holder = SqliteStore::open_with_timeout(&db_path, 0)?;
        holder.migrate()?;
        holder.begin_immediate(0)?;

        let contender = SqliteStore::open_with_timeout(&db_path, 0)?;
        let result = contender.begin_immediate(2);
        let Err(err) = result else {
            return Err(anyhow!("second writer acquired the lock"));
        };
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::TooManyRetries(_))));

        holder.rollback()?;
        drop(contender);
        drop(holder);
        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = memory_store()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, 1);
        Ok(())
    }
}
