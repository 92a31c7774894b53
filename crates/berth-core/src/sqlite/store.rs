use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use serde_json::{Map, Value};

use crate::models::{CheckInMode, CoreError, CoreErrorKind, TaskStatus, Trigger};
use crate::persistence::{MigrationStore, PersistenceResult};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "berth_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    pub(super) fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    /// `BEGIN IMMEDIATE` takes the database write lock up front, so a
    /// read-compute-write cycle inside `operation` cannot interleave with
    /// another writer.
    pub(super) fn with_write_transaction<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = operation(&transaction)?;
            transaction.commit()?;
            Ok(value)
        })
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Tables may be missing even though the version is recorded;
                // every statement is IF NOT EXISTS so re-running is harmless.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS berth_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

pub(super) fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before store operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

pub(super) fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::ToSqlConversionFailure(inner) = &error
        && let Some(domain) = inner.downcast_ref::<CoreError>()
    {
        return domain.clone();
    }

    let kind = match &error {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => CoreErrorKind::Transient,
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                CoreErrorKind::PreconditionFailed
            }
            ErrorCode::ConstraintViolation => CoreErrorKind::Conflict,
            _ => CoreErrorKind::Internal,
        },
        rusqlite::Error::QueryReturnedNoRows => CoreErrorKind::NotFound,
        _ => CoreErrorKind::Internal,
    };
    CoreError::new(kind, format!("sqlite store '{operation}' failed: {error}"))
}

/// Carries a typed error out of a connection closure without losing its kind.
pub(super) fn domain_error(error: CoreError) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(error))
}

pub(super) fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::internal(format!(
        "sqlite store '{operation}' failed: {}",
        message.as_ref()
    ))
}

pub(super) fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown status '{raw}' in sqlite record"))
    })
}

pub(super) fn parse_trigger(raw: &str) -> rusqlite::Result<Trigger> {
    raw.parse::<Trigger>().map_err(|_| {
        storage_error_sqlite(&format!("unknown trigger '{raw}' in sqlite record"))
    })
}

pub(super) fn parse_check_in_mode(raw: &str) -> rusqlite::Result<CheckInMode> {
    raw.parse::<CheckInMode>().map_err(|_| {
        storage_error_sqlite(&format!("unknown check-in mode '{raw}' in sqlite record"))
    })
}

pub(super) fn parse_json_map(raw: &str) -> rusqlite::Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("invalid extra_attrs in sqlite record: {error}"))
    })
}

pub(super) fn json_map_to_string(value: &Map<String, Value>) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode extra_attrs: {error}")))
}

pub(super) fn ids_to_json(ids: &[i64]) -> rusqlite::Result<String> {
    serde_json::to_string(ids)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode id list: {error}")))
}

pub(super) fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

pub(super) fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

pub(super) fn from_optional_unix_millis(value: Option<i64>) -> rusqlite::Result<Option<SystemTime>> {
    value.map(from_unix_millis).transpose()
}

pub(super) fn now_unix_millis() -> rusqlite::Result<i64> {
    to_unix_millis(SystemTime::now())
}

pub(super) fn to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

/// Accumulates `WHERE` clauses with positional parameters.
#[derive(Default)]
pub(super) struct SqlFilter {
    clauses: Vec<String>,
    pub(super) params: Vec<SqlValue>,
}

impl SqlFilter {
    pub(super) fn push(&mut self, clause: impl Into<String>, value: impl Into<SqlValue>) {
        self.clauses.push(clause.into());
        self.params.push(value.into());
    }

    pub(super) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(super) fn page_sql(&mut self, page: Option<crate::models::Page>) -> rusqlite::Result<String> {
        let Some(page) = page else {
            return Ok(String::new());
        };
        self.params.push(SqlValue::Integer(to_i64(page.size)?));
        self.params.push(SqlValue::Integer(to_i64(page.offset())?));
        Ok(" LIMIT ? OFFSET ?".to_string())
    }
}

pub(super) fn json_to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Turns `a.b` into the SQLite JSON path `$."a"."b"`.
pub(super) fn json_path(dotted: &str) -> String {
    let mut path = String::from("$");
    for segment in dotted.split('.') {
        path.push_str(".\"");
        path.push_str(&segment.replace('"', "\\\""));
        path.push('"');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_path_quotes_segments() {
        assert_eq!(json_path("policy.id"), "$.\"policy\".\"id\"");
    }

    #[test]
    fn domain_errors_keep_their_kind() {
        let error = storage_error(
            "get_task",
            domain_error(CoreError::not_found("task 7 not found")),
        );
        assert_eq!(error.kind, CoreErrorKind::NotFound);
        assert_eq!(error.message, "task 7 not found");
    }

    #[test]
    fn conversion_failures_without_a_domain_error_are_internal() {
        let error = storage_error("get_task", storage_error_sqlite("unknown status 'Lost'"));
        assert_eq!(error.kind, CoreErrorKind::Internal);
        assert!(error.message.starts_with("sqlite store 'get_task' failed"));
    }

    #[test]
    fn millis_round_trip() {
        let instant = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(from_unix_millis(to_unix_millis(instant).unwrap()).unwrap(), instant);
        assert!(from_unix_millis(-1).is_err());
    }
}
