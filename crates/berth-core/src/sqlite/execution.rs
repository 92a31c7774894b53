use std::time::SystemTime;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use crate::models::{
    CoreError, Execution, ExecutionMetrics, ExecutionQuery, NewExecution, StatusRefresh,
    TaskStatus, TaskStatusCount,
};
use crate::persistence::{ExecutionStore, PersistenceResult};
use crate::sqlite::store::{
    SqlFilter, SqliteStore, domain_error, ensure_schema_ready, from_optional_unix_millis,
    from_unix_millis, ids_to_json, json_map_to_string, json_path, json_to_sql_value,
    now_unix_millis, parse_json_map, parse_task_status, parse_trigger, to_i64, to_unix_millis,
};

const SELECT_EXECUTION: &str = "
SELECT id, vendor_type, vendor_id, status, status_message, \"trigger\", extra_attrs,
       start_time_unix_ms, update_time_unix_ms, end_time_unix_ms, revision
FROM execution";

const FINAL_STATUSES: &str = "('Stopped', 'Error', 'Success')";

const REFRESH_ATTEMPTS: usize = 5;

impl ExecutionStore for SqliteStore {
    fn create_execution(&self, execution: &NewExecution) -> PersistenceResult<i64> {
        self.with_connection("create_execution", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO execution (
    vendor_type, vendor_id, status, status_message, \"trigger\", extra_attrs,
    start_time_unix_ms, update_time_unix_ms, revision
) VALUES (?1, ?2, ?3, '', ?4, ?5, ?6, ?7, 0)
",
                params![
                    execution.vendor_type,
                    execution.vendor_id,
                    TaskStatus::Running.as_str(),
                    execution.trigger.as_str(),
                    json_map_to_string(&execution.extra_attrs)?,
                    to_unix_millis(execution.start_time)?,
                    now_unix_millis()?,
                ],
            )?;
            Ok(connection.last_insert_rowid())
        })
    }

    fn get_execution(&self, id: i64) -> PersistenceResult<Execution> {
        self.with_connection("get_execution", |connection| {
            ensure_schema_ready(connection)?;
            read_execution_by_id(connection, id)
        })
    }

    fn list_executions(&self, query: &ExecutionQuery) -> PersistenceResult<Vec<Execution>> {
        self.with_connection("list_executions", |connection| {
            ensure_schema_ready(connection)?;
            let mut filter = execution_filter(query)?;
            let page = filter.page_sql(query.page)?;
            let sql = format!(
                "{SELECT_EXECUTION}{} ORDER BY start_time_unix_ms DESC, id DESC{page}",
                filter.where_sql()
            );
            let mut statement = connection.prepare(&sql)?;
            let rows =
                statement.query_map(params_from_iter(filter.params.iter()), read_execution)?;
            rows.collect()
        })
    }

    fn count_executions(&self, query: &ExecutionQuery) -> PersistenceResult<i64> {
        self.with_connection("count_executions", |connection| {
            ensure_schema_ready(connection)?;
            let filter = execution_filter(query)?;
            let sql = format!("SELECT COUNT(*) FROM execution{}", filter.where_sql());
            connection.query_row(&sql, params_from_iter(filter.params.iter()), |row| {
                row.get(0)
            })
        })
    }

    fn update_execution_extra_attrs(
        &self,
        id: i64,
        extra_attrs: &Map<String, Value>,
    ) -> PersistenceResult<()> {
        self.with_connection("update_execution_extra_attrs", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE execution SET extra_attrs = ?1, update_time_unix_ms = ?2 WHERE id = ?3",
                params![json_map_to_string(extra_attrs)?, now_unix_millis()?, id],
            )?;
            require_execution(updated, id)
        })
    }

    fn set_execution_status(
        &self,
        id: i64,
        status: TaskStatus,
        message: &str,
    ) -> PersistenceResult<()> {
        self.with_connection("set_execution_status", |connection| {
            ensure_schema_ready(connection)?;
            let now = now_unix_millis()?;
            let end_time = status.is_final().then_some(now);
            let updated = connection.execute(
                "
UPDATE execution
SET status = ?1, status_message = ?2, revision = revision + 1,
    update_time_unix_ms = ?3, end_time_unix_ms = ?4
WHERE id = ?5
",
                params![status.as_str(), message, now, end_time, id],
            )?;
            require_execution(updated, id)
        })
    }

    fn delete_execution(&self, id: i64) -> PersistenceResult<()> {
        self.with_connection("delete_execution", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute("DELETE FROM execution WHERE id = ?1", [id])?;
            require_execution(deleted, id)
        })
    }

    fn execution_metrics(&self, id: i64) -> PersistenceResult<ExecutionMetrics> {
        self.with_connection("execution_metrics", |connection| {
            ensure_schema_ready(connection)?;
            Ok(ExecutionMetrics::from_counts(&read_status_counts(
                connection, id,
            )?))
        })
    }

    fn refresh_execution_status(&self, id: i64) -> PersistenceResult<StatusRefresh> {
        for _ in 0..REFRESH_ATTEMPTS {
            let refreshed = self.with_write_transaction("refresh_execution_status", |transaction| {
                refresh_status_once(transaction, id)
            })?;
            if let Some(refreshed) = refreshed {
                return Ok(refreshed);
            }
        }
        Err(CoreError::conflict(format!(
            "failed to refresh the status of execution {id} after {REFRESH_ATTEMPTS} attempts"
        )))
    }

    fn list_vendor_ids(&self, vendor_type: &str) -> PersistenceResult<Vec<i64>> {
        self.with_connection("list_vendor_ids", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "SELECT DISTINCT vendor_id FROM execution WHERE vendor_type = ?1 ORDER BY vendor_id",
            )?;
            let rows = statement.query_map([vendor_type], |row| row.get(0))?;
            rows.collect()
        })
    }

    fn nth_latest_start_time(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        n: u64,
    ) -> PersistenceResult<Option<SystemTime>> {
        if n == 0 {
            return Ok(None);
        }
        self.with_connection("nth_latest_start_time", |connection| {
            ensure_schema_ready(connection)?;
            let start: Option<i64> = connection
                .query_row(
                    "
SELECT start_time_unix_ms FROM execution
WHERE vendor_type = ?1 AND vendor_id = ?2
ORDER BY start_time_unix_ms DESC, id DESC
LIMIT 1 OFFSET ?3
",
                    params![vendor_type, vendor_id, to_i64(n - 1)?],
                    |row| row.get(0),
                )
                .optional()?;
            from_optional_unix_millis(start)
        })
    }

    fn count_sweep_candidates(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        before: SystemTime,
    ) -> PersistenceResult<i64> {
        self.with_connection("count_sweep_candidates", |connection| {
            ensure_schema_ready(connection)?;
            connection.query_row(
                &format!(
                    "
SELECT COUNT(*) FROM execution
WHERE vendor_type = ?1 AND vendor_id = ?2 AND start_time_unix_ms < ?3
  AND status IN {FINAL_STATUSES}
"
                ),
                params![vendor_type, vendor_id, to_unix_millis(before)?],
                |row| row.get(0),
            )
        })
    }

    fn list_sweep_candidates(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        before: SystemTime,
        offset: u64,
        limit: u64,
    ) -> PersistenceResult<Vec<i64>> {
        self.with_connection("list_sweep_candidates", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT id FROM execution
WHERE vendor_type = ?1 AND vendor_id = ?2 AND start_time_unix_ms < ?3
  AND status IN {FINAL_STATUSES}
ORDER BY id DESC
LIMIT ?4 OFFSET ?5
"
            ))?;
            let rows = statement.query_map(
                params![
                    vendor_type,
                    vendor_id,
                    to_unix_millis(before)?,
                    to_i64(limit)?,
                    to_i64(offset)?
                ],
                |row| row.get(0),
            )?;
            rows.collect()
        })
    }

    fn sweep_executions(&self, ids: &[i64]) -> PersistenceResult<(usize, usize)> {
        if ids.is_empty() {
            return Ok((0, 0));
        }
        self.with_write_transaction("sweep_executions", |transaction| {
            let encoded = ids_to_json(ids)?;
            let tasks = transaction.execute(
                "
DELETE FROM task
WHERE execution_id IN (SELECT value FROM json_each(?1)) AND status_code = 3
",
                [&encoded],
            )?;
            let executions = transaction.execute(
                "
DELETE FROM execution
WHERE id IN (SELECT value FROM json_each(?1))
  AND NOT EXISTS (SELECT 1 FROM task WHERE task.execution_id = execution.id)
",
                [&encoded],
            )?;
            Ok((tasks, executions))
        })
    }

    fn list_dangling_executions(&self, updated_before: SystemTime) -> PersistenceResult<Vec<i64>> {
        self.with_connection("list_dangling_executions", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT e.id FROM execution e
WHERE e.status = 'Running' AND e.update_time_unix_ms < ?1
  AND EXISTS (SELECT 1 FROM task t WHERE t.execution_id = e.id)
  AND NOT EXISTS (SELECT 1 FROM task t WHERE t.execution_id = e.id AND t.status_code < 3)
ORDER BY e.id
",
            )?;
            let rows = statement.query_map([to_unix_millis(updated_before)?], |row| row.get(0))?;
            rows.collect()
        })
    }
}

/// `None` means the revision moved under us and the caller should retry.
fn refresh_status_once(
    connection: &Connection,
    id: i64,
) -> rusqlite::Result<Option<StatusRefresh>> {
    let (current_raw, revision): (String, i64) = connection
        .query_row(
            "SELECT status, revision FROM execution WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| not_found(id))?;
    let current = parse_task_status(&current_raw)?;

    let metrics = ExecutionMetrics::from_counts(&read_status_counts(connection, id)?);
    let Some(status) = metrics.rollup_status() else {
        return Ok(Some(StatusRefresh {
            changed: false,
            status: None,
        }));
    };

    let updated = connection.execute(
        "
UPDATE execution SET status = ?1, revision = revision + 1, update_time_unix_ms = ?2
WHERE id = ?3 AND revision = ?4
",
        params![status.as_str(), now_unix_millis()?, id, revision],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    connection.execute(
        "
UPDATE execution
SET end_time_unix_ms = CASE
    WHEN ?2 THEN (SELECT MAX(end_time_unix_ms) FROM task WHERE execution_id = ?1)
    ELSE NULL
END
WHERE id = ?1
",
        params![id, status.is_final()],
    )?;

    Ok(Some(StatusRefresh {
        changed: current != status,
        status: Some(status),
    }))
}

pub(super) fn read_status_counts(
    connection: &Connection,
    execution_id: i64,
) -> rusqlite::Result<Vec<TaskStatusCount>> {
    let mut statement = connection
        .prepare("SELECT status, COUNT(*) FROM task WHERE execution_id = ?1 GROUP BY status")?;
    let rows = statement.query_map([execution_id], |row| {
        let status_raw: String = row.get(0)?;
        Ok(TaskStatusCount {
            status: parse_task_status(&status_raw)?,
            count: row.get(1)?,
        })
    })?;
    rows.collect()
}

pub(super) fn read_execution_by_id(connection: &Connection, id: i64) -> rusqlite::Result<Execution> {
    connection
        .query_row(&format!("{SELECT_EXECUTION} WHERE id = ?1"), [id], read_execution)
        .optional()?
        .ok_or_else(|| not_found(id))
}

fn read_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status_raw: String = row.get(3)?;
    let trigger_raw: String = row.get(5)?;
    let extra_attrs_raw: String = row.get(6)?;
    Ok(Execution {
        id: row.get(0)?,
        vendor_type: row.get(1)?,
        vendor_id: row.get(2)?,
        status: parse_task_status(&status_raw)?,
        status_message: row.get(4)?,
        trigger: parse_trigger(&trigger_raw)?,
        extra_attrs: parse_json_map(&extra_attrs_raw)?,
        start_time: from_unix_millis(row.get(7)?)?,
        update_time: from_unix_millis(row.get(8)?)?,
        end_time: from_optional_unix_millis(row.get(9)?)?,
        revision: row.get(10)?,
        metrics: None,
    })
}

fn execution_filter(query: &ExecutionQuery) -> rusqlite::Result<SqlFilter> {
    let mut filter = SqlFilter::default();
    if !query.ids.is_empty() {
        filter.push(
            "id IN (SELECT value FROM json_each(?))",
            SqlValue::Text(ids_to_json(&query.ids)?),
        );
    }
    if let Some(vendor_type) = &query.vendor_type {
        filter.push("vendor_type = ?", vendor_type.clone());
    }
    if let Some(vendor_id) = query.vendor_id {
        filter.push("vendor_id = ?", vendor_id);
    }
    if let Some(trigger) = query.trigger {
        filter.push("\"trigger\" = ?", trigger.as_str().to_string());
    }
    if let Some(status) = query.status {
        filter.push("status = ?", status.as_str().to_string());
    }
    if let Some(from) = query.start_time_from {
        filter.push("start_time_unix_ms >= ?", to_unix_millis(from)?);
    }
    if let Some(to) = query.start_time_to {
        filter.push("start_time_unix_ms <= ?", to_unix_millis(to)?);
    }
    for (path, value) in &query.extra_attrs {
        filter.push(
            format!("json_extract(extra_attrs, '{}') IS ?", json_path(path).replace('\'', "''")),
            json_to_sql_value(value),
        );
    }
    Ok(filter)
}

fn require_execution(affected: usize, id: i64) -> rusqlite::Result<()> {
    if affected == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

fn not_found(id: i64) -> rusqlite::Error {
    domain_error(CoreError::not_found(format!("execution {id} not found")))
}
