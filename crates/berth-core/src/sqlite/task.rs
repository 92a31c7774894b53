use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use crate::models::{CoreError, NewTask, Task, TaskQuery, TaskStatus, TaskStatusCount};
use crate::persistence::{PersistenceResult, TaskStore};
use crate::sqlite::execution::{read_execution_by_id, read_status_counts};
use crate::sqlite::store::{
    SqlFilter, SqliteStore, domain_error, ensure_schema_ready, from_optional_unix_millis,
    from_unix_millis, ids_to_json, json_map_to_string, now_unix_millis, parse_check_in_mode,
    parse_json_map, parse_task_status,
};

const SELECT_TASK: &str = "
SELECT id, vendor_type, execution_id, job_id, status, status_code, status_revision,
       status_message, run_count, check_in_mode, extra_attrs, creation_time_unix_ms,
       start_time_unix_ms, update_time_unix_ms, end_time_unix_ms
FROM task";

impl TaskStore for SqliteStore {
    fn create_task(&self, task: &NewTask) -> PersistenceResult<i64> {
        self.with_write_transaction("create_task", |transaction| {
            read_execution_by_id(transaction, task.execution_id)?;
            let now = now_unix_millis()?;
            transaction.execute(
                "
INSERT INTO task (
    vendor_type, execution_id, job_id, status, status_code, status_revision, status_message,
    run_count, check_in_mode, extra_attrs, creation_time_unix_ms, update_time_unix_ms
) VALUES (?1, ?2, '', ?3, ?4, 0, '', 0, ?5, ?6, ?7, ?7)
",
                params![
                    task.vendor_type,
                    task.execution_id,
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Pending.code(),
                    task.check_in_mode.as_str(),
                    json_map_to_string(&task.extra_attrs)?,
                    now,
                ],
            )?;
            Ok(transaction.last_insert_rowid())
        })
    }

    fn get_task(&self, id: i64) -> PersistenceResult<Task> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(&format!("{SELECT_TASK} WHERE id = ?1"), [id], read_task)
                .optional()?
                .ok_or_else(|| not_found(id))
        })
    }

    fn list_tasks(&self, query: &TaskQuery) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut filter = task_filter(query)?;
            let page = filter.page_sql(query.page)?;
            let sql = format!("{SELECT_TASK}{} ORDER BY id ASC{page}", filter.where_sql());
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(filter.params.iter()), read_task)?;
            rows.collect()
        })
    }

    fn count_tasks(&self, query: &TaskQuery) -> PersistenceResult<i64> {
        self.with_connection("count_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let filter = task_filter(query)?;
            let sql = format!("SELECT COUNT(*) FROM task{}", filter.where_sql());
            connection.query_row(&sql, params_from_iter(filter.params.iter()), |row| {
                row.get(0)
            })
        })
    }

    fn set_task_job_id(&self, id: i64, job_id: &str) -> PersistenceResult<()> {
        self.with_connection("set_task_job_id", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE task SET job_id = ?1, update_time_unix_ms = ?2 WHERE id = ?3",
                params![job_id, now_unix_millis()?, id],
            )?;
            require_task(updated, id)
        })
    }

    fn force_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        message: &str,
    ) -> PersistenceResult<()> {
        self.with_connection("force_task_status", |connection| {
            ensure_schema_ready(connection)?;
            let now = now_unix_millis()?;
            let updated = connection.execute(
                "
UPDATE task
SET status = ?1, status_code = ?2, status_message = ?3, update_time_unix_ms = ?4,
    end_time_unix_ms = ?5
WHERE id = ?6
",
                params![
                    status.as_str(),
                    status.code(),
                    message,
                    now,
                    status.is_final().then_some(now),
                    id
                ],
            )?;
            require_task(updated, id)
        })
    }

    fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        revision: i64,
    ) -> PersistenceResult<bool> {
        self.with_write_transaction("update_task_status", |transaction| {
            // A newer revision is a new attempt of the job.
            transaction.execute(
                "
UPDATE task SET run_count = run_count + 1, start_time_unix_ms = ?2
WHERE id = ?1 AND status_revision < ?3
",
                params![id, revision.saturating_mul(1000), revision],
            )?;

            let now = now_unix_millis()?;
            let updated = transaction.execute(
                "
UPDATE task
SET status = ?2, status_code = ?3, status_revision = ?4, update_time_unix_ms = ?5,
    end_time_unix_ms = ?6
WHERE id = ?1
  AND ((status_revision = ?4 AND status_code < ?3) OR status_revision < ?4)
",
                params![
                    id,
                    status.as_str(),
                    status.code(),
                    revision,
                    now,
                    status.is_final().then_some(now)
                ],
            )?;
            Ok(updated > 0)
        })
    }

    fn update_task_extra_attrs(
        &self,
        id: i64,
        extra_attrs: &Map<String, Value>,
    ) -> PersistenceResult<()> {
        self.with_connection("update_task_extra_attrs", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "UPDATE task SET extra_attrs = ?1, update_time_unix_ms = ?2 WHERE id = ?3",
                params![json_map_to_string(extra_attrs)?, now_unix_millis()?, id],
            )?;
            require_task(updated, id)
        })
    }

    fn list_status_count(&self, execution_id: i64) -> PersistenceResult<Vec<TaskStatusCount>> {
        self.with_connection("list_status_count", |connection| {
            ensure_schema_ready(connection)?;
            read_status_counts(connection, execution_id)
        })
    }

    fn delete_task(&self, id: i64) -> PersistenceResult<()> {
        self.with_connection("delete_task", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute("DELETE FROM task WHERE id = ?1", [id])?;
            require_task(deleted, id)
        })
    }
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(4)?;
    let check_in_mode_raw: String = row.get(9)?;
    let extra_attrs_raw: String = row.get(10)?;
    Ok(Task {
        id: row.get(0)?,
        vendor_type: row.get(1)?,
        execution_id: row.get(2)?,
        job_id: row.get(3)?,
        status: parse_task_status(&status_raw)?,
        status_code: row.get(5)?,
        status_revision: row.get(6)?,
        status_message: row.get(7)?,
        run_count: row.get(8)?,
        check_in_mode: parse_check_in_mode(&check_in_mode_raw)?,
        extra_attrs: parse_json_map(&extra_attrs_raw)?,
        creation_time: from_unix_millis(row.get(11)?)?,
        start_time: from_optional_unix_millis(row.get(12)?)?,
        update_time: from_unix_millis(row.get(13)?)?,
        end_time: from_optional_unix_millis(row.get(14)?)?,
    })
}

fn task_filter(query: &TaskQuery) -> rusqlite::Result<SqlFilter> {
    let mut filter = SqlFilter::default();
    if !query.ids.is_empty() {
        filter.push(
            "id IN (SELECT value FROM json_each(?))",
            SqlValue::Text(ids_to_json(&query.ids)?),
        );
    }
    if let Some(execution_id) = query.execution_id {
        filter.push("execution_id = ?", execution_id);
    }
    if let Some(vendor_type) = &query.vendor_type {
        filter.push("vendor_type = ?", vendor_type.clone());
    }
    if let Some(status) = query.status {
        filter.push("status = ?", status.as_str().to_string());
    }
    if let Some(job_id) = &query.job_id {
        filter.push("job_id = ?", job_id.clone());
    }
    Ok(filter)
}

fn require_task(affected: usize, id: i64) -> rusqlite::Result<()> {
    if affected == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

fn not_found(id: i64) -> rusqlite::Error {
    domain_error(CoreError::not_found(format!("task {id} not found")))
}
