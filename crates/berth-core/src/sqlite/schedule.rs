use rusqlite::{OptionalExtension, Row, params};

use crate::models::{CoreError, NewSchedule, Schedule};
use crate::persistence::{PersistenceResult, ScheduleStore};
use crate::sqlite::store::{
    SqliteStore, domain_error, ensure_schema_ready, from_unix_millis, now_unix_millis,
};

const SELECT_SCHEDULE: &str = "
SELECT id, vendor_type, vendor_id, cron, callback_func_name, callback_func_param,
       creation_time_unix_ms, update_time_unix_ms
FROM schedule";

impl ScheduleStore for SqliteStore {
    fn create_schedule(&self, schedule: &NewSchedule) -> PersistenceResult<i64> {
        self.with_connection("create_schedule", |connection| {
            ensure_schema_ready(connection)?;
            let now = now_unix_millis()?;
            connection.execute(
                "
INSERT INTO schedule (
    vendor_type, vendor_id, cron, callback_func_name, callback_func_param,
    creation_time_unix_ms, update_time_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
",
                params![
                    schedule.vendor_type,
                    schedule.vendor_id,
                    schedule.cron,
                    schedule.callback_func_name,
                    schedule.callback_func_param,
                    now,
                ],
            )?;
            Ok(connection.last_insert_rowid())
        })
    }

    fn get_schedule(&self, id: i64) -> PersistenceResult<Schedule> {
        self.with_connection("get_schedule", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(&format!("{SELECT_SCHEDULE} WHERE id = ?1"), [id], read_schedule)
                .optional()?
                .ok_or_else(|| {
                    domain_error(CoreError::not_found(format!("schedule {id} not found")))
                })
        })
    }

    fn list_schedules(&self, vendor_type: Option<&str>) -> PersistenceResult<Vec<Schedule>> {
        self.with_connection("list_schedules", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "{SELECT_SCHEDULE} WHERE (?1 IS NULL OR vendor_type = ?1) ORDER BY id ASC"
            ))?;
            let rows = statement.query_map([vendor_type], read_schedule)?;
            rows.collect()
        })
    }

    fn delete_schedule(&self, id: i64) -> PersistenceResult<()> {
        self.with_connection("delete_schedule", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute("DELETE FROM schedule WHERE id = ?1", [id])?;
            if deleted == 0 {
                return Err(domain_error(CoreError::not_found(format!(
                    "schedule {id} not found"
                ))));
            }
            Ok(())
        })
    }
}

fn read_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        vendor_type: row.get(1)?,
        vendor_id: row.get(2)?,
        cron: row.get(3)?,
        callback_func_name: row.get(4)?,
        callback_func_param: row.get(5)?,
        creation_time: from_unix_millis(row.get(6)?)?,
        update_time: from_unix_millis(row.get(7)?)?,
    })
}
