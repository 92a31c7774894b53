use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::models::{
    CoreError, Quota, QuotaChanges, QuotaQuery, QuotaSortKey, ResourceList, ResourceName,
};
use crate::persistence::{PersistenceResult, QuotaStore, UsageUpdate};
use crate::sqlite::store::{
    SqlFilter, SqliteStore, domain_error, ensure_schema_ready, from_unix_millis, now_unix_millis,
    storage_error_sqlite,
};

const SELECT_QUOTA: &str = "
SELECT q.id, q.reference, q.reference_id, q.hard, u.used,
       q.creation_time_unix_ms, q.update_time_unix_ms, q.version
FROM quota q
JOIN quota_usage u ON u.id = q.id";

impl QuotaStore for SqliteStore {
    fn create_quota(
        &self,
        reference: &str,
        reference_id: &str,
        hard: &ResourceList,
        used: Option<&ResourceList>,
    ) -> PersistenceResult<i64> {
        let used = used.cloned().unwrap_or_else(|| hard.zero());
        self.with_write_transaction("create_quota", |transaction| {
            let now = now_unix_millis()?;
            transaction.execute(
                "
INSERT INTO quota (reference, reference_id, hard, creation_time_unix_ms, update_time_unix_ms, version)
VALUES (?1, ?2, ?3, ?4, ?4, 0)
",
                params![reference, reference_id, hard.to_json(), now],
            )?;
            let id = transaction.last_insert_rowid();
            transaction.execute(
                "
INSERT INTO quota_usage (id, reference, reference_id, used, creation_time_unix_ms, update_time_unix_ms, version)
VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)
",
                params![id, reference, reference_id, used.to_json(), now],
            )?;
            Ok(id)
        })
    }

    fn get_quota(&self, id: i64) -> PersistenceResult<Quota> {
        self.with_connection("get_quota", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(&format!("{SELECT_QUOTA} WHERE q.id = ?1"), [id], read_quota)
                .optional()?
                .ok_or_else(|| domain_error(CoreError::not_found(format!("quota {id} not found"))))
        })
    }

    fn get_quota_by_ref(&self, reference: &str, reference_id: &str) -> PersistenceResult<Quota> {
        self.with_connection("get_quota_by_ref", |connection| {
            ensure_schema_ready(connection)?;
            read_quota_by_ref(connection, reference, reference_id)
        })
    }

    fn update_usage_for_update(
        &self,
        reference: &str,
        reference_id: &str,
        update: &mut UsageUpdate<'_>,
    ) -> PersistenceResult<Quota> {
        self.with_write_transaction("update_usage_for_update", |transaction| {
            let quota = read_quota_by_ref(transaction, reference, reference_id)?;
            let Some(used) = update(&quota).map_err(domain_error)? else {
                return Ok(quota);
            };

            let now = now_unix_millis()?;
            bump_quota_version(transaction, quota.id, quota.version, None, now)?;
            let updated = transaction.execute(
                "
UPDATE quota_usage
SET used = ?1, update_time_unix_ms = ?2, version = version + 1
WHERE id = ?3 AND version = ?4
",
                params![used.to_json(), now, quota.id, quota.version],
            )?;
            if updated == 0 {
                return Err(optimistic_lock(&quota));
            }

            Ok(Quota {
                used,
                update_time: from_unix_millis(now)?,
                version: quota.version + 1,
                ..quota
            })
        })
    }

    fn list_quotas(&self, query: &QuotaQuery) -> PersistenceResult<Vec<Quota>> {
        self.with_connection("list_quotas", |connection| {
            ensure_schema_ready(connection)?;
            let mut filter = quota_filter(query)?;
            let order = quota_order(query);
            let page = filter.page_sql(query.page)?;
            let sql = format!("{SELECT_QUOTA}{} ORDER BY {order}{page}", filter.where_sql());
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(filter.params.iter()), read_quota)?;
            rows.collect()
        })
    }

    fn count_quotas(&self, query: &QuotaQuery) -> PersistenceResult<i64> {
        self.with_connection("count_quotas", |connection| {
            ensure_schema_ready(connection)?;
            let filter = quota_filter(query)?;
            let sql = format!(
                "SELECT COUNT(*) FROM quota q JOIN quota_usage u ON u.id = q.id{}",
                filter.where_sql()
            );
            connection.query_row(&sql, params_from_iter(filter.params.iter()), |row| {
                row.get(0)
            })
        })
    }

    fn update_quota(&self, quota: &Quota, changes: QuotaChanges) -> PersistenceResult<()> {
        let hard = changes.hard.then(|| quota.hard.to_json());
        let used = changes.used.then(|| quota.used.to_json());
        self.with_write_transaction("update_quota", |transaction| {
            let now = now_unix_millis()?;
            bump_quota_version(transaction, quota.id, quota.version, hard.as_deref(), now)?;
            let updated = transaction.execute(
                "
UPDATE quota_usage
SET used = COALESCE(?1, used), update_time_unix_ms = ?2, version = version + 1
WHERE id = ?3 AND version = ?4
",
                params![used, now, quota.id, quota.version],
            )?;
            if updated == 0 {
                return Err(optimistic_lock(quota));
            }
            Ok(())
        })
    }

    fn flush_usage(&self, id: i64, used: &ResourceList) -> PersistenceResult<()> {
        self.with_write_transaction("flush_usage", |transaction| {
            let now = now_unix_millis()?;
            let updated = transaction.execute(
                "
UPDATE quota_usage
SET used = ?1, update_time_unix_ms = ?2, version = version + 1
WHERE id = ?3
",
                params![used.to_json(), now, id],
            )?;
            if updated == 0 {
                return Err(domain_error(CoreError::not_found(format!(
                    "quota {id} not found"
                ))));
            }
            transaction.execute(
                "UPDATE quota SET update_time_unix_ms = ?1, version = version + 1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    fn delete_quota(&self, id: i64) -> PersistenceResult<()> {
        self.with_write_transaction("delete_quota", |transaction| {
            transaction.execute("DELETE FROM quota_usage WHERE id = ?1", [id])?;
            let deleted = transaction.execute("DELETE FROM quota WHERE id = ?1", [id])?;
            if deleted == 0 {
                return Err(domain_error(CoreError::not_found(format!(
                    "quota {id} not found"
                ))));
            }
            Ok(())
        })
    }
}

fn read_quota_by_ref(
    connection: &Connection,
    reference: &str,
    reference_id: &str,
) -> rusqlite::Result<Quota> {
    connection
        .query_row(
            &format!("{SELECT_QUOTA} WHERE q.reference = ?1 AND q.reference_id = ?2"),
            params![reference, reference_id],
            read_quota,
        )
        .optional()?
        .ok_or_else(|| {
            domain_error(CoreError::not_found(format!(
                "quota for {reference} {reference_id} not found"
            )))
        })
}

fn bump_quota_version(
    connection: &Connection,
    id: i64,
    version: i64,
    hard: Option<&str>,
    now: i64,
) -> rusqlite::Result<()> {
    let updated = connection.execute(
        "
UPDATE quota
SET hard = COALESCE(?1, hard), update_time_unix_ms = ?2, version = version + 1
WHERE id = ?3 AND version = ?4
",
        params![hard, now, id, version],
    )?;
    if updated == 0 {
        return Err(domain_error(CoreError::conflict(format!(
            "quota {id} was modified concurrently (version {version})"
        ))));
    }
    Ok(())
}

fn optimistic_lock(quota: &Quota) -> rusqlite::Error {
    domain_error(CoreError::conflict(format!(
        "quota {} was modified concurrently (version {})",
        quota.id, quota.version
    )))
}

fn quota_filter(query: &QuotaQuery) -> rusqlite::Result<SqlFilter> {
    let mut filter = SqlFilter::default();
    if let Some(id) = query.id {
        filter.push("q.id = ?", id);
    }
    if let Some(reference) = &query.reference {
        filter.push("q.reference = ?", reference.clone());
    }
    if !query.reference_ids.is_empty() {
        let encoded = serde_json::to_string(&query.reference_ids).map_err(|error| {
            storage_error_sqlite(&format!("failed to encode reference ids: {error}"))
        })?;
        filter.push(
            "q.reference_id IN (SELECT value FROM json_each(?))",
            SqlValue::Text(encoded),
        );
    }
    Ok(filter)
}

fn quota_order(query: &QuotaQuery) -> String {
    let Some(sort) = query.sort else {
        return "q.id ASC".to_string();
    };
    let direction = if sort.descending { "DESC" } else { "ASC" };
    let column = match sort.key {
        QuotaSortKey::CreationTime => "q.creation_time_unix_ms".to_string(),
        QuotaSortKey::UpdateTime => "q.update_time_unix_ms".to_string(),
        QuotaSortKey::Hard(resource) => resource_sort_column("q.hard", resource),
        QuotaSortKey::Used(resource) => resource_sort_column("u.used", resource),
    };
    format!("{column} {direction}, q.id ASC")
}

/// Unlimited (-1) sorts above every limited value.
fn resource_sort_column(column: &str, resource: ResourceName) -> String {
    let extracted = format!(
        "CAST(json_extract({column}, '$.{}') AS INTEGER)",
        resource.as_str()
    );
    format!("(CASE WHEN {extracted} = -1 THEN {} ELSE {extracted} END)", i64::MAX)
}

fn read_quota(row: &Row<'_>) -> rusqlite::Result<Quota> {
    let hard_raw: String = row.get(3)?;
    let used_raw: String = row.get(4)?;
    Ok(Quota {
        id: row.get(0)?,
        reference: row.get(1)?,
        reference_id: row.get(2)?,
        hard: ResourceList::from_json(&hard_raw).map_err(|error| storage_error_sqlite(&error))?,
        used: ResourceList::from_json(&used_raw).map_err(|error| storage_error_sqlite(&error))?,
        creation_time: from_unix_millis(row.get(5)?)?,
        update_time: from_unix_millis(row.get(6)?)?,
        version: row.get(7)?,
    })
}

