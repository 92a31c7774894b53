#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_quota_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS quota (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    hard TEXT NOT NULL,
    creation_time_unix_ms INTEGER NOT NULL,
    update_time_unix_ms INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    UNIQUE (reference, reference_id)
);

CREATE TABLE IF NOT EXISTS quota_usage (
    id INTEGER PRIMARY KEY REFERENCES quota (id) ON DELETE CASCADE,
    reference TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    used TEXT NOT NULL,
    creation_time_unix_ms INTEGER NOT NULL,
    update_time_unix_ms INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    UNIQUE (reference, reference_id)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS quota_usage;
DROP TABLE IF EXISTS quota;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_execution_and_task",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS execution (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_type TEXT NOT NULL,
    vendor_id INTEGER NOT NULL DEFAULT -1,
    status TEXT NOT NULL,
    status_message TEXT NOT NULL DEFAULT '',
    "trigger" TEXT NOT NULL,
    extra_attrs TEXT NOT NULL DEFAULT '{}',
    start_time_unix_ms INTEGER NOT NULL,
    update_time_unix_ms INTEGER NOT NULL,
    end_time_unix_ms INTEGER,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_execution_vendor_start
    ON execution (vendor_type, vendor_id, start_time_unix_ms DESC);

CREATE INDEX IF NOT EXISTS idx_execution_status_update
    ON execution (status, update_time_unix_ms);

CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_type TEXT NOT NULL,
    execution_id INTEGER NOT NULL REFERENCES execution (id),
    job_id TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    status_revision INTEGER NOT NULL DEFAULT 0,
    status_message TEXT NOT NULL DEFAULT '',
    run_count INTEGER NOT NULL DEFAULT 0,
    check_in_mode TEXT NOT NULL DEFAULT 'override',
    extra_attrs TEXT NOT NULL DEFAULT '{}',
    creation_time_unix_ms INTEGER NOT NULL,
    start_time_unix_ms INTEGER,
    update_time_unix_ms INTEGER NOT NULL,
    end_time_unix_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_task_execution_status
    ON task (execution_id, status_code);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_execution_status;
DROP TABLE IF EXISTS task;
DROP INDEX IF EXISTS idx_execution_status_update;
DROP INDEX IF EXISTS idx_execution_vendor_start;
DROP TABLE IF EXISTS execution;
"#,
};

const MIGRATION_0003: SqliteMigration = SqliteMigration {
    version: 3,
    name: "add_schedule",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS schedule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_type TEXT NOT NULL,
    vendor_id INTEGER NOT NULL DEFAULT -1,
    cron TEXT NOT NULL,
    callback_func_name TEXT NOT NULL,
    callback_func_param TEXT NOT NULL DEFAULT '',
    creation_time_unix_ms INTEGER NOT NULL,
    update_time_unix_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS schedule;
"#,
};

const MIGRATIONS: [SqliteMigration; 3] = [MIGRATION_0001, MIGRATION_0002, MIGRATION_0003];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
