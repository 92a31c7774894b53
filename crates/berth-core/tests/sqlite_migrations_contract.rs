use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use berth_core::models::{CoreErrorKind, ResourceList, ResourceName};
use berth_core::persistence::{MigrationStore, QuotaStore};
use berth_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("berth-{test_name}-{nanos}.sqlite3"))
}

#[test]
fn migration_versions_are_strictly_increasing() {
    let entries = migrations();
    assert!(!entries.is_empty());

    let mut previous = 0;
    for entry in entries {
        assert!(entry.version > previous);
        previous = entry.version;
    }
}

#[test]
fn migration_lookup_and_schema_version_are_consistent() {
    let latest = current_schema_version();
    let latest_entry = migration(latest).expect("latest migration must exist");
    assert_eq!(latest_entry.version, latest);
}

#[test]
fn migration_sql_is_defined_for_up_and_down_paths() {
    for entry in migrations() {
        assert!(!entry.up_sql.trim().is_empty(), "up sql must not be empty");
        assert!(
            !entry.down_sql.trim().is_empty(),
            "down sql must not be empty"
        );
    }
}

#[test]
fn store_operations_require_migrated_schema() {
    let store = SqliteStore::new(test_db_path("unmigrated"));
    assert_eq!(store.current_version().unwrap(), 0);

    let error = store.get_quota(1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Internal);

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert_eq!(store.get_quota(1).unwrap_err().kind, CoreErrorKind::NotFound);
}

#[test]
fn migrating_twice_keeps_data() {
    let store = SqliteStore::new(test_db_path("migrate-twice"));
    store.migrate_to_latest().unwrap();
    let hard = ResourceList::new()
        .with(ResourceName::Count, 10)
        .with(ResourceName::Storage, 100);
    let id = store.create_quota("project", "1", &hard, None).unwrap();

    store.migrate_to_latest().unwrap();

    assert_eq!(store.get_quota(id).unwrap().hard, hard);
}

#[test]
fn rolling_back_to_zero_drops_the_schema() {
    let store = SqliteStore::new(test_db_path("rollback"));
    store.migrate_to_latest().unwrap();
    assert_eq!(store.planned_migrations(0).len(), migrations().len());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    assert!(store.get_quota(1).is_err());

    let error = store
        .apply_migration(current_schema_version() + 1)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Internal);
}
