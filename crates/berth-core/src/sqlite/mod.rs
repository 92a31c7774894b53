mod execution;
pub mod migrations;
mod quota;
mod schedule;
pub mod store;
mod task;

pub use migrations::{SqliteMigration, current_schema_version, migration, migrations};
pub use store::SqliteStore;
