pub mod execution;
pub mod hook;
pub mod manager;
pub mod refresher;
pub mod registry;
pub mod worker_pool;

pub use execution::ExecutionManager;
pub use hook::{
    CHECK_IN_ATTR, HookHandler, RollupMode, STATUS_OUTDATED_PREFIX, apply_check_in,
    parse_status_outdated_key, status_outdated_key,
};
pub use manager::{TaskManager, TaskOptions};
pub use refresher::StatusRefresher;
pub use registry::{CheckInProcessor, StatusChangeHook, VendorRegistry};
pub use worker_pool::WorkerPool;
