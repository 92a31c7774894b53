pub mod callback;
pub mod jobs;
pub mod runner;

pub use callback::{CallbackRegistry, SchedulerCallback};
pub use jobs::{
    GC_CALLBACK, GcController, GcPolicy, GcSuccessHook, JobControllers, PURGE_AUDIT_LOG_CALLBACK,
    PurgeController, PurgePolicy, QUOTA_REFRESH_CALLBACK, QuotaRefreshPolicy, REPLICATION_CALLBACK,
    ReplicationController, ReplicationPolicy,
};
pub use runner::{Scheduler, fires_between, parse_cron};
