pub mod controller;
pub mod driver;
pub mod flush;
pub mod project;
pub mod warning;

pub use controller::{
    MISSING_RESOURCE_RETRY, QUOTA_CACHE_PREFIX, QUOTA_CACHE_TTL, QuotaController, QuotaOptions, RefreshSummary,
    quota_cache_key,
};
pub use driver::{DriverRegistry, QuotaDriver};
pub use flush::{flush_quotas, spawn_flush_loop};
pub use project::{
    MAX_LIMITED, MemoryProjectCatalog, ProjectCatalog, ProjectDriver, StoredUsageCatalog,
};
pub use warning::{QuotaEventSink, QuotaWarningEvent, crossed_resources};
