pub mod error;
pub mod execution;
pub mod query;
pub mod quota;
pub mod resource;
pub mod schedule;
pub mod task;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use execution::{
    Execution, ExecutionMetrics, NewExecution, StatusRefresh, Trigger, vendor,
};
pub use query::{ExecutionQuery, Page, QuotaQuery, QuotaSort, QuotaSortKey, TaskQuery};
pub use quota::{PROJECT_REFERENCE, Quota, QuotaChanges, QuotaView, ReferenceObject};
pub use resource::{
    ResourceError, ResourceErrors, ResourceList, ResourceName, ResourceOverflow, UNLIMITED,
    is_safe,
};
pub use schedule::{NewSchedule, Schedule};
pub use task::{
    CheckInMode, FINAL_STATUS_CODE, NewTask, StatusChange, StatusChangeMetadata, Task,
    TaskStatus, TaskStatusCount,
};
