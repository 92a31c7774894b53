pub mod bootstrap;
pub mod routes;

pub use bootstrap::Services;
pub use routes::{AppState, ApiError, router, status_for};
