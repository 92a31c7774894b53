pub mod cache;
pub mod config;
pub mod jobservice;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod quota;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod singleflight;
pub mod sqlite;
pub mod sweep;
pub mod task;
