pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod recurrence;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
