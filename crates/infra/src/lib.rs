//! Infrastructure layer: DB, config, credentials, external services, and the
//! job queue worker.

pub mod config;
pub mod credentials;
pub mod db;
pub mod external;
pub mod jobs;
pub mod projects;
