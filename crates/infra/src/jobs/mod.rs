//! The job queue worker.
//!
//! ## Design
//!
//! - Jobs live in a shared `job_queue` table; workers coordinate only through
//!   the atomic claim and compare-and-swap status writes
//! - `attempt_count` is incremented by every claim and never reset
//! - Stale locks are reaped back to `pending` (or failed once the budget is spent)
//! - Authentication failures are permanent; everything else is retried until
//!   the attempt budget runs out
//! - Infrastructure failures back off exponentially and never cost attempts
//!
//! ## Components
//!
//! - `JobStore`: typed façade over the queue (Postgres or in-memory)
//! - `StaleJobReaper`: recovery of abandoned locks
//! - `JobDispatcher`: routes a job to the implement or setup path
//! - `outcome`: failure classification and bookkeeping
//! - `JobExecutor`: the poll loop

pub mod dispatcher;
pub mod executor;
pub mod outcome;
pub mod postgres;
pub mod reaper;
pub mod store;
pub mod types;

pub use dispatcher::{JobDispatcher, JobError, SystemCredentials};
pub use executor::{Cycle, JobExecutor, JobExecutorConfig};
pub use outcome::{Outcome, classify, is_auth_error, record_failure};
pub use postgres::PostgresJobStore;
pub use reaper::{ReapReport, StaleJobReaper};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobStatus, JobType, RetryPolicy};
