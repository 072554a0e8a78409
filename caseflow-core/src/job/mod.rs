//! Deferred work: timers, retries and async continuations.
//!
//! Jobs are claimed with a time-limited lock (`acquire_jobs`), executed in a
//! fresh command context, and deleted in the same flush as the handler's
//! effects. A node that lost its lock finds out through a version conflict
//! at flush time, so each job's effects commit at most once.

pub mod backoff;
pub mod executor;
pub mod handlers;

pub use executor::{JobExecutor, JobResult};
pub use handlers::{JobHandler, JobOutcome};
