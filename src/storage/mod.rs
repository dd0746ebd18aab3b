//! Job store abstraction and the in-memory reference implementation.
//!
//! A store owns its job records and keeps them indexed two ways: by id, and
//! by next run time for the range query the scheduler loop issues every
//! tick. Updates must keep both views consistent so `get_due_jobs` never
//! returns stale tuples.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::JobId;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A job with the same id already exists.
    #[error("job id {0} conflicts with an existing job")]
    ConflictingId(JobId),

    /// No job with the given id.
    #[error("no job with id {0}")]
    JobNotFound(JobId),

    /// The job cannot be serialized for persistence (direct runner
    /// reference).
    #[error("job {0} holds a runner reference that cannot be persisted")]
    NotSerializable(JobId),

    /// A persisted record could not be rehydrated. The store reports the
    /// record and continues serving the rest.
    #[error("stored job record is unreadable: {0}")]
    Corrupt(String),

    /// Store lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Backend-specific failure.
    #[error("store error: {0}")]
    Other(String),
}

/// Persistent (or in-memory) collection of jobs.
///
/// All mutations are atomic with respect to concurrent reads from the
/// scheduler loop.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Called when the owning scheduler starts or the store is added to a
    /// running scheduler.
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Called when the owning scheduler shuts down or the store is removed.
    async fn shutdown(&self) {}

    /// Add a job; fails with [`StoreError::ConflictingId`] when the id
    /// exists.
    async fn add_job(&self, job: Job) -> Result<(), StoreError>;

    /// Replace a job by id; fails with [`StoreError::JobNotFound`] when
    /// absent.
    async fn update_job(&self, job: Job) -> Result<(), StoreError>;

    /// Remove a job by id; fails with [`StoreError::JobNotFound`] when
    /// absent.
    async fn remove_job(&self, id: &JobId) -> Result<(), StoreError>;

    /// Remove every job.
    async fn remove_all_jobs(&self) -> Result<(), StoreError>;

    /// Look up a job by id.
    async fn lookup_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// All jobs with `next_run_time <= now`, ascending by next run time
    /// (ties by id).
    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Earliest non-null next run time across jobs.
    async fn get_next_run_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Every job, ascending by next run time with paused jobs last.
    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;
}
