//! In-memory job store.
//!
//! The reference store implementation: a map by id plus a list kept sorted
//! by `(next_run_time, id)` with paused jobs ordered last. Both structures
//! are updated together under one lock, so range queries never observe a
//! half-applied mutation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobStore, StoreError};
use crate::core::job::Job;
use crate::core::types::JobId;

/// Sort key giving a total order over jobs: paused jobs (no next run time)
/// compare greater than any scheduled instant, ties break on id.
fn sort_key(next_run_time: Option<DateTime<Utc>>, id: &JobId) -> (DateTime<Utc>, &JobId) {
    (next_run_time.unwrap_or(DateTime::<Utc>::MAX_UTC), id)
}

struct State {
    by_id: HashMap<JobId, Job>,
    /// Ids ordered by `sort_key`, maintained with binary search on every
    /// mutation.
    ordered: Vec<(Option<DateTime<Utc>>, JobId)>,
}

impl State {
    /// Index of the entry, or the insertion point for its key.
    fn position(&self, next_run_time: Option<DateTime<Utc>>, id: &JobId) -> usize {
        self.ordered
            .binary_search_by(|(t, i)| sort_key(*t, i).cmp(&sort_key(next_run_time, id)))
            .unwrap_or_else(|insert_at| insert_at)
    }
}

/// Thread-safe in-memory store; jobs do not survive a restart.
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                by_id: HashMap::new(),
                ordered: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn shutdown(&self) {
        if let Ok(mut state) = self.state.write() {
            state.by_id.clear();
            state.ordered.clear();
        }
    }

    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        if state.by_id.contains_key(job.id()) {
            return Err(StoreError::ConflictingId(job.id().clone()));
        }
        let index = state.position(job.next_run_time(), job.id());
        state
            .ordered
            .insert(index, (job.next_run_time(), job.id().clone()));
        state.by_id.insert(job.id().clone(), job);
        Ok(())
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        let old = state
            .by_id
            .get(job.id())
            .ok_or_else(|| StoreError::JobNotFound(job.id().clone()))?;

        let old_time = old.next_run_time();
        if old_time != job.next_run_time() {
            let old_index = state.position(old_time, job.id());
            state.ordered.remove(old_index);
            let new_index = state.position(job.next_run_time(), job.id());
            state
                .ordered
                .insert(new_index, (job.next_run_time(), job.id().clone()));
        }
        state.by_id.insert(job.id().clone(), job);
        Ok(())
    }

    async fn remove_job(&self, id: &JobId) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        let job = state
            .by_id
            .remove(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        let index = state.position(job.next_run_time(), id);
        state.ordered.remove(index);
        Ok(())
    }

    async fn remove_all_jobs(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        state.by_id.clear();
        state.ordered.clear();
        Ok(())
    }

    async fn lookup_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.by_id.get(id).cloned())
    }

    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut due = Vec::new();
        for (next_run_time, id) in &state.ordered {
            match next_run_time {
                Some(t) if *t <= now => {
                    if let Some(job) = state.by_id.get(id) {
                        due.push(job.clone());
                    }
                }
                // The list is sorted: the first unscheduled or future entry
                // ends the due range.
                _ => break,
            }
        }
        Ok(due)
    }

    async fn get_next_run_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.ordered.first().and_then(|(t, _)| *t))
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state
            .ordered
            .iter()
            .filter_map(|(_, id)| state.by_id.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{FnRunner, JobRequest};
    use crate::scheduler::JobDefaults;
    use crate::triggers::IntervalTrigger;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn job(id: &str, next_run_time: Option<DateTime<Utc>>) -> Job {
        let trigger = IntervalTrigger::starting_at(Duration::from_secs(60), t0()).unwrap();
        let runner = Arc::new(FnRunner::new(|_inv| async { Ok(Value::Null) }));
        let mut job = JobRequest::new(trigger, runner)
            .with_id(id)
            .into_job(&JobDefaults::default());
        job.set_next_run_time(next_run_time);
        job
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let store = MemoryStore::new();
        store.add_job(job("a", Some(t0()))).await.unwrap();

        let found = store.lookup_job(&JobId::new("a")).await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().id().as_str(), "a");

        let missing = store.lookup_job(&JobId::new("zzz")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_conflicting_id_rejected() {
        let store = MemoryStore::new();
        store.add_job(job("a", Some(t0()))).await.unwrap();

        let result = store.add_job(job("a", Some(t0() + secs(5)))).await;
        assert!(matches!(result, Err(StoreError::ConflictingId(_))));
    }

    #[tokio::test]
    async fn test_remove_missing_job_fails() {
        let store = MemoryStore::new();
        let result = store.remove_job(&JobId::new("ghost")).await;
        assert!(matches!(result, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_readd_after_remove() {
        let store = MemoryStore::new();
        store.add_job(job("a", Some(t0()))).await.unwrap();
        store.remove_job(&JobId::new("a")).await.unwrap();
        store.add_job(job("a", Some(t0()))).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_job_fails() {
        let store = MemoryStore::new();
        let result = store.update_job(job("ghost", Some(t0()))).await;
        assert!(matches!(result, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_due_jobs_sorted_and_bounded() {
        let store = MemoryStore::new();
        store.add_job(job("later", Some(t0() + secs(30)))).await.unwrap();
        store.add_job(job("soon", Some(t0() + secs(5)))).await.unwrap();
        store.add_job(job("future", Some(t0() + secs(300)))).await.unwrap();
        store.add_job(job("paused", None)).await.unwrap();

        let due = store.get_due_jobs(t0() + secs(60)).await.unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["soon", "later"]);
    }

    #[tokio::test]
    async fn test_due_jobs_ties_break_on_id() {
        let store = MemoryStore::new();
        store.add_job(job("b", Some(t0()))).await.unwrap();
        store.add_job(job("a", Some(t0()))).await.unwrap();

        let due = store.get_due_jobs(t0()).await.unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_next_run_time_skips_nothing_when_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.get_next_run_time().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_run_time_is_earliest() {
        let store = MemoryStore::new();
        store.add_job(job("later", Some(t0() + secs(30)))).await.unwrap();
        store.add_job(job("soon", Some(t0() + secs(5)))).await.unwrap();

        assert_eq!(store.get_next_run_time().await.unwrap(), Some(t0() + secs(5)));
    }

    #[tokio::test]
    async fn test_next_run_time_none_when_all_paused() {
        let store = MemoryStore::new();
        store.add_job(job("paused", None)).await.unwrap();
        assert_eq!(store.get_next_run_time().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_reorders_index() {
        let store = MemoryStore::new();
        store.add_job(job("a", Some(t0() + secs(10)))).await.unwrap();
        store.add_job(job("b", Some(t0() + secs(20)))).await.unwrap();

        // Move "b" ahead of "a".
        store.update_job(job("b", Some(t0() + secs(1)))).await.unwrap();

        assert_eq!(store.get_next_run_time().await.unwrap(), Some(t0() + secs(1)));
        let all = store.get_all_jobs().await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_all_jobs_paused_last() {
        let store = MemoryStore::new();
        store.add_job(job("paused", None)).await.unwrap();
        store.add_job(job("active", Some(t0()))).await.unwrap();

        let all = store.get_all_jobs().await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["active", "paused"]);
    }

    #[tokio::test]
    async fn test_remove_all_jobs() {
        let store = MemoryStore::new();
        store.add_job(job("a", Some(t0()))).await.unwrap();
        store.add_job(job("b", None)).await.unwrap();

        store.remove_all_jobs().await.unwrap();
        assert!(store.get_all_jobs().await.unwrap().is_empty());
        assert_eq!(store.get_next_run_time().await.unwrap(), None);
    }
}
