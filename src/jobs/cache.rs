//! Time-bounded, capacity-bounded store of jobs, shared by submitters,
//! workers and pollers.
//!
//! Every operation takes one short synchronous lock, so a read-modify-write
//! through [`ResultCache::update`] can never interleave with another one.
//! Entries expire `ttl` after they were created or last updated. Expiry is
//! checked lazily on access and by a periodic sweeper, so an entry may linger
//! past its TTL but never disappears early.
//!
//! Active (pending or processing) jobs are pinned. A worker still owns them
//! and will update them again, so they neither expire nor get evicted. The
//! capacity only limits how many finished jobs we keep around: when every
//! entry is active, new jobs are admitted anyway, and the worker pool's queue
//! decides when they run.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

use super::job::{Job, JobId};
use crate::prelude::*;

/// Errors returned by [`ResultCache`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    AlreadyExists(JobId),
}

struct CacheEntry {
    job: Job,
    expires_at: Instant,
    /// Logical timestamp of the last access, for LRU eviction.
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.job.status().is_terminal() && now >= self.expires_at
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<JobId, CacheEntry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a live entry, dropping it first if it has expired.
    fn live_entry(&mut self, id: JobId, now: Instant) -> Result<&mut CacheEntry, CacheError> {
        if self.entries.get(&id).is_some_and(|e| e.is_expired(now)) {
            trace!(job_id = %id, "Expired job on access");
            self.entries.remove(&id);
        }
        let tick = self.tick();
        let entry = self.entries.get_mut(&id).ok_or(CacheError::NotFound(id))?;
        entry.last_used = tick;
        Ok(entry)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Evict the least recently used terminal entry, if there is one.
    fn evict_one(&mut self) -> Option<JobId> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.job.status().is_terminal())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| *id)?;
        self.entries.remove(&victim);
        Some(victim)
    }
}

/// See the module docs.
pub struct ResultCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` jobs for `ttl` each.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            capacity,
        }
    }

    /// Insert a new job.
    pub fn put(&self, job: Job) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        let id = job.id();
        if state.entries.contains_key(&id) {
            return Err(CacheError::AlreadyExists(id));
        }
        if state.entries.len() >= self.capacity {
            state.sweep(now);
        }
        while state.entries.len() >= self.capacity {
            match state.evict_one() {
                Some(victim) => debug!(job_id = %victim, "Evicted least recently used job"),
                None => {
                    debug!(
                        job_id = %id,
                        capacity = self.capacity,
                        "Every cached job is active, admitting past capacity"
                    );
                    break;
                }
            }
        }
        let last_used = state.tick();
        state.entries.insert(
            id,
            CacheEntry {
                job,
                expires_at: now + self.ttl,
                last_used,
            },
        );
        Ok(())
    }

    /// Get a copy of a job.
    pub fn get(&self, id: JobId) -> Result<Job, CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        Ok(state.live_entry(id, now)?.job.clone())
    }

    /// Atomically modify a job, and restart its TTL.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Result<R, CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        let entry = state.live_entry(id, now)?;
        let result = f(&mut entry.job);
        entry.expires_at = now + self.ttl;
        Ok(result)
    }

    /// Copies of every live job, in no particular order.
    pub fn list(&self) -> Vec<Job> {
        let now = Instant::now();
        let state = self.state.lock().expect("lock poisoned");
        state
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// Number of live entries. Expired entries waiting for the sweeper are
    /// not counted.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().expect("lock poisoned");
        state
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        self.state.lock().expect("lock poisoned").sweep(now)
    }

    /// Sweep expired entries every `period`, until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired jobs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobError, PageStats};

    const TTL: Duration = Duration::from_secs(3600);

    fn pending() -> Job {
        Job::new(JobId::new(), vec!["a.pdf".to_owned()])
    }

    fn finished() -> Job {
        let mut job = pending();
        job.start().unwrap();
        job.complete(vec![], PageStats::default(), "done".to_owned())
            .unwrap();
        job
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_at_ttl_and_not_before() {
        let cache = ResultCache::new(TTL, 10);
        let job = finished();
        let id = job.id();
        cache.put(job).unwrap();

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(cache.get(id).is_ok());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(id).unwrap_err(), CacheError::NotFound(id));
    }

    #[tokio::test(start_paused = true)]
    async fn updates_restart_the_ttl() {
        let cache = ResultCache::new(TTL, 10);
        let job = pending();
        let id = job.id();
        cache.put(job).unwrap();

        tokio::time::advance(TTL / 2).await;
        cache.update(id, |job| job.start()).unwrap().unwrap();
        tokio::time::advance(TTL / 2).await;
        cache
            .update(id, |job| {
                job.complete(vec![], PageStats::default(), "done".to_owned())
            })
            .unwrap()
            .unwrap();
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(cache.get(id).is_ok());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn active_jobs_never_expire() {
        let cache = ResultCache::new(TTL, 10);
        let job = pending();
        let id = job.id();
        cache.put(job).unwrap();
        tokio::time::advance(TTL * 3).await;
        assert_eq!(cache.sweep_expired(), 0);
        assert!(cache.get(id).is_ok());
    }

    /// Entries actually held, expired or not.
    fn stored_entries(cache: &ResultCache) -> usize {
        cache.state.lock().unwrap().entries.len()
    }

    #[tokio::test(start_paused = true)]
    async fn len_skips_expired_entries_before_they_are_swept() {
        let cache = ResultCache::new(TTL, 10);
        cache.put(finished()).unwrap();
        cache.put(pending()).unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::advance(TTL).await;
        assert_eq!(stored_entries(&cache), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let cache = Arc::new(ResultCache::new(TTL, 10));
        let handle = cache.spawn_sweeper(Duration::from_secs(60));
        cache.put(finished()).unwrap();
        cache.put(pending()).unwrap();
        assert_eq!(stored_entries(&cache), 2);

        tokio::time::sleep(TTL + Duration::from_secs(61)).await;
        assert_eq!(stored_entries(&cache), 1);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn evicts_least_recently_used_terminal_job() {
        let cache = ResultCache::new(TTL, 3);
        let old = finished();
        let recent = finished();
        let active = pending();
        let (old_id, recent_id, active_id) = (old.id(), recent.id(), active.id());
        cache.put(old).unwrap();
        cache.put(recent).unwrap();
        cache.put(active).unwrap();

        // Touch `old` so that `recent` becomes the least recently used.
        cache.get(old_id).unwrap();
        cache.put(pending()).unwrap();

        assert!(cache.get(old_id).is_ok());
        assert!(cache.get(recent_id).is_err());
        assert!(cache.get(active_id).is_ok());
    }

    #[tokio::test]
    async fn active_jobs_are_admitted_past_capacity() {
        let cache = ResultCache::new(TTL, 2);
        let jobs = (0..4).map(|_| pending()).collect::<Vec<_>>();
        let ids = jobs.iter().map(Job::id).collect::<Vec<_>>();
        for job in jobs {
            cache.put(job).unwrap();
        }
        assert_eq!(cache.len(), 4);
        for id in &ids {
            assert!(cache.get(*id).is_ok());
        }
    }

    #[tokio::test]
    async fn finished_jobs_are_evicted_back_down_to_capacity() {
        let cache = ResultCache::new(TTL, 2);
        let ids = (0..3)
            .map(|_| {
                let job = pending();
                let id = job.id();
                cache.put(job).unwrap();
                id
            })
            .collect::<Vec<_>>();
        for id in &ids {
            cache.update(*id, |job| job.start()).unwrap().unwrap();
            cache
                .update(*id, |job| {
                    job.complete(vec![], PageStats::default(), "done".to_owned())
                })
                .unwrap()
                .unwrap();
        }

        let newest = finished();
        let newest_id = newest.id();
        cache.put(newest).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(newest_id).is_ok());
        assert!(cache.get(ids[2]).is_ok());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let cache = ResultCache::new(TTL, 2);
        let job = pending();
        cache.put(job.clone()).unwrap();
        assert_eq!(
            cache.put(job.clone()).unwrap_err(),
            CacheError::AlreadyExists(job.id())
        );
    }

    #[tokio::test]
    async fn updates_are_atomic_across_tasks() {
        let cache = Arc::new(ResultCache::new(TTL, 10));
        let job = pending();
        let id = job.id();
        cache.put(job).unwrap();
        cache.update(id, |job| job.start()).unwrap().unwrap();

        let tasks = (0..50)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .update(id, |job| {
                            let stats = PageStats {
                                processed_pages: job.stats().processed_pages + 1,
                                total_pages: 100,
                                ..job.stats()
                            };
                            job.record_progress(i, stats)
                        })
                        .unwrap()
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        let job = cache.get(id).unwrap();
        assert_eq!(job.stats().processed_pages, 50);
        assert_eq!(job.progress(), 49);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let cache = ResultCache::new(TTL, 2);
        let id = JobId::new();
        assert_eq!(cache.get(id).unwrap_err(), CacheError::NotFound(id));
        assert_eq!(
            cache.update(id, |job| job.fail(JobError::internal_fault("x"))).unwrap_err(),
            CacheError::NotFound(id)
        );
    }
}
