//! Job store backends
//!
//! One trait covers both deployment modes: a single-process store (in-memory
//! map plus an on-disk journal) and the Redis-backed distributed store. All
//! claim, commit, and counter operations go through the backend so the
//! worker logic stays mode-agnostic.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::queue::LocalJobQueue;
use super::types::{now_ts, ClaimToken, CommitOutcome, JobRecord, SegmentRecord, SegmentStatus};
use crate::core::error::{Result, ServiceError};

/// Storage, queueing, and coordination operations shared by both modes
pub trait JobBackend: Send + Sync {
    fn insert_job(&self, job: &JobRecord) -> Result<()>;

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Atomically mutate a job record; returns the post-mutation record
    fn update_job(
        &self,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>>;

    /// Claim a segment for a worker. Fresh claims (from `queued`) count an
    /// attempt; reclaims of a stale `in_progress` segment do not.
    fn claim_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimToken>>;

    /// Commit a claimed segment. The mutation is applied only when the
    /// token's epoch still matches and the job is not canceled.
    fn commit_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        token: &ClaimToken,
        apply: &mut dyn FnMut(&mut SegmentRecord),
    ) -> Result<CommitOutcome>;

    /// Return a claimed segment to `queued` (transient failure path)
    fn release_claim(&self, job_id: &str, segment_id: &str, token: &ClaimToken) -> Result<()>;

    fn enqueue(&self, job_id: &str) -> Result<()>;

    fn requeue_front(&self, job_id: &str) -> Result<()>;

    fn dequeue(&self, timeout: Duration) -> Result<Option<String>>;

    fn queue_len(&self) -> Result<usize>;

    /// Take an active-job slot; false when the limit is reached
    fn try_acquire_active_slot(&self, job_id: &str, limit: usize, ttl: Duration) -> Result<bool>;

    fn release_active_slot(&self, job_id: &str) -> Result<()>;

    fn active_jobs(&self) -> Result<i64>;

    fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()>;

    fn workers_online(&self) -> Result<usize>;

    fn try_acquire_merge_lock(&self, job_id: &str, ttl: Duration) -> Result<bool>;

    fn release_merge_lock(&self, job_id: &str) -> Result<()>;

    fn idempotency_get(&self, key: &str) -> Result<Option<String>>;

    fn idempotency_put(&self, key: &str, job_id: &str, ttl: Duration) -> Result<()>;

    /// Evict jobs past their TTL; returns the number removed
    fn sweep_expired(&self, ttl: Duration) -> Result<usize>;
}

/// Decide whether a segment is claimable, shared by both backends
pub(crate) fn claimable(
    segment: &SegmentRecord,
    stale_after: Duration,
) -> Option<ClaimKind> {
    match segment.status {
        SegmentStatus::Queued => Some(ClaimKind::Fresh),
        SegmentStatus::InProgress => {
            let claimed_at = segment.claimed_at?;
            // Exactly at the stale bound the claim is still fresh
            if now_ts() - claimed_at > stale_after.as_secs_f64() {
                Some(ClaimKind::StaleReclaim)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimKind {
    Fresh,
    StaleReclaim,
}

/// Single-process backend: in-memory map plus per-job journal files
pub struct MemoryBackend {
    jobs: Mutex<HashMap<String, JobRecord>>,
    queue: LocalJobQueue,
    active: Mutex<HashSet<String>>,
    heartbeats: Mutex<HashMap<String, Instant>>,
    merge_locks: Mutex<HashMap<String, Instant>>,
    idempotency: Mutex<HashMap<String, (String, Instant)>>,
    journal_dir: Option<PathBuf>,
}

impl MemoryBackend {
    pub fn new(journal_dir: Option<PathBuf>) -> Self {
        let backend = Self {
            jobs: Mutex::new(HashMap::new()),
            queue: LocalJobQueue::new(),
            active: Mutex::new(HashSet::new()),
            heartbeats: Mutex::new(HashMap::new()),
            merge_locks: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            journal_dir,
        };
        backend.replay_journal();
        backend
    }

    fn replay_journal(&self) {
        let Some(dir) = &self.journal_dir else { return };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(ServiceError::from)
                .and_then(|raw| serde_json::from_str::<JobRecord>(&raw).map_err(ServiceError::from))
            {
                Ok(job) => {
                    jobs.insert(job.job_id.clone(), job);
                    loaded += 1;
                }
                Err(e) => warn!("skipping corrupt journal entry {:?}: {}", path, e),
            }
        }
        if loaded > 0 {
            debug!("replayed {} jobs from journal", loaded);
        }
    }

    fn journal_write(&self, job: &JobRecord) {
        let Some(dir) = &self.journal_dir else { return };
        let path = dir.join(format!("{}.json", job.job_id));
        let tmp = dir.join(format!("{}.json.tmp", job.job_id));
        let result = serde_json::to_string(job)
            .map_err(ServiceError::from)
            .and_then(|payload| {
                std::fs::create_dir_all(dir)?;
                std::fs::write(&tmp, payload)?;
                std::fs::rename(&tmp, &path)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("journal write failed for {}: {}", job.job_id, e);
        }
    }

    fn journal_remove(&self, job_id: &str) {
        if let Some(dir) = &self.journal_dir {
            let _ = std::fs::remove_file(dir.join(format!("{}.json", job_id)));
        }
    }
}

impl JobBackend for MemoryBackend {
    fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        jobs.insert(job.job_id.to_string(), job.clone());
        drop(jobs);
        self.journal_write(job);
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().expect("jobs lock").get(job_id).cloned())
    }

    fn update_job(
        &self,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        mutate(job);
        job.updated_at = now_ts();
        let snapshot = job.clone();
        drop(jobs);
        self.journal_write(&snapshot);
        Ok(Some(snapshot))
    }

    fn claim_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimToken>> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.is_canceled() {
            return Ok(None);
        }
        let Some(segment) = job.segment_mut(segment_id) else {
            return Ok(None);
        };
        let Some(kind) = claimable(segment, stale_after) else {
            return Ok(None);
        };
        if kind == ClaimKind::Fresh {
            segment.attempts += 1;
        }
        segment.status = SegmentStatus::InProgress;
        segment.claimed_at = Some(now_ts());
        segment.claim_owner = Some(worker_id.to_string());
        segment.claim_epoch += 1;
        let token = ClaimToken {
            worker_id: worker_id.to_string(),
            epoch: segment.claim_epoch,
        };
        job.updated_at = now_ts();
        let snapshot = job.clone();
        drop(jobs);
        self.journal_write(&snapshot);
        Ok(Some(token))
    }

    fn commit_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        token: &ClaimToken,
        apply: &mut dyn FnMut(&mut SegmentRecord),
    ) -> Result<CommitOutcome> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(CommitOutcome::Rejected);
        };
        if job.is_canceled() {
            return Ok(CommitOutcome::Rejected);
        }
        let Some(segment) = job.segment_mut(segment_id) else {
            return Ok(CommitOutcome::Rejected);
        };
        if segment.claim_epoch != token.epoch
            || segment.claim_owner.as_deref() != Some(token.worker_id.as_str())
        {
            return Ok(CommitOutcome::Rejected);
        }
        apply(segment);
        segment.clear_claim();
        job.settle_status();
        job.updated_at = now_ts();
        let snapshot = job.clone();
        drop(jobs);
        self.journal_write(&snapshot);
        Ok(CommitOutcome::Committed)
    }

    fn release_claim(&self, job_id: &str, segment_id: &str, token: &ClaimToken) -> Result<()> {
        self.update_job(job_id, &mut |job| {
            if let Some(segment) = job.segment_mut(segment_id) {
                if segment.claim_epoch == token.epoch
                    && segment.status == SegmentStatus::InProgress
                {
                    segment.status = SegmentStatus::Queued;
                    segment.clear_claim();
                }
            }
        })?;
        Ok(())
    }

    fn enqueue(&self, job_id: &str) -> Result<()> {
        self.queue.enqueue(job_id);
        Ok(())
    }

    fn requeue_front(&self, job_id: &str) -> Result<()> {
        self.queue.requeue_front(job_id);
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<String>> {
        Ok(self.queue.dequeue(timeout))
    }

    fn queue_len(&self) -> Result<usize> {
        Ok(self.queue.len())
    }

    fn try_acquire_active_slot(&self, job_id: &str, limit: usize, _ttl: Duration) -> Result<bool> {
        let mut active = self.active.lock().expect("active lock");
        if active.contains(job_id) {
            return Ok(true);
        }
        if active.len() >= limit {
            return Ok(false);
        }
        active.insert(job_id.to_string());
        Ok(true)
    }

    fn release_active_slot(&self, job_id: &str) -> Result<()> {
        self.active.lock().expect("active lock").remove(job_id);
        Ok(())
    }

    fn active_jobs(&self) -> Result<i64> {
        Ok(self.active.lock().expect("active lock").len() as i64)
    }

    fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        self.heartbeats
            .lock()
            .expect("heartbeat lock")
            .insert(worker_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    fn workers_online(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .heartbeats
            .lock()
            .expect("heartbeat lock")
            .values()
            .filter(|expiry| **expiry > now)
            .count())
    }

    fn try_acquire_merge_lock(&self, job_id: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.merge_locks.lock().expect("merge lock table");
        let now = Instant::now();
        match locks.get(job_id) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                locks.insert(job_id.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    fn release_merge_lock(&self, job_id: &str) -> Result<()> {
        self.merge_locks
            .lock()
            .expect("merge lock table")
            .remove(job_id);
        Ok(())
    }

    fn idempotency_get(&self, key: &str) -> Result<Option<String>> {
        let table = self.idempotency.lock().expect("idempotency lock");
        Ok(table.get(key).and_then(|(job_id, expiry)| {
            (*expiry > Instant::now()).then(|| job_id.clone())
        }))
    }

    fn idempotency_put(&self, key: &str, job_id: &str, ttl: Duration) -> Result<()> {
        self.idempotency
            .lock()
            .expect("idempotency lock")
            .insert(key.to_string(), (job_id.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn sweep_expired(&self, ttl: Duration) -> Result<usize> {
        let cutoff = now_ts() - ttl.as_secs_f64();
        let expired: Vec<String> = {
            let jobs = self.jobs.lock().expect("jobs lock");
            jobs.values()
                .filter(|job| job.status.is_terminal() && job.updated_at < cutoff)
                .map(|job| job.job_id.clone())
                .collect()
        };
        let mut jobs = self.jobs.lock().expect("jobs lock");
        for job_id in &expired {
            jobs.remove(job_id);
        }
        drop(jobs);
        for job_id in &expired {
            self.journal_remove(job_id);
        }
        // Idempotency entries age out alongside their jobs
        self.idempotency
            .lock()
            .expect("idempotency lock")
            .retain(|_, (_, expiry)| *expiry > Instant::now());
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::ReadingProfile;

    fn sample_job(job_id: &str, segment_count: usize) -> JobRecord {
        let segments = (0..segment_count)
            .map(|i| {
                SegmentRecord::new(
                    format!("{}-seg{}", job_id, i),
                    i,
                    format!("text {}", i),
                    format!("key-{}-{}", job_id, i),
                )
            })
            .collect();
        JobRecord {
            job_id: job_id.to_string(),
            status: super::super::types::JobStatus::Queued,
            created_at: now_ts(),
            updated_at: now_ts(),
            model_id: "m".to_string(),
            voice_id: None,
            reading_profile: ReadingProfile::default(),
            prefer_phonemes: true,
            dict_pack_versions: HashMap::new(),
            segments,
            cache_hit_count: 0,
            cache_miss_count: 0,
            canceled_at: None,
            active_released: false,
        }
    }

    #[test]
    fn test_insert_get_update() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 2)).unwrap();
        assert!(backend.get_job("j1").unwrap().is_some());
        let updated = backend
            .update_job("j1", &mut |job| job.cache_hit_count = 5)
            .unwrap()
            .unwrap();
        assert_eq!(updated.cache_hit_count, 5);
        assert!(backend.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();
        let stale = Duration::from_secs(300);

        let token = backend
            .claim_segment("j1", "j1-seg0", "w1", stale)
            .unwrap()
            .unwrap();
        assert_eq!(token.epoch, 1);
        // Second claim on a live claim fails
        assert!(backend
            .claim_segment("j1", "j1-seg0", "w2", stale)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_fresh_claim_counts_attempt_reclaim_does_not() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();

        let _token = backend
            .claim_segment("j1", "j1-seg0", "w1", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        assert_eq!(backend.get_job("j1").unwrap().unwrap().segments[0].attempts, 1);

        // Make the claim look stale, then reclaim from another worker
        backend
            .update_job("j1", &mut |job| {
                job.segments[0].claimed_at = Some(now_ts() - 301.0);
            })
            .unwrap();
        let token2 = backend
            .claim_segment("j1", "j1-seg0", "w2", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        assert_eq!(token2.epoch, 2);
        assert_eq!(backend.get_job("j1").unwrap().unwrap().segments[0].attempts, 1);
    }

    #[test]
    fn test_claim_exactly_at_stale_bound_is_fresh() {
        let segment = {
            let mut seg = SegmentRecord::new("s".into(), 0, "t".into(), "k".into());
            seg.status = SegmentStatus::InProgress;
            seg.claimed_at = Some(now_ts() - 300.0);
            seg
        };
        // Exactly at the bound: not reclaimable
        assert!(claimable(&segment, Duration::from_secs(300)).is_none());

        let mut stale = segment;
        stale.claimed_at = Some(now_ts() - 300.002);
        assert_eq!(
            claimable(&stale, Duration::from_secs(300)),
            Some(ClaimKind::StaleReclaim)
        );
    }

    #[test]
    fn test_commit_rejected_after_reclaim() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();

        let old_token = backend
            .claim_segment("j1", "j1-seg0", "w1", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        backend
            .update_job("j1", &mut |job| {
                job.segments[0].claimed_at = Some(now_ts() - 301.0);
            })
            .unwrap();
        let _new_token = backend
            .claim_segment("j1", "j1-seg0", "w2", Duration::from_secs(300))
            .unwrap()
            .unwrap();

        // The superseded owner's commit is a no-op
        let outcome = backend
            .commit_segment("j1", "j1-seg0", &old_token, &mut |seg| {
                seg.status = SegmentStatus::Ready;
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Rejected);
        let job = backend.get_job("j1").unwrap().unwrap();
        assert_eq!(job.segments[0].status, SegmentStatus::InProgress);
    }

    #[test]
    fn test_commit_settles_job_status() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();
        let token = backend
            .claim_segment("j1", "j1-seg0", "w1", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        backend
            .commit_segment("j1", "j1-seg0", &token, &mut |seg| {
                seg.status = SegmentStatus::Ready;
                seg.path = Some("/tmp/x.ogg".to_string());
            })
            .unwrap();
        let job = backend.get_job("j1").unwrap().unwrap();
        assert!(job.status.is_terminal_complete());
    }

    #[test]
    fn test_commit_rejected_when_canceled() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();
        let token = backend
            .claim_segment("j1", "j1-seg0", "w1", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        backend
            .update_job("j1", &mut |job| {
                job.status = super::super::types::JobStatus::Canceled;
            })
            .unwrap();
        let outcome = backend
            .commit_segment("j1", "j1-seg0", &token, &mut |seg| {
                seg.status = SegmentStatus::Ready;
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Rejected);
    }

    #[test]
    fn test_release_claim_requeues() {
        let backend = MemoryBackend::new(None);
        backend.insert_job(&sample_job("j1", 1)).unwrap();
        let token = backend
            .claim_segment("j1", "j1-seg0", "w1", Duration::from_secs(300))
            .unwrap()
            .unwrap();
        backend.release_claim("j1", "j1-seg0", &token).unwrap();
        let job = backend.get_job("j1").unwrap().unwrap();
        assert_eq!(job.segments[0].status, SegmentStatus::Queued);
        assert!(job.segments[0].claim_owner.is_none());
    }

    #[test]
    fn test_active_slots_enforce_limit() {
        let backend = MemoryBackend::new(None);
        let ttl = Duration::from_secs(60);
        assert!(backend.try_acquire_active_slot("a", 2, ttl).unwrap());
        assert!(backend.try_acquire_active_slot("b", 2, ttl).unwrap());
        assert!(!backend.try_acquire_active_slot("c", 2, ttl).unwrap());
        backend.release_active_slot("a").unwrap();
        assert!(backend.try_acquire_active_slot("c", 2, ttl).unwrap());
        assert_eq!(backend.active_jobs().unwrap(), 2);
    }

    #[test]
    fn test_merge_lock_mutual_exclusion() {
        let backend = MemoryBackend::new(None);
        let ttl = Duration::from_secs(60);
        assert!(backend.try_acquire_merge_lock("j1", ttl).unwrap());
        assert!(!backend.try_acquire_merge_lock("j1", ttl).unwrap());
        backend.release_merge_lock("j1").unwrap();
        assert!(backend.try_acquire_merge_lock("j1", ttl).unwrap());
    }

    #[test]
    fn test_heartbeats_expire() {
        let backend = MemoryBackend::new(None);
        backend.heartbeat("w1", Duration::from_secs(10)).unwrap();
        backend.heartbeat("w2", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(backend.workers_online().unwrap(), 1);
    }

    #[test]
    fn test_idempotency_round_trip() {
        let backend = MemoryBackend::new(None);
        assert!(backend.idempotency_get("k").unwrap().is_none());
        backend
            .idempotency_put("k", "j1", Duration::from_secs(60))
            .unwrap();
        assert_eq!(backend.idempotency_get("k").unwrap(), Some("j1".into()));
    }

    #[test]
    fn test_journal_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = MemoryBackend::new(Some(dir.path().to_path_buf()));
            backend.insert_job(&sample_job("j1", 2)).unwrap();
        }
        let backend = MemoryBackend::new(Some(dir.path().to_path_buf()));
        let job = backend.get_job("j1").unwrap().unwrap();
        assert_eq!(job.segments.len(), 2);
    }

    #[test]
    fn test_sweep_removes_expired_terminal_jobs() {
        let backend = MemoryBackend::new(None);
        let mut job = sample_job("j1", 1);
        job.status = super::super::types::JobStatus::Complete;
        backend.insert_job(&job).unwrap();
        backend
            .update_job("j1", &mut |job| job.updated_at = now_ts() - 100_000.0)
            .unwrap();
        // update_job refreshed updated_at; set it back directly
        {
            let mut jobs = backend.jobs.lock().unwrap();
            jobs.get_mut("j1").unwrap().updated_at = now_ts() - 100_000.0;
        }
        let removed = backend.sweep_expired(Duration::from_secs(86_400)).unwrap();
        assert_eq!(removed, 0);
        {
            let mut jobs = backend.jobs.lock().unwrap();
            jobs.get_mut("j1").unwrap().updated_at = now_ts() - 100_000.0;
        }
        let removed = backend.sweep_expired(Duration::from_secs(3_600)).unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get_job("j1").unwrap().is_none());
    }
}
