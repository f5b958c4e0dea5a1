//! Redis-backed distributed backend
//!
//! Key layout (all prefixed `px:`):
//! - `px:job:<job_id>`                      job record JSON, EXPIRE = jobs TTL
//! - `px:job:<job_id>:seg:<segment_id>`     segment record mirror
//! - `px:job:<job_id>:seg:<segment_id>:claim`  claim marker, EX = stale bound
//! - `px:job:<job_id>:merge_lock`           per-job merge lock (SET NX EX)
//! - `px:queue:jobs`                        FIFO of job IDs (RPUSH/BLPOP)
//! - `px:active_jobs` / `px:active_job:<id>` admission counter + markers
//! - `px:worker:heartbeat:<worker_id>`      worker liveness (SET EX)
//! - `px:idem:<key>`                        idempotency mapping
//!
//! Job-record mutations run under WATCH/MULTI/EXEC and retry on conflict.
//! Claim decisions are made inside those transactions; the claim key is the
//! cross-worker visible marker and is double-checked at commit.

use std::sync::Mutex;
use std::time::Duration;

use redis::{Commands, Script};
use tracing::{debug, warn};

use super::store::{claimable, ClaimKind, JobBackend};
use super::types::{now_ts, ClaimToken, CommitOutcome, JobRecord, SegmentRecord, SegmentStatus};
use crate::core::error::{Result, ServiceError};

const QUEUE_KEY: &str = "px:queue:jobs";
const ACTIVE_KEY: &str = "px:active_jobs";

const ACTIVE_INC_LUA: &str = r#"
local active_key = KEYS[1]
local marker_key = KEYS[2]
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
if redis.call("GET", marker_key) then
  return 1
end
local current = tonumber(redis.call("GET", active_key) or "0")
if current >= limit then
  return 0
end
local ok = redis.call("SET", marker_key, "1", "NX", "EX", ttl)
if ok then
  redis.call("INCR", active_key)
  return 1
end
return 0
"#;

const ACTIVE_DEC_LUA: &str = r#"
local active_key = KEYS[1]
local marker_key = KEYS[2]
if not redis.call("GET", marker_key) then
  return 0
end
redis.call("DEL", marker_key)
local current = tonumber(redis.call("GET", active_key) or "0")
if current <= 0 then
  return 0
end
redis.call("DECR", active_key)
return 1
"#;

/// Distributed backend over a shared Redis
pub struct RedisBackend {
    client: redis::Client,
    conn: Mutex<redis::Connection>,
    blocking: Mutex<Vec<redis::Connection>>,
    jobs_ttl: Duration,
}

impl RedisBackend {
    pub fn connect(url: &str, jobs_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(ServiceError::from)?;
        let mut conn = client.get_connection()?;
        redis::cmd("PING").query::<String>(&mut conn)?;
        Ok(Self {
            client,
            conn: Mutex::new(conn),
            blocking: Mutex::new(Vec::new()),
            jobs_ttl,
        })
    }

    fn job_key(job_id: &str) -> String {
        format!("px:job:{}", job_id)
    }

    fn segment_key(job_id: &str, segment_id: &str) -> String {
        format!("px:job:{}:seg:{}", job_id, segment_id)
    }

    fn claim_key(job_id: &str, segment_id: &str) -> String {
        format!("px:job:{}:seg:{}:claim", job_id, segment_id)
    }

    fn merge_lock_key(job_id: &str) -> String {
        format!("px:job:{}:merge_lock", job_id)
    }

    fn ttl_secs(&self) -> u64 {
        self.jobs_ttl.as_secs().max(1)
    }

    /// Run a WATCH/MULTI/EXEC mutation of a job record. The closure may run
    /// multiple times on write conflicts; it must be idempotent over a fresh
    /// read, which `FnMut(&mut JobRecord)` mutations are.
    fn transact_job(
        &self,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut JobRecord) -> bool,
    ) -> Result<Option<JobRecord>> {
        let key = Self::job_key(job_id);
        let ttl = self.ttl_secs();
        let mut conn = self.conn.lock().expect("redis conn");
        let result: Option<JobRecord> =
            redis::transaction(&mut *conn, &[key.clone()], |conn, pipe| {
                let raw: Option<String> = conn.get(&key)?;
                let Some(raw) = raw else {
                    return Ok(Some(None));
                };
                let mut job: JobRecord = match serde_json::from_str(&raw) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!("corrupt job record {}: {}", job_id, e);
                        return Ok(Some(None));
                    }
                };
                if !mutate(&mut job) {
                    // Mutation declined (e.g. claim not available); no write
                    return Ok(Some(Some(job)));
                }
                job.updated_at = now_ts();
                let payload = serde_json::to_string(&job)
                    .map_err(|e| redis::RedisError::from(std::io::Error::other(e)))?;
                // EXEC returns nil on a WATCH conflict; None retries the loop
                let executed: Option<()> = pipe
                    .cmd("SET")
                    .arg(&key)
                    .arg(payload)
                    .arg("EX")
                    .arg(ttl)
                    .ignore()
                    .query(conn)?;
                Ok(executed.map(|()| Some(job)))
            })?;
        Ok(result)
    }

    /// Best-effort mirror of one segment record under its own key
    fn mirror_segment(&self, job_id: &str, segment: &SegmentRecord) {
        let key = Self::segment_key(job_id, &segment.segment_id);
        let Ok(payload) = serde_json::to_string(segment) else {
            return;
        };
        let mut conn = self.conn.lock().expect("redis conn");
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, payload, self.ttl_secs()) {
            debug!("segment mirror write failed for {}: {}", key, e);
        }
    }
}

impl JobBackend for RedisBackend {
    fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.lock().expect("redis conn");
        conn.set_ex::<_, _, ()>(Self::job_key(&job.job_id), payload, self.ttl_secs())?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.lock().expect("redis conn");
        let raw: Option<String> = conn.get(Self::job_key(job_id))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn update_job(
        &self,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>> {
        self.transact_job(job_id, &mut |job| {
            mutate(job);
            true
        })
    }

    fn claim_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimToken>> {
        let mut claimed: Option<ClaimToken> = None;
        let job = self.transact_job(job_id, &mut |job| {
            claimed = None;
            if job.is_canceled() {
                return false;
            }
            let Some(segment) = job.segment_mut(segment_id) else {
                return false;
            };
            let Some(kind) = claimable(segment, stale_after) else {
                return false;
            };
            if kind == ClaimKind::Fresh {
                segment.attempts += 1;
            }
            segment.status = SegmentStatus::InProgress;
            segment.claimed_at = Some(now_ts());
            segment.claim_owner = Some(worker_id.to_string());
            segment.claim_epoch += 1;
            claimed = Some(ClaimToken {
                worker_id: worker_id.to_string(),
                epoch: segment.claim_epoch,
            });
            true
        })?;

        if let (Some(token), Some(job)) = (&claimed, &job) {
            // Visible claim marker, expiring at the stale bound
            let mut conn = self.conn.lock().expect("redis conn");
            let _: std::result::Result<(), _> = conn.set_ex(
                Self::claim_key(job_id, segment_id),
                token.encode(),
                stale_after.as_secs().max(1),
            );
            drop(conn);
            if let Some(segment) = job.segment(segment_id) {
                self.mirror_segment(job_id, segment);
            }
        }
        Ok(claimed)
    }

    fn commit_segment(
        &self,
        job_id: &str,
        segment_id: &str,
        token: &ClaimToken,
        apply: &mut dyn FnMut(&mut SegmentRecord),
    ) -> Result<CommitOutcome> {
        // Cross-check the visible claim marker; a different holder means the
        // claim went stale and was taken over
        {
            let mut conn = self.conn.lock().expect("redis conn");
            let marker: Option<String> = conn.get(Self::claim_key(job_id, segment_id))?;
            if let Some(marker) = marker {
                if marker != token.encode() {
                    return Ok(CommitOutcome::Rejected);
                }
            }
        }

        let mut committed = false;
        let job = self.transact_job(job_id, &mut |job| {
            committed = false;
            if job.is_canceled() {
                return false;
            }
            let Some(segment) = job.segment_mut(segment_id) else {
                return false;
            };
            if segment.claim_epoch != token.epoch
                || segment.claim_owner.as_deref() != Some(token.worker_id.as_str())
            {
                return false;
            }
            apply(segment);
            segment.clear_claim();
            job.settle_status();
            committed = true;
            true
        })?;

        if committed {
            let mut conn = self.conn.lock().expect("redis conn");
            let _: std::result::Result<(), _> =
                conn.del(Self::claim_key(job_id, segment_id));
            drop(conn);
            if let Some(segment) = job.as_ref().and_then(|j| j.segment(segment_id)) {
                self.mirror_segment(job_id, segment);
            }
            Ok(CommitOutcome::Committed)
        } else {
            Ok(CommitOutcome::Rejected)
        }
    }

    fn release_claim(&self, job_id: &str, segment_id: &str, token: &ClaimToken) -> Result<()> {
        self.transact_job(job_id, &mut |job| {
            let Some(segment) = job.segment_mut(segment_id) else {
                return false;
            };
            if segment.claim_epoch != token.epoch
                || segment.status != SegmentStatus::InProgress
            {
                return false;
            }
            segment.status = SegmentStatus::Queued;
            segment.clear_claim();
            true
        })?;
        let mut conn = self.conn.lock().expect("redis conn");
        let _: std::result::Result<(), _> = conn.del(Self::claim_key(job_id, segment_id));
        Ok(())
    }

    fn enqueue(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        conn.rpush::<_, _, ()>(QUEUE_KEY, job_id)?;
        Ok(())
    }

    fn requeue_front(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        conn.lpush::<_, _, ()>(QUEUE_KEY, job_id)?;
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<String>> {
        // Blocking pops get their own connection so they never starve the
        // shared store connection
        let mut conn = match self.blocking.lock().expect("blocking pool").pop() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let popped: Option<(String, String)> =
            conn.blpop(QUEUE_KEY, timeout.as_secs_f64())?;
        self.blocking.lock().expect("blocking pool").push(conn);
        Ok(popped.map(|(_, job_id)| job_id))
    }

    fn queue_len(&self) -> Result<usize> {
        let mut conn = self.conn.lock().expect("redis conn");
        let len: usize = conn.llen(QUEUE_KEY)?;
        Ok(len)
    }

    fn try_acquire_active_slot(&self, job_id: &str, limit: usize, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().expect("redis conn");
        let granted: i64 = Script::new(ACTIVE_INC_LUA)
            .key(ACTIVE_KEY)
            .key(format!("px:active_job:{}", job_id))
            .arg(limit as i64)
            .arg(ttl.as_secs().max(1))
            .invoke(&mut *conn)?;
        Ok(granted == 1)
    }

    fn release_active_slot(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        let _: i64 = Script::new(ACTIVE_DEC_LUA)
            .key(ACTIVE_KEY)
            .key(format!("px:active_job:{}", job_id))
            .invoke(&mut *conn)?;
        Ok(())
    }

    fn active_jobs(&self) -> Result<i64> {
        let mut conn = self.conn.lock().expect("redis conn");
        let count: Option<i64> = conn.get(ACTIVE_KEY)?;
        Ok(count.unwrap_or(0).max(0))
    }

    fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        conn.set_ex::<_, _, ()>(
            format!("px:worker:heartbeat:{}", worker_id),
            now_ts().to_string(),
            ttl.as_secs().max(1),
        )?;
        Ok(())
    }

    fn workers_online(&self) -> Result<usize> {
        let mut conn = self.conn.lock().expect("redis conn");
        let keys: Vec<String> = conn
            .scan_match::<_, String>("px:worker:heartbeat:*")?
            .collect();
        Ok(keys.len())
    }

    fn try_acquire_merge_lock(&self, job_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().expect("redis conn");
        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::merge_lock_key(job_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query(&mut *conn)?;
        Ok(acquired.is_some())
    }

    fn release_merge_lock(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        conn.del::<_, ()>(Self::merge_lock_key(job_id))?;
        Ok(())
    }

    fn idempotency_get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().expect("redis conn");
        let job_id: Option<String> = conn.get(format!("px:idem:{}", key))?;
        Ok(job_id)
    }

    fn idempotency_put(&self, key: &str, job_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis conn");
        conn.set_ex::<_, _, ()>(format!("px:idem:{}", key), job_id, ttl.as_secs().max(1))?;
        Ok(())
    }

    fn sweep_expired(&self, _ttl: Duration) -> Result<usize> {
        // Redis EXPIRE on the job keys does the eviction
        Ok(0)
    }
}
