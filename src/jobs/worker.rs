//! Segment workers
//!
//! Each worker is a loop: refresh heartbeat, block on the queue, walk the
//! job's segments in index order, and for each one run the claim -> resolve
//! -> synthesize -> encode -> commit pipeline. Cancellation is checked
//! before every segment and before each expensive step; a superseded claim
//! makes the commit a no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::{build_cache_key, FingerprintInputs};
use crate::core::error::{Result, SegmentErrorCode, ServiceError};
use crate::text::apply_reading_modes;

use super::manager::JobManager;
use super::types::{ClaimToken, CommitOutcome, JobRecord, JobStatus, SegmentStatus};

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_TTL: Duration = Duration::from_secs(10);

/// Synthesis faults that historically clear up on the quality model
const MODEL_FALLBACK_MARKERS: [&str; 2] = ["kernel size", "dimension out of range"];

enum SegmentPass {
    /// Terminal outcome committed (ready or error)
    Settled,
    /// Transient failure released the claim; the job wants another pass
    Requeue,
    /// Nothing to do (cache hit, foreign claim, canceled, terminal)
    Skipped,
}

/// Spawn the configured number of worker threads
pub fn spawn_workers(manager: Arc<JobManager>) -> Vec<std::thread::JoinHandle<()>> {
    let count = manager.settings().job_workers;
    (0..count)
        .map(|n| {
            let worker = Worker {
                manager: Arc::clone(&manager),
                worker_id: format!("{}-{}", std::process::id(), n),
            };
            std::thread::Builder::new()
                .name(format!("worker-{}", n))
                .spawn(move || worker.run())
                .expect("spawn worker thread")
        })
        .collect()
}

pub struct Worker {
    manager: Arc<JobManager>,
    worker_id: String,
}

impl Worker {
    pub fn new(manager: Arc<JobManager>, worker_id: impl Into<String>) -> Self {
        Self {
            manager,
            worker_id: worker_id.into(),
        }
    }

    pub fn run(&self) {
        info!(worker_id = %self.worker_id, "worker online");
        loop {
            if let Err(e) = self
                .manager
                .backend()
                .heartbeat(&self.worker_id, HEARTBEAT_TTL)
            {
                warn!("heartbeat failed: {}", e);
            }
            let job_id = match self.manager.backend().dequeue(DEQUEUE_TIMEOUT) {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(e) => {
                    warn!("dequeue failed: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            if let Err(e) = self.process_job(&job_id) {
                warn!(job_id, "job processing failed: {}", e);
            }
        }
    }

    /// Process every outstanding segment of one job
    pub fn process_job(&self, job_id: &str) -> Result<()> {
        let Some(job) = self.manager.get_job(job_id)? else {
            return Ok(());
        };
        if job.is_canceled() {
            return self.manager.finalize_if_terminal(job_id);
        }
        self.manager.backend().update_job(job_id, &mut |job| {
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Running;
            }
        })?;

        let segment_ids: Vec<String> = job
            .segments
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.segment_id.clone())
            .collect();

        let fan_out = self
            .manager
            .settings()
            .max_concurrent_segments
            .min(self.manager.settings().workers)
            .max(1);

        let mut requeue = false;
        if fan_out <= 1 {
            for segment_id in &segment_ids {
                match self.process_segment(job_id, segment_id)? {
                    SegmentPass::Requeue => requeue = true,
                    SegmentPass::Settled | SegmentPass::Skipped => {}
                }
                if self.job_canceled(job_id)? {
                    break;
                }
            }
        } else {
            let pending = std::sync::Mutex::new(segment_ids.into_iter());
            let requeue_flag = std::sync::atomic::AtomicBool::new(false);
            std::thread::scope(|scope| {
                for _ in 0..fan_out {
                    scope.spawn(|| loop {
                        let next = pending.lock().expect("segment feed").next();
                        let Some(segment_id) = next else { break };
                        match self.process_segment(job_id, &segment_id) {
                            Ok(SegmentPass::Requeue) => {
                                requeue_flag.store(true, std::sync::atomic::Ordering::Relaxed);
                            }
                            Ok(_) => {}
                            Err(e) => warn!(job_id, segment_id, "segment failed: {}", e),
                        }
                    });
                }
            });
            requeue = requeue_flag.load(std::sync::atomic::Ordering::Relaxed);
        }

        if requeue && !self.job_canceled(job_id)? {
            self.manager.backend().requeue_front(job_id)?;
        }
        self.manager.finalize_if_terminal(job_id)
    }

    fn job_canceled(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .manager
            .get_job(job_id)?
            .map(|job| job.is_canceled())
            .unwrap_or(true))
    }

    /// One segment through the claim/commit protocol
    fn process_segment(&self, job_id: &str, segment_id: &str) -> Result<SegmentPass> {
        let Some(job) = self.manager.get_job(job_id)? else {
            return Ok(SegmentPass::Skipped);
        };
        if job.is_canceled() {
            return Ok(SegmentPass::Skipped);
        }
        let Some(segment) = job.segment(segment_id) else {
            return Ok(SegmentPass::Skipped);
        };
        if segment.status.is_terminal() {
            return Ok(SegmentPass::Skipped);
        }

        // Cache hit short-circuits the claim entirely
        if let Some(path) = self.manager.cache().lookup(&segment.cache_key) {
            self.manager.backend().update_job(job_id, &mut |job| {
                let mut hit = false;
                if let Some(seg) = job.segment_mut(segment_id) {
                    if !seg.status.is_terminal() {
                        seg.status = SegmentStatus::Ready;
                        seg.path = Some(path.to_string_lossy().into_owned());
                        seg.clear_claim();
                        hit = true;
                    }
                }
                if hit {
                    job.cache_hit_count += 1;
                }
                job.settle_status();
            })?;
            return Ok(SegmentPass::Settled);
        }

        let stale_after = Duration::from_secs(self.manager.settings().segment_stale_seconds);
        let Some(token) =
            self.manager
                .backend()
                .claim_segment(job_id, segment_id, &self.worker_id, stale_after)?
        else {
            return Ok(SegmentPass::Skipped);
        };

        let Some(job) = self.manager.get_job(job_id)? else {
            return Ok(SegmentPass::Skipped);
        };
        let Some(segment) = job.segment(segment_id) else {
            return Ok(SegmentPass::Skipped);
        };
        if segment.attempts > 1 {
            self.manager.metrics().record_segment_retry();
        }

        self.run_claimed_segment(&job, segment_id, &token)
    }

    fn run_claimed_segment(
        &self,
        job: &JobRecord,
        segment_id: &str,
        token: &ClaimToken,
    ) -> Result<SegmentPass> {
        let job_id = job.job_id.clone();
        let segment = job
            .segment(segment_id)
            .ok_or_else(|| ServiceError::internal("claimed segment vanished"))?;
        let settings = self.manager.settings();
        let profile = &job.reading_profile;

        // Profile-driven rewrites happen before resolution
        let spoken_text = apply_reading_modes(&segment.text, profile);

        let resolve_result = self.manager.resolver().resolve_text(&spoken_text);
        let resolved = match resolve_result {
            Ok(resolved) => resolved,
            Err(e) => {
                // Fallback backend unavailable: terminal, not retryable
                warn!(job_id, segment_id, "resolver unavailable: {}", e);
                return self.commit_error(
                    &job_id,
                    segment_id,
                    token,
                    SegmentErrorCode::ResolverUnavailable,
                    e.to_string(),
                );
            }
        };
        let phonemes = if job.prefer_phonemes {
            resolved.phoneme_text.clone()
        } else {
            None
        };

        if self.job_canceled(&job_id)? {
            return Ok(SegmentPass::Skipped);
        }

        // Synthesis, with a one-shot quality-model fallback for known
        // capacity faults
        let mut effective_model = job.model_id.clone();
        let mut attempted_models = vec![job.model_id.clone()];
        let synth_start = Instant::now();
        let synth_result = self.synthesize_once(
            &job.model_id,
            job.voice_id.as_deref(),
            &spoken_text,
            phonemes.as_deref(),
            profile.rate,
        );
        let output = match synth_result {
            Ok(output) => output,
            Err(first_err) => {
                let quality = settings.model_id_quality.clone();
                if is_model_fallback_error(&first_err) && job.model_id != quality {
                    info!(job_id, segment_id, model_id = %job.model_id, "retrying on quality model: {}", first_err);
                    attempted_models.push(quality.clone());
                    match self.synthesize_once(
                        &quality,
                        job.voice_id.as_deref(),
                        &spoken_text,
                        phonemes.as_deref(),
                        profile.rate,
                    ) {
                        Ok(output) => {
                            effective_model = quality;
                            self.manager.metrics().record_fallback_usage();
                            output
                        }
                        Err(second_err) => {
                            return self.handle_synth_failure(
                                &job_id,
                                segment_id,
                                token,
                                segment.attempts,
                                format!("orig={}; fallback={}", first_err, second_err),
                                second_err.is_transient(),
                            );
                        }
                    }
                } else {
                    let transient = first_err.is_transient();
                    return self.handle_synth_failure(
                        &job_id,
                        segment_id,
                        token,
                        segment.attempts,
                        first_err.to_string(),
                        transient,
                    );
                }
            }
        };
        let synth_ms = synth_start.elapsed().as_secs_f64() * 1000.0;

        let mean = self.manager.metrics().synth_mean_ms();
        if mean > 0.0 && synth_ms > mean * 2.0 {
            warn!(job_id, segment_id, synth_ms, mean_ms = mean, "synthesis exceeded soft timeout");
            self.manager.metrics().record_soft_timeout();
        }
        self.manager.metrics().record_synth_ms(synth_ms);

        if self.job_canceled(&job_id)? {
            // The synthesized audio is discarded; cancellation is sticky
            return Ok(SegmentPass::Skipped);
        }

        // The fallback model changes the fingerprint, so recompute the key
        let cache_key = if effective_model == job.model_id {
            segment.cache_key.clone()
        } else {
            let canonical = crate::text::canonical_text(&segment.text);
            build_cache_key(&FingerprintInputs {
                normalized_text: &canonical,
                model_id: &effective_model,
                voice_id: job.voice_id.as_deref(),
                pack_versions: &job.dict_pack_versions,
                profile_json: &profile.canonical_json(),
                compiler_version: &settings.compiler_version,
                phoneme_mode: &settings.phoneme_mode,
            })
        };

        // Encode, with one re-encode retry before giving up
        let encode_start = Instant::now();
        let staged = self.manager.cache().stage_tmp(".ogg");
        let encode_result = self
            .manager
            .codec()
            .encode_ogg(&output.audio, &staged)
            .or_else(|first| {
                debug!(job_id, segment_id, "re-encoding after failure: {}", first);
                self.manager.codec().encode_ogg(&output.audio, &staged)
            });
        if let Err(e) = encode_result {
            return self.commit_error(
                &job_id,
                segment_id,
                token,
                SegmentErrorCode::CodecFailed,
                e.to_string(),
            );
        }
        let encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

        // Cache write gets one retry, then the segment errors
        let committed_path = match self.manager.cache().commit(&cache_key, &staged) {
            Ok(path) => path,
            Err(first) => {
                warn!(job_id, segment_id, "cache write failed, retrying: {}", first);
                match self.manager.cache().commit(&cache_key, &staged) {
                    Ok(path) => path,
                    Err(second) => {
                        return self.commit_error(
                            &job_id,
                            segment_id,
                            token,
                            SegmentErrorCode::CacheWriteFailed,
                            second.to_string(),
                        );
                    }
                }
            }
        };

        let fallback_used = effective_model != job.model_id;
        let outcome = self.manager.backend().commit_segment(
            &job_id,
            segment_id,
            token,
            &mut |seg| {
                seg.status = SegmentStatus::Ready;
                seg.cache_key = cache_key.clone();
                seg.path = Some(committed_path.to_string_lossy().into_owned());
                seg.error = None;
                seg.resolved_phonemes = phonemes.clone();
                seg.used_phonemes = output.used_phonemes;
                seg.resolve_source_counts = resolved.source_counts.clone();
                seg.timing_synth_ms = (synth_ms * 1000.0).round() / 1000.0;
                seg.timing_encode_ms = (encode_ms * 1000.0).round() / 1000.0;
                if fallback_used {
                    seg.attempted_models = attempted_models.clone();
                }
            },
        )?;
        match outcome {
            CommitOutcome::Committed => {
                self.manager.backend().update_job(&job_id, &mut |job| {
                    job.cache_miss_count += 1;
                })?;
                debug!(
                    job_id,
                    segment_id, synth_ms, encode_ms, "segment ready"
                );
                Ok(SegmentPass::Settled)
            }
            CommitOutcome::Rejected => {
                // Stale takeover or cancellation; the cached audio stays
                debug!(job_id, segment_id, "commit rejected, discarding result");
                Ok(SegmentPass::Skipped)
            }
        }
    }

    fn synthesize_once(
        &self,
        model_id: &str,
        voice_id: Option<&str>,
        text: &str,
        phonemes: Option<&str>,
        rate: f32,
    ) -> Result<crate::synth::SynthOutput> {
        let mut synth = self.manager.pool().acquire(model_id, voice_id)?;
        synth.synthesize(text, phonemes, rate)
    }

    fn handle_synth_failure(
        &self,
        job_id: &str,
        segment_id: &str,
        token: &ClaimToken,
        attempts: u32,
        message: String,
        transient: bool,
    ) -> Result<SegmentPass> {
        let max_retries = self.manager.settings().segment_max_retries;
        if !transient {
            return self.commit_error(
                job_id,
                segment_id,
                token,
                SegmentErrorCode::SynthPermanent,
                message,
            );
        }
        if attempts > max_retries {
            self.manager.metrics().record_retry_cap();
            return self.commit_error(
                job_id,
                segment_id,
                token,
                SegmentErrorCode::RetryCapExceeded,
                format!("retry cap exceeded: {}", message),
            );
        }
        warn!(job_id, segment_id, attempts, "transient synthesis failure, requeueing: {}", message);
        self.manager
            .backend()
            .release_claim(job_id, segment_id, token)?;
        Ok(SegmentPass::Requeue)
    }

    fn commit_error(
        &self,
        job_id: &str,
        segment_id: &str,
        token: &ClaimToken,
        code: SegmentErrorCode,
        message: String,
    ) -> Result<SegmentPass> {
        let short: String = message.lines().next().unwrap_or("").chars().take(160).collect();
        self.manager
            .backend()
            .commit_segment(job_id, segment_id, token, &mut |seg| {
                seg.status = SegmentStatus::Error;
                seg.error = Some(super::types::SegmentError {
                    code,
                    message: short.clone(),
                });
            })?;
        Ok(SegmentPass::Settled)
    }
}

fn is_model_fallback_error(err: &ServiceError) -> bool {
    let message = err.to_string().to_lowercase();
    MODEL_FALLBACK_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
