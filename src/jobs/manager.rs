//! Job manager
//!
//! Owns admission, cancellation, and the service-level snapshot. Everything
//! stateful is injected: the store backend, resolver, cache, synthesizer
//! pool, and codec. Workers and the merge pipeline share this manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{build_cache_key, FingerprintInputs, SegmentCache};
use crate::config::Settings;
use crate::core::error::{AdmissionErrorKind, Result, SegmentErrorCode, ServiceError};
use crate::core::metrics::ServiceMetrics;
use crate::dict::Resolver;
use crate::synth::{AudioCodec, SynthesizerPool};
use crate::text::{canonical_text, chunk_text, normalize_text, ChunkOptions};

use super::store::JobBackend;
use super::types::{now_ts, JobRecord, JobRequest, JobStatus, SegmentError, SegmentRecord, SegmentStatus};

/// Operational snapshot for the admin endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub workers_online: usize,
    pub queue_len: usize,
    pub active_jobs: i64,
    pub retry_counts: RetryCounts,
    pub fallback_model_usage: u64,
    pub merge_lock_contention: MergeLockContention,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryCounts {
    pub segment_retries: u64,
    pub retry_caps: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeLockContention {
    pub wait_count: u64,
    pub wait_total_ms: f64,
    pub wait_max_ms: f64,
}

/// Central coordinator shared by the API and the workers
pub struct JobManager {
    settings: Arc<Settings>,
    backend: Arc<dyn JobBackend>,
    resolver: Arc<Resolver>,
    cache: Arc<SegmentCache>,
    pool: Arc<SynthesizerPool>,
    codec: Arc<dyn AudioCodec>,
    metrics: Arc<ServiceMetrics>,
}

impl JobManager {
    pub fn new(
        settings: Arc<Settings>,
        backend: Arc<dyn JobBackend>,
        resolver: Arc<Resolver>,
        cache: Arc<SegmentCache>,
        pool: Arc<SynthesizerPool>,
        codec: Arc<dyn AudioCodec>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            settings,
            backend,
            resolver,
            cache,
            pool,
            codec,
            metrics,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<SynthesizerPool> {
        &self.pool
    }

    pub fn codec(&self) -> &Arc<dyn AudioCodec> {
        &self.codec
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    fn jobs_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.jobs_ttl_seconds)
    }

    /// Admit a job: validate, chunk, fingerprint, persist, enqueue
    pub fn submit(
        &self,
        request: JobRequest,
        idempotency_key: Option<&str>,
    ) -> Result<JobRecord> {
        if let Some(key) = idempotency_key {
            if let Some(job_id) = self.backend.idempotency_get(key)? {
                if let Some(job) = self.backend.get_job(&job_id)? {
                    info!(job_id, "idempotency replay");
                    return Ok(job);
                }
            }
        }

        if request.text.trim().is_empty() {
            return Err(ServiceError::admission(
                AdmissionErrorKind::InvalidText,
                "text is empty",
            ));
        }
        if !self.settings.model_allowlist.contains(&request.model_id) {
            return Err(ServiceError::admission(
                AdmissionErrorKind::ModelDisallowed,
                format!(
                    "model_id '{}' not allowed; allowed: {}",
                    request.model_id,
                    self.settings.model_allowlist.join(", ")
                ),
            ));
        }
        let text_chars = request.text.chars().count();
        if text_chars > self.settings.max_text_chars {
            return Err(ServiceError::admission(
                AdmissionErrorKind::TooLarge,
                format!(
                    "text too long: {} > {}",
                    text_chars, self.settings.max_text_chars
                ),
            ));
        }
        if self.settings.require_workers && self.backend.workers_online()? == 0 {
            return Err(ServiceError::admission(
                AdmissionErrorKind::NoWorkers,
                "no workers online",
            ));
        }

        let normalized = normalize_text(&request.text);
        if normalized.is_empty() {
            return Err(ServiceError::admission(
                AdmissionErrorKind::InvalidText,
                "text is empty after normalization",
            ));
        }
        let chunks = chunk_text(
            &normalized,
            &ChunkOptions {
                target_chars: self.settings.chunk_target_chars,
                max_chars: self.settings.chunk_max_chars,
                min_chars: self.settings.min_segment_chars,
            },
        );
        if chunks.is_empty() {
            return Err(ServiceError::admission(
                AdmissionErrorKind::InvalidText,
                "no speakable segments",
            ));
        }
        if chunks.len() > self.settings.max_segments {
            return Err(ServiceError::admission(
                AdmissionErrorKind::TooLarge,
                format!(
                    "too many segments: {} > {}",
                    chunks.len(),
                    self.settings.max_segments
                ),
            ));
        }

        let profile = request.reading_profile.clamped();
        let profile_json = profile.canonical_json();
        let dict_versions = self.resolver.dict_versions();

        let job_id = Uuid::new_v4().simple().to_string();
        let mut cache_hits = 0u32;
        let segments: Vec<SegmentRecord> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let canonical = canonical_text(&text);
                let cache_key = build_cache_key(&FingerprintInputs {
                    normalized_text: &canonical,
                    model_id: &request.model_id,
                    voice_id: request.voice_id.as_deref(),
                    pack_versions: &dict_versions,
                    profile_json: &profile_json,
                    compiler_version: &self.settings.compiler_version,
                    phoneme_mode: &self.settings.phoneme_mode,
                });
                let mut segment = SegmentRecord::new(
                    Uuid::new_v4().simple().to_string(),
                    index,
                    text,
                    cache_key,
                );
                if let Some(path) = self.cache.lookup(&segment.cache_key) {
                    segment.status = SegmentStatus::Ready;
                    segment.path = Some(path.to_string_lossy().into_owned());
                    cache_hits += 1;
                }
                segment
            })
            .collect();

        if !self
            .backend
            .try_acquire_active_slot(&job_id, self.settings.max_active_jobs, self.jobs_ttl())?
        {
            return Err(ServiceError::admission(
                AdmissionErrorKind::Capacity,
                "too many active jobs",
            ));
        }

        let mut job = JobRecord {
            job_id: job_id.clone(),
            status: JobStatus::Queued,
            created_at: now_ts(),
            updated_at: now_ts(),
            model_id: request.model_id,
            voice_id: request.voice_id,
            reading_profile: profile,
            prefer_phonemes: request.prefer_phonemes,
            dict_pack_versions: dict_versions,
            segments,
            cache_hit_count: cache_hits,
            cache_miss_count: 0,
            canceled_at: None,
            active_released: false,
        };
        // A fully cache-hit job is complete at admission
        job.settle_status();
        if job.status.is_terminal() {
            job.active_released = true;
        }

        let persist = (|| -> Result<()> {
            self.backend.insert_job(&job)?;
            if !job.status.is_terminal() {
                self.backend.enqueue(&job_id)?;
            } else {
                self.backend.release_active_slot(&job_id)?;
            }
            Ok(())
        })();
        if let Err(e) = persist {
            let _ = self.backend.release_active_slot(&job_id);
            return Err(e);
        }

        if let Some(key) = idempotency_key {
            self.backend.idempotency_put(key, &job_id, self.jobs_ttl())?;
        }

        info!(
            job_id,
            segments = job.segments.len(),
            cache_hits,
            status = ?job.status,
            "job admitted"
        );
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.backend.get_job(job_id)
    }

    /// Cancel a job: sticky, observed by workers at every checkpoint
    pub fn cancel(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut released = false;
        let job = self.backend.update_job(job_id, &mut |job| {
            released = false;
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Canceled;
            job.canceled_at = Some(now_ts());
            for segment in &mut job.segments {
                if segment.status.is_terminal() {
                    continue;
                }
                segment.status = SegmentStatus::Canceled;
                segment.error = Some(SegmentError {
                    code: SegmentErrorCode::Canceled,
                    message: "canceled".to_string(),
                });
                segment.clear_claim();
            }
            if !job.active_released {
                job.active_released = true;
                released = true;
            }
        })?;
        if released {
            self.backend.release_active_slot(job_id)?;
        }
        if job.is_some() {
            info!(job_id, "job canceled");
        }
        Ok(job)
    }

    /// Release the active slot and record job metrics exactly once
    pub fn finalize_if_terminal(&self, job_id: &str) -> Result<()> {
        let mut released = false;
        let job = self.backend.update_job(job_id, &mut |job| {
            released = false;
            if job.status.is_terminal() && !job.active_released {
                job.active_released = true;
                released = true;
            }
        })?;
        if released {
            self.backend.release_active_slot(job_id)?;
            if let Some(job) = job {
                let progress = job.progress();
                let chars: usize = job.segments.iter().map(|s| s.text.chars().count()).sum();
                self.metrics.record_job(
                    progress.segments_total as u64,
                    chars as u64,
                    (now_ts() - job.created_at) * 1000.0,
                    job.cache_hit_count as u64,
                    job.cache_miss_count as u64,
                    progress.segments_error as u64,
                );
                info!(
                    job_id,
                    status = ?job.status,
                    ready = progress.segments_ready,
                    errors = progress.segments_error,
                    "job finished"
                );
            }
        }
        Ok(())
    }

    pub fn status_snapshot(&self) -> Result<StatusSnapshot> {
        let metrics = self.metrics.snapshot();
        Ok(StatusSnapshot {
            workers_online: self.backend.workers_online()?,
            queue_len: self.backend.queue_len()?,
            active_jobs: self.backend.active_jobs()?,
            retry_counts: RetryCounts {
                segment_retries: metrics.segment_retries,
                retry_caps: metrics.segment_retry_caps,
            },
            fallback_model_usage: metrics.fallback_segments,
            merge_lock_contention: MergeLockContention {
                wait_count: metrics.merge_lock_waits,
                wait_total_ms: (metrics.merge_lock_wait_ms * 1000.0).round() / 1000.0,
                wait_max_ms: (metrics.merge_lock_wait_max_ms * 1000.0).round() / 1000.0,
            },
        })
    }

    /// Background maintenance: TTL sweep, cache eviction, learner flush
    pub fn spawn_maintenance(manager: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(30));
                match manager.backend.sweep_expired(manager.jobs_ttl()) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "expired jobs swept"),
                    Err(e) => warn!("job sweep failed: {}", e),
                }
                manager.cache.evict_if_needed();
                if let Some(learner) = manager.resolver.learner() {
                    if let Err(e) = learner.flush() {
                        warn!("auto-learn flush failed: {}", e);
                    }
                }
            })
            .expect("spawn maintenance thread")
    }

    /// Warm the default model's synthesizer pool
    pub fn warmup_default_model(&self) {
        match self.pool.warmup(&self.settings.model_id) {
            Ok(()) => info!(model_id = %self.settings.model_id, "warmup complete"),
            Err(e) => warn!("warmup failed: {}", e),
        }
    }

    /// Pack versions as seen by new jobs (admin/debug surface)
    pub fn dict_versions(&self) -> HashMap<String, String> {
        self.resolver.dict_versions()
    }
}
