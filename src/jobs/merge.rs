//! Merged-audio pipeline
//!
//! Produces one OGG per finished job under a per-job lock. Output is keyed
//! by a fingerprint over the ordered segment cache keys and the pause
//! scale, so an unchanged job never re-merges. Inter-segment silence
//! follows the terminal punctuation of the preceding segment; errored
//! segments are skipped with a short stand-in silence.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cache::build_merge_fingerprint;
use crate::core::error::{Result, ServiceError};
use crate::synth::ConcatPart;
use crate::text::{QuoteMode, ReadingProfile};

use super::manager::JobManager;
use super::types::{JobRecord, SegmentStatus};

/// Base silence after a sentence-final segment
const PAUSE_LONG_MS: u64 = 350;
/// Base silence after a clause-final segment; also the stand-in for errors
const PAUSE_SHORT_MS: u64 = 150;
/// Base silence everywhere else
const PAUSE_MICRO_MS: u64 = 60;

const LOCK_TTL: Duration = Duration::from_secs(60);
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Produce (or reuse) the merged OGG for a terminal job
pub fn ensure_merged(manager: &JobManager, job: &JobRecord) -> Result<PathBuf> {
    let ready: Vec<_> = job
        .segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Ready && s.path.is_some())
        .collect();
    if ready.is_empty() {
        return Err(ServiceError::internal("no ready segments to merge"));
    }

    let cache_keys: Vec<String> = ready.iter().map(|s| s.cache_key.clone()).collect();
    let fingerprint = build_merge_fingerprint(&cache_keys, job.reading_profile.pause_scale);
    let target = manager.cache().merged_path(&fingerprint);

    // Content-addressed output: an existing file is always valid
    if file_nonempty(&target) {
        debug!(job_id = %job.job_id, fingerprint, "merge reuse");
        return Ok(target);
    }

    acquire_merge_lock(manager, &job.job_id)?;
    let result = merge_under_lock(manager, job, &fingerprint, cache_keys);
    manager.backend().release_merge_lock(&job.job_id)?;
    result
}

fn acquire_merge_lock(manager: &JobManager, job_id: &str) -> Result<()> {
    let budget = Duration::from_secs(manager.settings().merge_lock_wait_seconds);
    let start = Instant::now();
    let mut contended = false;
    loop {
        if manager.backend().try_acquire_merge_lock(job_id, LOCK_TTL)? {
            // Only acquisitions that actually waited count as contention
            if contended {
                manager
                    .metrics()
                    .record_merge_lock_wait(start.elapsed().as_secs_f64() * 1000.0);
            }
            return Ok(());
        }
        contended = true;
        if start.elapsed() >= budget {
            let waited_ms = start.elapsed().as_millis() as u64;
            manager
                .metrics()
                .record_merge_lock_wait(waited_ms as f64);
            return Err(ServiceError::MergeLockTimeout { waited_ms });
        }
        std::thread::sleep(LOCK_RETRY);
    }
}

fn merge_under_lock(
    manager: &JobManager,
    job: &JobRecord,
    fingerprint: &str,
    cache_keys: Vec<String>,
) -> Result<PathBuf> {
    let target = manager.cache().merged_path(fingerprint);
    // Another caller may have merged while this one waited on the lock
    if file_nonempty(&target) {
        return Ok(target);
    }

    let parts = build_parts(job, &job.reading_profile);
    let staged = manager.cache().stage_tmp(".ogg");
    manager.codec().concat_ogg(&parts, &staged)?;
    let out = manager
        .cache()
        .commit_merged(fingerprint, &staged, cache_keys)?;
    info!(job_id = %job.job_id, fingerprint, parts = parts.len(), "merged audio written");
    Ok(out)
}

/// Assemble the concat plan: ready audio in index order with pause silences,
/// errored segments replaced by a short silence
fn build_parts(job: &JobRecord, profile: &ReadingProfile) -> Vec<ConcatPart> {
    let mut parts: Vec<ConcatPart> = Vec::new();
    let mut previous_text: Option<&str> = None;
    for segment in &job.segments {
        match segment.status {
            SegmentStatus::Ready => {
                let Some(path) = &segment.path else { continue };
                if parts.is_empty() {
                    parts.push(ConcatPart::Audio(PathBuf::from(path)));
                } else {
                    let base = previous_text.map(pause_class_ms).unwrap_or(PAUSE_MICRO_MS);
                    parts.push(ConcatPart::Silence {
                        millis: scale_pause(base, previous_text, profile),
                    });
                    parts.push(ConcatPart::Audio(PathBuf::from(path)));
                }
                previous_text = Some(segment.text.as_str());
            }
            SegmentStatus::Error => {
                // Skipped content still gets a beat so the narration flows
                if !parts.is_empty() {
                    parts.push(ConcatPart::Silence {
                        millis: scale_pause(PAUSE_SHORT_MS, None, profile),
                    });
                }
                previous_text = None;
            }
            _ => {}
        }
    }
    parts
}

/// Base pause class for the text preceding the gap
fn pause_class_ms(text: &str) -> u64 {
    let trimmed = text.trim_end();
    let last_meaningful = trimmed
        .chars()
        .rev()
        .find(|c| !matches!(c, '"' | '\'' | ')' | ']'));
    match last_meaningful {
        Some('.') | Some('!') | Some('?') | Some('\u{2026}') => PAUSE_LONG_MS,
        Some(',') | Some(';') | Some(':') => PAUSE_SHORT_MS,
        _ => PAUSE_MICRO_MS,
    }
}

/// Apply pause scaling and the tight quote mode
fn scale_pause(base_ms: u64, previous_text: Option<&str>, profile: &ReadingProfile) -> u64 {
    let mut base = base_ms;
    if profile.quote_mode == QuoteMode::Tight {
        let ends_in_quote = previous_text
            .map(|t| t.trim_end().ends_with(['"', '\'']))
            .unwrap_or(false);
        if ends_in_quote {
            // Dialogue keeps moving: cap the pause at the short class
            base = base.min(PAUSE_SHORT_MS);
        }
    }
    (base as f64 * profile.pause_scale as f64).round() as u64
}

fn file_nonempty(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
