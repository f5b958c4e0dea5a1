//! Job and segment records
//!
//! The job record is the unit of persistence: it owns its ordered segments
//! and every counter the manifest exposes. Segments reference cache entries
//! by key only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::SegmentErrorCode;
use crate::text::ReadingProfile;

/// Segment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Queued,
    InProgress,
    Ready,
    Error,
    Canceled,
}

impl SegmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SegmentStatus::Ready | SegmentStatus::Error | SegmentStatus::Canceled
        )
    }
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    CompleteWithErrors,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete
                | JobStatus::CompleteWithErrors
                | JobStatus::Canceled
                | JobStatus::Failed
        )
    }

    /// Terminal and mergeable (at least partially synthesized)
    pub fn is_terminal_complete(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::CompleteWithErrors)
    }
}

/// Terminal error recorded on a segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentError {
    pub code: SegmentErrorCode,
    pub message: String,
}

/// One synthesis unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_id: String,
    pub index: usize,
    pub text: String,
    pub status: SegmentStatus,
    pub cache_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SegmentError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_phonemes: Option<String>,
    #[serde(default)]
    pub used_phonemes: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resolve_source_counts: HashMap<String, u32>,
    #[serde(default)]
    pub timing_synth_ms: f64,
    #[serde(default)]
    pub timing_encode_ms: f64,
    #[serde(default)]
    pub attempts: u32,
    /// Unix seconds of the live claim, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_owner: Option<String>,
    /// Bumped on every successful claim; commits must present the epoch
    #[serde(default)]
    pub claim_epoch: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempted_models: Vec<String>,
}

impl SegmentRecord {
    pub fn new(segment_id: String, index: usize, text: String, cache_key: String) -> Self {
        Self {
            segment_id,
            index,
            text,
            status: SegmentStatus::Queued,
            cache_key,
            path: None,
            error: None,
            resolved_phonemes: None,
            used_phonemes: false,
            resolve_source_counts: HashMap::new(),
            timing_synth_ms: 0.0,
            timing_encode_ms: 0.0,
            attempts: 0,
            claimed_at: None,
            claim_owner: None,
            claim_epoch: 0,
            attempted_models: Vec::new(),
        }
    }

    /// Clear claim bookkeeping (on commit or release)
    pub fn clear_claim(&mut self) {
        self.claimed_at = None;
        self.claim_owner = None;
    }
}

/// Derived progress counters exposed in manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub segments_total: usize,
    pub segments_ready: usize,
    pub segments_error: usize,
    pub segments_in_progress: usize,
    pub progress_pct: f64,
}

/// A submitted job and its segments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: f64,
    pub updated_at: f64,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub reading_profile: ReadingProfile,
    pub prefer_phonemes: bool,
    /// Pack versions frozen at admission
    pub dict_pack_versions: HashMap<String, String>,
    pub segments: Vec<SegmentRecord>,
    #[serde(default)]
    pub cache_hit_count: u32,
    #[serde(default)]
    pub cache_miss_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<f64>,
    /// The active-jobs slot has been given back
    #[serde(default)]
    pub active_released: bool,
}

impl JobRecord {
    pub fn progress(&self) -> ProgressSummary {
        let total = self.segments.len();
        let ready = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Ready)
            .count();
        let error = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Error)
            .count();
        let in_progress = total.saturating_sub(ready).saturating_sub(error);
        ProgressSummary {
            segments_total: total,
            segments_ready: ready,
            segments_error: error,
            segments_in_progress: in_progress,
            progress_pct: if total > 0 {
                (ready as f64 / total as f64 * 100.0 * 1000.0).round() / 1000.0
            } else {
                0.0
            },
        }
    }

    pub fn segment(&self, segment_id: &str) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    pub fn segment_mut(&mut self, segment_id: &str) -> Option<&mut SegmentRecord> {
        self.segments.iter_mut().find(|s| s.segment_id == segment_id)
    }

    pub fn is_canceled(&self) -> bool {
        self.status == JobStatus::Canceled
    }

    /// Derive the terminal job status once every segment is terminal.
    /// Returns true when the status changed.
    pub fn settle_status(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !self.segments.iter().all(|s| s.status.is_terminal()) {
            return false;
        }
        let any_error = self
            .segments
            .iter()
            .any(|s| s.status == SegmentStatus::Error);
        self.status = if any_error {
            JobStatus::CompleteWithErrors
        } else {
            JobStatus::Complete
        };
        true
    }
}

/// Admission request after model alias resolution
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub text: String,
    pub model_id: String,
    pub voice_id: Option<String>,
    pub reading_profile: ReadingProfile,
    pub prefer_phonemes: bool,
}

/// Exclusive right to process one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub worker_id: String,
    pub epoch: u64,
}

impl ClaimToken {
    /// Wire form stored in the distributed claim key
    pub fn encode(&self) -> String {
        format!("{}:{}", self.worker_id, self.epoch)
    }
}

/// Outcome of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The claim was superseded or the job is gone; the result is discarded
    Rejected,
}

/// Current unix time in fractional seconds
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_segments(statuses: &[SegmentStatus]) -> JobRecord {
        let segments = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut seg = SegmentRecord::new(
                    format!("seg{}", i),
                    i,
                    format!("text {}", i),
                    format!("key{}", i),
                );
                seg.status = *status;
                seg
            })
            .collect();
        JobRecord {
            job_id: "job1".to_string(),
            status: JobStatus::Running,
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
    fn test_progress_counters() {
        let job = job_with_segments(&[
            SegmentStatus::Ready,
            SegmentStatus::Error,
            SegmentStatus::Queued,
            SegmentStatus::Ready,
        ]);
        let progress = job.progress();
        assert_eq!(progress.segments_total, 4);
        assert_eq!(progress.segments_ready, 2);
        assert_eq!(progress.segments_error, 1);
        assert_eq!(progress.segments_in_progress, 1);
        assert_eq!(progress.progress_pct, 50.0);
    }

    #[test]
    fn test_settle_all_ready_is_complete() {
        let mut job = job_with_segments(&[SegmentStatus::Ready, SegmentStatus::Ready]);
        assert!(job.settle_status());
        assert_eq!(job.status, JobStatus::Complete);
    }

    #[test]
    fn test_settle_with_error_is_complete_with_errors() {
        let mut job = job_with_segments(&[SegmentStatus::Ready, SegmentStatus::Error]);
        assert!(job.settle_status());
        assert_eq!(job.status, JobStatus::CompleteWithErrors);
    }

    #[test]
    fn test_settle_waits_for_nonterminal_segments() {
        let mut job = job_with_segments(&[SegmentStatus::Ready, SegmentStatus::InProgress]);
        assert!(!job.settle_status());
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn test_settle_keeps_canceled_sticky() {
        let mut job = job_with_segments(&[SegmentStatus::Canceled, SegmentStatus::Canceled]);
        job.status = JobStatus::Canceled;
        assert!(!job.settle_status());
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn test_claim_token_encoding() {
        let token = ClaimToken {
            worker_id: "worker-7".to_string(),
            epoch: 3,
        };
        assert_eq!(token.encode(), "worker-7:3");
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::CompleteWithErrors).unwrap(),
            "\"complete_with_errors\""
        );
        assert_eq!(
            serde_json::to_string(&SegmentStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
