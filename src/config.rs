//! Service configuration
//!
//! One `Settings` struct covering the full configuration surface: model
//! selection, dictionary/cache/job directories, worker topology, admission
//! limits, and the Redis URL for distributed mode. Loadable from YAML with
//! per-field defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::error::{Result, ServiceError};

/// Process role: API front-end, worker, or both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// API + worker in one process
    #[default]
    All,
    /// HTTP API only
    Api,
    /// Segment worker only
    Worker,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Process role
    #[serde(default)]
    pub role: Role,

    /// Default model id
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Model resolved by the "default" alias
    #[serde(default)]
    pub model_id_default: Option<String>,

    /// Model resolved by the "quality" alias; also the synthesis fallback
    #[serde(default = "default_model_id_quality")]
    pub model_id_quality: String,

    /// Models accepted at admission
    #[serde(default)]
    pub model_allowlist: Vec<String>,

    /// Optional API key required on mutating endpoints
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-client token bucket refill (requests per minute, 0 = unlimited)
    #[serde(default = "default_rate_limit_per_min")]
    pub rate_limit_per_min: u32,

    /// Segment cache size budget in megabytes
    #[serde(default = "default_cache_max_mb")]
    pub cache_max_mb: u64,

    /// Dictionary pack directory
    #[serde(default = "default_dict_dir")]
    pub dict_dir: PathBuf,

    /// Compiled pack output directory
    #[serde(default = "default_compiled_dir")]
    pub compiled_dir: PathBuf,

    /// Cache root (segments/, merged/, tmp/ live below)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Job journal directory (single-process mode)
    #[serde(default)]
    pub jobs_dir: Option<PathBuf>,

    /// Segment audio directory; defaults below cache_dir
    #[serde(default)]
    pub segments_dir: Option<PathBuf>,

    /// Phoneme output mode of the fallback phonemizer
    #[serde(default = "default_phoneme_mode")]
    pub phoneme_mode: String,

    /// Enable the auto-learn pack
    #[serde(default = "default_true")]
    pub autolearn: bool,

    /// Learn fallback-resolved tokens automatically
    #[serde(default)]
    pub autolearn_on_miss: bool,

    /// Auto-learn pack file
    #[serde(default)]
    pub autolearn_path: Option<PathBuf>,

    /// Seconds between auto-learn flushes
    #[serde(default = "default_autolearn_flush_seconds")]
    pub autolearn_flush_seconds: u64,

    /// Minimum token length for automatic learning
    #[serde(default = "default_autolearn_min_len")]
    pub autolearn_min_len: usize,

    /// Redis URL; set to enable distributed mode
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-worker segment thread pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Worker loop count
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,

    /// Concurrent segments per job
    #[serde(default = "default_one")]
    pub max_concurrent_segments: usize,

    /// Trailing segments below this length merge into the previous one
    #[serde(default = "default_min_segment_chars")]
    pub min_segment_chars: usize,

    /// Admission limit on text length
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Admission limit on segment count
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,

    /// Admission limit on concurrently active jobs
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs: usize,

    /// Reject admission when no worker heartbeat is live
    #[serde(default)]
    pub require_workers: bool,

    /// Seconds a job outlives its terminal state
    #[serde(default = "default_jobs_ttl_seconds")]
    pub jobs_ttl_seconds: u64,

    /// Transient-failure retries per segment
    #[serde(default = "default_segment_max_retries")]
    pub segment_max_retries: u32,

    /// Seconds before an unfinished claim is reclaimable
    #[serde(default = "default_segment_stale_seconds")]
    pub segment_stale_seconds: u64,

    /// Preferred segment length
    #[serde(default = "default_chunk_target_chars")]
    pub chunk_target_chars: usize,

    /// Hard segment length bound
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// GPU flag passed through to the synthesizer factory
    #[serde(default)]
    pub gpu: bool,

    /// Pre-load the default model at startup
    #[serde(default)]
    pub warmup_default: bool,

    /// Compiler version mixed into cache keys
    #[serde(default = "default_compiler_version")]
    pub compiler_version: String,

    /// Synthesis engine command (binds the Synthesizer capability)
    #[serde(default)]
    pub synth_command: Option<String>,

    /// Flag advertising phoneme input support on the engine command
    #[serde(default)]
    pub synth_phoneme_flag: Option<String>,

    /// Phonemizer command for the fallback path
    #[serde(default = "default_espeak_command")]
    pub espeak_command: String,

    /// ffmpeg command for the codec
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,

    /// Merge lock wait budget in seconds
    #[serde(default = "default_merge_lock_wait_seconds")]
    pub merge_lock_wait_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_model_id() -> String {
    "en/ljspeech/tacotron2-ph".to_string()
}

fn default_model_id_quality() -> String {
    "en/ljspeech/vits".to_string()
}

fn default_rate_limit_per_min() -> u32 {
    120
}

fn default_cache_max_mb() -> u64 {
    512
}

fn default_dict_dir() -> PathBuf {
    PathBuf::from("data/dicts/packs")
}

fn default_compiled_dir() -> PathBuf {
    PathBuf::from("data/dicts/compiled")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_phoneme_mode() -> String {
    "espeak".to_string()
}

fn default_true() -> bool {
    true
}

fn default_autolearn_flush_seconds() -> u64 {
    10
}

fn default_autolearn_min_len() -> usize {
    3
}

fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.min(4)
}

fn default_job_workers() -> usize {
    1
}

fn default_one() -> usize {
    1
}

fn default_min_segment_chars() -> usize {
    60
}

fn default_max_text_chars() -> usize {
    20_000
}

fn default_max_segments() -> usize {
    120
}

fn default_max_active_jobs() -> usize {
    20
}

fn default_jobs_ttl_seconds() -> u64 {
    86_400
}

fn default_segment_max_retries() -> u32 {
    2
}

fn default_segment_stale_seconds() -> u64 {
    300
}

fn default_chunk_target_chars() -> usize {
    300
}

fn default_chunk_max_chars() -> usize {
    500
}

fn default_compiler_version() -> String {
    "1.0.0".to_string()
}

fn default_espeak_command() -> String {
    "espeak-ng".to_string()
}

fn default_ffmpeg_command() -> String {
    "ffmpeg".to_string()
}

fn default_merge_lock_wait_seconds() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty settings deserialize")
    }
}

impl Settings {
    /// Load from a YAML file, then validate
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ServiceError::Config {
            message: format!("cannot read config: {}", e),
            path: Some(path.as_ref().to_path_buf()),
        })?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|e| ServiceError::Config {
                message: format!("invalid config: {}", e),
                path: Some(path.as_ref().to_path_buf()),
            })?;
        settings.validated()
    }

    /// Clamp and cross-check fields; fill the model allowlist if empty
    pub fn validated(mut self) -> Result<Self> {
        if self.model_allowlist.is_empty() {
            self.model_allowlist = vec![self.model_id.clone(), self.model_id_quality.clone()];
        }
        if !self.model_allowlist.contains(&self.model_id_quality) {
            return Err(ServiceError::Config {
                message: "model_id_quality must be in model_allowlist".to_string(),
                path: None,
            });
        }
        if let Some(default_id) = &self.model_id_default {
            if !self.model_allowlist.contains(default_id) {
                self.model_id_default = None;
            }
        }
        self.workers = self.workers.max(1);
        self.job_workers = self.job_workers.max(1);
        self.max_concurrent_segments = self.max_concurrent_segments.max(1);
        self.max_text_chars = self.max_text_chars.max(1);
        self.max_segments = self.max_segments.max(1);
        self.max_active_jobs = self.max_active_jobs.max(1);
        self.min_segment_chars = self.min_segment_chars.max(1);
        self.segment_stale_seconds = self.segment_stale_seconds.max(1);
        self.chunk_target_chars = self.chunk_target_chars.max(1);
        if self.chunk_max_chars < self.chunk_target_chars {
            self.chunk_max_chars = self.chunk_target_chars;
        }
        self.autolearn_flush_seconds = self.autolearn_flush_seconds.max(1);
        // Single-letter tokens ("a", "I") are never worth a dictionary entry
        self.autolearn_min_len = self.autolearn_min_len.max(2);
        Ok(self)
    }

    /// Model resolved by the "default" alias
    pub fn resolved_default_model(&self) -> &str {
        self.model_id_default.as_deref().unwrap_or(&self.model_id)
    }

    /// Job journal directory
    pub fn jobs_dir(&self) -> PathBuf {
        self.jobs_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("jobs"))
    }

    /// Segment audio directory
    pub fn segments_dir(&self) -> PathBuf {
        self.segments_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("segments"))
    }

    /// Merged audio directory
    pub fn merged_dir(&self) -> PathBuf {
        self.cache_dir.join("merged")
    }

    /// Scratch directory for encoders
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// Auto-learn pack file location
    pub fn autolearn_path(&self) -> PathBuf {
        self.autolearn_path
            .clone()
            .unwrap_or_else(|| self.dict_dir.join("auto_learn.json"))
    }

    /// Create every directory the service writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.dict_dir.clone(),
            self.compiled_dir.clone(),
            self.cache_dir.clone(),
            self.jobs_dir(),
            self.segments_dir(),
            self.merged_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| ServiceError::Io {
                message: format!("cannot create {}: {}", dir.display(), e),
                path: Some(dir.clone()),
            })?;
        }
        if let Some(parent) = self.autolearn_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.chunk_target_chars, 300);
        assert_eq!(settings.chunk_max_chars, 500);
        assert_eq!(settings.min_segment_chars, 60);
        assert_eq!(settings.max_segments, 120);
        assert_eq!(settings.max_active_jobs, 20);
        assert_eq!(settings.segment_max_retries, 2);
        assert_eq!(settings.segment_stale_seconds, 300);
        assert_eq!(settings.jobs_ttl_seconds, 86_400);
        assert_eq!(settings.phoneme_mode, "espeak");
        assert!(settings.autolearn);
        assert!(!settings.autolearn_on_miss);
    }

    #[test]
    fn test_validated_fills_allowlist() {
        let settings = Settings::default().validated().unwrap();
        assert!(settings.model_allowlist.contains(&settings.model_id));
        assert!(settings
            .model_allowlist
            .contains(&settings.model_id_quality));
    }

    #[test]
    fn test_validated_rejects_quality_outside_allowlist() {
        let mut settings = Settings::default();
        settings.model_allowlist = vec!["only-this".to_string()];
        assert!(settings.validated().is_err());
    }

    #[test]
    fn test_autolearn_min_len_floor() {
        let mut settings = Settings::default();
        settings.autolearn_min_len = 1;
        let settings = settings.validated().unwrap();
        assert_eq!(settings.autolearn_min_len, 2);

        let mut settings = Settings::default();
        settings.autolearn_min_len = 5;
        let settings = settings.validated().unwrap();
        assert_eq!(settings.autolearn_min_len, 5);
    }

    #[test]
    fn test_chunk_max_clamped_to_target() {
        let mut settings = Settings::default();
        settings.chunk_target_chars = 400;
        settings.chunk_max_chars = 100;
        let settings = settings.validated().unwrap();
        assert_eq!(settings.chunk_max_chars, 400);
    }

    #[test]
    fn test_derived_dirs() {
        let settings = Settings::default();
        assert!(settings.segments_dir().ends_with("segments"));
        assert!(settings.merged_dir().ends_with("merged"));
        assert!(settings.jobs_dir().ends_with("jobs"));
        assert!(settings.autolearn_path().ends_with("auto_learn.json"));
    }
}
