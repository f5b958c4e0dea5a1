//! Content-addressed segment cache
//!
//! Segment audio is cached under a deterministic fingerprint of every input
//! that influences the audio. Writes go through a temp file and rename, so
//! readers never observe partial files. Eviction is LRU by access time and
//! runs when the cache exceeds its size budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::error::{Result, ServiceError};

/// Everything that feeds a segment cache key
#[derive(Debug, Clone)]
pub struct FingerprintInputs<'a> {
    pub normalized_text: &'a str,
    pub model_id: &'a str,
    pub voice_id: Option<&'a str>,
    pub pack_versions: &'a HashMap<String, String>,
    pub profile_json: &'a str,
    pub compiler_version: &'a str,
    pub phoneme_mode: &'a str,
}

/// Compute the segment cache key: a SHA-256 over NUL-joined inputs with
/// pack versions sorted as `name:version` and joined by `|`
pub fn build_cache_key(inputs: &FingerprintInputs<'_>) -> String {
    let mut versions: Vec<String> = inputs
        .pack_versions
        .iter()
        .map(|(name, version)| format!("{}:{}", name, version))
        .collect();
    versions.sort();

    let mut hasher = Sha256::new();
    hasher.update(inputs.normalized_text.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.model_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.voice_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(versions.join("|").as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.profile_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.compiler_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.phoneme_mode.as_bytes());
    hex_digest(hasher)
}

/// Merge fingerprint over the ordered segment cache keys and pause scale
pub fn build_merge_fingerprint(cache_keys: &[String], pause_scale: f32) -> String {
    let mut hasher = Sha256::new();
    for key in cache_keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(format!("{:.3}", pause_scale).as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Sidecar metadata next to each cached file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMeta {
    pub created_at: String,
    pub size: u64,
}

/// Sidecar metadata next to merged outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedMeta {
    pub created_at: String,
    pub size: u64,
    pub segment_cache_keys: Vec<String>,
}

/// Disk cache for segment and merged audio
pub struct SegmentCache {
    segments_dir: PathBuf,
    merged_dir: PathBuf,
    tmp_dir: PathBuf,
    max_bytes: u64,
    eviction: Mutex<()>,
}

impl SegmentCache {
    pub fn new(segments_dir: PathBuf, merged_dir: PathBuf, tmp_dir: PathBuf, max_mb: u64) -> Self {
        Self {
            segments_dir,
            merged_dir,
            tmp_dir,
            max_bytes: max_mb.saturating_mul(1024 * 1024),
            eviction: Mutex::new(()),
        }
    }

    /// Cache file path for a key (`segments/<first2>/<key>.ogg`)
    pub fn segment_path(&self, cache_key: &str) -> PathBuf {
        let shard = &cache_key[..cache_key.len().min(2)];
        self.segments_dir.join(shard).join(format!("{}.ogg", cache_key))
    }

    /// Merged output path for a merge fingerprint
    pub fn merged_path(&self, fingerprint: &str) -> PathBuf {
        self.merged_dir.join(format!("{}.ogg", fingerprint))
    }

    /// Existing, non-empty cache entry for a key
    pub fn lookup(&self, cache_key: &str) -> Option<PathBuf> {
        let path = self.segment_path(cache_key);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    /// Fresh temp path for codec output
    pub fn stage_tmp(&self, suffix: &str) -> PathBuf {
        self.tmp_dir
            .join(format!("stage_{}{}", uuid::Uuid::new_v4().simple(), suffix))
    }

    /// Atomically move a finished temp file into the cache
    pub fn commit(&self, cache_key: &str, tmp_path: &Path) -> Result<PathBuf> {
        let target = self.segment_path(cache_key);
        self.commit_to(tmp_path, &target)?;
        self.evict_if_needed();
        Ok(target)
    }

    /// Atomically move a finished temp file to a merged output path
    pub fn commit_merged(
        &self,
        fingerprint: &str,
        tmp_path: &Path,
        segment_cache_keys: Vec<String>,
    ) -> Result<PathBuf> {
        let target = self.merged_path(fingerprint);
        self.commit_to(tmp_path, &target)?;
        let size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        let meta = MergedMeta {
            created_at: chrono::Utc::now().to_rfc3339(),
            size,
            segment_cache_keys,
        };
        std::fs::write(
            target.with_extension("ogg.meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(target)
    }

    fn commit_to(&self, tmp_path: &Path, target: &Path) -> Result<()> {
        let size = std::fs::metadata(tmp_path)
            .map_err(|e| ServiceError::Cache {
                message: format!("staged file missing: {}", e),
                path: Some(tmp_path.to_path_buf()),
            })?
            .len();
        if size == 0 {
            return Err(ServiceError::Cache {
                message: "staged file is empty".to_string(),
                path: Some(tmp_path.to_path_buf()),
            });
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(tmp_path, target).map_err(|e| ServiceError::Cache {
            message: format!("cache rename failed: {}", e),
            path: Some(target.to_path_buf()),
        })?;
        let meta = SidecarMeta {
            created_at: chrono::Utc::now().to_rfc3339(),
            size,
        };
        std::fs::write(
            target.with_extension("ogg.meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(())
    }

    /// Write raw bytes under a key (test and import paths)
    pub fn write_bytes(&self, cache_key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let tmp = self.stage_tmp(".ogg");
        std::fs::create_dir_all(&self.tmp_dir)?;
        std::fs::write(&tmp, bytes)?;
        self.commit(cache_key, &tmp)
    }

    /// Evict least-recently-used segment files while over the size budget
    pub fn evict_if_needed(&self) {
        let Ok(_guard) = self.eviction.try_lock() else {
            return; // another thread is already sweeping
        };
        let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let mut total: u64 = 0;
        collect_ogg_files(&self.segments_dir, &mut entries, &mut total);
        if total <= self.max_bytes {
            return;
        }
        // Oldest access first
        entries.sort_by_key(|(_, accessed, _)| *accessed);
        let target = self.max_bytes.saturating_mul(9) / 10;
        let mut freed: u64 = 0;
        for (path, _, size) in entries {
            if total - freed <= target {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    let _ = std::fs::remove_file(path.with_extension("ogg.meta.json"));
                    freed += size;
                    debug!("evicted cache entry {}", path.display());
                }
                Err(e) => warn!("cache eviction failed for {}: {}", path.display(), e),
            }
        }
    }

    /// Total bytes currently cached (segments only)
    pub fn total_bytes(&self) -> u64 {
        let mut entries = Vec::new();
        let mut total = 0;
        collect_ogg_files(&self.segments_dir, &mut entries, &mut total);
        total
    }
}

fn collect_ogg_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime, u64)>, total: &mut u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_ogg_files(&path, out, total);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("ogg") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let accessed = meta
            .accessed()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        *total += meta.len();
        out.push((path, accessed, meta.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs<'a>(
        versions: &'a HashMap<String, String>,
        profile: &'a str,
    ) -> FingerprintInputs<'a> {
        FingerprintInputs {
            normalized_text: "gojo meets sukuna.",
            model_id: "en/ljspeech/vits",
            voice_id: None,
            pack_versions: versions,
            profile_json: profile,
            compiler_version: "1.0.0",
            phoneme_mode: "espeak",
        }
    }

    #[test]
    fn test_cache_key_is_pure() {
        let versions: HashMap<String, String> =
            [("anime_en".to_string(), "20240101-000000".to_string())].into();
        let a = build_cache_key(&sample_inputs(&versions, "{}"));
        let b = build_cache_key(&sample_inputs(&versions, "{}"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_sensitive_to_each_input() {
        let versions: HashMap<String, String> =
            [("anime_en".to_string(), "20240101-000000".to_string())].into();
        let base = build_cache_key(&sample_inputs(&versions, "{}"));

        let mut other = sample_inputs(&versions, "{}");
        other.model_id = "en/ljspeech/glow";
        assert_ne!(base, build_cache_key(&other));

        let mut other = sample_inputs(&versions, "{}");
        other.voice_id = Some("p225");
        assert_ne!(base, build_cache_key(&other));

        let bumped: HashMap<String, String> =
            [("anime_en".to_string(), "20240102-000000".to_string())].into();
        assert_ne!(base, build_cache_key(&sample_inputs(&bumped, "{}")));

        assert_ne!(
            base,
            build_cache_key(&sample_inputs(&versions, "{\"rate\":1.1}"))
        );
    }

    #[test]
    fn test_pack_version_order_does_not_matter() {
        let a: HashMap<String, String> = [
            ("anime_en".to_string(), "1".to_string()),
            ("en_core".to_string(), "2".to_string()),
        ]
        .into();
        // HashMap iteration order differs run to run; equality must hold anyway
        let key1 = build_cache_key(&sample_inputs(&a, "{}"));
        let key2 = build_cache_key(&sample_inputs(&a, "{}"));
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_merge_fingerprint_stability() {
        let keys = vec!["aaa".to_string(), "bbb".to_string()];
        assert_eq!(
            build_merge_fingerprint(&keys, 1.0),
            build_merge_fingerprint(&keys, 1.0)
        );
        assert_ne!(
            build_merge_fingerprint(&keys, 1.0),
            build_merge_fingerprint(&keys, 1.2)
        );
        let reversed = vec!["bbb".to_string(), "aaa".to_string()];
        assert_ne!(
            build_merge_fingerprint(&keys, 1.0),
            build_merge_fingerprint(&reversed, 1.0)
        );
    }

    fn cache_in(dir: &tempfile::TempDir, max_mb: u64) -> SegmentCache {
        let cache = SegmentCache::new(
            dir.path().join("segments"),
            dir.path().join("merged"),
            dir.path().join("tmp"),
            max_mb,
        );
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        cache
    }

    #[test]
    fn test_write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 512);
        let key = "ab".to_string() + &"0".repeat(62);
        assert!(cache.lookup(&key).is_none());

        let path = cache.write_bytes(&key, b"OggS-fake-audio").unwrap();
        assert_eq!(cache.lookup(&key), Some(path.clone()));
        // Sharded under the first two hex chars
        assert!(path.parent().unwrap().ends_with("ab"));
        // Sidecar written
        assert!(path.with_extension("ogg.meta.json").exists());
    }

    #[test]
    fn test_empty_staged_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 512);
        let key = "cd".to_string() + &"0".repeat(62);
        assert!(cache.write_bytes(&key, b"").is_err());
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn test_eviction_under_budget_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 512);
        let key = "ef".to_string() + &"0".repeat(62);
        cache.write_bytes(&key, b"data").unwrap();
        cache.evict_if_needed();
        assert!(cache.lookup(&key).is_some());
    }

    #[test]
    fn test_eviction_removes_oldest_when_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        // 0 MB budget forces eviction of everything on sweep
        let cache = cache_in(&dir, 0);
        let key = "01".to_string() + &"0".repeat(62);
        // write_bytes triggers the sweep after commit
        cache.write_bytes(&key, b"payload").unwrap();
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn test_commit_merged_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 512);
        let tmp = cache.stage_tmp(".ogg");
        std::fs::write(&tmp, b"merged-bytes").unwrap();
        let out = cache
            .commit_merged("f00d", &tmp, vec!["k1".to_string(), "k2".to_string()])
            .unwrap();
        assert!(out.exists());
        let meta: MergedMeta = serde_json::from_str(
            &std::fs::read_to_string(out.with_extension("ogg.meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.segment_cache_keys.len(), 2);
        assert_eq!(meta.size, 12);
    }
}
