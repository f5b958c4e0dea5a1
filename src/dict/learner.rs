//! Auto-learn pack persistence
//!
//! Fallback-resolved pronunciations are buffered in memory and flushed to the
//! `auto_learn` pack file on an interval. The file is shared across processes,
//! so flushes take an on-disk lock and write through a temp file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::pack::{mtime_version, DictPack, PackEntryValue, PackFile};
use crate::core::error::{Result, ServiceError};

/// One learned pronunciation with bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedEntry {
    pub phonemes: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

struct LearnerInner {
    entries: HashMap<String, LearnedEntry>,
    dirty: bool,
    last_flush: Instant,
    version: String,
}

/// Buffered writer for the auto-learn pack
pub struct AutoLearner {
    path: PathBuf,
    flush_interval: Duration,
    inner: Mutex<LearnerInner>,
}

impl AutoLearner {
    /// Open the learner, replaying any existing pack file
    pub fn open(path: PathBuf, flush_interval: Duration) -> Self {
        let mut entries = HashMap::new();
        let mut version = current_version();
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(ServiceError::from)
                .and_then(|raw| serde_json::from_str::<PackFile>(&raw).map_err(ServiceError::from))
            {
                Ok(file) => {
                    if let Some(v) = file.version.filter(|v| !v.trim().is_empty()) {
                        version = v;
                    }
                    for (key, value) in file.entries {
                        let entry = match value {
                            PackEntryValue::Plain(phonemes) => LearnedEntry {
                                phonemes,
                                count: 1,
                                updated_at: None,
                            },
                            PackEntryValue::Detailed {
                                phonemes,
                                count,
                                updated_at,
                                ..
                            } => LearnedEntry {
                                phonemes,
                                count: count.unwrap_or(1),
                                updated_at,
                            },
                        };
                        if !entry.phonemes.trim().is_empty() {
                            entries.insert(key.to_lowercase(), entry);
                        }
                    }
                }
                Err(e) => warn!("ignoring unreadable auto-learn pack: {}", e),
            }
        }
        Self {
            path,
            flush_interval: flush_interval.max(Duration::from_secs(1)),
            inner: Mutex::new(LearnerInner {
                entries,
                dirty: false,
                last_flush: Instant::now(),
                version,
            }),
        }
    }

    /// Record a learned pronunciation; flushes when the interval elapsed
    pub fn learn(&self, key: &str, phonemes: &str) {
        let key = key.trim().to_lowercase();
        let phonemes = phonemes.trim();
        if key.is_empty() || phonemes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("learner lock");
        let count = inner.entries.get(&key).map(|e| e.count + 1).unwrap_or(1);
        inner.entries.insert(
            key,
            LearnedEntry {
                phonemes: phonemes.to_string(),
                count,
                updated_at: Some(now_rfc3339()),
            },
        );
        inner.dirty = true;
        if inner.last_flush.elapsed() >= self.flush_interval {
            if let Err(e) = self.flush_locked(&mut inner) {
                warn!("auto-learn flush failed: {}", e);
            }
        }
    }

    /// Look up a learned pronunciation
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("learner lock");
        inner
            .entries
            .get(&key.trim().to_lowercase())
            .map(|e| e.phonemes.clone())
    }

    /// Remove a key (used by pack promotion)
    pub fn remove(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("learner lock");
        let removed = inner.entries.remove(&key.trim().to_lowercase());
        if removed.is_some() {
            inner.dirty = true;
        }
        removed.map(|e| e.phonemes)
    }

    /// Current pack version
    pub fn version(&self) -> String {
        self.inner.lock().expect("learner lock").version.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("learner lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot as a DictPack for the resolver's priority chain
    pub fn as_pack(&self) -> Option<DictPack> {
        let inner = self.inner.lock().expect("learner lock");
        if inner.entries.is_empty() {
            return None;
        }
        let mut pack = DictPack::new("auto_learn", inner.version.clone());
        for (key, entry) in &inner.entries {
            pack.insert(key.clone(), entry.phonemes.clone());
        }
        Some(pack)
    }

    /// Force a flush to disk
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("learner lock");
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut LearnerInner) -> Result<()> {
        if !inner.dirty {
            return Ok(());
        }
        inner.version = current_version();
        let file = PackFile {
            name: "auto_learn".to_string(),
            version: Some(inner.version.clone()),
            format: "espeak".to_string(),
            description: None,
            entries: inner
                .entries
                .iter()
                .map(|(k, e)| {
                    (
                        k.clone(),
                        PackEntryValue::Detailed {
                            phonemes: e.phonemes.clone(),
                            source: None,
                            count: Some(e.count),
                            updated_at: e.updated_at.clone(),
                        },
                    )
                })
                .collect(),
        };
        let payload = serde_json::to_string_pretty(&file)?;

        let _guard = FileLock::acquire(&self.path, Duration::from_secs(2))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;

        inner.dirty = false;
        inner.last_flush = Instant::now();
        Ok(())
    }
}

impl Drop for AutoLearner {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Coarse cross-process lock built on exclusive lock-file creation.
///
/// A lock file older than 30 s is treated as left behind by a dead process
/// and broken.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        let path = target.with_extension("lock");
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .map(|m| {
                            SystemTime::now()
                                .duration_since(m)
                                .unwrap_or(Duration::ZERO)
                                > Duration::from_secs(30)
                        })
                        .unwrap_or(true);
                    if stale {
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(ServiceError::Io {
                            message: "auto-learn lock timed out".to_string(),
                            path: Some(path),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn current_version() -> String {
    mtime_version(SystemTime::now())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
