//! Dictionary pack model and file format
//!
//! Packs are JSON documents mapping keys (tokens or multi-word phrases,
//! case-preserving) to phoneme strings. Entry values come in two accepted
//! shapes: a plain string, or an object carrying `phonemes` plus metadata.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, ServiceError};

/// On-disk pack document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackFile {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entries: HashMap<String, PackEntryValue>,
}

fn default_format() -> String {
    "espeak".to_string()
}

/// Entry value: plain phoneme string or annotated object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackEntryValue {
    Plain(String),
    Detailed {
        phonemes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<String>,
    },
}

impl PackEntryValue {
    /// Extract the phoneme string regardless of shape
    pub fn phonemes(&self) -> &str {
        match self {
            PackEntryValue::Plain(s) => s,
            PackEntryValue::Detailed { phonemes, .. } => phonemes,
        }
    }
}

/// A loaded dictionary pack
#[derive(Debug, Clone)]
pub struct DictPack {
    pub name: String,
    pub version: String,
    pub format: String,
    /// Entries with original-case keys
    entries: HashMap<String, String>,
    /// Lowercase key -> original-case key
    lower_index: HashMap<String, String>,
}

impl DictPack {
    /// Build a pack from raw entries
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            format: default_format(),
            entries: HashMap::new(),
            lower_index: HashMap::new(),
        }
    }

    /// Insert or replace an entry, keeping the case-insensitive index in sync
    pub fn insert(&mut self, key: impl Into<String>, phonemes: impl Into<String>) {
        let key = key.into();
        let phonemes = phonemes.into();
        if key.is_empty() || phonemes.trim().is_empty() {
            return;
        }
        self.lower_index.insert(key.to_lowercase(), key.clone());
        self.entries.insert(key, phonemes.trim().to_string());
    }

    /// Exact-case lookup
    pub fn get_exact(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Case-insensitive lookup
    pub fn get_fold(&self, key: &str) -> Option<&str> {
        if let Some(hit) = self.get_exact(key) {
            return Some(hit);
        }
        let original = self.lower_index.get(&key.to_lowercase())?;
        self.entries.get(original).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let lowered = key.to_lowercase();
        let original = self.lower_index.remove(&lowered)?;
        self.entries.remove(&original)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries with original-case keys
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// Keys containing whitespace (phrase keys)
    pub fn phrase_entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter().filter(|(k, _)| k.contains(' '))
    }

    /// Parse a pack file, deriving the version from file mtime when the
    /// document does not carry one
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ServiceError::Io {
            message: format!("cannot read pack: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        let file: PackFile = serde_json::from_str(&raw).map_err(|e| ServiceError::Config {
            message: format!("invalid pack JSON: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        let version = file
            .version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| mtime_version_of(path));

        let mut pack = DictPack::new(file.name, version);
        pack.format = file.format;
        for (key, value) in file.entries {
            pack.insert(key, value.phonemes().to_string());
        }
        Ok(pack)
    }

    /// Serialize back into the on-disk document shape
    pub fn to_file(&self, version: &str) -> PackFile {
        PackFile {
            name: self.name.clone(),
            version: Some(version.to_string()),
            format: self.format.clone(),
            description: None,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), PackEntryValue::Plain(v.clone())))
                .collect(),
        }
    }
}

/// Format a timestamp as a pack version (`YYYYMMDD-HHMMSS`)
pub fn mtime_version(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format("%Y%m%d-%H%M%S").to_string()
}

/// Version for a pack file derived from its modification time
pub fn mtime_version_of(path: &Path) -> String {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    mtime_version(mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_entry_value_shapes() {
        let plain: PackEntryValue = serde_json::from_str("\"g oʊ dʒ oʊ\"").unwrap();
        assert_eq!(plain.phonemes(), "g oʊ dʒ oʊ");

        let detailed: PackEntryValue =
            serde_json::from_str("{\"phonemes\": \"s uː\", \"source\": \"espeak\"}").unwrap();
        assert_eq!(detailed.phonemes(), "s uː");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut pack = DictPack::new("anime_en", "1");
        pack.insert("Gojo", "ɡ oʊ dʒ oʊ");
        assert_eq!(pack.get_fold("gojo"), Some("ɡ oʊ dʒ oʊ"));
        assert_eq!(pack.get_fold("GOJO"), Some("ɡ oʊ dʒ oʊ"));
        assert_eq!(pack.get_exact("gojo"), None);
        assert_eq!(pack.get_exact("Gojo"), Some("ɡ oʊ dʒ oʊ"));
    }

    #[test]
    fn test_phrase_entries_filter() {
        let mut pack = DictPack::new("local_overrides", "1");
        pack.insert("Senpai Gojo", "X Y");
        pack.insert("Senpai", "A");
        let phrases: Vec<_> = pack.phrase_entries().map(|(k, _)| k.clone()).collect();
        assert_eq!(phrases, vec!["Senpai Gojo".to_string()]);
    }

    #[test]
    fn test_load_from_derives_mtime_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anime_en.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "{}",
            "{\"name\": \"anime_en\", \"entries\": {\"Gojo\": \"ɡ oʊ dʒ oʊ\"}}"
        )
        .unwrap();
        drop(f);

        let pack = DictPack::load_from(&path).unwrap();
        assert_eq!(pack.name, "anime_en");
        assert_eq!(pack.len(), 1);
        // YYYYMMDD-HHMMSS
        assert_eq!(pack.version.len(), 15);
        assert_eq!(&pack.version[8..9], "-");
    }

    #[test]
    fn test_mtime_version_format() {
        let v = mtime_version(SystemTime::UNIX_EPOCH);
        assert_eq!(v, "19700101-000000");
    }

    #[test]
    fn test_empty_values_skipped() {
        let mut pack = DictPack::new("p", "1");
        pack.insert("key", "   ");
        assert!(pack.is_empty());
    }
}
