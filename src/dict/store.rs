//! Dictionary store
//!
//! Loads and persists dictionary packs from the pack directory. Versions are
//! derived from file modification times and recomputed whenever a backing
//! file changes, so `refresh()` is cheap to call before every read that
//! needs current versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use super::pack::{mtime_version_of, DictPack};
use crate::core::error::{Result, ServiceError};

/// Fixed pack priority, highest first
pub const PACK_PRIORITY: [&str; 4] = ["local_overrides", "auto_learn", "anime_en", "en_core"];

/// Pack metadata for listings
#[derive(Debug, Clone, Serialize)]
pub struct PackSummary {
    pub name: String,
    pub version: String,
    pub entry_count: usize,
}

struct LoadedPack {
    pack: DictPack,
    path: PathBuf,
    mtime: SystemTime,
}

/// Disk-backed pack collection
pub struct DictStore {
    dict_dir: PathBuf,
    compiled_dir: PathBuf,
    packs: RwLock<HashMap<String, LoadedPack>>,
}

impl DictStore {
    /// Open the store and load every pack under `dict_dir`
    pub fn open(dict_dir: PathBuf, compiled_dir: PathBuf) -> Self {
        let store = Self {
            dict_dir,
            compiled_dir,
            packs: RwLock::new(HashMap::new()),
        };
        store.refresh();
        store
    }

    /// Reload packs whose backing file changed; drop packs whose file is gone
    pub fn refresh(&self) {
        let mut next: HashMap<String, LoadedPack> = HashMap::new();
        let entries = match std::fs::read_dir(&self.dict_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read dict dir {}: {}", self.dict_dir.display(), e);
                return;
            }
        };
        {
            let current = self.packs.read().expect("dict store lock");
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);

                // Reuse the parsed pack when the file is unchanged
                let reusable = current
                    .values()
                    .find(|loaded| loaded.path == path && loaded.mtime == mtime);
                let loaded = match reusable {
                    Some(loaded) => LoadedPack {
                        pack: loaded.pack.clone(),
                        path: path.clone(),
                        mtime,
                    },
                    None => match DictPack::load_from(&path) {
                        Ok(pack) => LoadedPack { pack, path, mtime },
                        Err(e) => {
                            warn!("skipping unreadable pack {:?}: {}", entry.file_name(), e);
                            continue;
                        }
                    },
                };

                // Duplicate names: keep the newest version
                match next.get(&loaded.pack.name) {
                    Some(existing) if existing.pack.version >= loaded.pack.version => {}
                    _ => {
                        next.insert(loaded.pack.name.clone(), loaded);
                    }
                }
            }
        }
        debug!("dictionary store loaded {} packs", next.len());
        *self.packs.write().expect("dict store lock") = next;
    }

    /// Current pack versions by name
    pub fn versions(&self) -> HashMap<String, String> {
        self.packs
            .read()
            .expect("dict store lock")
            .iter()
            .map(|(name, loaded)| (name.clone(), loaded.pack.version.clone()))
            .collect()
    }

    /// Pack listing with entry counts
    pub fn list(&self) -> Vec<PackSummary> {
        let packs = self.packs.read().expect("dict store lock");
        let mut summaries: Vec<PackSummary> = packs
            .values()
            .map(|loaded| PackSummary {
                name: loaded.pack.name.clone(),
                version: loaded.pack.version.clone(),
                entry_count: loaded.pack.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Clone a pack by name
    pub fn get(&self, name: &str) -> Option<DictPack> {
        self.packs
            .read()
            .expect("dict store lock")
            .get(name)
            .map(|loaded| loaded.pack.clone())
    }

    /// Run `f` over packs in priority order (excluding `auto_learn`, which
    /// the resolver supplies from the learner) and return its first hit
    pub fn first_hit<T>(&self, mut f: impl FnMut(&DictPack) -> Option<T>) -> Option<T> {
        let packs = self.packs.read().expect("dict store lock");
        for name in PACK_PRIORITY {
            if name == "auto_learn" {
                continue;
            }
            if let Some(loaded) = packs.get(name) {
                if let Some(hit) = f(&loaded.pack) {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Visit every loaded pack
    pub fn for_each(&self, mut f: impl FnMut(&DictPack)) {
        let packs = self.packs.read().expect("dict store lock");
        for loaded in packs.values() {
            f(&loaded.pack);
        }
    }

    /// Insert or replace entries in a named pack, creating the pack file if
    /// needed, then reload
    pub fn upsert_entries(
        &self,
        pack_name: &str,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<PackSummary> {
        let mut pack = self
            .get(pack_name)
            .unwrap_or_else(|| DictPack::new(pack_name, "0"));
        let mut inserted = 0usize;
        for (key, phonemes) in entries {
            let key = key.trim();
            let phonemes = phonemes.trim();
            if key.is_empty() || phonemes.is_empty() {
                return Err(ServiceError::Config {
                    message: "pack entries need non-empty key and phonemes".to_string(),
                    path: None,
                });
            }
            pack.insert(key.to_string(), phonemes.to_string());
            inserted += 1;
        }
        if inserted == 0 {
            return Err(ServiceError::Config {
                message: "no entries supplied".to_string(),
                path: None,
            });
        }
        let path = self.write_pack(&pack)?;
        self.refresh();
        Ok(PackSummary {
            name: pack_name.to_string(),
            version: mtime_version_of(&path),
            entry_count: pack.len(),
        })
    }

    fn write_pack(&self, pack: &DictPack) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dict_dir)?;
        let path = self.pack_path(&pack.name);
        // The stored version field is advisory; the effective version comes
        // from the file mtime after this write.
        let file = pack.to_file(&pack.version);
        let payload = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Path of a pack's backing file
    pub fn pack_path(&self, name: &str) -> PathBuf {
        self.dict_dir.join(format!("{}.json", name))
    }

    /// Write model-tagged copies of every pack into the compiled directory
    pub fn compile_packs(&self, model_id: &str, compiler_version: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.compiled_dir)?;
        let model_slug = slugify(model_id);
        let mut written = Vec::new();
        let packs = self.packs.read().expect("dict store lock");
        for loaded in packs.values() {
            let pack = &loaded.pack;
            let mut file = pack.to_file(&pack.version);
            file.description = Some(format!(
                "compiled for {} (compiler {})",
                model_id, compiler_version
            ));
            let out = self
                .compiled_dir
                .join(format!("{}_{}_{}.json", pack.name, pack.version, model_slug));
            std::fs::write(&out, serde_json::to_string_pretty(&file)?)?;
            written.push(out);
        }
        Ok(written)
    }

    /// Directory the packs live in
    pub fn dict_dir(&self) -> &Path {
        &self.dict_dir
    }
}

fn slugify(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pack_file(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{}.json", name)), body).unwrap();
    }

    fn store_in(dir: &tempfile::TempDir) -> DictStore {
        DictStore::open(dir.path().to_path_buf(), dir.path().join("compiled"))
    }

    #[test]
    fn test_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        write_pack_file(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"Gojo\": \"ɡ oʊ dʒ oʊ\", \"Sukuna\": \"s uː k uː n ə\"}}",
        );
        let store = store_in(&dir);
        let listing = store.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "anime_en");
        assert_eq!(listing[0].entry_count, 2);
    }

    #[test]
    fn test_priority_order_in_first_hit() {
        let dir = tempfile::tempdir().unwrap();
        write_pack_file(
            dir.path(),
            "en_core",
            "{\"name\": \"en_core\", \"entries\": {\"gojo\": \"LOW\"}}",
        );
        write_pack_file(
            dir.path(),
            "local_overrides",
            "{\"name\": \"local_overrides\", \"entries\": {\"gojo\": \"HIGH\"}}",
        );
        let store = store_in(&dir);
        let hit = store.first_hit(|pack| pack.get_fold("gojo").map(String::from));
        assert_eq!(hit, Some("HIGH".to_string()));
    }

    #[test]
    fn test_upsert_creates_pack() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .upsert_entries(
                "local_overrides",
                vec![("Senpai".to_string(), "s ɛ n p aɪ".to_string())],
            )
            .unwrap();
        assert!(store.pack_path("local_overrides").exists());
        let hit = store.first_hit(|pack| pack.get_fold("senpai").map(String::from));
        assert_eq!(hit, Some("s ɛ n p aɪ".to_string()));
    }

    #[test]
    fn test_upsert_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store
            .upsert_entries("local_overrides", vec![("".to_string(), "x".to_string())])
            .is_err());
        assert!(store
            .upsert_entries("local_overrides", Vec::new())
            .is_err());
    }

    #[test]
    fn test_refresh_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.list().is_empty());

        write_pack_file(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"Gojo\": \"X\"}}",
        );
        store.refresh();
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_compile_packs_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        write_pack_file(
            dir.path(),
            "en_core",
            "{\"name\": \"en_core\", \"entries\": {\"the\": \"ð ə\"}}",
        );
        let store = store_in(&dir);
        let written = store.compile_packs("en/ljspeech/vits", "1.0.0").unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].exists());
        let name = written[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("en_core_"));
        assert!(name.contains("en_ljspeech_vits"));
    }

    #[test]
    fn test_versions_map() {
        let dir = tempfile::tempdir().unwrap();
        write_pack_file(
            dir.path(),
            "en_core",
            "{\"name\": \"en_core\", \"entries\": {}}",
        );
        let store = store_in(&dir);
        let versions = store.versions();
        assert!(versions.contains_key("en_core"));
        assert_eq!(versions["en_core"].len(), 15);
    }
}
