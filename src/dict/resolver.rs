//! Pronunciation resolver
//!
//! Resolves normalized segment text to a phoneme string in three passes:
//! greedy longest-phrase matching across packs, per-token lookup in priority
//! order, and a grapheme-to-phoneme fallback for everything left. Fallback
//! results can be auto-learned into the `auto_learn` pack.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{Result, ServiceError};
use crate::synth::Phonemizer;

use super::learner::AutoLearner;
use super::store::{DictStore, PACK_PRIORITY};

/// Resolution result for one text
#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    /// Full text with resolved spans replaced by phoneme strings; `None`
    /// when nothing resolved
    pub phoneme_text: Option<String>,
    /// True when any pack or the fallback contributed
    pub used_phonemes: bool,
    /// Hits per source (`pack name` or `espeak`)
    pub source_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    /// ASCII-alphabetic run, eligible for lookup
    Word,
    /// Everything else, passed through untouched (this keeps phoneme
    /// strings stable under re-resolution)
    Sep,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
}

struct PhraseCandidate {
    words_lower: Vec<String>,
    words_exact: Vec<String>,
    phonemes: String,
    pack: String,
    priority: usize,
    char_len: usize,
}

/// Layered dictionary + fallback resolver
pub struct Resolver {
    store: Arc<DictStore>,
    learner: Option<Arc<AutoLearner>>,
    phonemizer: Arc<dyn Phonemizer>,
    phoneme_mode: String,
    autolearn_on_miss: bool,
    autolearn_min_len: usize,
}

impl Resolver {
    pub fn new(
        store: Arc<DictStore>,
        learner: Option<Arc<AutoLearner>>,
        phonemizer: Arc<dyn Phonemizer>,
        phoneme_mode: String,
        autolearn_on_miss: bool,
        autolearn_min_len: usize,
    ) -> Self {
        Self {
            store,
            learner,
            phonemizer,
            phoneme_mode,
            autolearn_on_miss,
            autolearn_min_len,
        }
    }

    /// Pack versions visible to new jobs, recomputed from disk
    pub fn dict_versions(&self) -> HashMap<String, String> {
        self.store.refresh();
        let mut versions = self.store.versions();
        if let Some(learner) = &self.learner {
            if !learner.is_empty() {
                versions.insert("auto_learn".to_string(), learner.version());
            }
        }
        versions
    }

    /// Resolve a full text (phrase pass, token pass, fallback)
    pub fn resolve_text(&self, text: &str) -> Result<ResolveOutcome> {
        let tokens = tokenize(text);
        let candidates = self.phrase_candidates();
        let mut source_counts: HashMap<String, u32> = HashMap::new();

        let mut pieces: Vec<String> = Vec::with_capacity(tokens.len());
        let mut found_phoneme = false;
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if token.kind != TokenKind::Word {
                pieces.push(token.text.clone());
                i += 1;
                continue;
            }
            if let Some((end, phonemes, pack)) = match_phrase(&tokens, i, &candidates) {
                *source_counts.entry(pack).or_insert(0) += 1;
                pieces.push(phonemes);
                found_phoneme = true;
                i = end + 1;
                continue;
            }
            match self.resolve_word(&token.text)? {
                Some((phonemes, source)) => {
                    *source_counts.entry(source).or_insert(0) += 1;
                    pieces.push(phonemes);
                    found_phoneme = true;
                }
                None => pieces.push(token.text.clone()),
            }
            i += 1;
        }

        Ok(ResolveOutcome {
            phoneme_text: found_phoneme.then(|| pieces.concat()),
            used_phonemes: found_phoneme,
            source_counts,
        })
    }

    /// Resolve one token: packs in priority order, then fallback
    pub fn resolve_word(&self, word: &str) -> Result<Option<(String, String)>> {
        if let Some(hit) = self.lookup_sources(word) {
            return Ok(Some(hit));
        }
        if self.phoneme_mode != "espeak" {
            return Ok(None);
        }
        let phonemes = self
            .phonemizer
            .phonemize(word)
            .map_err(|e| ServiceError::Resolver {
                message: format!("fallback unavailable: {}", e),
            })?;
        let Some(phonemes) = phonemes else {
            return Ok(None);
        };
        if self.should_autolearn(word) {
            if let Some(learner) = &self.learner {
                learner.learn(word, &phonemes);
            }
        }
        Ok(Some((phonemes, "espeak".to_string())))
    }

    /// Dictionary-only lookup of a token or phrase key
    pub fn lookup_key(&self, key: &str) -> Option<(String, String)> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        self.lookup_sources(key)
    }

    /// Phonemize a key (token or phrase) and store it in the auto-learn pack
    pub fn learn_key(&self, key: &str) -> Result<(String, String)> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ServiceError::Resolver {
                message: "key is required".to_string(),
            });
        }
        if self.phoneme_mode != "espeak" {
            return Err(ServiceError::Resolver {
                message: format!("phoneme_mode '{}' cannot phonemize", self.phoneme_mode),
            });
        }
        let phonemes = self
            .phonemizer
            .phonemize(key)
            .map_err(|e| ServiceError::Resolver {
                message: format!("fallback unavailable: {}", e),
            })?
            .ok_or_else(|| ServiceError::Resolver {
                message: format!("unable to phonemize '{}'", key),
            })?;
        if let Some(learner) = &self.learner {
            learner.learn(key, &phonemes);
        }
        Ok((phonemes, "espeak".to_string()))
    }

    /// Store explicit phonemes for a key in the auto-learn pack
    pub fn store_phonemes(&self, key: &str, phonemes: &str) -> Result<(String, String)> {
        let key = key.trim();
        let phonemes = phonemes.trim();
        if key.is_empty() || phonemes.is_empty() {
            return Err(ServiceError::Resolver {
                message: "key and phonemes are required".to_string(),
            });
        }
        match &self.learner {
            Some(learner) => {
                learner.learn(key, phonemes);
                Ok((phonemes.to_string(), "auto_learn".to_string()))
            }
            None => Err(ServiceError::Resolver {
                message: "auto-learn is disabled".to_string(),
            }),
        }
    }

    /// Learner handle (used by pack promotion)
    pub fn learner(&self) -> Option<&Arc<AutoLearner>> {
        self.learner.as_ref()
    }

    fn lookup_sources(&self, key: &str) -> Option<(String, String)> {
        for name in PACK_PRIORITY {
            if name == "auto_learn" {
                if let Some(learner) = &self.learner {
                    if let Some(phonemes) = learner.get(key) {
                        return Some((phonemes, "auto_learn".to_string()));
                    }
                }
                continue;
            }
            if let Some(pack) = self.store.get(name) {
                if let Some(phonemes) = pack.get_fold(key) {
                    return Some((phonemes.to_string(), name.to_string()));
                }
            }
        }
        None
    }

    fn should_autolearn(&self, word: &str) -> bool {
        if !self.autolearn_on_miss || self.learner.is_none() {
            return false;
        }
        if word.chars().count() < self.autolearn_min_len {
            return false;
        }
        if !word.chars().all(|c| c.is_ascii_alphabetic()) {
            return false;
        }
        // Already covered by a pack: nothing to learn
        self.store
            .first_hit(|pack| pack.get_fold(word).map(|_| ()))
            .is_none()
    }

    /// Phrase keys across all sources, longest first
    fn phrase_candidates(&self) -> Vec<PhraseCandidate> {
        let mut candidates = Vec::new();
        for (priority, name) in PACK_PRIORITY.iter().enumerate() {
            let pack = if *name == "auto_learn" {
                match &self.learner {
                    Some(learner) => learner.as_pack(),
                    None => None,
                }
            } else {
                self.store.get(name)
            };
            let Some(pack) = pack else { continue };
            for (key, phonemes) in pack.phrase_entries() {
                let words_exact: Vec<String> =
                    key.split_whitespace().map(str::to_string).collect();
                if words_exact.len() < 2 {
                    continue;
                }
                candidates.push(PhraseCandidate {
                    words_lower: words_exact.iter().map(|w| w.to_lowercase()).collect(),
                    words_exact,
                    phonemes: phonemes.clone(),
                    pack: name.to_string(),
                    priority,
                    char_len: key.chars().count(),
                });
            }
        }
        candidates.sort_by(|a, b| {
            b.words_lower
                .len()
                .cmp(&a.words_lower.len())
                .then(b.char_len.cmp(&a.char_len))
                .then(a.priority.cmp(&b.priority))
        });
        candidates
    }
}

/// Split text into ASCII-word and separator tokens.
///
/// A maximal alphabetic-or-apostrophe run is a Word only when every char is
/// ASCII; runs containing other letters (IPA output, CJK) stay separators so
/// resolver output re-resolves to itself.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_wordish = false;

    let flush = |tokens: &mut Vec<Token>, current: &mut String, wordish: bool| {
        if current.is_empty() {
            return;
        }
        let kind = if wordish && current.chars().all(|c| c.is_ascii_alphabetic() || c == '\'') {
            TokenKind::Word
        } else {
            TokenKind::Sep
        };
        tokens.push(Token {
            kind,
            text: std::mem::take(current),
        });
    };

    for c in text.chars() {
        let wordish = c.is_alphabetic() || c == '\'';
        if wordish != current_is_wordish && !current.is_empty() {
            flush(&mut tokens, &mut current, current_is_wordish);
        }
        current_is_wordish = wordish;
        current.push(c);
    }
    flush(&mut tokens, &mut current, current_is_wordish);
    tokens
}

/// Longest phrase match at `start`, resolved by (length, case, priority)
fn match_phrase(
    tokens: &[Token],
    start: usize,
    candidates: &[PhraseCandidate],
) -> Option<(usize, String, String)> {
    let mut best: Option<(&PhraseCandidate, usize)> = None;
    let mut best_rank: Option<(usize, usize)> = None;
    let mut best_exact = false;

    for candidate in candidates {
        let rank = (candidate.words_lower.len(), candidate.char_len);
        if let Some(current) = best_rank {
            // Candidates are sorted; once length drops below the best match
            // nothing later can win
            if rank < current {
                break;
            }
        }
        let Some((end, exact)) = phrase_matches_at(tokens, start, candidate) else {
            continue;
        };
        match best_rank {
            None => {
                best = Some((candidate, end));
                best_rank = Some(rank);
                best_exact = exact;
            }
            Some(current) if rank == current && exact && !best_exact => {
                // Case-preserving tie-break among equal-length matches
                best = Some((candidate, end));
                best_exact = true;
            }
            _ => {}
        }
    }

    best.map(|(candidate, end)| (end, candidate.phonemes.clone(), candidate.pack.clone()))
}

/// Try to match one candidate at `start`; returns (last token index, exact-case)
fn phrase_matches_at(
    tokens: &[Token],
    start: usize,
    candidate: &PhraseCandidate,
) -> Option<(usize, bool)> {
    let mut idx = start;
    let mut exact = true;
    for (word_idx, word_lower) in candidate.words_lower.iter().enumerate() {
        let token = tokens.get(idx)?;
        if token.kind != TokenKind::Word || token.text.to_lowercase() != *word_lower {
            return None;
        }
        if token.text != candidate.words_exact[word_idx] {
            exact = false;
        }
        if word_idx + 1 == candidate.words_lower.len() {
            return Some((idx, exact));
        }
        idx += 1;
        // Words inside a phrase must be separated by pure whitespace
        let sep = tokens.get(idx)?;
        if sep.kind != TokenKind::Sep || !sep.text.chars().all(char::is_whitespace) {
            return None;
        }
        idx += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    struct StubPhonemizer;

    impl Phonemizer for StubPhonemizer {
        fn phonemize(&self, text: &str) -> Result<Option<String>> {
            if text.trim().is_empty() {
                return Ok(None);
            }
            // Deterministic pseudo-IPA so outputs contain no ASCII words
            Ok(Some(format!("ɸ{}ɸ", text.to_lowercase())))
        }
    }

    struct DownPhonemizer;

    impl Phonemizer for DownPhonemizer {
        fn phonemize(&self, _text: &str) -> Result<Option<String>> {
            Err(ServiceError::internal("backend missing"))
        }
    }

    fn write_pack(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{}.json", name)), body).unwrap();
    }

    fn resolver_with(
        dir: &tempfile::TempDir,
        learner: bool,
        on_miss: bool,
        phonemizer: Arc<dyn Phonemizer>,
    ) -> Resolver {
        let store = Arc::new(DictStore::open(
            dir.path().to_path_buf(),
            dir.path().join("compiled"),
        ));
        let learner = learner.then(|| {
            Arc::new(AutoLearner::open(
                dir.path().join("auto_learn.json"),
                Duration::from_secs(3600),
            ))
        });
        Resolver::new(store, learner, phonemizer, "espeak".to_string(), on_miss, 3)
    }

    #[test]
    fn test_pack_tokens_resolved() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"Gojo\": \"ɡ oʊ dʒ oʊ\", \"Sukuna\": \"s uː k uː n ə\"}}",
        );
        let resolver = resolver_with(&dir, false, false, Arc::new(StubPhonemizer));
        let outcome = resolver.resolve_text("Gojo meets Sukuna.").unwrap();
        assert!(outcome.used_phonemes);
        let text = outcome.phoneme_text.unwrap();
        assert!(text.contains("ɡ oʊ dʒ oʊ"));
        assert!(text.contains("s uː k uː n ə"));
        assert_eq!(outcome.source_counts.get("anime_en"), Some(&2));
    }

    #[test]
    fn test_priority_law() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "en_core",
            "{\"name\": \"en_core\", \"entries\": {\"gojo\": \"LOW\"}}",
        );
        write_pack(
            dir.path(),
            "local_overrides",
            "{\"name\": \"local_overrides\", \"entries\": {\"gojo\": \"ʜɪɢʜ\"}}",
        );
        let resolver = resolver_with(&dir, false, false, Arc::new(StubPhonemizer));
        let (phonemes, source) = resolver.lookup_key("gojo").unwrap();
        assert_eq!(phonemes, "ʜɪɢʜ");
        assert_eq!(source, "local_overrides");
    }

    #[test]
    fn test_autolearn_beats_bundled_packs() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"sukuna\": \"BUNDLED\"}}",
        );
        let resolver = resolver_with(&dir, true, false, Arc::new(StubPhonemizer));
        resolver.store_phonemes("sukuna", "ʟᴇᴀʀɴᴇᴅ").unwrap();
        let (phonemes, source) = resolver.lookup_key("sukuna").unwrap();
        assert_eq!(phonemes, "ʟᴇᴀʀɴᴇᴅ");
        assert_eq!(source, "auto_learn");
    }

    #[test]
    fn test_phrase_pass_consumes_longest_match() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "local_overrides",
            "{\"name\": \"local_overrides\", \"entries\": {\"Senpai Gojo\": \"φφ ψψ\"}}",
        );
        write_pack(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"Senpai\": \"ᴀ\", \"Gojo\": \"ʙ\"}}",
        );
        let resolver = resolver_with(&dir, false, false, Arc::new(StubPhonemizer));
        let outcome = resolver.resolve_text("Senpai Gojo arrives.").unwrap();
        let text = outcome.phoneme_text.unwrap();
        assert!(text.contains("φφ ψψ"));
        assert!(!text.contains('ᴀ'));
        assert_eq!(outcome.source_counts.get("local_overrides"), Some(&1));
        assert_eq!(outcome.source_counts.get("anime_en"), None);
    }

    #[test]
    fn test_longest_match_wins_across_packs() {
        // "A B C" in a lower-priority pack beats "A B" in a higher one
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "local_overrides",
            "{\"name\": \"local_overrides\", \"entries\": {\"alpha beta\": \"ʃᴏʀᴛ\"}}",
        );
        write_pack(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"alpha beta gamma\": \"ʟᴏɴɢ\"}}",
        );
        let resolver = resolver_with(&dir, false, false, Arc::new(StubPhonemizer));
        let outcome = resolver.resolve_text("alpha beta gamma delta").unwrap();
        let text = outcome.phoneme_text.unwrap();
        assert!(text.contains("ʟᴏɴɢ"));
        assert!(!text.contains("ʃᴏʀᴛ"));
    }

    #[test]
    fn test_fallback_and_autolearn_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with(&dir, true, true, Arc::new(StubPhonemizer));
        let outcome = resolver.resolve_text("Nanami").unwrap();
        assert_eq!(outcome.source_counts.get("espeak"), Some(&1));
        // Learned for next time
        assert_eq!(
            resolver.learner().unwrap().get("nanami"),
            Some("ɸnanamiɸ".to_string())
        );
    }

    #[test]
    fn test_short_or_nonalpha_tokens_not_learned() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with(&dir, true, true, Arc::new(StubPhonemizer));
        resolver.resolve_text("ab can't").unwrap();
        let learner = resolver.learner().unwrap();
        assert!(learner.get("ab").is_none());
        assert!(learner.get("can't").is_none());
    }

    #[test]
    fn test_resolver_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(
            dir.path(),
            "anime_en",
            "{\"name\": \"anime_en\", \"entries\": {\"Gojo\": \"ɡ oʊ dʒ oʊ\"}}",
        );
        let resolver = resolver_with(&dir, false, false, Arc::new(StubPhonemizer));
        let first = resolver.resolve_text("Gojo").unwrap().phoneme_text.unwrap();
        let second = resolver.resolve_text(&first).unwrap();
        // Phoneme output contains no ASCII word runs, so it passes through
        assert_eq!(second.phoneme_text, None);
    }

    #[test]
    fn test_fallback_unavailable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with(&dir, false, false, Arc::new(DownPhonemizer));
        let err = resolver.resolve_text("Unknown").unwrap_err();
        assert!(matches!(err, ServiceError::Resolver { .. }));
    }

    #[test]
    fn test_learn_key_stores_phrases() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with(&dir, true, false, Arc::new(StubPhonemizer));
        let (phonemes, source) = resolver.learn_key("Senpai Gojo").unwrap();
        assert_eq!(source, "espeak");
        assert!(!phonemes.is_empty());
        assert!(resolver.learner().unwrap().get("senpai gojo").is_some());
    }

    #[test]
    fn test_tokenize_classification() {
        let tokens = tokenize("Gojo's ɡoʊ 42!");
        let words: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Word)
            .map(|t| t.text.as_str())
            .collect();
        // The IPA run and digits are separators
        assert_eq!(words, vec!["Gojo's"]);
    }
}
