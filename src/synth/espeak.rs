//! eSpeak-backed fallback phonemizer
//!
//! Shells out to `espeak-ng` for grapheme-to-phoneme conversion. Output is
//! whitespace-normalized IPA. A missing binary surfaces as a backend
//! unavailability error; an empty result for a given input is a soft miss.

use std::process::Command;

use tracing::debug;

use super::traits::Phonemizer;
use crate::core::error::{Result, ServiceError};

/// Subprocess phonemizer speaking the eSpeak CLI
pub struct EspeakPhonemizer {
    command: String,
    language: String,
}

impl EspeakPhonemizer {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
        }
    }
}

impl Default for EspeakPhonemizer {
    fn default() -> Self {
        Self::new("espeak-ng", "en-us")
    }
}

impl Phonemizer for EspeakPhonemizer {
    fn phonemize(&self, text: &str) -> Result<Option<String>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let output = Command::new(&self.command)
            .args(["-q", "--ipa", "-v", &self.language, "--", text])
            .output()
            .map_err(|e| ServiceError::Resolver {
                message: format!("cannot run {}: {}", self.command, e),
            })?;
        if !output.status.success() {
            debug!(
                "espeak exited with {} for input of {} chars",
                output.status,
                text.chars().count()
            );
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let phonemes = stdout.split_whitespace().collect::<Vec<_>>().join(" ");
        if phonemes.is_empty() {
            return Ok(None);
        }
        Ok(Some(phonemes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_a_miss() {
        let phonemizer = EspeakPhonemizer::default();
        assert!(phonemizer.phonemize("   ").unwrap().is_none());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let phonemizer = EspeakPhonemizer::new("definitely-not-a-real-binary", "en-us");
        assert!(phonemizer.phonemize("hello").is_err());
    }
}
