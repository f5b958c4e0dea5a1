//! Capability traits at the synthesis boundary
//!
//! The core treats neural TTS, phoneme fallback, and audio encoding as
//! external capabilities with blocking call semantics. Any engine reachable
//! as a library, subprocess, or RPC can sit behind these traits.

use std::path::{Path, PathBuf};

use crate::core::error::Result;

/// Mono PCM audio at a known sample rate
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    /// Duration in seconds
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Result of a synthesis call
#[derive(Debug, Clone)]
pub struct SynthOutput {
    pub audio: PcmAudio,
    /// Whether the engine consumed the phoneme string rather than raw text
    pub used_phonemes: bool,
}

/// A synthesis engine instance bound to one model and voice.
///
/// Instances are not assumed thread-safe; the pool hands each one to a
/// single caller at a time.
pub trait Synthesizer: Send {
    fn model_id(&self) -> &str;

    fn voice_id(&self) -> Option<&str>;

    /// Whether phoneme input is accepted
    fn supports_phonemes(&self) -> bool;

    /// Produce PCM audio from text, preferring `phonemes` when supported.
    /// `rate` is the speed multiplier from the reading profile.
    fn synthesize(&mut self, text: &str, phonemes: Option<&str>, rate: f32) -> Result<SynthOutput>;
}

/// Creates synthesizer instances for the pool
pub trait SynthesizerFactory: Send + Sync {
    fn create(&self, model_id: &str, voice_id: Option<&str>) -> Result<Box<dyn Synthesizer>>;
}

/// Fallback grapheme-to-phoneme capability (eSpeak-compatible output)
pub trait Phonemizer: Send + Sync {
    /// `Ok(None)` when the backend produced nothing for this input;
    /// `Err` when the backend itself is unavailable.
    fn phonemize(&self, text: &str) -> Result<Option<String>>;
}

/// One piece of a merged output stream
#[derive(Debug, Clone)]
pub enum ConcatPart {
    /// An existing OGG file
    Audio(PathBuf),
    /// Generated silence
    Silence { millis: u64 },
}

/// PCM-to-OGG encoding and OGG concatenation capability
pub trait AudioCodec: Send + Sync {
    /// Encode PCM to OGG/Opus at `output` (atomic: temp + rename)
    fn encode_ogg(&self, audio: &PcmAudio, output: &Path) -> Result<()>;

    /// Concatenate parts into one OGG at `output`, inserting silences
    fn concat_ogg(&self, parts: &[ConcatPart], output: &Path) -> Result<()>;
}
