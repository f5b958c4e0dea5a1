//! # Lexivox - pronunciation-correct TTS job service
//!
//! A job service for long-form text-to-speech with a layered pronunciation
//! dictionary:
//!
//! - **Jobs and segments**: submitted text is normalized, chunked into
//!   ordered segments, and scheduled through a distributed-capable queue
//!   with claims, stale-claim recovery, retry caps, and cancellation
//! - **Pronunciation resolution**: greedy longest-phrase and per-token
//!   lookup across prioritized dictionary packs, with a grapheme-to-phoneme
//!   fallback and auto-learning of fallback results
//! - **Caching**: segment audio is content-addressed by a fingerprint over
//!   every input that shapes the audio; merged job audio is fingerprinted
//!   over the ordered segment keys
//! - **Playback contract**: per-segment fetch with Range/ETag support, a
//!   readiness playlist, and merged audio with a 202 progress fallback
//!
//! The synthesis engine, phoneme fallback, and audio codec are capability
//! traits (`Synthesizer`, `Phonemizer`, `AudioCodec`); subprocess-backed
//! bindings ship in [`synth`].

pub mod cache;
pub mod config;
pub mod core;
pub mod dict;
pub mod jobs;
pub mod server;
pub mod synth;
pub mod text;

// Re-exports for embedders
pub use crate::cache::{build_cache_key, build_merge_fingerprint, FingerprintInputs, SegmentCache};
pub use crate::config::{Role, Settings};
pub use crate::core::error::{Result, SegmentErrorCode, ServiceError};
pub use crate::core::metrics::{MetricsSnapshot, ServiceMetrics};
pub use crate::dict::{AutoLearner, DictStore, Resolver, PACK_PRIORITY};
pub use crate::jobs::{
    JobBackend, JobManager, JobRecord, JobRequest, JobStatus, MemoryBackend, RedisBackend,
    SegmentStatus,
};
pub use crate::server::{create_router, serve, AppState};
pub use crate::synth::{
    AudioCodec, CommandSynthesizerFactory, ConcatPart, EspeakPhonemizer, FfmpegCodec, PcmAudio,
    Phonemizer, SynthOutput, Synthesizer, SynthesizerFactory, SynthesizerPool,
};
pub use crate::text::{normalize_text, ReadingProfile};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used in logs and client-facing strings
pub const SERVICE_NAME: &str = "lexivox";
