//! Synthesis capabilities: traits, pooling, and subprocess-backed bindings

pub mod command;
pub mod espeak;
pub mod ffmpeg;
pub mod pool;
pub mod traits;

pub use command::CommandSynthesizerFactory;
pub use espeak::EspeakPhonemizer;
pub use ffmpeg::FfmpegCodec;
pub use pool::{PooledSynthesizer, SynthesizerPool};
pub use traits::{
    AudioCodec, ConcatPart, PcmAudio, Phonemizer, SynthOutput, Synthesizer, SynthesizerFactory,
};
