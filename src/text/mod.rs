//! Text processing: normalization, reading profiles, and chunking

pub mod chunker;
pub mod normalizer;
pub mod profile;

pub use chunker::{chunk_text, ChunkOptions};
pub use normalizer::{apply_reading_modes, canonical_text, normalize_text};
pub use profile::{AcronymMode, NumberMode, QuoteMode, ReadingProfile};
