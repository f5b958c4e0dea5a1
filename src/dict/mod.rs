//! Dictionary packs, persistence, auto-learning, and pronunciation resolution

pub mod learner;
pub mod pack;
pub mod resolver;
pub mod store;

pub use learner::AutoLearner;
pub use pack::{mtime_version, DictPack};
pub use resolver::{ResolveOutcome, Resolver};
pub use store::{DictStore, PackSummary, PACK_PRIORITY};
