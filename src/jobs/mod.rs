//! Job scheduling: records, stores, queueing, workers, and merging

pub mod manager;
pub mod merge;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod types;
pub mod worker;

pub use manager::{JobManager, StatusSnapshot};
pub use queue::LocalJobQueue;
pub use redis_store::RedisBackend;
pub use store::{JobBackend, MemoryBackend};
pub use types::{
    now_ts, ClaimToken, CommitOutcome, JobRecord, JobRequest, JobStatus, ProgressSummary,
    SegmentError, SegmentRecord, SegmentStatus,
};
pub use worker::{spawn_workers, Worker};
