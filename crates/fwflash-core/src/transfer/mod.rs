//! Chunked transfer of a verified image to a target.

pub mod engine;
pub mod job;

pub use engine::{CancelToken, JobReport, TransferEngine, TransferSettings};
pub use job::{ChunkPlan, FlashJob, JobSnapshot, JobState};
