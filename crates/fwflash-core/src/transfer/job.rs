//! Flash job bookkeeping.

use std::fmt;

use crate::checksum::Md5Digest;
use crate::error::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Erasing,
    Writing,
    VerifyingWrite,
    Succeeded,
    Failed(FailureReason),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "IDLE"),
            JobState::Erasing => write!(f, "ERASING"),
            JobState::Writing => write!(f, "WRITING"),
            JobState::VerifyingWrite => write!(f, "VERIFYING_WRITE"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed(reason) => write!(f, "FAILED({})", reason),
        }
    }
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// One attempt to write one verified image to one target.
#[derive(Debug)]
pub struct FlashJob {
    label: String,
    digest: Md5Digest,
    length: usize,
    cursor: usize,
    state: JobState,
}

impl FlashJob {
    pub fn new(label: impl Into<String>, digest: Md5Digest, length: usize) -> Self {
        Self {
            label: label.into(),
            digest,
            length,
            cursor: 0,
            state: JobState::Idle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn digest(&self) -> &Md5Digest {
        &self.digest
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes confirmed written.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn goto_state(&mut self, new_state: JobState) {
        tracing::debug!(job = %self.label, from = %self.state, to = %new_state, "Job state transition");
        self.state = new_state;
    }

    /// Move the cursor forward; it never decreases and never passes `length`.
    pub(crate) fn advance(&mut self, bytes: usize) {
        self.cursor = self.cursor.saturating_add(bytes).min(self.length);
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            label: self.label.clone(),
            length: self.length,
            cursor: self.cursor,
            state: self.state,
        }
    }
}

/// Read-only view of a job, for status queries while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub label: String,
    pub length: usize,
    pub cursor: usize,
    pub state: JobState,
}

impl JobSnapshot {
    pub fn percent(&self) -> u8 {
        if self.length == 0 {
            100
        } else {
            (self.cursor * 100 / self.length) as u8
        }
    }
}

/// Splits an image into offset-ordered chunks; the last one may be short.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    pub length: usize,
    pub chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(length: usize, chunk_size: usize) -> Self {
        Self {
            length,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.length.div_ceil(self.chunk_size)
    }

    /// The chunk starting at `offset`, as a range into the image.
    pub fn chunk_at(&self, offset: usize) -> Option<std::ops::Range<usize>> {
        (offset < self.length).then(|| offset..(offset + self.chunk_size).min(self.length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(length: usize) -> FlashJob {
        FlashJob::new(
            "test",
            Md5Digest::parse("d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            length,
        )
    }

    #[test]
    fn test_cursor_is_monotone_and_capped() {
        let mut job = job(1000);
        let mut last = 0;
        for step in [0, 256, 256, 100, 512, 512] {
            job.advance(step);
            assert!(job.cursor() >= last);
            assert!(job.cursor() <= job.length());
            last = job.cursor();
        }
        assert_eq!(job.cursor(), 1000);
        job.advance(usize::MAX);
        assert_eq!(job.cursor(), 1000);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed(FailureReason::Cancelled).is_terminal());
        assert!(!JobState::Writing.is_terminal());
        assert_eq!(
            JobState::Failed(FailureReason::Busy).to_string(),
            "FAILED(busy)"
        );
    }

    #[test]
    fn test_chunk_plan() {
        let plan = ChunkPlan::new(1300, 512);
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(plan.chunk_at(0), Some(0..512));
        assert_eq!(plan.chunk_at(1024), Some(1024..1300));
        assert_eq!(plan.chunk_at(1300), None);

        assert_eq!(ChunkPlan::new(0, 256).total_chunks(), 0);
        assert_eq!(ChunkPlan::new(512, 256).total_chunks(), 2);
    }

    #[test]
    fn test_snapshot_percent() {
        let mut job = job(1536);
        job.advance(512);
        let snap = job.snapshot();
        assert_eq!(snap.cursor, 512);
        assert_eq!(snap.percent(), 33);
        assert_eq!(snap.state, JobState::Idle);
    }
}
