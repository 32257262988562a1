//! Chunked transfer engine: erase, ordered chunk writes, optional read-back.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::job::{ChunkPlan, FlashJob, JobSnapshot, JobState};
use crate::checksum::{Md5Digest, digest_of};
use crate::error::FlashError;
use crate::events::{EventDispatcher, PhaseEvent};
use crate::transport::{FlashTransport, PAGE_SIZE, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub erase_attempts: u32,
    pub write_attempts: u32,
    pub erase_timeout: Duration,
    pub chunk_timeout: Duration,
    /// Ask the target for a digest of what it holds after the last chunk.
    pub verify_after_write: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: PAGE_SIZE,
            erase_attempts: 3,
            write_attempts: 3,
            erase_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(2),
            verify_after_write: true,
        }
    }
}

/// Shared cancellation flag, honoured between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Summary of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub label: String,
    pub length: usize,
    pub chunks: usize,
    /// Attempts beyond the first, over erase and all chunks.
    pub retries: u32,
    /// Digest the target reported after writing, if it can report one.
    pub target_digest: Option<Md5Digest>,
}

/// Outcome of a retried transport operation that ran out of attempts.
struct Exhausted {
    attempts: u32,
    source: TransportError,
}

pub struct TransferEngine {
    transport: Arc<dyn FlashTransport>,
    events: EventDispatcher,
    settings: TransferSettings,
    current: Mutex<Option<JobSnapshot>>,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn FlashTransport>,
        events: EventDispatcher,
        settings: TransferSettings,
    ) -> Self {
        Self {
            transport,
            events,
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Latest state of the running (or last) job.
    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_snapshot(&self, job: &FlashJob) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(job.snapshot());
    }

    fn enter(&self, job: &mut FlashJob, state: JobState) {
        job.goto_state(state);
        self.publish_snapshot(job);
    }

    /// Run `op` under `limit` up to `attempts` times. A timeout is a failed
    /// attempt like any other.
    async fn with_retries<F, Fut>(
        &self,
        what: &str,
        limit: Duration,
        attempts: u32,
        mut op: F,
    ) -> Result<u32, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let attempts = attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(limit, op()).await {
                Ok(Ok(())) => return Ok(attempt),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                },
            };
            warn!(op = what, attempt, of = attempts, error = %error, "Transport operation failed");
            last = Some(error);
        }
        Err(Exhausted {
            attempts,
            source: last.unwrap_or(TransportError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        })
    }

    /// Erase room for `length` bytes and publish `EraseDone`.
    ///
    /// Returns the number of attempts used.
    #[instrument(skip(self))]
    pub async fn erase(&self, length: usize) -> Result<u32, FlashError> {
        let transport = self.transport.clone();
        let used = self
            .with_retries(
                "erase",
                self.settings.erase_timeout,
                self.settings.erase_attempts,
                || {
                    let transport = transport.clone();
                    async move { transport.erase(length).await }
                },
            )
            .await
            .map_err(|e| FlashError::EraseError {
                attempts: e.attempts,
                source: e.source,
            })?;
        info!(length, attempts = used, "Erase complete");
        self.events.publish(PhaseEvent::EraseDone);
        Ok(used)
    }

    /// Drive `job` to a terminal state, writing `image` to the target.
    ///
    /// `image` must be the verified bytes the job's digest describes; a
    /// buffer whose length differs from the job's fails with
    /// `ChecksumMismatch` before the target is touched.
    #[instrument(skip_all, fields(job = %job.label(), length = job.length()))]
    pub async fn run(
        &self,
        job: &mut FlashJob,
        image: &[u8],
        cancel: &CancelToken,
    ) -> Result<JobReport, FlashError> {
        if job.state() != JobState::Idle {
            warn!(state = %job.state(), "Job already ran");
            return Err(FlashError::Busy);
        }
        self.publish_snapshot(job);

        match self.drive(job, image, cancel).await {
            Ok(report) => {
                self.enter(job, JobState::Succeeded);
                Ok(report)
            }
            Err(e) => {
                self.enter(job, JobState::Failed(e.reason()));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job: &mut FlashJob,
        image: &[u8],
        cancel: &CancelToken,
    ) -> Result<JobReport, FlashError> {
        let length = job.length();
        if image.len() != length {
            warn!(expected = length, given = image.len(), "Image length does not match job");
            return Err(FlashError::ChecksumMismatch {
                expected: job.digest().to_string(),
                computed: digest_of(image).to_string(),
            });
        }
        let plan = ChunkPlan::new(length, self.settings.chunk_size);
        let mut retries = 0;

        if cancel.is_cancelled() {
            return Err(FlashError::Cancelled {
                cursor: job.cursor(),
            });
        }

        self.enter(job, JobState::Erasing);
        retries += self.erase(length).await? - 1;

        self.enter(job, JobState::Writing);
        debug!(chunks = plan.total_chunks(), chunk_size = plan.chunk_size, "Writing");
        while let Some(range) = plan.chunk_at(job.cursor()) {
            if cancel.is_cancelled() {
                info!(cursor = job.cursor(), "Cancelled between chunks");
                return Err(FlashError::Cancelled {
                    cursor: job.cursor(),
                });
            }

            let offset = range.start;
            let chunk = &image[range];
            let transport = self.transport.clone();
            let used = self
                .with_retries(
                    "write",
                    self.settings.chunk_timeout,
                    self.settings.write_attempts,
                    || {
                        let transport = transport.clone();
                        async move { transport.write_chunk(offset, chunk).await }
                    },
                )
                .await
                .map_err(|e| FlashError::TransportError {
                    offset,
                    attempts: e.attempts,
                    source: e.source,
                })?;
            retries += used - 1;

            job.advance(chunk.len());
            self.publish_snapshot(job);
            self.events.publish(PhaseEvent::ProgressUpdate {
                bytes_done: job.cursor(),
                bytes_total: length,
            });
        }

        self.enter(job, JobState::VerifyingWrite);
        let target_digest = if self.settings.verify_after_write {
            self.verify_target(job).await?
        } else {
            None
        };

        Ok(JobReport {
            label: job.label().to_string(),
            length,
            chunks: plan.total_chunks(),
            retries,
            target_digest,
        })
    }

    async fn verify_target(&self, job: &FlashJob) -> Result<Option<Md5Digest>, FlashError> {
        let length = job.length();
        let reported = match tokio::time::timeout(
            self.settings.erase_timeout,
            self.transport.read_digest(length),
        )
        .await
        {
            Ok(Ok(reported)) => reported,
            Ok(Err(source)) => {
                return Err(FlashError::TransportError {
                    offset: length,
                    attempts: 1,
                    source,
                });
            }
            Err(_) => {
                return Err(FlashError::TransportError {
                    offset: length,
                    attempts: 1,
                    source: TransportError::Timeout {
                        timeout_ms: self.settings.erase_timeout.as_millis() as u64,
                    },
                });
            }
        };

        match reported {
            None => {
                debug!("Target cannot report a digest, skipping read-back check");
                Ok(None)
            }
            Some(digest) if digest == *job.digest() => {
                info!(md5 = %digest, "Target digest matches");
                Ok(Some(digest))
            }
            Some(digest) => {
                warn!(expected = %job.digest(), reported = %digest, "Target digest mismatch");
                Err(FlashError::WriteVerificationFailed {
                    expected: job.digest().to_string(),
                    reported: digest.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::events::RecordingObserver;
    use crate::transport::{MockTransport, TransportOp};

    fn settings() -> TransferSettings {
        TransferSettings {
            chunk_size: 512,
            erase_timeout: Duration::from_secs(1),
            chunk_timeout: Duration::from_millis(100),
            ..TransferSettings::default()
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn setup(
        mock: &MockTransport,
        settings: TransferSettings,
    ) -> (TransferEngine, Arc<RecordingObserver>, EventDispatcher) {
        let events = EventDispatcher::spawn();
        let recorder = Arc::new(RecordingObserver::new());
        events.subscribe(recorder.clone());
        let engine = TransferEngine::new(Arc::new(mock.clone()), events.clone(), settings);
        (engine, recorder, events)
    }

    fn progress(recorder: &RecordingObserver) -> Vec<usize> {
        recorder
            .phase_events()
            .into_iter()
            .filter_map(|e| match e {
                PhaseEvent::ProgressUpdate { bytes_done, .. } => Some(bytes_done),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_writes_in_order_and_reports_progress() {
        let mock = MockTransport::new();
        let (engine, recorder, events) = setup(&mock, settings());
        let data = image(1300);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());

        let report = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap();
        events.flush().await;

        assert_eq!(report.chunks, 3);
        assert_eq!(report.retries, 0);
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(job.cursor(), 1300);
        assert_eq!(mock.memory(), data);
        assert_eq!(mock.writes(), vec![(0, 512), (512, 512), (1024, 276)]);
        assert_eq!(mock.ops()[0], TransportOp::Erase { length: 1300 });
        assert_eq!(progress(&recorder), vec![512, 1024, 1300]);
        assert_eq!(recorder.phase_events()[0], PhaseEvent::EraseDone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_erase_retries_then_gives_up() {
        let mock = MockTransport::new();
        mock.fail_erases(3);
        let (engine, recorder, events) = setup(&mock, settings());
        let data = image(64);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());

        let err = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap_err();
        events.flush().await;

        assert!(matches!(err, FlashError::EraseError { attempts: 3, .. }));
        assert_eq!(job.state(), JobState::Failed(FailureReason::EraseError));
        assert!(mock.writes().is_empty());
        assert!(recorder.phase_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_timeouts_share_the_write_budget() {
        let mock = MockTransport::new();
        mock.stall_chunk(512, 3);
        let (engine, _recorder, _events) = setup(&mock, settings());
        let data = image(1536);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());

        let err = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap_err();
        match err {
            FlashError::TransportError {
                offset,
                attempts,
                source: TransportError::Timeout { .. },
            } => {
                assert_eq!(offset, 512);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(job.cursor(), 512);
        assert_eq!(mock.write_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried() {
        let mock = MockTransport::new();
        mock.fail_chunk(0, 2);
        let (engine, _recorder, _events) = setup(&mock, settings());
        let data = image(700);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());

        let report = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(mock.memory(), data);
    }

    #[tokio::test]
    async fn test_cancel_before_start_touches_nothing() {
        let mock = MockTransport::new();
        let (engine, _recorder, _events) = setup(&mock, settings());
        let data = image(1024);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = engine.run(&mut job, &data, &cancel).await.unwrap_err();
        assert!(matches!(err, FlashError::Cancelled { cursor: 0 }));
        assert!(mock.ops().is_empty());
    }

    #[tokio::test]
    async fn test_target_digest_checked_after_write() {
        let mock = MockTransport::new();
        mock.report_digest(true);
        let (engine, _recorder, _events) = setup(&mock, settings());
        let data = image(900);

        let mut job = FlashJob::new("fw", digest_of(&data), data.len());
        let report = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap();
        assert_eq!(report.target_digest, Some(digest_of(&data)));

        mock.corrupt_readback(true);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());
        let err = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, FlashError::WriteVerificationFailed { .. }));
        assert_eq!(
            job.state(),
            JobState::Failed(FailureReason::WriteVerificationFailed)
        );
    }

    #[tokio::test]
    async fn test_terminal_job_is_not_rerun() {
        let mock = MockTransport::new();
        let (engine, _recorder, _events) = setup(&mock, settings());
        let data = image(10);
        let mut job = FlashJob::new("fw", digest_of(&data), data.len());

        engine.run(&mut job, &data, &CancelToken::new()).await.unwrap();
        let ops = mock.ops().len();
        assert!(engine.run(&mut job, &data, &CancelToken::new()).await.is_err());
        assert_eq!(mock.ops().len(), ops);
        assert_eq!(engine.snapshot().unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_short_buffer_is_rejected_before_erase() {
        let mock = MockTransport::new();
        let (engine, recorder, events) = setup(&mock, settings());
        let data = image(100);
        let mut job = FlashJob::new("fw", digest_of(&image(300)), 300);

        let err = engine.run(&mut job, &data, &CancelToken::new()).await.unwrap_err();
        events.flush().await;

        assert!(matches!(err, FlashError::ChecksumMismatch { .. }));
        assert_eq!(job.state(), JobState::Failed(FailureReason::ChecksumMismatch));
        assert_eq!(job.cursor(), 0);
        assert!(mock.ops().is_empty());
        assert!(recorder.phase_events().is_empty());
    }
}
