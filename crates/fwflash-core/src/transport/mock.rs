//! Mock flash transport for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::traits::{FlashTransport, LinkHealth, ResetLine, TransportError};
use crate::checksum::{Md5Digest, digest_of};

/// Long enough to outlast any timeout a test configures.
const STALL: Duration = Duration::from_secs(3600);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A completed transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    Erase { length: usize },
    Write { offset: usize, len: usize },
    ReadStatus,
    ReadDigest { length: usize },
}

/// Rendezvous point that parks a chunk write until the test opens it.
#[derive(Default)]
pub struct ChunkGate {
    reached: Notify,
    release: Notify,
}

impl ChunkGate {
    /// Wait until the engine is parked on the gated chunk.
    pub async fn wait_reached(&self) {
        self.reached.notified().await;
    }

    /// Let the parked write complete.
    pub fn open(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct Faults {
    erase_failures: u32,
    /// Offset -> remaining attempts that stall past any timeout.
    stalls: HashMap<usize, u32>,
    /// Offset -> remaining attempts that fail outright.
    write_failures: HashMap<usize, u32>,
    gates: HashMap<usize, Arc<ChunkGate>>,
}

/// In-memory target for unit and scenario tests.
///
/// Clones share the same simulated memory and operation log.
#[derive(Clone)]
pub struct MockTransport {
    memory: Arc<Mutex<Vec<u8>>>,
    ops: Arc<Mutex<Vec<TransportOp>>>,
    faults: Arc<Mutex<Faults>>,
    health: Arc<Mutex<LinkHealth>>,
    stall_probes: Arc<AtomicBool>,
    report_digest: Arc<AtomicBool>,
    corrupt_readback: Arc<AtomicBool>,
    write_attempts: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(Mutex::new(Vec::new())),
            ops: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
            health: Arc::new(Mutex::new(LinkHealth::Ready)),
            stall_probes: Arc::new(AtomicBool::new(false)),
            report_digest: Arc::new(AtomicBool::new(false)),
            corrupt_readback: Arc::new(AtomicBool::new(false)),
            write_attempts: Arc::new(AtomicUsize::new(0)),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the answer to subsequent liveness probes.
    pub fn set_health(&self, health: LinkHealth) {
        *lock(&self.health) = health;
    }

    /// Make probes hang instead of answering.
    pub fn stall_probes(&self, stall: bool) {
        self.stall_probes.store(stall, Ordering::SeqCst);
    }

    /// Fail the next `times` erase attempts.
    pub fn fail_erases(&self, times: u32) {
        lock(&self.faults).erase_failures = times;
    }

    /// Make the next `times` writes at `offset` hang past any timeout.
    pub fn stall_chunk(&self, offset: usize, times: u32) {
        lock(&self.faults).stalls.insert(offset, times);
    }

    /// Make the next `times` writes at `offset` fail.
    pub fn fail_chunk(&self, offset: usize, times: u32) {
        lock(&self.faults).write_failures.insert(offset, times);
    }

    /// Park the next write at `offset` until the returned gate is opened.
    pub fn gate_chunk(&self, offset: usize) -> Arc<ChunkGate> {
        let gate = Arc::new(ChunkGate::default());
        lock(&self.faults).gates.insert(offset, gate.clone());
        gate
    }

    /// Answer digest queries with the md5 of simulated memory.
    pub fn report_digest(&self, enabled: bool) {
        self.report_digest.store(enabled, Ordering::SeqCst);
    }

    /// Flip a bit in what the target reports back, as a bad cell would.
    pub fn corrupt_readback(&self, enabled: bool) {
        self.corrupt_readback.store(enabled, Ordering::SeqCst);
    }

    /// All completed operations, in order.
    pub fn ops(&self) -> Vec<TransportOp> {
        lock(&self.ops).clone()
    }

    /// Completed writes as `(offset, len)`.
    pub fn writes(&self) -> Vec<(usize, usize)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Write { offset, len } => Some((offset, len)),
                _ => None,
            })
            .collect()
    }

    pub fn erase_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, TransportOp::Erase { .. }))
            .count()
    }

    /// Write attempts, including ones that failed or stalled.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Probes received, answered or not.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Snapshot of simulated memory.
    pub fn memory(&self) -> Vec<u8> {
        lock(&self.memory).clone()
    }

    fn record(&self, op: TransportOp) {
        lock(&self.ops).push(op);
    }

    fn take_fault(map: &mut HashMap<usize, u32>, offset: usize) -> bool {
        match map.get_mut(&offset) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlashTransport for MockTransport {
    async fn erase(&self, length: usize) -> Result<(), TransportError> {
        {
            let mut faults = lock(&self.faults);
            if faults.erase_failures > 0 {
                faults.erase_failures -= 1;
                return Err(TransportError::EraseFailed("simulated erase fault".into()));
            }
        }
        {
            let mut memory = lock(&self.memory);
            memory.clear();
            memory.resize(length, 0xFF);
        }
        self.record(TransportOp::Erase { length });
        Ok(())
    }

    async fn write_chunk(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let (stall, fail, gate) = {
            let mut faults = lock(&self.faults);
            let stall = Self::take_fault(&mut faults.stalls, offset);
            let fail = Self::take_fault(&mut faults.write_failures, offset);
            let gate = faults.gates.remove(&offset);
            (stall, fail, gate)
        };

        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        if stall {
            tokio::time::sleep(STALL).await;
        }
        if fail {
            return Err(TransportError::WriteFailed(format!(
                "simulated fault at {offset:#x}"
            )));
        }

        {
            let mut memory = lock(&self.memory);
            let end = offset + data.len();
            if memory.len() < end {
                memory.resize(end, 0xFF);
            }
            memory[offset..end].copy_from_slice(data);
        }
        self.record(TransportOp::Write {
            offset,
            len: data.len(),
        });
        Ok(())
    }

    async fn read_status(&self) -> Result<LinkHealth, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.stall_probes.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        let health = *lock(&self.health);
        self.record(TransportOp::ReadStatus);
        Ok(health)
    }

    async fn read_digest(&self, length: usize) -> Result<Option<Md5Digest>, TransportError> {
        if !self.report_digest.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut held = lock(&self.memory).clone();
        held.resize(length, 0xFF);
        if self.corrupt_readback.load(Ordering::SeqCst) {
            if let Some(first) = held.first_mut() {
                *first ^= 0x01;
            }
        }
        self.record(TransportOp::ReadDigest { length });
        Ok(Some(digest_of(&held)))
    }
}

/// Reset line that only records what it was told.
#[derive(Default)]
pub struct MockResetLine {
    asserted: AtomicBool,
    pulses: AtomicUsize,
    broken: AtomicBool,
}

impl MockResetLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }

    /// Completed assert/release cycles.
    pub fn pulses(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail.
    pub fn break_line(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(TransportError::Reset("line stuck".into()))
        } else {
            Ok(())
        }
    }
}

impl ResetLine for MockResetLine {
    fn assert_reset(&self) -> Result<(), TransportError> {
        self.check()?;
        self.asserted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release_reset(&self) -> Result<(), TransportError> {
        self.check()?;
        if self.asserted.swap(false, Ordering::SeqCst) {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_erase_and_write() {
        let mock = MockTransport::new();
        mock.erase(8).await.unwrap();
        mock.write_chunk(0, b"abcd").await.unwrap();

        assert_eq!(mock.memory(), b"abcd\xFF\xFF\xFF\xFF");
        assert_eq!(
            mock.ops(),
            vec![
                TransportOp::Erase { length: 8 },
                TransportOp::Write { offset: 0, len: 4 }
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_faults_are_consumed() {
        let mock = MockTransport::new();
        mock.fail_erases(1);
        mock.fail_chunk(4, 1);

        assert!(mock.erase(8).await.is_err());
        assert!(mock.erase(8).await.is_ok());
        assert!(mock.write_chunk(4, b"x").await.is_err());
        assert!(mock.write_chunk(4, b"x").await.is_ok());
        assert_eq!(mock.write_attempts(), 2);
        assert_eq!(mock.writes(), vec![(4, 1)]);
    }

    #[tokio::test]
    async fn test_mock_digest_reporting() {
        let mock = MockTransport::new();
        assert!(mock.read_digest(0).await.unwrap().is_none());

        mock.report_digest(true);
        let digest = mock.read_digest(0).await.unwrap().unwrap();
        assert_eq!(digest.as_str(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_mock_reset_line() {
        let line = MockResetLine::new();
        line.assert_reset().unwrap();
        assert!(line.is_asserted());
        line.release_reset().unwrap();
        line.release_reset().unwrap();
        assert_eq!(line.pulses(), 1);

        line.break_line();
        assert!(line.assert_reset().is_err());
    }
}
