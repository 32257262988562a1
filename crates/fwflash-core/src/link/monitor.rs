//! Link state machine for one target device.
//!
//! Liveness probes and reset requests drive the transitions. The `Flashing`
//! state doubles as the exclusive lock on the transport: it is taken by
//! [`LinkMonitor::begin_flash`] and held by the returned [`FlashLease`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::state::LinkState;
use crate::error::FlashError;
use crate::events::{EventDispatcher, LinkEvent};
use crate::transport::{FlashTransport, ResetLine, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Timeout of a single liveness probe.
    pub probe_timeout: Duration,
    /// Consecutive missed probes before the target counts as unresponsive.
    pub unresponsive_after: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            unresponsive_after: 3,
        }
    }
}

#[derive(Debug, Default)]
struct LinkInner {
    state: LinkState,
    missed_probes: u32,
}

/// How a flash lease ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The target is still reachable.
    Healthy,
    /// The job died on a transport failure; contact must be re-established.
    LinkLost,
}

pub struct LinkMonitor {
    inner: Mutex<LinkInner>,
    /// Serialises transactions on the transport between probes and jobs.
    bus: Arc<AsyncMutex<()>>,
    settings: LinkSettings,
    events: EventDispatcher,
}

impl LinkMonitor {
    pub fn new(settings: LinkSettings, events: EventDispatcher) -> Self {
        Self {
            inner: Mutex::new(LinkInner::default()),
            bus: Arc::new(AsyncMutex::new(())),
            settings,
            events,
        }
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn goto_state(&self, inner: &mut LinkInner, to: LinkState) {
        let from = inner.state;
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "Link state transition");
        inner.state = to;
        self.events.publish(LinkEvent::StateChanged { from, to });

        match to {
            LinkState::Connected
                if matches!(from, LinkState::Connecting | LinkState::Unresponsive) =>
            {
                self.events.publish(LinkEvent::Connected);
            }
            LinkState::Unresponsive => self.events.publish(LinkEvent::NoResponse),
            _ => {}
        }
    }

    /// Issue one liveness probe and apply its result.
    ///
    /// While a job holds the link no transaction is started and the state is
    /// returned unchanged.
    #[instrument(level = "debug", skip_all)]
    pub async fn probe(&self, transport: &dyn FlashTransport) -> LinkState {
        let Ok(_bus) = self.bus.clone().try_lock_owned() else {
            debug!("Transport in use, skipping probe");
            return self.state();
        };
        {
            let mut inner = self.lock();
            if !inner.state.accepts_probe() {
                return inner.state;
            }
            if inner.state == LinkState::Disconnected {
                self.goto_state(&mut inner, LinkState::Connecting);
            }
        }

        let responsive = match tokio::time::timeout(
            self.settings.probe_timeout,
            transport.read_status(),
        )
        .await
        {
            Ok(Ok(health)) => {
                debug!(?health, "Probe answered");
                health.is_responsive()
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.settings.probe_timeout.as_millis() as u64,
                    "Probe timed out"
                );
                false
            }
        };

        let mut inner = self.lock();
        if !inner.state.accepts_probe() {
            return inner.state;
        }
        if responsive {
            inner.missed_probes = 0;
            if inner.state == LinkState::Unresponsive {
                self.goto_state(&mut inner, LinkState::Connecting);
            }
            self.goto_state(&mut inner, LinkState::Connected);
        } else {
            inner.missed_probes += 1;
            if inner.missed_probes >= self.settings.unresponsive_after
                && matches!(inner.state, LinkState::Connecting | LinkState::Connected)
            {
                warn!(missed = inner.missed_probes, "Target stopped answering probes");
                self.goto_state(&mut inner, LinkState::Unresponsive);
            }
        }
        inner.state
    }

    /// Probe periodically until the returned task is aborted.
    pub fn spawn_prober(
        self: Arc<Self>,
        transport: Arc<dyn FlashTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe(transport.as_ref()).await;
            }
        })
    }

    /// Take the link for a flash job.
    ///
    /// Fails with `Busy` while another job holds it and with `NoResponse`
    /// unless the target is `Connected`.
    pub async fn begin_flash(self: &Arc<Self>) -> Result<FlashLease, FlashError> {
        {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                LinkState::Flashing => return Err(FlashError::Busy),
                state if !state.can_start_flash() => {
                    debug!(state = %state, "Refusing flash, target not connected");
                    return Err(FlashError::NoResponse);
                }
                _ => self.goto_state(&mut inner, LinkState::Flashing),
            }
        }
        // Flashing is set, so no new probe starts; wait out one in flight.
        let bus = self.bus.clone().lock_owned().await;
        Ok(FlashLease {
            monitor: self.clone(),
            _bus: bus,
            released: false,
        })
    }

    fn end_flash(&self, outcome: LeaseOutcome) {
        let mut inner = self.lock();
        if inner.state != LinkState::Flashing {
            return;
        }
        inner.missed_probes = 0;
        let next = match outcome {
            LeaseOutcome::Healthy => LinkState::Connected,
            LeaseOutcome::LinkLost => LinkState::Disconnected,
        };
        self.goto_state(&mut inner, next);
    }

    fn refuse_while_flashing(&self) -> Result<(), FlashError> {
        if self.state() == LinkState::Flashing {
            Err(FlashError::Busy)
        } else {
            Ok(())
        }
    }

    /// Assert the reset line and keep it asserted.
    #[instrument(skip_all)]
    pub fn hold_reset(&self, line: &dyn ResetLine) -> Result<(), FlashError> {
        self.refuse_while_flashing()?;
        line.assert_reset().map_err(reset_failed)?;
        let mut inner = self.lock();
        inner.missed_probes = 0;
        self.goto_state(&mut inner, LinkState::Disconnected);
        Ok(())
    }

    /// Release the reset line; the target boots and is probed again.
    #[instrument(skip_all)]
    pub fn release_reset(&self, line: &dyn ResetLine) -> Result<(), FlashError> {
        self.refuse_while_flashing()?;
        line.release_reset().map_err(reset_failed)?;
        let mut inner = self.lock();
        inner.missed_probes = 0;
        self.goto_state(&mut inner, LinkState::Connecting);
        Ok(())
    }

    /// Assert reset for `hold`, then release it.
    pub async fn pulse_reset(&self, line: &dyn ResetLine, hold: Duration) -> Result<(), FlashError> {
        self.hold_reset(line)?;
        tokio::time::sleep(hold).await;
        self.release_reset(line)
    }
}

fn reset_failed(source: TransportError) -> FlashError {
    FlashError::TransportError {
        offset: 0,
        attempts: 1,
        source,
    }
}

/// Exclusive hold on a target's link for the duration of a flash job.
///
/// Dropping the lease without calling [`FlashLease::release`] returns the
/// link to `Connected`.
pub struct FlashLease {
    monitor: Arc<LinkMonitor>,
    _bus: OwnedMutexGuard<()>,
    released: bool,
}

impl FlashLease {
    pub fn release(mut self, outcome: LeaseOutcome) {
        self.released = true;
        self.monitor.end_flash(outcome);
    }
}

impl Drop for FlashLease {
    fn drop(&mut self) {
        if !self.released {
            self.monitor.end_flash(LeaseOutcome::Healthy);
        }
    }
}
