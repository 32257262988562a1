//! Event system for decoupling automation from the flashing core.
//!
//! The transfer engine and the link monitor publish [`FlashEvent`]s into an
//! [`EventDispatcher`]. Delivery to observers happens on a separate task so
//! a slow observer never holds up a transfer. Events reach observers in the
//! order they were published.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::FailureReason;
use crate::link::LinkState;

/// Phase transitions of a single flash job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Started,
    ProgressUpdate { bytes_done: usize, bytes_total: usize },
    EraseDone,
    Succeeded,
    Failed(FailureReason),
}

impl PhaseEvent {
    /// Whole-number percentage for progress updates.
    pub fn percent(&self) -> Option<u8> {
        match *self {
            PhaseEvent::ProgressUpdate {
                bytes_done,
                bytes_total,
            } => Some(if bytes_total == 0 {
                100
            } else {
                (bytes_done * 100 / bytes_total) as u8
            }),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEvent::Started => write!(f, "started"),
            PhaseEvent::ProgressUpdate {
                bytes_done,
                bytes_total,
            } => write!(f, "progress {}/{}", bytes_done, bytes_total),
            PhaseEvent::EraseDone => write!(f, "erase done"),
            PhaseEvent::Succeeded => write!(f, "succeeded"),
            PhaseEvent::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Link health notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link entered `Connected` from `Connecting` or `Unresponsive`.
    Connected,
    /// Link entered `Unresponsive`.
    NoResponse,
    StateChanged { from: LinkState, to: LinkState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    Phase(PhaseEvent),
    Link(LinkEvent),
}

impl From<PhaseEvent> for FlashEvent {
    fn from(event: PhaseEvent) -> Self {
        FlashEvent::Phase(event)
    }
}

impl From<LinkEvent> for FlashEvent {
    fn from(event: LinkEvent) -> Self {
        FlashEvent::Link(event)
    }
}

/// Observer trait for receiving flash events.
///
/// Implementations run on the dispatcher's delivery task and should return
/// quickly.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Phase(PhaseEvent::Started) => tracing::info!("Flashing started"),
            FlashEvent::Phase(
                phase @ PhaseEvent::ProgressUpdate {
                    bytes_done,
                    bytes_total,
                },
            ) => {
                tracing::debug!(
                    done = bytes_done,
                    total = bytes_total,
                    progress = %format!("{}%", phase.percent().unwrap_or(0)),
                    "Progress"
                );
            }
            FlashEvent::Phase(PhaseEvent::EraseDone) => tracing::info!("Erase done"),
            FlashEvent::Phase(PhaseEvent::Succeeded) => tracing::info!("Flashing succeeded"),
            FlashEvent::Phase(PhaseEvent::Failed(reason)) => {
                tracing::error!(reason = %reason, "Flashing failed")
            }
            FlashEvent::Link(LinkEvent::Connected) => tracing::info!("Target connected"),
            FlashEvent::Link(LinkEvent::NoResponse) => tracing::warn!("Target not responding"),
            FlashEvent::Link(LinkEvent::StateChanged { from, to }) => {
                tracing::debug!(from = %from, to = %to, "Link state changed")
            }
        }
    }
}

/// Observer that keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<FlashEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase_events(&self) -> Vec<PhaseEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Phase(p) => Some(p),
                FlashEvent::Link(_) => None,
            })
            .collect()
    }

    pub fn link_events(&self) -> Vec<LinkEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Link(l) => Some(l),
                FlashEvent::Phase(_) => None,
            })
            .collect()
    }
}

impl FlashObserver for RecordingObserver {
    fn on_event(&self, event: &FlashEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
    }
}

/// The automation hooks a flasher exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    FlashingStart,
    ProgressUpdate,
    ErasingDone,
    FlashingSuccess,
    FlashingFailed,
    Connected,
    NoResponse,
}

impl TriggerKind {
    pub fn matches(&self, event: &FlashEvent) -> bool {
        matches!(
            (self, event),
            (TriggerKind::FlashingStart, FlashEvent::Phase(PhaseEvent::Started))
                | (
                    TriggerKind::ProgressUpdate,
                    FlashEvent::Phase(PhaseEvent::ProgressUpdate { .. })
                )
                | (TriggerKind::ErasingDone, FlashEvent::Phase(PhaseEvent::EraseDone))
                | (TriggerKind::FlashingSuccess, FlashEvent::Phase(PhaseEvent::Succeeded))
                | (TriggerKind::FlashingFailed, FlashEvent::Phase(PhaseEvent::Failed(_)))
                | (TriggerKind::Connected, FlashEvent::Link(LinkEvent::Connected))
                | (TriggerKind::NoResponse, FlashEvent::Link(LinkEvent::NoResponse))
        )
    }
}

/// Runs a closure for every event of one kind.
pub struct Trigger<F> {
    kind: TriggerKind,
    action: F,
}

impl<F> Trigger<F>
where
    F: Fn(&FlashEvent) + Send + Sync,
{
    pub fn new(kind: TriggerKind, action: F) -> Self {
        Self { kind, action }
    }
}

impl<F> FlashObserver for Trigger<F>
where
    F: Fn(&FlashEvent) + Send + Sync,
{
    fn on_event(&self, event: &FlashEvent) {
        if self.kind.matches(event) {
            (self.action)(event);
        }
    }
}

enum Envelope {
    Event(FlashEvent),
    Flush(oneshot::Sender<()>),
}

type ObserverList = Arc<RwLock<Vec<Arc<dyn FlashObserver>>>>;

/// Fire-and-forget event fan-out.
///
/// Cloning yields another handle onto the same queue and observer list.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
    observers: ObserverList,
}

impl EventDispatcher {
    /// Start the delivery task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        let delivery = observers.clone();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Event(event) => {
                        let current = delivery
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        for observer in current {
                            observer.on_event(&event);
                        }
                    }
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, observers }
    }

    pub fn subscribe(&self, observer: Arc<dyn FlashObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Queue an event for delivery. Never blocks.
    pub fn publish(&self, event: impl Into<FlashEvent>) {
        if self.tx.send(Envelope::Event(event.into())).is_err() {
            warn!("Event dispatcher stopped; event dropped");
        }
    }

    /// Wait until every event published before this call has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
