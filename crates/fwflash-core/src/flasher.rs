//! Flasher - high-level orchestrator for one target.
//!
//! Wires the image resolver, checksum verification, the link monitor and
//! the transfer engine together. Every job ends with exactly one
//! `Succeeded` or `Failed` event.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::checksum::{self, ChecksumResolver, ChecksumSpec};
use crate::config::FlasherConfig;
use crate::error::FlashError;
use crate::events::{EventDispatcher, PhaseEvent};
use crate::image::{Downloader, EmbeddedImage, ImageDescriptor, ImageResolver};
use crate::link::{FlashLease, LeaseOutcome, LinkMonitor, LinkSettings, LinkState};
use crate::transfer::{CancelToken, FlashJob, JobReport, JobSnapshot, TransferEngine, TransferSettings};
use crate::transport::{FlashTransport, ResetLine};

/// A validated request: one image, one checksum source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    pub image: ImageDescriptor,
    pub checksum: ChecksumSpec,
}

impl FlashRequest {
    pub fn new(image: ImageDescriptor, checksum: ChecksumSpec) -> Self {
        Self { image, checksum }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlasherStatus {
    pub link: LinkState,
    /// Current or most recent job.
    pub job: Option<JobSnapshot>,
}

pub struct Flasher {
    images: Arc<ImageResolver>,
    checksums: ChecksumResolver,
    link: Arc<LinkMonitor>,
    engine: TransferEngine,
    transport: Arc<dyn FlashTransport>,
    events: EventDispatcher,
    cancel: CancelToken,
    reset_pulse: Duration,
}

impl Flasher {
    pub fn new(
        transport: Arc<dyn FlashTransport>,
        images: Arc<ImageResolver>,
        events: EventDispatcher,
        transfer: TransferSettings,
        link: LinkSettings,
    ) -> Self {
        Self {
            checksums: ChecksumResolver::new(images.clone()),
            images,
            link: Arc::new(LinkMonitor::new(link, events.clone())),
            engine: TransferEngine::new(transport.clone(), events.clone(), transfer),
            transport,
            events,
            cancel: CancelToken::new(),
            reset_pulse: Duration::from_millis(100),
        }
    }

    /// How long [`Flasher::reset_target`] holds the reset line.
    pub fn with_reset_pulse(mut self, hold: Duration) -> Self {
        self.reset_pulse = hold;
        self
    }

    pub fn from_config(
        config: &FlasherConfig,
        transport: Arc<dyn FlashTransport>,
        downloader: Arc<dyn Downloader>,
        events: EventDispatcher,
    ) -> Self {
        let images = Arc::new(ImageResolver::new(config.cache_dir.clone(), downloader));
        Self::new(
            transport,
            images,
            events,
            config.transfer.settings(),
            config.link.settings(),
        )
        .with_reset_pulse(config.link.reset_pulse())
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn link(&self) -> &Arc<LinkMonitor> {
        &self.link
    }

    pub fn images(&self) -> &Arc<ImageResolver> {
        &self.images
    }

    /// One liveness probe of the target.
    pub async fn probe(&self) -> LinkState {
        self.link.probe(self.transport.as_ref()).await
    }

    pub fn spawn_prober(&self, interval: Duration) -> JoinHandle<()> {
        self.link
            .clone()
            .spawn_prober(self.transport.clone(), interval)
    }

    /// Pulse the target's reset line and probe it once it has been released.
    pub async fn reset_target(&self, line: &dyn ResetLine) -> Result<LinkState, FlashError> {
        self.link.pulse_reset(line, self.reset_pulse).await?;
        Ok(self.probe().await)
    }

    /// True while a job holds the target.
    pub fn in_progress(&self) -> bool {
        self.link.state() == LinkState::Flashing
    }

    pub fn status(&self) -> FlasherStatus {
        FlasherStatus {
            link: self.link.state(),
            job: self.engine.snapshot(),
        }
    }

    /// Ask the running job to stop at the next chunk boundary.
    pub fn cancel(&self) {
        if self.in_progress() {
            info!("Cancellation requested");
        }
        self.cancel.cancel();
    }

    async fn acquire(&self) -> Result<FlashLease, FlashError> {
        // Connected, Flashing and Unresponsive are settled; anything else
        // gets one probe before the link is judged.
        if matches!(
            self.link.state(),
            LinkState::Disconnected | LinkState::Connecting
        ) {
            self.probe().await;
        }
        self.link.begin_flash().await
    }

    fn finish<T>(&self, lease: FlashLease, result: &Result<T, FlashError>) {
        match result {
            Ok(_) => {
                self.events.publish(PhaseEvent::Succeeded);
                lease.release(LeaseOutcome::Healthy);
            }
            Err(e) => {
                warn!(reason = %e.reason(), error = %e, "Job failed");
                self.events.publish(PhaseEvent::Failed(e.reason()));
                lease.release(if e.is_link_failure() {
                    LeaseOutcome::LinkLost
                } else {
                    LeaseOutcome::Healthy
                });
            }
        }
    }

    /// Resolve, verify and write one image.
    #[instrument(skip_all, fields(image = %request.image))]
    pub async fn flash(&self, request: &FlashRequest) -> Result<JobReport, FlashError> {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(reason = %e.reason(), "Flash request rejected");
                self.events.publish(PhaseEvent::Failed(e.reason()));
                return Err(e);
            }
        };
        self.cancel.reset();
        self.events.publish(PhaseEvent::Started);

        let result = self.run_job(request).await;
        self.finish(lease, &result);
        result
    }

    async fn run_job(&self, request: &FlashRequest) -> Result<JobReport, FlashError> {
        let resolved = self.images.resolve(&request.image).await?;
        let expected = self.checksums.resolve_digest(&request.checksum).await?;
        checksum::ensure_matches(&resolved.bytes, &expected)?;

        if let Some(version) = &request.image.version {
            info!(version = %version, length = resolved.length, "Flashing image");
        } else {
            info!(length = resolved.length, "Flashing image");
        }
        let mut job = FlashJob::new(request.image.to_string(), expected, resolved.length);
        self.engine.run(&mut job, &resolved.bytes, &self.cancel).await
    }

    /// Flash the image built into this binary.
    pub async fn flash_embedded(&self, image: EmbeddedImage) -> Result<JobReport, FlashError> {
        if !image.looks_like_factory() {
            warn!(
                name = image.name.unwrap_or_default(),
                "Embedded image file name does not contain 'factory'"
            );
        }
        let request = FlashRequest::new(
            ImageDescriptor::embedded(image),
            ChecksumSpec::Literal(image.md5.to_string()),
        );
        self.flash(&request).await
    }

    /// Erase room for `length` bytes without writing anything.
    #[instrument(skip(self))]
    pub async fn erase(&self, length: usize) -> Result<(), FlashError> {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                self.events.publish(PhaseEvent::Failed(e.reason()));
                return Err(e);
            }
        };
        let result = self.engine.erase(length).await.map(|_| ());
        if let Err(e) = &result {
            self.events.publish(PhaseEvent::Failed(e.reason()));
            lease.release(LeaseOutcome::LinkLost);
        } else {
            lease.release(LeaseOutcome::Healthy);
        }
        result
    }
}
