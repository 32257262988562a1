use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use fwflash_core::{
    ChecksumResolver, EventDispatcher, FileFlash, FlashEvent, Flasher, FlasherConfig,
    HttpDownloader, ImageConfig, ImageResolver, PhaseEvent, TracingObserver, Trigger,
    TriggerKind, checksum,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware image flasher", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for downloaded images and digest files
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve, verify and write an image to the target
    Flash {
        #[command(flatten)]
        image: ImageArgs,

        /// File emulating the target's flash memory
        #[arg(long)]
        target: PathBuf,

        /// Bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Erase the target without writing
    Erase {
        #[arg(long)]
        target: PathBuf,

        /// Bytes to erase, rounded up to whole sectors
        #[arg(long)]
        length: usize,
    },
    /// Resolve an image and check it against its digest, without a target
    Verify {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Probe the target and print its link state
    Probe {
        #[arg(long)]
        target: PathBuf,

        /// Keep probing at the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Write a configuration file with default values
    InitConfig { path: PathBuf },
}

#[derive(ClapArgs, Debug)]
struct ImageArgs {
    /// Image path or http(s) URL; falls back to the config file
    #[arg(long)]
    image: Option<String>,

    /// Expected MD5 digest
    #[arg(long, group = "checksum")]
    md5: Option<String>,

    /// File whose first line is the expected MD5 digest
    #[arg(long, group = "checksum")]
    md5_file: Option<PathBuf>,

    /// URL of a file whose first line is the expected MD5 digest
    #[arg(long, group = "checksum")]
    md5_url: Option<String>,

    /// Version tag of the image, e.g. v1.2.0-rc.1
    #[arg(long)]
    image_version: Option<String>,
}

impl ImageArgs {
    /// CLI flags override the `[image]` table of the config file.
    fn merge(self, from_file: Option<ImageConfig>) -> Result<ImageConfig> {
        let checksum_given = self.md5.is_some() || self.md5_file.is_some() || self.md5_url.is_some();
        let mut image = match (self.image, from_file) {
            (Some(image_file), _) => ImageConfig {
                image_file,
                ..ImageConfig::default()
            },
            (None, Some(cfg)) => cfg,
            (None, None) => bail!("No image given; use --image or an [image] table in the config"),
        };
        if checksum_given {
            image.md5 = self.md5;
            image.md5_file = self.md5_file;
            image.md5_url = self.md5_url;
        }
        if self.image_version.is_some() {
            image.version = self.image_version;
        }
        Ok(image)
    }
}

fn load_config(args: &Args) -> Result<FlasherConfig> {
    let mut config = match &args.config {
        Some(path) => FlasherConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FlasherConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

fn progress_printer(events: &EventDispatcher) {
    events.subscribe(Arc::new(Trigger::new(TriggerKind::ProgressUpdate, |event| {
        if let FlashEvent::Phase(phase) = event {
            eprint!("\rFlashing: {:3}%", phase.percent().unwrap_or(0));
            let _ = std::io::stderr().flush();
        }
    })));
    events.subscribe(Arc::new(Trigger::new(TriggerKind::FlashingSuccess, |_| {
        eprintln!();
    })));
    events.subscribe(Arc::new(Trigger::new(TriggerKind::FlashingFailed, |event| {
        if let FlashEvent::Phase(PhaseEvent::Failed(reason)) = event {
            eprintln!("\nFailed: {}", reason);
        }
    })));
}

fn flasher_for(config: &FlasherConfig, target: PathBuf, events: EventDispatcher) -> Arc<Flasher> {
    Arc::new(Flasher::from_config(
        config,
        Arc::new(FileFlash::new(target)),
        Arc::new(HttpDownloader::default()),
        events,
    ))
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    let events = EventDispatcher::spawn();
    events.subscribe(Arc::new(TracingObserver));

    match args.command {
        Command::Flash {
            image,
            target,
            chunk_size,
        } => {
            if let Some(size) = chunk_size {
                config.transfer.chunk_size = size;
            }
            config.validate()?;
            let request = image.merge(config.image.clone())?.to_request()?;

            progress_printer(&events);
            let flasher = flasher_for(&config, target, events.clone());

            let on_interrupt = flasher.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling at next chunk boundary");
                    on_interrupt.cancel();
                }
            });

            let result = flasher.flash(&request).await;
            events.flush().await;
            let report = result?;
            info!(
                image = %report.label,
                bytes = report.length,
                chunks = report.chunks,
                retries = report.retries,
                "Flash complete"
            );
        }
        Command::Erase { target, length } => {
            let flasher = flasher_for(&config, target, events.clone());
            let result = flasher.erase(length).await;
            events.flush().await;
            result?;
            info!(length, "Erase complete");
        }
        Command::Verify { image } => {
            let request = image.merge(config.image.clone())?.to_request()?;
            let images = Arc::new(ImageResolver::new(
                config.cache_dir.clone(),
                Arc::new(HttpDownloader::default()),
            ));
            let resolved = images.resolve(&request.image).await?;
            let expected = ChecksumResolver::new(images)
                .resolve_digest(&request.checksum)
                .await?;
            checksum::ensure_matches(&resolved.bytes, &expected)?;
            println!("{}  {} bytes  OK", expected, resolved.length);
        }
        Command::Probe { target, watch } => {
            let flasher = flasher_for(&config, target, events.clone());
            if watch {
                let prober = flasher.spawn_prober(config.link.probe_interval());
                tokio::signal::ctrl_c().await?;
                prober.abort();
            } else {
                flasher.probe().await;
            }
            events.flush().await;
            println!("{}", flasher.status().link);
        }
        Command::InitConfig { path } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Wrote default configuration");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
