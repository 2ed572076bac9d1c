use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use vidtuner::bus::EventBus;
use vidtuner::channel::{Channel, ChannelSource};
use vidtuner::clock::SystemClock;
use vidtuner::config::{Config, ResolveMode};
use vidtuner::playback::{CommandPlayback, LogPlayback, Playback, PlaybackState};
use vidtuner::resolver::{HttpFetcher, SourceResolver, http_client, renderer_from_config};
use vidtuner::schedule::{ScheduleError, Scheduler, SwitchEvent, load_schedule};
use vidtuner::server;
use vidtuner::switcher::Switcher;

#[derive(Parser, Debug)]
#[command(name = "vidtuner")]
#[command(about = "Scheduled live TV channel switcher with stream discovery")]
struct Args {
    /// Config file (defaults to ./vidtuner.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Schedule file, overrides the config
    #[arg(short, long)]
    schedule: Option<PathBuf>,

    /// HTTP server port, overrides the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Resolution mode, overrides the config
    #[arg(long, value_enum)]
    mode: Option<ResolveMode>,

    /// Run the browser renderer headless
    #[arg(long)]
    headless: Option<bool>,

    /// Log everything down to trace level
    #[arg(short, long)]
    verbose: bool,

    /// Do not start the HTTP control server
    #[arg(long)]
    no_server: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.schedule {
            config.schedule.path = path.clone();
        }
        if let Some(port) = self.port {
            config.server.address.set_port(port);
        }
        if let Some(mode) = self.mode {
            config.resolver.mode = mode;
        }
        if let Some(headless) = self.headless {
            config.resolver.headless = headless;
        }
        if self.no_server {
            config.server.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(
            match args.verbose {
                true => LevelFilter::TRACE,
                _ => LevelFilter::INFO,
            }
            .into(),
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let channels = Arc::new(ChannelSource::with_overrides(&config.channels));
    info!(count = channels.len(), "channels registered");

    let entries = match load_schedule(&config.schedule.path, &channels) {
        Ok(entries) => entries,
        // Only a schedule that was asked for explicitly has to exist
        Err(ScheduleError::Read { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound && args.schedule.is_none() =>
        {
            warn!(
                path = %config.schedule.path.display(),
                "no schedule file, running without scheduled switches"
            );
            Vec::new()
        }
        Err(e) => return Err(e).context("failed to load schedule"),
    };

    let bus = EventBus::new();
    bus.subscribe(|state: &PlaybackState| match state {
        PlaybackState::Playing { channel, uri } => info!(%channel, %uri, "playing"),
        PlaybackState::Stopped => info!("playback stopped"),
        PlaybackState::Error(message) => error!("playback error: {message}"),
    });

    // Create resolver
    let renderer = renderer_from_config(&config.resolver)?;
    let fetcher = Arc::new(HttpFetcher::new(http_client(
        config.resolver.proxy.as_deref(),
    )?));
    let resolver = Arc::new(
        SourceResolver::new(Arc::clone(&channels), renderer, fetcher, &config.resolver)
            .context("invalid resolver.source_pattern")?,
    );
    info!(mode = ?resolver.mode(), "resolver ready");

    let playback: Arc<dyn Playback> = match &config.playback.command {
        Some(command) => Arc::new(CommandPlayback::new(command.clone(), bus.clone())?),
        None => Arc::new(LogPlayback::new(bus.clone())),
    };

    let switcher = Arc::new(Switcher::new(
        Arc::clone(&resolver),
        Arc::clone(&playback),
        bus.clone(),
        config.playback.announce_delay(),
    ));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start switcher task
    let (_, switch_events) = bus.subscribe_channel::<SwitchEvent>();
    let switcher_handle = tokio::spawn(
        Arc::clone(&switcher).run(switch_events, shutdown_rx.clone()),
    );

    // Start HTTP server
    let server_handle = if config.server.enabled {
        let addr: SocketAddr = config.server.address;
        let server_shutdown_rx = shutdown_rx.clone();
        let server_switcher = Arc::clone(&switcher);
        info!("IPTV playlist: http://{addr}/channels.m3u");
        Some(tokio::spawn(async move {
            if let Err(e) = server::run_server(addr, server_switcher, server_shutdown_rx).await {
                error!("server failed: {e}");
            }
        }))
    } else {
        None
    };

    // Start scheduler
    let scheduler = Scheduler::new(
        entries,
        bus.clone(),
        Arc::new(SystemClock),
        &config.scheduler,
    );
    info!(pending = scheduler.pending().len(), "starting scheduler");
    let scheduler_handle = scheduler.spawn();
    scheduler_handle.start();

    if let Some(initial) = &config.initial_channel {
        let initial_switcher = Arc::clone(&switcher);
        let channel = Channel::new(initial);
        tokio::spawn(async move {
            initial_switcher.switch_and_report(&channel).await;
        });
    }

    // Wait for Ctrl+C
    signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(scheduler) = scheduler_handle.join().await {
        info!(remaining = scheduler.pending().len(), "scheduler disposed");
    }
    // Aborts any resolution still rendering or fetching
    resolver.dispose().await;
    let _ = switcher_handle.await;
    if let Some(server_handle) = server_handle {
        let _ = server_handle.await;
    }

    playback.stop().await;
    bus.dispose();

    info!("done");
    Ok(())
}
