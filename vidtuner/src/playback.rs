use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::channel::Channel;

/// Placeholder replaced with the stream address in player commands.
pub const URI_PLACEHOLDER: &str = "{uri}";

/**
    Playback lifecycle, published on the event bus by playback drivers.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Playing { channel: Channel, uri: Url },
    Stopped,
    Error(String),
}

/**
    Something that can play a stream address.
*/
pub trait Playback: Send + Sync {
    fn play<'a>(&'a self, channel: &'a Channel, uri: &'a Url) -> BoxFuture<'a, Result<()>>;

    fn stop(&self) -> BoxFuture<'_, ()>;
}

/**
    Playback driver that only reports what would be played.

    Used when no player command is configured, so that another process can
    pick the stream up from the log or the HTTP control surface.
*/
pub struct LogPlayback {
    bus: EventBus,
}

impl LogPlayback {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl Playback for LogPlayback {
    fn play<'a>(&'a self, channel: &'a Channel, uri: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(%channel, %uri, "now playing");
            self.bus.publish(PlaybackState::Playing {
                channel: channel.clone(),
                uri: uri.clone(),
            });
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.bus.publish(PlaybackState::Stopped);
        })
    }
}

/**
    Playback driver that runs an external player process per stream.

    Starting a new stream kills the previous player. A player that exits
    on its own is reported as [`PlaybackState::Stopped`].
*/
pub struct CommandPlayback {
    command: Vec<String>,
    bus: EventBus,
    generation: Arc<AtomicU64>,
    current: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandPlayback {
    pub fn new(command: Vec<String>, bus: EventBus) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("player command must name a program"));
        }
        Ok(Self {
            command,
            bus,
            generation: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(None),
        })
    }

    /**
        Program arguments with the placeholder substituted.
    */
    pub fn args_for(&self, uri: &Url) -> Vec<String> {
        self.command[1..]
            .iter()
            .map(|arg| arg.replace(URI_PLACEHOLDER, uri.as_str()))
            .collect()
    }

    fn kill_current(&self) {
        if let Some(stop_tx) = self.current.lock().take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Playback for CommandPlayback {
    fn play<'a>(&'a self, channel: &'a Channel, uri: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.kill_current();

            let mut args = self.args_for(uri);
            if !self.command.iter().any(|arg| arg.contains(URI_PLACEHOLDER)) {
                args.push(uri.to_string());
            }

            let mut child = Command::new(&self.command[0])
                .args(&args)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    let message = format!("failed to start {}: {e}", self.command[0]);
                    self.bus.publish(PlaybackState::Error(message.clone()));
                    anyhow!(message)
                })?;

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (stop_tx, stop_rx) = oneshot::channel();
            *self.current.lock() = Some(stop_tx);

            info!(%channel, %uri, pid = child.id(), "started player");
            self.bus.publish(PlaybackState::Playing {
                channel: channel.clone(),
                uri: uri.clone(),
            });

            let bus = self.bus.clone();
            let current_generation = Arc::clone(&self.generation);
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        // A newer player replacing this one is not a stop
                        if current_generation.load(Ordering::SeqCst) == generation {
                            match status {
                                Ok(status) => info!(%status, "player exited"),
                                Err(e) => warn!("failed to wait for player: {e}"),
                            }
                            bus.publish(PlaybackState::Stopped);
                        }
                    }
                    _ = stop_rx => {
                        let _ = child.kill().await;
                    }
                }
            });

            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.kill_current();
            self.bus.publish(PlaybackState::Stopped);
        })
    }
}
