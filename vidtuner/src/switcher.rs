use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::bus::EventBus;
use crate::channel::Channel;
use crate::playback::Playback;
use crate::resolver::{ResolveError, SourceResolver};
use crate::schedule::SwitchEvent;

/**
    User-visible status message, published on the event bus.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement(pub String);

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("playback failed: {0}")]
    Playback(anyhow::Error),
}

/**
    The channel currently handed to playback.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub channel: Channel,
    pub uri: String,
    pub candidates: Vec<String>,
    pub since: DateTime<Local>,
}

/**
    Turns channel selections into resolved streams and hands them to playback.

    Scheduled switches arrive as [`SwitchEvent`]s from the event bus, manual
    selections come in through [`Switcher::select`].
*/
pub struct Switcher {
    resolver: Arc<SourceResolver>,
    playback: Arc<dyn Playback>,
    bus: EventBus,
    announce_delay: Duration,
    current: RwLock<Option<NowPlaying>>,
    /// Channel a manual selection is currently switching to
    selecting: Mutex<Option<Channel>>,
}

/// Clears the in-progress selection when the selecting call ends or is dropped
struct Selection<'a> {
    slot: &'a Mutex<Option<Channel>>,
    channel: Channel,
}

impl Drop for Selection<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref() == Some(&self.channel) {
            *slot = None;
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

impl Switcher {
    pub fn new(
        resolver: Arc<SourceResolver>,
        playback: Arc<dyn Playback>,
        bus: EventBus,
        announce_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            playback,
            bus,
            announce_delay,
            current: RwLock::new(None),
            selecting: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.current.read().clone()
    }

    /**
        Resolve `channel` and play its primary stream.
    */
    pub async fn switch_to(&self, channel: &Channel) -> Result<NowPlaying, SwitchError> {
        let streams = self.resolver.resolve(channel).await?;
        let primary = &streams[0];

        self.playback
            .play(channel, primary)
            .await
            .map_err(SwitchError::Playback)?;

        let now_playing = NowPlaying {
            channel: channel.clone(),
            uri: primary.to_string(),
            candidates: streams.iter().map(ToString::to_string).collect(),
            since: Local::now(),
        };
        *self.current.write() = Some(now_playing.clone());

        Ok(now_playing)
    }

    /**
        Manual channel selection. Selecting the channel that is already
        playing, or already being switched to, does nothing and returns `None`.
    */
    pub async fn select(&self, channel: &Channel) -> Result<Option<NowPlaying>, SwitchError> {
        let _selection = {
            let mut selecting = self.selecting.lock();
            let already_playing = self
                .current
                .read()
                .as_ref()
                .is_some_and(|current| &current.channel == channel);
            if already_playing || selecting.as_ref() == Some(channel) {
                return Ok(None);
            }
            *selecting = Some(channel.clone());
            Selection {
                slot: &self.selecting,
                channel: channel.clone(),
            }
        };

        self.switch_to(channel).await.map(Some)
    }

    /**
        Switch to the channel, reporting failures as announcements
        instead of returning them.
    */
    pub async fn switch_and_report(&self, channel: &Channel) {
        if let Err(e) = self.switch_to(channel).await {
            error!(%channel, "switch failed: {e}");
            self.announce(format!("Error: {e}"));
        }
    }

    fn announce(&self, message: String) {
        info!("{message}");
        self.bus.publish(Announcement(message));
    }

    fn display_name(&self, channel: &Channel) -> String {
        self.resolver
            .channels()
            .get(channel)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| channel.to_string())
    }

    /**
        Handle scheduled switches until shutdown or until the bus goes away.

        Each switch is announced first and carried out after the announce delay.
        Shutdown abandons a switch that is still waiting or resolving.
    */
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SwitchEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown_requested(&mut shutdown_rx) => break,
            };

            self.announce(format!("Switching to: {}", self.display_name(&event.channel)));

            let switch = async {
                tokio::time::sleep(self.announce_delay).await;
                self.switch_and_report(&event.channel).await;
            };
            tokio::select! {
                _ = switch => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
        }

        info!("switcher stopped");
    }
}
