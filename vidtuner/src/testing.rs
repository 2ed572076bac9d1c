/*!
    Test doubles shared across module tests.
*/

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::Url;

use crate::channel::{Channel, ChannelSource};
use crate::config::ResolverConfig;
use crate::playback::Playback;
use crate::resolver::{FetchError, ManifestFetcher, PageRenderer, RenderError, SourceResolver};

pub const PAGE: &str = r#"<video><source src="https://x/y/path?z.m3u8?token" type="application/x-mpegURL"></video>"#;
pub const MANIFEST: &str = "#EXTM3U\nA\nB\n";

pub struct StaticRenderer(pub String);

impl PageRenderer for StaticRenderer {
    fn render<'a>(&'a mut self, _url: &'a str) -> BoxFuture<'a, Result<String, RenderError>> {
        let html = self.0.clone();
        Box::pin(async move { Ok(html) })
    }
}

pub struct StaticFetcher(pub String);

impl ManifestFetcher for StaticFetcher {
    fn fetch<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
        let body = self.0.clone();
        Box::pin(async move { Ok(body) })
    }
}

/**
    Extended-mode resolver over the built-in channels whose every page
    resolves to `https://x/y/B`, `https://x/y/A`.
*/
pub fn resolver_with_page() -> SourceResolver {
    SourceResolver::new(
        Arc::new(ChannelSource::builtin()),
        Box::new(StaticRenderer(PAGE.to_string())),
        Arc::new(StaticFetcher(MANIFEST.to_string())),
        &ResolverConfig::default(),
    )
    .unwrap()
}

#[derive(Default)]
pub struct RecordingPlayback {
    played: Mutex<Vec<(Channel, String)>>,
}

impl RecordingPlayback {
    pub fn played(&self) -> Vec<(Channel, String)> {
        self.played.lock().clone()
    }
}

impl Playback for RecordingPlayback {
    fn play<'a>(&'a self, channel: &'a Channel, uri: &'a Url) -> BoxFuture<'a, Result<()>> {
        self.played.lock().push((channel.clone(), uri.to_string()));
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
