/*!
    Channel to stream address resolution.

    A resolution loads the channel's watch page through the page renderer,
    extracts the manifest address from the rendered HTML and, in extended
    mode, fetches the manifest and returns every stream it lists. Only one
    resolution is ever in flight, concurrent callers queue in order.
*/

mod extract;
mod manifest;
mod renderer;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelSource};
use crate::config::{ResolveMode, ResolverConfig};

pub use self::extract::{SOURCE_PATTERN, SourceExtractor};
pub use self::manifest::{
    FetchError, HttpFetcher, ManifestFetcher, RetryPolicy, fetch_with_retry, parse_manifest,
};
pub use self::renderer::{
    HttpPageRenderer, PageRenderer, RenderError, http_client, renderer_from_config,
};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown channel: {0}")]
    UnknownChannel(Channel),
    #[error("failed to render {url}: {source}")]
    Render { url: String, source: RenderError },
    #[error("timed out rendering {url} after {timeout:?}")]
    RenderTimeout { url: String, timeout: Duration },
    #[error("no stream source found in {url} ({} bytes of HTML)", .html.len())]
    Extraction { url: String, html: String },
    #[error("invalid stream source {value:?}: {message}")]
    InvalidSource { value: String, message: String },
    #[error("failed to fetch manifest {url}: {source}")]
    Fetch { url: Url, source: FetchError },
    #[error("manifest {url} lists no streams")]
    EmptyManifest { url: Url },
    #[error("resolver has been disposed")]
    Disposed,
}

/**
    Resolves channels to ordered candidate stream addresses, primary first.
*/
pub struct SourceResolver {
    channels: Arc<ChannelSource>,
    /// The single page renderer, also serving as the single-flight gate
    /// for whole resolutions
    engine: Mutex<Box<dyn PageRenderer>>,
    fetcher: Arc<dyn ManifestFetcher>,
    extractor: SourceExtractor,
    mode: ResolveMode,
    retry: RetryPolicy,
    render_timeout: Duration,
    disposed: CancellationToken,
}

impl SourceResolver {
    /**
        Create a resolver, failing if the configured source pattern is invalid.
    */
    pub fn new(
        channels: Arc<ChannelSource>,
        renderer: Box<dyn PageRenderer>,
        fetcher: Arc<dyn ManifestFetcher>,
        config: &ResolverConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            channels,
            engine: Mutex::new(renderer),
            fetcher,
            extractor: SourceExtractor::from_config(config)?,
            mode: config.mode,
            retry: RetryPolicy::from_config(config),
            render_timeout: config.render_timeout(),
            disposed: CancellationToken::new(),
        })
    }

    pub fn channels(&self) -> &ChannelSource {
        &self.channels
    }

    pub fn mode(&self) -> ResolveMode {
        self.mode
    }

    /**
        Resolve a channel to one or more stream addresses.

        Waits for any resolution already in flight to finish first, the gate
        is held from the page render until the manifest has been expanded.
        Dropping the returned future gives up its place in the queue without
        affecting anyone else. Disposal aborts both waiting and running calls.
    */
    pub async fn resolve(&self, channel: &Channel) -> Result<Vec<Url>, ResolveError> {
        let url = self
            .channels
            .watch_url(channel)
            .ok_or_else(|| ResolveError::UnknownChannel(channel.clone()))?
            .to_string();

        let mut engine = tokio::select! {
            biased;
            _ = self.disposed.cancelled() => return Err(ResolveError::Disposed),
            engine = self.engine.lock() => engine,
        };

        let streams = tokio::select! {
            biased;
            _ = self.disposed.cancelled() => Err(ResolveError::Disposed),
            streams = self.resolve_gated(&mut **engine, channel, &url) => streams,
        }?;
        drop(engine);

        info!(
            %channel,
            primary = %streams[0],
            candidates = streams.len(),
            "resolved channel"
        );

        Ok(streams)
    }

    async fn resolve_gated(
        &self,
        engine: &mut dyn PageRenderer,
        channel: &Channel,
        url: &str,
    ) -> Result<Vec<Url>, ResolveError> {
        let source = self.render_and_extract(engine, channel, url).await?;
        let source = Url::parse(&source).map_err(|e| ResolveError::InvalidSource {
            value: source.clone(),
            message: e.to_string(),
        })?;

        match self.mode {
            ResolveMode::Minimal => Ok(vec![source]),
            ResolveMode::Extended => self.expand_manifest(source).await,
        }
    }

    async fn render_and_extract(
        &self,
        engine: &mut dyn PageRenderer,
        channel: &Channel,
        url: &str,
    ) -> Result<String, ResolveError> {
        debug!(%channel, url, "rendering watch page");
        let html = match tokio::time::timeout(self.render_timeout, engine.render(url)).await {
            Ok(Ok(html)) => html,
            Ok(Err(source)) => {
                return Err(ResolveError::Render {
                    url: url.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ResolveError::RenderTimeout {
                    url: url.to_string(),
                    timeout: self.render_timeout,
                });
            }
        };

        self.extractor
            .extract(&html)
            .ok_or_else(|| ResolveError::Extraction {
                url: url.to_string(),
                html,
            })
    }

    async fn expand_manifest(&self, manifest_url: Url) -> Result<Vec<Url>, ResolveError> {
        let body = fetch_with_retry(self.fetcher.as_ref(), &manifest_url, &self.retry)
            .await
            .map_err(|source| ResolveError::Fetch {
                url: manifest_url.clone(),
                source,
            })?;

        let streams = parse_manifest(&manifest_url, &body);
        if streams.is_empty() {
            return Err(ResolveError::EmptyManifest { url: manifest_url });
        }

        Ok(streams)
    }

    /**
        Abort running and queued resolutions and refuse new ones, then close
        the page renderer.
    */
    pub async fn dispose(&self) {
        if self.disposed.is_cancelled() {
            return;
        }
        self.disposed.cancel();

        let mut engine = self.engine.lock().await;
        engine.close().await;
        debug!("resolver disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    const PAGE: &str = r#"<html><body><video><source src="https://x/y/path?z.m3u8?token" type="application/x-mpegURL"></video></body></html>"#;

    #[derive(Default)]
    struct Recording {
        navigations: parking_lot::Mutex<Vec<(String, Instant, Instant)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        closed: AtomicBool,
    }

    struct RecordingRenderer {
        html: String,
        delay: Duration,
        recording: Arc<Recording>,
    }

    impl RecordingRenderer {
        fn new(html: &str, delay: Duration) -> (Self, Arc<Recording>) {
            let recording = Arc::new(Recording::default());
            let renderer = Self {
                html: html.to_string(),
                delay,
                recording: Arc::clone(&recording),
            };
            (renderer, recording)
        }
    }

    impl PageRenderer for RecordingRenderer {
        fn render<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<String, RenderError>> {
            Box::pin(async move {
                let active = self.recording.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.recording.max_active.fetch_max(active, Ordering::SeqCst);

                let start = Instant::now();
                tokio::time::sleep(self.delay).await;
                let end = Instant::now();

                self.recording.active.fetch_sub(1, Ordering::SeqCst);
                self.recording
                    .navigations
                    .lock()
                    .push((url.to_string(), start, end));

                Ok(self.html.clone())
            })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            self.recording.closed.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct FailingRenderer;

    impl PageRenderer for FailingRenderer {
        fn render<'a>(&'a mut self, _url: &'a str) -> BoxFuture<'a, Result<String, RenderError>> {
            Box::pin(async { Err(RenderError::Status(503)) })
        }
    }

    struct ScriptedFetcher {
        responses: parking_lot::Mutex<VecDeque<Result<String, FetchError>>>,
        requested: parking_lot::Mutex<Vec<Url>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<String, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: parking_lot::Mutex::new(responses.into()),
                requested: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl ManifestFetcher for ScriptedFetcher {
        fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
            self.requested.lock().push(url.clone());
            let next = self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("#EXTM3U\nA\nB\n".to_string()));
            Box::pin(async move { next })
        }
    }

    /// Fetcher that takes a while and records when each fetch ran
    struct SlowFetcher {
        delay: Duration,
        fetches: parking_lot::Mutex<Vec<(Instant, Instant)>>,
    }

    impl ManifestFetcher for SlowFetcher {
        fn fetch<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
            Box::pin(async move {
                let start = Instant::now();
                tokio::time::sleep(self.delay).await;
                self.fetches.lock().push((start, Instant::now()));
                Ok("#EXTM3U\nA\nB\n".to_string())
            })
        }
    }

    fn config(mode: ResolveMode) -> ResolverConfig {
        ResolverConfig {
            mode,
            ..ResolverConfig::default()
        }
    }

    fn resolver(
        renderer: impl PageRenderer + 'static,
        fetcher: Arc<ScriptedFetcher>,
        mode: ResolveMode,
    ) -> SourceResolver {
        SourceResolver::new(
            Arc::new(ChannelSource::builtin()),
            Box::new(renderer),
            fetcher,
            &config(mode),
        )
        .unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn minimal_mode_returns_extracted_source() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let fetcher = ScriptedFetcher::new(vec![]);
        let resolver = resolver(renderer, fetcher.clone(), ResolveMode::Minimal);

        let streams = resolver.resolve(&Channel::new("bbc1")).await.unwrap();

        assert_eq!(streams, vec![url("https://x/y/path?z.m3u8?token")]);
        assert!(fetcher.requested.lock().is_empty());

        let navigations = recording.navigations.lock();
        assert_eq!(navigations.len(), 1);
        assert_eq!(navigations[0].0, "http://www.tvcatchup.com/watch/bbcone");
    }

    #[tokio::test(start_paused = true)]
    async fn extended_mode_expands_manifest() {
        let (renderer, _) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let fetcher = ScriptedFetcher::new(vec![Ok("#comment\nA\nB\n".to_string())]);
        let resolver = resolver(renderer, fetcher.clone(), ResolveMode::Extended);

        let streams = resolver.resolve(&Channel::new("itv1")).await.unwrap();

        assert_eq!(streams, vec![url("https://x/y/B"), url("https://x/y/A")]);
        assert_eq!(
            *fetcher.requested.lock(),
            vec![url("https://x/y/path?z.m3u8?token")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extended_mode_retries_fetch() {
        let (renderer, _) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Transport("reset".to_string())),
            Err(FetchError::Timeout(Duration::from_secs(10))),
            Ok("A\n".to_string()),
        ]);
        let resolver = resolver(renderer, fetcher.clone(), ResolveMode::Extended);

        let streams = resolver.resolve(&Channel::new("bbc1")).await.unwrap();
        assert_eq!(streams, vec![url("https://x/y/A")]);
        assert_eq!(fetcher.requested.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_mode_surfaces_last_fetch_error() {
        let (renderer, _) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Status(500)),
            Err(FetchError::Status(502)),
            Err(FetchError::Status(404)),
        ]);
        let resolver = resolver(renderer, fetcher, ResolveMode::Extended);

        let err = resolver.resolve(&Channel::new("bbc1")).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Fetch {
                source: FetchError::Status(404),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn comment_only_manifest_is_an_error() {
        let (renderer, _) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let fetcher = ScriptedFetcher::new(vec![Ok("#EXTM3U\n".to_string())]);
        let resolver = resolver(renderer, fetcher, ResolveMode::Extended);

        let err = resolver.resolve(&Channel::new("bbc1")).await.unwrap_err();
        assert!(matches!(err, ResolveError::EmptyManifest { .. }));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected_before_rendering() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::ZERO);
        let resolver = resolver(renderer, ScriptedFetcher::new(vec![]), ResolveMode::Minimal);

        let err = resolver.resolve(&Channel::new("nope")).await.unwrap_err();
        assert!(matches!(err, ResolveError::UnknownChannel(_)));
        assert!(recording.navigations.lock().is_empty());
    }

    #[tokio::test]
    async fn extraction_failure_keeps_html_and_releases_gate() {
        let (renderer, recording) =
            RecordingRenderer::new("<html>no video here</html>", Duration::ZERO);
        let resolver = resolver(renderer, ScriptedFetcher::new(vec![]), ResolveMode::Minimal);

        for _ in 0..2 {
            match resolver.resolve(&Channel::new("bbc1")).await {
                Err(ResolveError::Extraction { html, .. }) => {
                    assert_eq!(html, "<html>no video here</html>");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(recording.navigations.lock().len(), 2);
    }

    #[tokio::test]
    async fn render_failure_releases_gate() {
        let resolver = resolver(FailingRenderer, ScriptedFetcher::new(vec![]), ResolveMode::Minimal);

        for _ in 0..2 {
            let err = resolver.resolve(&Channel::new("bbc1")).await.unwrap_err();
            assert!(matches!(err, ResolveError::Render { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn render_timeout() {
        let (renderer, _) = RecordingRenderer::new(PAGE, Duration::from_secs(120));
        let resolver = resolver(renderer, ScriptedFetcher::new(vec![]), ResolveMode::Minimal);

        let err = resolver.resolve(&Channel::new("bbc1")).await.unwrap_err();
        assert!(matches!(err, ResolveError::RenderTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolutions_never_overlap() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_millis(250));
        let resolver = Arc::new(resolver(
            renderer,
            ScriptedFetcher::new(vec![]),
            ResolveMode::Extended,
        ));

        let channels = ["bbc1", "bbc2", "itv1", "channel4", "five", "cbbc"];
        let tasks: Vec<_> = channels
            .iter()
            .map(|id| {
                let resolver = Arc::clone(&resolver);
                let channel = Channel::new(id);
                tokio::spawn(async move { resolver.resolve(&channel).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(recording.max_active.load(Ordering::SeqCst), 1);

        let mut navigations = recording.navigations.lock().clone();
        assert_eq!(navigations.len(), channels.len());
        navigations.sort_by_key(|(_, start, _)| *start);
        for pair in navigations.windows(2) {
            let previous_end = pair[0].2;
            let next_start = pair[1].1;
            assert!(next_start >= previous_end);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_render_starts_while_a_manifest_is_fetched() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_millis(50));
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_millis(500),
            fetches: parking_lot::Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(
            SourceResolver::new(
                Arc::new(ChannelSource::builtin()),
                Box::new(renderer),
                fetcher.clone(),
                &config(ResolveMode::Extended),
            )
            .unwrap(),
        );

        let tasks: Vec<_> = ["bbc1", "bbc2", "itv1"]
            .iter()
            .map(|id| {
                let resolver = Arc::clone(&resolver);
                let channel = Channel::new(id);
                tokio::spawn(async move { resolver.resolve(&channel).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let fetches = fetcher.fetches.lock().clone();
        let navigations = recording.navigations.lock().clone();
        assert_eq!(fetches.len(), 3);
        assert_eq!(navigations.len(), 3);
        for (_, render_start, _) in &navigations {
            for (fetch_start, fetch_end) in &fetches {
                assert!(
                    !(render_start >= fetch_start && render_start < fetch_end),
                    "render started while a manifest fetch was running"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_aborts_running_resolution() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_secs(20));
        let resolver = Arc::new(resolver(
            renderer,
            ScriptedFetcher::new(vec![]),
            ResolveMode::Minimal,
        ));

        let running = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(&Channel::new("bbc1")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        resolver.dispose().await;

        assert!(matches!(running.await.unwrap(), Err(ResolveError::Disposed)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(recording.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_leak_gate() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_secs(2));
        let resolver = Arc::new(resolver(
            renderer,
            ScriptedFetcher::new(vec![]),
            ResolveMode::Minimal,
        ));

        let first = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(&Channel::new("bbc1")).await })
        };
        tokio::task::yield_now().await;

        // Gives up while still queued behind the first render
        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            resolver.resolve(&Channel::new("bbc2")),
        )
        .await;
        assert!(abandoned.is_err());

        assert!(first.await.unwrap().is_ok());
        assert!(resolver.resolve(&Channel::new("itv1")).await.is_ok());

        let urls: Vec<String> = recording
            .navigations
            .lock()
            .iter()
            .map(|(url, _, _)| url.clone())
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://www.tvcatchup.com/watch/bbcone".to_string(),
                "http://www.tvcatchup.com/watch/itv".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_closes_renderer_and_rejects_callers() {
        let (renderer, recording) = RecordingRenderer::new(PAGE, Duration::from_millis(10));
        let resolver = resolver(renderer, ScriptedFetcher::new(vec![]), ResolveMode::Minimal);

        resolver.dispose().await;
        resolver.dispose().await;

        assert!(resolver.is_disposed());
        assert!(recording.closed.load(Ordering::SeqCst));

        let err = resolver.resolve(&Channel::new("bbc1")).await.unwrap_err();
        assert!(matches!(err, ResolveError::Disposed));
    }
}
