use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::config::{RendererKind, ResolverConfig};

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("renderer is closed")]
    Closed,
}

/**
    A page-rendering engine that can load one page at a time.

    `render` navigates to `url` and completes exactly once, with the
    rendered document's HTML once it is ready. The engine is stateful,
    which is why it is borrowed mutably for the whole round trip.
*/
pub trait PageRenderer: Send {
    fn render<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<String, RenderError>>;

    /**
        Release the engine. Further renders fail with [`RenderError::Closed`].
    */
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/**
    Create the renderer selected in the config.
*/
pub fn renderer_from_config(config: &ResolverConfig) -> anyhow::Result<Box<dyn PageRenderer>> {
    match config.renderer {
        RendererKind::Http => Ok(Box::new(HttpPageRenderer::new(config.proxy.as_deref())?)),
        #[cfg(feature = "chrome")]
        RendererKind::Chrome => Ok(Box::new(chrome::ChromePageRenderer::new(
            config.headless,
            config.proxy.clone(),
        ))),
        #[cfg(not(feature = "chrome"))]
        RendererKind::Chrome => Err(anyhow::anyhow!(
            "the chrome renderer requires building with `--features chrome`"
        )),
    }
}

/**
    Renderer that fetches the page over plain HTTP, without running scripts.
*/
pub struct HttpPageRenderer {
    client: Option<reqwest::Client>,
}

impl HttpPageRenderer {
    pub fn new(proxy: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            client: Some(http_client(proxy)?),
        })
    }
}

impl PageRenderer for HttpPageRenderer {
    fn render<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<String, RenderError>> {
        Box::pin(async move {
            let client = self.client.as_ref().ok_or(RenderError::Closed)?;

            debug!(url, "loading page");
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| RenderError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(RenderError::Status(response.status().as_u16()));
            }

            response
                .text()
                .await
                .map_err(|e| RenderError::Transport(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.client = None;
        Box::pin(async {})
    }
}

/**
    Build an HTTP client with a browser user agent, optionally through a proxy.
*/
pub fn http_client(proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| anyhow::anyhow!("Invalid proxy URL '{}': {}", proxy_url, e))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

#[cfg(feature = "chrome")]
mod chrome {
    use chrome_browser::{ChromeBrowser, ChromeBrowserTab, ChromeLaunchOptions};
    use futures::future::BoxFuture;
    use tracing::{debug, info};

    use super::{PageRenderer, RenderError};

    const READY_CONDITION: &str = "document.readyState === 'complete'";
    const DOCUMENT_HTML: &str = "document.documentElement.outerHTML";

    /**
        Renderer driving a Chrome tab, so client-side rendered pages work.

        The browser is launched lazily on first render and reused afterwards.
    */
    pub struct ChromePageRenderer {
        headless: bool,
        proxy: Option<String>,
        browser: Option<(ChromeBrowser, ChromeBrowserTab)>,
        closed: bool,
    }

    impl ChromePageRenderer {
        pub fn new(headless: bool, proxy: Option<String>) -> Self {
            Self {
                headless,
                proxy,
                browser: None,
                closed: false,
            }
        }

        async fn tab(&mut self) -> Result<&ChromeBrowserTab, RenderError> {
            if self.closed {
                return Err(RenderError::Closed);
            }

            if self.browser.is_none() {
                info!(headless = self.headless, "launching Chrome");

                let mut options = ChromeLaunchOptions::default()
                    .headless(self.headless)
                    .devtools(false);
                if let Some(ref proxy) = self.proxy {
                    options = options.proxy_server(proxy);
                }

                let browser = ChromeBrowser::new(options).await.map_err(browser_error)?;
                let tab = browser.new_tab().await.map_err(browser_error)?;
                self.browser = Some((browser, tab));
            }

            match &self.browser {
                Some((_, tab)) => Ok(tab),
                None => Err(RenderError::Closed),
            }
        }
    }

    impl PageRenderer for ChromePageRenderer {
        fn render<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<String, RenderError>> {
            Box::pin(async move {
                let tab = self.tab().await?;

                debug!(url, "navigating");
                tab.navigate(url).await.map_err(browser_error)?;
                tab.wait_for_function(READY_CONDITION)
                    .await
                    .map_err(browser_error)?;

                tab.eval::<String>(DOCUMENT_HTML)
                    .await
                    .map_err(browser_error)
            })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.closed = true;
                if let Some((browser, _)) = self.browser.take() {
                    debug!("closing Chrome");
                    let _ = browser.close().await;
                }
            })
        }
    }

    fn browser_error(e: impl std::fmt::Display) -> RenderError {
        RenderError::Browser(e.to_string())
    }
}
