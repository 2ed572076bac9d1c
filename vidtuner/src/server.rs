use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::channel::{Channel, ChannelInfo};
use crate::resolver::ResolveError;
use crate::switcher::{NowPlaying, SwitchError, Switcher};

#[derive(Clone)]
struct AppState {
    switcher: Arc<Switcher>,
}

/**
    Error response carrying a status code and a plain text reason.
*/
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        let status = match &e {
            ResolveError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            ResolveError::Disposed => StatusCode::SERVICE_UNAVAILABLE,
            ResolveError::RenderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        warn!("resolution failed: {e}");
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<SwitchError> for ApiError {
    fn from(e: SwitchError) -> Self {
        match e {
            SwitchError::Resolve(e) => e.into(),
            SwitchError::Playback(e) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("playback failed: {e}"),
            },
        }
    }
}

#[derive(Serialize)]
struct Sources {
    channel: Channel,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct PlayResult {
    changed: bool,
    now_playing: Option<NowPlaying>,
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelInfo>> {
    let channels = state
        .switcher
        .resolver()
        .channels()
        .list_all()
        .into_iter()
        .cloned()
        .collect();
    Json(channels)
}

/**
    IPTV playlist with one entry per channel, each pointing back at this server
*/
async fn channels_m3u(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8080");

    let mut playlist = String::from("#EXTM3U\n");
    for info in state.switcher.resolver().channels().list_all() {
        playlist.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{id}\" tvg-name=\"{name}\" tvg-type=\"live\" group-title=\"Live TV\",{name}\n\
             http://{host}/channel/{id}\n",
            id = info.id,
            name = info.name,
        ));
    }

    ([(header::CONTENT_TYPE, "audio/x-mpegurl")], playlist)
}

/// Resolve and redirect to the primary stream
async fn channel_redirect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Redirect, ApiError> {
    let streams = state.switcher.resolver().resolve(&Channel::new(id)).await?;
    Ok(Redirect::to(streams[0].as_str()))
}

async fn channel_sources(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Sources>, ApiError> {
    let channel = Channel::new(id);
    let streams = state.switcher.resolver().resolve(&channel).await?;
    Ok(Json(Sources {
        channel,
        sources: streams.iter().map(ToString::to_string).collect(),
    }))
}

/// Manual channel switch
async fn channel_play(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PlayResult>, ApiError> {
    let channel = Channel::new(id);
    let changed = state.switcher.select(&channel).await?.is_some();
    Ok(Json(PlayResult {
        changed,
        now_playing: state.switcher.now_playing(),
    }))
}

async fn now_playing(State(state): State<AppState>) -> Response {
    match state.switcher.now_playing() {
        Some(now_playing) => Json(now_playing).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn router(switcher: Arc<Switcher>) -> Router {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels.m3u", get(channels_m3u))
        .route("/channel/{id}", get(channel_redirect))
        .route("/channel/{id}/sources", get(channel_sources))
        .route("/channel/{id}/play", post(channel_play))
        .route("/now-playing", get(now_playing))
        .with_state(AppState { switcher })
}

/**
    Run the HTTP control server until shutdown is signalled.
*/
pub async fn run_server(
    addr: SocketAddr,
    switcher: Arc<Switcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(switcher);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
