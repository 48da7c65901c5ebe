#![forbid(unsafe_code)]

//! HTTP front door for yt-dlp.
//!
//! Two API routes do the real work: `/video-info` lists the downloadable
//! formats of a URL and `/download` streams one of them back. Everything
//! else is served from the static web root so the bundled frontend can live
//! next to the API.

use std::{
    any::Any,
    io,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;
use tubegate::config::{ConfigOverrides, GatewayConfig, parse_host, parse_port, resolve_config};
use tubegate::error::{GatewayError, require_params};
use tubegate::formats::VideoSummary;
use tubegate::relay;
use tubegate::ytdlp::YtDlp;

const DEFAULT_LOG_FILTER: &str = "tubegate=info,gateway=info,tower_http=info";
const SAMPLE_VIDEO_URL: &str = "https://youtu.be/dQw4w9WgXcQ";
const SAMPLE_ITAG: &str = "22";
const DOWNLOAD_FILENAME: &str = "attachment; filename=\"video.mp4\"";
const DOWNLOAD_CONTENT_TYPE: &str = "video/mp4";
const FETCH_FAILED_SOLUTION: &str = "Please check the URL and try again. If the problem persists, the video may not be available.";
const DOWNLOAD_PARAMS: [&str; 2] = ["url", "itag"];

#[derive(Debug, Clone, Default)]
struct GatewayArgs {
    overrides: ConfigOverrides,
}

impl GatewayArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--port" => overrides.port = Some(parse_port(&value()?)?),
                "--host" => {
                    let host = value()?;
                    parse_host(&host)?;
                    overrides.host = Some(host);
                }
                "--ytdlp" => overrides.ytdlp_path = Some(PathBuf::from(value()?)),
                "--www-root" => overrides.www_root = Some(PathBuf::from(value()?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(Self { overrides })
    }
}

/// Shared state handed to every handler. Nothing in here is mutable; each
/// request owns its own subprocess.
#[derive(Clone)]
struct AppState {
    ytdlp: YtDlp,
    www_root: Arc<PathBuf>,
    /// Base used for the example URLs in validation errors.
    public_base: Arc<String>,
}

impl AppState {
    fn new(config: &GatewayConfig) -> Self {
        Self {
            ytdlp: YtDlp::new(config.ytdlp_path.clone()),
            www_root: Arc::new(config.www_root.clone()),
            public_base: Arc::new(format!("http://localhost:{}", config.port)),
        }
    }

    fn example_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.public_base, path_and_query)
    }
}

/// JSON error body. Optional fields are only present for the errors that
/// need them.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    solution: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    example: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                details: None,
                solution: None,
                required: None,
                missing: None,
                example: None,
            },
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn url_required(state: &AppState) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, "URL is required");
        err.body.example = Some(state.example_url(&format!("/video-info?url={SAMPLE_VIDEO_URL}")));
        err
    }

    /// `missing` is `None` when the query string could not be read at all.
    fn missing_parameters(state: &AppState, missing: Option<&GatewayError>) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, "Missing parameters");
        err.body.required = Some(DOWNLOAD_PARAMS.to_vec());
        err.body.missing = missing
            .and_then(GatewayError::missing_fields)
            .map(<[_]>::to_vec);
        err.body.example = Some(state.example_url(&format!(
            "/download?url={SAMPLE_VIDEO_URL}&itag={SAMPLE_ITAG}"
        )));
        err
    }

    fn fetch_failed(cause: &GatewayError) -> Self {
        let mut err = Self::internal("Failed to fetch video info");
        err.body.details = Some(cause.to_string());
        err.body.solution = Some(FETCH_FAILED_SOLUTION);
        err
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct VideoInfoQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    itag: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    install_panic_hook();

    let result = run().await;
    if let Err(err) = &result {
        tracing::error!("gateway stopped: {err:#}");
    }
    result
}

async fn run() -> Result<()> {
    let GatewayArgs { overrides } = GatewayArgs::parse()?;
    let config = resolve_config(overrides).context("resolving configuration")?;
    let state = AppState::new(&config);
    let app = router(state);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            if err.kind() == io::ErrorKind::AddrInUse {
                tracing::error!(
                    "Port {} is already in use. Try changing the PORT environment variable.",
                    config.port
                );
            }
            return Err(err).with_context(|| format!("binding to {addr}"));
        }
    };
    log_banner(&config, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    tracing::info!("gateway shut down");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/video-info", get(video_info))
        .route("/download", get(download))
        .fallback(static_fallback)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Every panic goes through the log. Handler panics are also turned into a
/// 500 by `CatchPanicLayer`; a panic on the main task ends the process.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!("uncaught panic: {info}");
    }));
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    tracing::error!("request handler panicked: {detail}");
    ApiError::internal("Internal server error").into_response()
}

fn log_banner(config: &GatewayConfig, addr: SocketAddr) {
    let local = if config.host.is_unspecified() {
        format!("http://localhost:{}", config.port)
    } else {
        format!("http://{addr}")
    };
    tracing::info!("gateway listening on {addr} (local: {local})");
    tracing::info!("endpoint: GET /video-info?url=VIDEO_URL");
    tracing::info!("endpoint: GET /download?url=VIDEO_URL&itag=FORMAT_ITAG");
    tracing::info!(
        ytdlp = %config.ytdlp_path.display(),
        www_root = %config.www_root.display(),
        "press Ctrl+C to stop"
    );
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!("Failed to install Ctrl+C handler: {err}");
    }
}

async fn video_info(
    State(state): State<AppState>,
    query: Result<Query<VideoInfoQuery>, QueryRejection>,
) -> ApiResult<Json<VideoSummary>> {
    let Query(query) = query.map_err(|rejection| {
        tracing::warn!("Rejected /video-info query: {rejection}");
        ApiError::url_required(&state)
    })?;
    require_params(&[("url", query.url.as_deref())]).map_err(|_| ApiError::url_required(&state))?;
    let url = query.url.unwrap_or_default();

    let summary = state.ytdlp.video_info(&url).await.map_err(|err| {
        tracing::error!(kind = err.kind(), url, "Error in /video-info: {err}");
        ApiError::fetch_failed(&err)
    })?;
    Ok(Json(summary))
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            tracing::warn!("Rejected /download query: {rejection}");
            return ApiError::missing_parameters(&state, None).into_response();
        }
    };
    if let Err(missing) = require_params(&[
        ("url", query.url.as_deref()),
        ("itag", query.itag.as_deref()),
    ]) {
        return ApiError::missing_parameters(&state, Some(&missing)).into_response();
    }
    let url = query.url.unwrap_or_default();
    let itag = query.itag.unwrap_or_default();

    tracing::info!("Starting download for itag {itag} from {url}");
    match relay::start(&state.ytdlp, &url, &itag) {
        Ok(relay) => {
            // The supervisor keeps running on its own; its handle is not needed.
            let mut response = Body::from_stream(relay.body).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static(DOWNLOAD_FILENAME),
            );
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DOWNLOAD_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            tracing::error!(kind = err.kind(), "Process error: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request) -> Response {
    match serve_www_path(&state.www_root, req.uri().path()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(target.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) => Err(ApiError::not_found(format!("Cannot GET {request_path}"))),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
