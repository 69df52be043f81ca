use std::{
    collections::HashSet,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    error::ApiError,
    metadata::{MetadataFetcher, VideoInfo},
    orchestrator::{DownloadOrchestrator, DownloadRequest},
    registry::{TaskStatus, TaskView},
    validation::{has_servable_extension, is_plain_filename, is_safe_url},
};

const UNSUPPORTED_URL_MESSAGE: &str =
    "Unsupported URL. Use a YouTube, TikTok, Instagram, SoundCloud, Facebook, X, Bluesky or Vimeo link.";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub metadata: MetadataFetcher,
    pub downloads_dir: PathBuf,
    pub trust_proxy_headers: bool,
    pub api_keys: Arc<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    url: Option<String>,
    format_id: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    task_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: TaskStatus,
    percentage: f64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_link: Option<String>,
}

impl From<TaskView> for StatusResponse {
    fn from(view: TaskView) -> Self {
        Self {
            status: view.status,
            percentage: view.percentage,
            message: view.message,
            download_link: view
                .filename
                .map(|filename| format!("/downloads/{}", urlencoding::encode(&filename))),
        }
    }
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    bytes_used: u64,
    remaining_bytes: u64,
    daily_limit_bytes: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/download-info", post(download_info))
        .route("/api/process-video", post(process_video))
        .route("/api/status/{task_id}", get(task_status))
        .route("/api/quota", get(quota_status))
        .route("/downloads/{filename}", get(serve_download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn download_info(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Json<VideoInfo>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;
    if !is_safe_url(url) {
        return Err(ApiError::bad_request(UNSUPPORTED_URL_MESSAGE));
    }

    let info = state.metadata.fetch(url).await.map_err(|error| {
        warn!("Metadata lookup failed for {url:?}: {error}");
        ApiError::from(error)
    })?;

    Ok(Json(info))
}

async fn process_video(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ProcessRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    let url = payload.url.as_deref().and_then(non_empty);
    let format_id = payload.format_id.as_deref().and_then(non_empty);
    let (Some(url), Some(format_id)) = (url, format_id) else {
        return Err(ApiError::bad_request("Missing data"));
    };
    if !is_safe_url(url) {
        return Err(ApiError::bad_request(UNSUPPORTED_URL_MESSAGE));
    }

    let user_id = user_id_for_request(&state, &headers, addr);
    let task_id = state
        .orchestrator
        .submit(DownloadRequest {
            url: url.to_string(),
            format_id: format_id.to_string(),
            filename: payload.filename.clone(),
            user_id,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            task_id,
            status: "started",
        }),
    ))
}

async fn task_status(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let view = Uuid::parse_str(task_id.trim())
        .ok()
        .and_then(|id| state.orchestrator.status(&id));

    match view {
        Some(view) => Json(StatusResponse::from(view)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"status": "Not Found"})),
        )
            .into_response(),
    }
}

async fn quota_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<QuotaResponse>, ApiError> {
    let user_id = user_id_for_request(&state, &headers, addr);
    let quota = state.orchestrator.quota();
    let bytes_used = quota
        .usage(&user_id)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read download quota: {error}")))?;

    Ok(Json(QuotaResponse {
        bytes_used,
        remaining_bytes: quota.daily_limit().saturating_sub(bytes_used),
        daily_limit_bytes: quota.daily_limit(),
    }))
}

async fn serve_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_plain_filename(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    if !has_servable_extension(&filename) {
        return Err(ApiError::forbidden("File type not allowed"));
    }

    let path = state.downloads_dir.join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!("Could not open file: {error}")));
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// Client address reported by a fronting proxy: the first hop of
/// `x-forwarded-for`, then `cf-connecting-ip`, then `x-real-ip`.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let first_hop = header("x-forwarded-for").and_then(|chain| chain.split(',').next());

    [first_hop, header("cf-connecting-ip"), header("x-real-ip")]
        .into_iter()
        .flatten()
        .find_map(non_empty)
        .map(ToString::to_string)
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    state
        .trust_proxy_headers
        .then(|| extract_client_ip(headers))
        .flatten()
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Quota identity: a configured API key when one is presented, the client
/// IP otherwise. Keys are stored only as a digest prefix.
fn user_id_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .and_then(non_empty)
        && state.api_keys.contains(key)
    {
        return format!("key:{}", api_key_fingerprint(key));
    }

    format!("ip:{}", client_ip_for_request(state, headers, addr))
}

fn api_key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// CORS policy for the browser front end. Only the listed origins are
/// allowed; an entry that is not a bare `scheme://host[:port]` is a
/// startup error.
pub fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let allowed = Arc::new(normalize_origins(origins)?);
    info!("CORS allow-list loaded with {} origin(s)", allowed.len());

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let candidate = origin.to_str().ok().and_then(normalize_origin);
        let permitted = candidate.as_ref().is_some_and(|value| allowed.contains(value));
        debug!("CORS origin {origin:?} -> {candidate:?}, allowed: {permitted}");
        permitted
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origins(origins: &[String]) -> Result<HashSet<String>, ApiError> {
    origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect()
}

/// Lowercased `scheme://host`, with the port kept only when it is not the
/// scheme default. Anything carrying a path, query or fragment is refused.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
    if !bare {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port().filter(|port| *port != default_port) {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

const MEDIA_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("opus", "audio/ogg"),
    ("flac", "audio/flac"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
];

fn content_type_for_filename(filename: &str) -> &'static str {
    let Some(extension) = FsPath::new(filename).extension().and_then(|ext| ext.to_str()) else {
        return "application/octet-stream";
    };

    MEDIA_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(extension))
        .map_or("application/octet-stream", |(_, media_type)| media_type)
}

/// `attachment` disposition with an ASCII fallback name plus the exact
/// name as RFC 5987 `filename*`.
fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|character| match character {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | ' ' | '(' | ')' => character,
            _ => '_',
        })
        .collect();

    match replaced.trim() {
        "" => "download.bin".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_wins_over_other_proxy_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.3"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );

        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn origins_drop_default_ports() {
        assert_eq!(
            normalize_origin("https://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn first_usable_proxy_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 10.0.0.1"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static(" 198.51.100.9 "));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.3"));

        assert_eq!(extract_client_ip(&headers).as_deref(), Some("198.51.100.9"));
        assert_eq!(extract_client_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn cors_rejects_origins_with_paths() {
        let configured = vec!["https://example.com".to_string(), "https://example.com/app".to_string()];
        let error = build_cors_layer(&configured).err().unwrap();
        assert!(error.message.contains("https://example.com/app"), "{}", error.message);

        let allowed = normalize_origins(&["HTTPS://Example.com:443".to_string()]).unwrap();
        assert_eq!(allowed, HashSet::from(["https://example.com".to_string()]));
    }

    #[test]
    fn media_types_ignore_extension_case() {
        assert_eq!(content_type_for_filename("clip.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("track.opus"), "audio/ogg");
        assert_eq!(content_type_for_filename("noextension"), "application/octet-stream");
    }

    #[test]
    fn api_key_fingerprint_is_stable_and_short() {
        let first = api_key_fingerprint("secret-key");
        assert_eq!(first.len(), 16);
        assert_eq!(first, api_key_fingerprint("secret-key"));
        assert_ne!(first, api_key_fingerprint("other-key"));
    }

    #[test]
    fn content_disposition_keeps_utf8_name() {
        let header = build_content_disposition("clip é.mp4");
        assert!(header.starts_with("attachment; filename=\"clip _.mp4\""));
        assert!(header.ends_with("filename*=UTF-8''clip%20%C3%A9.mp4"));
    }
}
